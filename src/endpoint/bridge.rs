//! Named-pipe bridge between the endpoint and independent local processes
//!
//! Two FIFOs under a configurable directory, created on demand:
//! - the command pipe: local producers write actuator commands into it (the
//!   listener forwards each record to the broker), and the endpoint writes
//!   commands received over the network into it for local consumers;
//! - the report pipe: the endpoint writes one JSON record per weather report
//!   for a local consumer.
//!
//! Records are newline-terminated text, one shot per read. There is no
//! queueing beyond the OS pipe buffer; a reader that attaches late can only
//! recover the most recent report through the in-process cache.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::WeatherReport;

/// Poll interval for the command listener when the pipe is idle
const LISTEN_POLL: Duration = Duration::from_millis(200);

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Bridge pipe locations
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Directory holding both pipes; created if absent
    pub pipe_dir: PathBuf,

    /// Command pipe file name
    pub command_pipe: String,

    /// Report pipe file name
    pub report_pipe: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            pipe_dir: PathBuf::from("/tmp/wxrelay"),
            command_pipe: "command_fifo".to_string(),
            report_pipe: "weather_fifo".to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Last-Known-Good Cache
// ─────────────────────────────────────────────────────────────────

/// The most recent report record, kept for late-attaching readers.
/// A missed pipe read is a genuine loss unless this cache is consulted.
#[derive(Debug, Clone)]
pub struct CachedReport {
    /// The JSON line as written to the pipe
    pub json: String,

    /// When it was cached
    pub cached_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────
// Pipe Bridge
// ─────────────────────────────────────────────────────────────────

/// The FIFO pair plus the report cache
pub struct PipeBridge {
    config: BridgeConfig,
    last_report: RwLock<Option<CachedReport>>,
}

impl PipeBridge {
    /// Create a bridge over the configured pipe directory
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            last_report: RwLock::new(None),
        }
    }

    /// Full path of the command pipe
    pub fn command_path(&self) -> PathBuf {
        self.config.pipe_dir.join(&self.config.command_pipe)
    }

    /// Full path of the report pipe
    pub fn report_path(&self) -> PathBuf {
        self.config.pipe_dir.join(&self.config.report_pipe)
    }

    /// Create the pipe directory and both FIFOs if they do not exist yet
    pub fn ensure_pipes(&self) -> Result<()> {
        std::fs::create_dir_all(&self.config.pipe_dir)?;
        ensure_fifo(&self.command_path())?;
        ensure_fifo(&self.report_path())?;
        Ok(())
    }

    /// Write a weather report to the report pipe as one JSON line.
    ///
    /// The cache is updated first, so even when no reader is attached the
    /// record is not lost to in-process consumers.
    pub fn write_report(&self, report: &WeatherReport) -> Result<()> {
        let json = report.to_json();

        *self.last_report.write() = Some(CachedReport {
            json: json.clone(),
            cached_at: Utc::now(),
        });

        write_record(&self.report_path(), &json)
    }

    /// Write a raw command token to the command pipe as one line
    pub fn write_command(&self, token: &str) -> Result<()> {
        write_record(&self.command_path(), token.trim_end())
    }

    /// The most recent report record, if any was ever written
    pub fn last_report(&self) -> Option<CachedReport> {
        self.last_report.read().clone()
    }

    /// Spawn the command-pipe listener on a blocking thread.
    ///
    /// Each newline-terminated record read from the pipe is pushed into
    /// `command_tx`; the consumer decides whether the endpoint is connected
    /// enough to forward it. The pipe is opened non-blocking and polled so
    /// the thread stops within one poll interval of `running` going false,
    /// rather than parking forever in open(2) waiting for a writer.
    pub fn spawn_command_listener(
        self: &Arc<Self>,
        command_tx: mpsc::UnboundedSender<String>,
        running: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            bridge.command_listener_loop(command_tx, running);
        })
    }

    /// Blocking read loop over the command pipe
    fn command_listener_loop(
        &self,
        command_tx: mpsc::UnboundedSender<String>,
        running: Arc<AtomicBool>,
    ) {
        let path = self.command_path();

        if let Err(e) = self.ensure_pipes() {
            warn!(error = %e, "Command listener could not set up pipes, exiting");
            return;
        }

        let mut file = match open_reader(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Command listener could not open pipe");
                return;
            }
        };

        info!(path = %path.display(), "Command listener started");

        let mut pending = String::new();
        let mut buf = [0u8; 1024];

        while running.load(Ordering::Relaxed) {
            match file.read(&mut buf) {
                Ok(0) => {
                    // No writer attached right now
                    std::thread::sleep(LISTEN_POLL);
                }
                Ok(n) => {
                    pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                    while let Some(idx) = pending.find('\n') {
                        let record: String = pending.drain(..=idx).collect();
                        let record = record.trim();
                        if record.is_empty() {
                            continue;
                        }
                        debug!(record = %record, "Command record read from pipe");
                        if command_tx.send(record.to_string()).is_err() {
                            info!("Command consumer gone, listener exiting");
                            return;
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(LISTEN_POLL);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Command pipe read failed");
                    std::thread::sleep(LISTEN_POLL);
                }
            }
        }

        info!("Command listener stopped");
    }
}

// ─────────────────────────────────────────────────────────────────
// FIFO plumbing
// ─────────────────────────────────────────────────────────────────

/// mkfifo(3), tolerating an already-existing pipe
fn ensure_fifo(path: &Path) -> Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::PipeCreate {
        path: path.to_path_buf(),
        message: "path contains an interior NUL byte".to_string(),
    })?;

    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o666) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::AlreadyExists {
            return Err(Error::PipeCreate {
                path: path.to_path_buf(),
                message: err.to_string(),
            });
        }
    }
    Ok(())
}

/// Open a FIFO for reading without blocking on a missing writer
fn open_reader(path: &Path) -> std::io::Result<File> {
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

/// Write one newline-terminated record, non-blocking.
///
/// Opening a FIFO write-side with no reader fails with ENXIO; that is the
/// "nobody listening" case, surfaced as a pipe error the caller logs and
/// skips.
fn write_record(path: &Path, record: &str) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|e| Error::PipeOpen {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    let mut line = record.to_string();
    line.push('\n');
    file.write_all(line.as_bytes()).map_err(|e| Error::PipeWrite {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_bridge(dir: &TempDir) -> PipeBridge {
        PipeBridge::new(BridgeConfig {
            pipe_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
    }

    fn sample_report() -> WeatherReport {
        WeatherReport {
            city: "Springfield".to_string(),
            weather: "Clear".to_string(),
            temperature: "21.5".to_string(),
            humidity: "45".to_string(),
        }
    }

    #[test]
    fn test_ensure_pipes_creates_fifos() {
        let dir = TempDir::new().unwrap();
        let bridge = make_bridge(&dir);

        bridge.ensure_pipes().unwrap();
        assert!(bridge.command_path().exists());
        assert!(bridge.report_path().exists());

        // Idempotent
        bridge.ensure_pipes().unwrap();
    }

    #[test]
    fn test_write_report_without_reader_still_caches() {
        let dir = TempDir::new().unwrap();
        let bridge = make_bridge(&dir);
        bridge.ensure_pipes().unwrap();

        // No reader attached: the pipe write fails but the cache holds the
        // record
        let result = bridge.write_report(&sample_report());
        assert!(result.is_err());

        let cached = bridge.last_report().unwrap();
        assert!(cached.json.contains("Springfield"));
    }

    #[test]
    fn test_last_report_tracks_most_recent() {
        let dir = TempDir::new().unwrap();
        let bridge = make_bridge(&dir);
        bridge.ensure_pipes().unwrap();

        assert!(bridge.last_report().is_none());

        let _ = bridge.write_report(&sample_report());
        let mut second = sample_report();
        second.city = "Oslo".to_string();
        let _ = bridge.write_report(&second);

        assert!(bridge.last_report().unwrap().json.contains("Oslo"));
    }

    #[test]
    fn test_write_command_reaches_attached_reader() {
        let dir = TempDir::new().unwrap();
        let bridge = make_bridge(&dir);
        bridge.ensure_pipes().unwrap();

        let mut reader = open_reader(&bridge.command_path()).unwrap();
        bridge.write_command("LED_ON\n").unwrap();

        let mut buf = [0u8; 64];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"LED_ON\n");
    }

    #[tokio::test]
    async fn test_command_listener_forwards_records() {
        let dir = TempDir::new().unwrap();
        let bridge = Arc::new(make_bridge(&dir));
        bridge.ensure_pipes().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let listener = bridge.spawn_command_listener(tx, Arc::clone(&running));

        // The write succeeds once the listener has the read side open
        let mut wrote = false;
        for _ in 0..50 {
            if bridge.write_command("BUZZER_ON").is_ok() {
                wrote = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(wrote, "listener never opened the pipe");

        let record = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("listener did not forward the record")
            .unwrap();
        assert_eq!(record, "BUZZER_ON");

        running.store(false, Ordering::Relaxed);
        let _ = listener.await;
    }
}
