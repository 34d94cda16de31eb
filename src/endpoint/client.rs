//! Resilient broker endpoint
//!
//! A long-lived actor that owns the connect/retry state machine, the
//! identity handshake, the receive/classify loop and the bridge hookup.
//! Consumers observe it through an event channel and drive it through a
//! cloneable handle.
//!
//! Retry policy is linear: after the Nth consecutive failure the endpoint
//! waits N times the base delay, up to a fixed attempt budget. Exhausting
//! the budget is terminal; the endpoint parks in its error state until the
//! process is restarted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{classify, ActuatorCommand, Classified, Role, WeatherReport, MAX_PAYLOAD};

use super::bridge::PipeBridge;

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Endpoint connection settings
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Broker host
    pub server_host: String,

    /// Broker port
    pub server_port: u16,

    /// Role announced in the handshake
    pub role: Role,

    /// Maximum consecutive connect attempts before the terminal error state
    pub max_connect_attempts: u32,

    /// Base retry delay; attempt N waits N times this
    pub retry_delay: Duration,

    /// Pause after a lost connection before the next retry cycle
    pub reconnect_cooldown: Duration,

    /// Per-call receive timeout; bounds how long a read can park
    pub receive_timeout: Duration,

    /// Timeout for the connect call itself
    pub connect_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 60000,
            role: Role::Device,
            max_connect_attempts: 10,
            retry_delay: Duration::from_secs(1),
            reconnect_cooldown: Duration::from_secs(2),
            receive_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl EndpointConfig {
    /// Broker address as host:port
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

// ─────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────

/// Endpoint connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Not connected, may retry
    Disconnected,
    /// Connect attempt in flight
    Connecting,
    /// Connected and identity sent
    Connected,
    /// Retry budget exhausted; terminal
    Error,
}

impl Default for EndpointState {
    fn default() -> Self {
        EndpointState::Disconnected
    }
}

// ─────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────

/// Events emitted by the endpoint to its owner
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    /// The connection state changed
    StateChanged(EndpointState),

    /// A peer-presence notice arrived from the broker
    PeerPresent(Role),

    /// A recognized actuator command arrived; already written to the bridge
    CommandReceived(ActuatorCommand),

    /// A weather report arrived; already written to the bridge
    ReportReceived(WeatherReport),

    /// A payload no classifier recognized; the raw text, for role-specific
    /// handling (the device discards these)
    Unrecognized(String),
}

// ─────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────

/// Cloneable handle for observing and driving a running endpoint
#[derive(Clone)]
pub struct EndpointHandle {
    state: Arc<RwLock<EndpointState>>,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    stop_tx: watch::Sender<bool>,
    running: Arc<AtomicBool>,
}

impl EndpointHandle {
    /// Current connection state
    pub fn state(&self) -> EndpointState {
        *self.state.read()
    }

    /// Whether the endpoint is currently connected
    pub fn is_connected(&self) -> bool {
        self.state() == EndpointState::Connected
    }

    /// Write a raw payload to the broker-facing stream.
    ///
    /// The write half sits behind a dedicated lock, so the network task and
    /// a bridge-driven caller cannot interleave partial writes.
    pub async fn send_command(&self, payload: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(Error::Connection("not connected".to_string()));
        };

        writer
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        debug!(bytes = payload.len(), "Payload sent to broker");
        Ok(())
    }

    /// Stop the endpoint. Cooperative: the network task observes the stop
    /// signal at its next loop turn, and the stream is dropped to unblock
    /// any in-flight read.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        let _ = self.stop_tx.send(true);
    }
}

// ─────────────────────────────────────────────────────────────────
// Endpoint
// ─────────────────────────────────────────────────────────────────

/// The resilient endpoint actor
pub struct Endpoint {
    config: EndpointConfig,
    bridge: Option<Arc<PipeBridge>>,
}

impl Endpoint {
    /// Create an endpoint; `bridge` is usually present for the device role
    /// and absent for provider/console embedding.
    pub fn new(config: EndpointConfig, bridge: Option<Arc<PipeBridge>>) -> Self {
        Self { config, bridge }
    }

    /// Start the endpoint. Spawns the network task (and, when a bridge is
    /// attached, the command-pipe listener plus its forwarder) and returns
    /// the handle and the event stream.
    pub fn start(self) -> (EndpointHandle, mpsc::Receiver<EndpointEvent>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let running = Arc::new(AtomicBool::new(true));

        let handle = EndpointHandle {
            state: Arc::new(RwLock::new(EndpointState::Disconnected)),
            writer: Arc::new(Mutex::new(None)),
            stop_tx,
            running: Arc::clone(&running),
        };

        // Bridge hookup: listener thread feeds records to a forwarder task
        // that relays them while connected and drops them otherwise
        if let Some(bridge) = &self.bridge {
            if let Err(e) = bridge.ensure_pipes() {
                // Bridge trouble is never fatal to the endpoint
                warn!(error = %e, "Bridge setup failed; pipes unavailable");
            }

            let (command_tx, command_rx) = mpsc::unbounded_channel();
            bridge.spawn_command_listener(command_tx, Arc::clone(&running));
            tokio::spawn(forward_bridge_commands(command_rx, handle.clone()));
        }

        let actor = EndpointActor {
            config: self.config,
            bridge: self.bridge,
            state: Arc::clone(&handle.state),
            writer: Arc::clone(&handle.writer),
            event_tx,
        };
        tokio::spawn(actor.run(stop_rx));

        (handle, event_rx)
    }
}

/// Relay bridge-originated command records to the broker while connected
async fn forward_bridge_commands(
    mut command_rx: mpsc::UnboundedReceiver<String>,
    handle: EndpointHandle,
) {
    while let Some(record) = command_rx.recv().await {
        if !handle.is_connected() {
            warn!(record = %record, "Not connected, dropping bridged command");
            continue;
        }
        match handle.send_command(&record).await {
            Ok(()) => info!(record = %record, "Bridged command sent to broker"),
            Err(e) => warn!(record = %record, error = %e, "Failed to send bridged command"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Network Actor
// ─────────────────────────────────────────────────────────────────

struct EndpointActor {
    config: EndpointConfig,
    bridge: Option<Arc<PipeBridge>>,
    state: Arc<RwLock<EndpointState>>,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    event_tx: mpsc::Sender<EndpointEvent>,
}

impl EndpointActor {
    /// Connect/retry loop; runs until stopped or the budget is exhausted
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let addr = self.config.server_addr();
        let mut attempt: u32 = 0;

        info!(addr = %addr, role = %self.config.role, "Endpoint starting");

        loop {
            if *stop_rx.borrow() {
                break;
            }

            self.set_state(EndpointState::Connecting).await;
            attempt += 1;

            let connected = tokio::time::timeout(
                self.config.connect_timeout,
                TcpStream::connect(&addr),
            )
            .await;

            match connected {
                Ok(Ok(stream)) => {
                    info!(addr = %addr, "Connected to broker");
                    attempt = 0;

                    let result = self.run_connection(stream, &mut stop_rx).await;
                    *self.writer.lock().await = None;

                    if *stop_rx.borrow() {
                        break;
                    }

                    match result {
                        Ok(()) => info!("Connection closed by broker"),
                        Err(e) => warn!(error = %e, "Connection lost"),
                    }
                    self.set_state(EndpointState::Disconnected).await;

                    // Short cooldown before the fresh retry cycle
                    if !self.sleep_or_stop(self.config.reconnect_cooldown, &mut stop_rx).await {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    warn!(addr = %addr, attempt, error = %e, "Connect failed");
                    if !self.backoff_or_give_up(attempt, &mut stop_rx).await {
                        return;
                    }
                }
                Err(_) => {
                    warn!(addr = %addr, attempt, timeout = ?self.config.connect_timeout, "Connect timed out");
                    if !self.backoff_or_give_up(attempt, &mut stop_rx).await {
                        return;
                    }
                }
            }
        }

        self.set_state(EndpointState::Disconnected).await;
        info!("Endpoint stopped");
    }

    /// Handle one failed attempt: either back off linearly and return true,
    /// or park in the terminal error state and return false.
    async fn backoff_or_give_up(&self, attempt: u32, stop_rx: &mut watch::Receiver<bool>) -> bool {
        self.set_state(EndpointState::Disconnected).await;

        if attempt >= self.config.max_connect_attempts {
            error!(
                attempts = attempt,
                "Retry budget exhausted, giving up"
            );
            self.set_state(EndpointState::Error).await;
            return false;
        }

        let delay = self.config.retry_delay * attempt;
        info!(attempt, delay_ms = delay.as_millis() as u64, "Retrying after backoff");
        self.sleep_or_stop(delay, stop_rx).await
    }

    /// Sleep, waking early on stop; false means stop was requested
    async fn sleep_or_stop(&self, delay: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = stop_rx.changed() => !*stop_rx.borrow(),
        }
    }

    /// Identity handshake plus the receive/classify loop for one connection
    async fn run_connection(
        &self,
        stream: TcpStream,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut read_half, mut write_half) = stream.into_split();

        // Identity first; the broker reads exactly one token
        write_half
            .write_all(self.config.role.token().as_bytes())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        write_half
            .flush()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        debug!(role = %self.config.role, "Identity sent");

        // Publish the write half for send_command callers
        *self.writer.lock().await = Some(write_half);
        self.set_state(EndpointState::Connected).await;

        let mut buf = vec![0u8; MAX_PAYLOAD];

        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        info!("Stop requested, leaving receive loop");
                        return Ok(());
                    }
                }

                read = tokio::time::timeout(
                    self.config.receive_timeout,
                    read_half.read(&mut buf),
                ) => {
                    match read {
                        // Timeout: just another turn of the loop so the stop
                        // signal stays observable
                        Err(_) => continue,
                        Ok(Ok(0)) => return Ok(()),
                        Ok(Ok(n)) => {
                            let record = String::from_utf8_lossy(&buf[..n]).into_owned();
                            self.handle_record(&record).await;
                        }
                        Ok(Err(e)) => {
                            return Err(Error::ConnectionLost {
                                message: e.to_string(),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Classify one received record and dispatch it
    async fn handle_record(&self, record: &str) {
        let record = record.trim_end_matches('\n');
        if record.is_empty() {
            return;
        }

        let classified = classify(record);
        debug!(kind = classified.kind(), bytes = record.len(), "Record received");

        match classified {
            Classified::Presence(role) => {
                info!(peer = %role, "Peer presence notice");
                let _ = self.event_tx.send(EndpointEvent::PeerPresent(role)).await;
            }

            Classified::Ack => {
                info!("Broker acknowledged connection");
            }

            Classified::Command(cmd) => {
                info!(command = %cmd, "Actuator command received");
                if let Some(bridge) = &self.bridge {
                    if let Err(e) = bridge.write_command(record) {
                        warn!(error = %e, "Command not written to pipe");
                    }
                }
                let _ = self.event_tx.send(EndpointEvent::CommandReceived(cmd)).await;
            }

            Classified::Report(report) => {
                info!(city = %report.city, "Weather report received");
                if let Some(bridge) = &self.bridge {
                    if let Err(e) = bridge.write_report(&report) {
                        warn!(error = %e, "Report not written to pipe");
                    }
                }
                let _ = self.event_tx.send(EndpointEvent::ReportReceived(report)).await;
            }

            Classified::Unrecognized => {
                debug!(record = %record, "Unclassified record");
                let _ = self
                    .event_tx
                    .send(EndpointEvent::Unrecognized(record.to_string()))
                    .await;
            }
        }
    }

    /// Update the shared state and notify observers
    async fn set_state(&self, new_state: EndpointState) {
        let changed = {
            let mut state = self.state.write();
            let changed = *state != new_state;
            *state = new_state;
            changed
        };

        if changed {
            debug!(state = ?new_state, "Endpoint state changed");
            let _ = self.event_tx.send(EndpointEvent::StateChanged(new_state)).await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
