//! TCP relay broker: accept loop and per-connection handlers
//!
//! Each accepted connection walks a small state machine: one read for the
//! identity token, registration (with presence notices and the ack), then a
//! relay loop that forwards every read verbatim along the routing table.
//! Handler tasks live in a JoinSet so shutdown can cancel and join them
//! deterministically instead of leaking detached tasks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::{Role, MAX_PAYLOAD};

use super::registry::{ConnectionRegistry, PeerHandle};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Broker listener configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address to bind (e.g. "0.0.0.0")
    pub bind_addr: String,

    /// Port to listen on (0 = OS-assigned)
    pub port: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 60000,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Broker
// ─────────────────────────────────────────────────────────────────

/// Handle for stopping a running broker
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl BrokerHandle {
    /// Signal the broker to stop accepting and wind down its handlers
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// The relay broker: owns the listener, the registry and the handler set
pub struct Broker {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: watch::Sender<bool>,
}

impl Broker {
    /// Bind the listener. Use port 0 to let the OS pick one.
    pub async fn bind(config: &BrokerConfig) -> Result<Broker> {
        let bind = format!("{}:{}", config.bind_addr, config.port);
        let listener = TcpListener::bind(&bind).await?;
        let (shutdown_tx, _) = watch::channel(false);

        info!(addr = %listener.local_addr()?, "Broker listening");

        Ok(Broker {
            listener,
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown_tx,
        })
    }

    /// The bound listen address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared registry, mainly for observability and tests
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Handle for signalling shutdown from another task
    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Run the accept loop until shutdown is signalled.
    ///
    /// Fan-out is unbounded: every accepted connection gets its own handler
    /// task. On shutdown, outstanding handlers are cancelled and joined.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut handlers = JoinSet::new();

        loop {
            // A subscriber created after the signal never sees a change
            // notification, so check the flag itself each turn
            if *shutdown_rx.borrow() {
                info!("Broker shutdown requested");
                break;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            debug!(peer_addr = %peer_addr, "Connection accepted");
                            let registry = Arc::clone(&self.registry);
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            handlers.spawn(async move {
                                handle_connection(registry, stream, peer_addr, shutdown_rx).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }

                // Reap finished handlers so the set does not grow unbounded
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        if !e.is_cancelled() {
                            warn!(error = %e, "Connection handler panicked");
                        }
                    }
                }
            }
        }

        // Cancel and join whatever is still running
        handlers.shutdown().await;
        info!("Broker stopped");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Per-Connection Handler
// ─────────────────────────────────────────────────────────────────

/// Drive one connection from handshake to close
async fn handle_connection(
    registry: Arc<ConnectionRegistry>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let conn_id = Uuid::new_v4();
    let (mut read_half, write_half) = stream.into_split();

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (close_tx, mut close_rx) = watch::channel(false);

    // Writer task drains the outbound queue; it ends when the queue closes,
    // which happens once the registry entry and the local handle are gone
    let writer = tokio::spawn(write_loop(conn_id, write_half, outbound_rx));

    // One read for the identity token
    let mut buf = vec![0u8; MAX_PAYLOAD];
    let n = match read_half.read(&mut buf).await {
        Ok(0) => {
            debug!(conn_id = %conn_id, peer_addr = %peer_addr, "Closed before handshake");
            drop(outbound_tx);
            let _ = writer.await;
            return;
        }
        Ok(n) => n,
        Err(e) => {
            debug!(conn_id = %conn_id, peer_addr = %peer_addr, error = %e, "Handshake read failed");
            drop(outbound_tx);
            let _ = writer.await;
            return;
        }
    };

    let token = String::from_utf8_lossy(&buf[..n]).into_owned();
    let Some(role) = Role::from_token(&token) else {
        // Unrecognized identity: close immediately, no registry mutation,
        // no ack
        warn!(
            conn_id = %conn_id,
            peer_addr = %peer_addr,
            token = %token.trim(),
            "Unrecognized role token, closing"
        );
        drop(outbound_tx);
        let _ = writer.await;
        return;
    };

    // Register; notices and the ack are enqueued under the registry lock
    let handle = PeerHandle::new(conn_id, outbound_tx, close_tx);
    let registration = registry.register(role, handle);
    if let Some(displaced) = registration.displaced {
        warn!(
            role = %role,
            old_conn = %displaced.conn_id,
            new_conn = %conn_id,
            "Role re-registered, closing displaced connection"
        );
        displaced.close();
    }

    info!(
        conn_id = %conn_id,
        peer_addr = %peer_addr,
        role = %role,
        notices = registration.notices.len(),
        "Role registered"
    );

    // Relay loop: forward each read verbatim. One read is one message; the
    // wire carries no framing.
    loop {
        if *shutdown_rx.borrow() {
            debug!(conn_id = %conn_id, role = %role, "Handler stopping on shutdown");
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }

            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    debug!(conn_id = %conn_id, role = %role, "Connection displaced, closing");
                    break;
                }
            }

            read = read_half.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        info!(conn_id = %conn_id, role = %role, "Peer closed");
                        break;
                    }
                    Ok(n) => {
                        let delivered = registry.forward(role, &buf[..n]);
                        debug!(
                            conn_id = %conn_id,
                            role = %role,
                            bytes = n,
                            delivered = delivered,
                            "Payload forwarded"
                        );
                    }
                    Err(e) => {
                        info!(conn_id = %conn_id, role = %role, error = %e, "Read failed, closing");
                        break;
                    }
                }
            }
        }
    }

    // Only removes the entry if this connection still owns it
    let removed = registry.deregister(role, conn_id);
    debug!(conn_id = %conn_id, role = %role, deregistered = removed, "Handler exiting");

    let _ = writer.await;
}

/// Drain a connection's outbound queue to its socket
async fn write_loop(
    conn_id: Uuid,
    mut writer: OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(payload) = outbound_rx.recv().await {
        if let Err(e) = writer.write_all(&payload).await {
            debug!(conn_id = %conn_id, error = %e, "Write failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            debug!(conn_id = %conn_id, error = %e, "Flush failed");
            break;
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_config_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0");
        assert_eq!(config.port, 60000);
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = BrokerConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
        };
        let broker = Broker::bind(&config).await.unwrap();
        let addr = broker.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let config = BrokerConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
        };
        let broker = Broker::bind(&config).await.unwrap();
        let handle = broker.handle();

        let run = tokio::spawn(broker.run());
        handle.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("broker did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
