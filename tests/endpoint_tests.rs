//! Endpoint integration tests
//!
//! Exercise the resilient endpoint against a real broker: retry budget,
//! classification of inbound payloads, and the named-pipe round trip.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use wxrelay::broker::{Broker, BrokerConfig, BrokerHandle};
use wxrelay::endpoint::{
    BridgeConfig, Endpoint, EndpointConfig, EndpointEvent, EndpointState, PipeBridge,
};
use wxrelay::protocol::Role;

// ─────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────

async fn start_broker() -> (std::net::SocketAddr, BrokerHandle, tokio::task::JoinHandle<wxrelay::error::Result<()>>) {
    let config = BrokerConfig {
        bind_addr: "127.0.0.1".to_string(),
        port: 0,
    };
    let broker = Broker::bind(&config).await.unwrap();
    let addr = broker.local_addr().unwrap();
    let handle = broker.handle();
    let run = tokio::spawn(broker.run());
    (addr, handle, run)
}

/// An address nothing listens on (bind an ephemeral port, then free it)
async fn dead_addr() -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn endpoint_config(addr: std::net::SocketAddr, role: Role) -> EndpointConfig {
    EndpointConfig {
        server_host: addr.ip().to_string(),
        server_port: addr.port(),
        role,
        max_connect_attempts: 10,
        retry_delay: Duration::from_millis(20),
        reconnect_cooldown: Duration::from_millis(50),
        receive_timeout: Duration::from_millis(200),
        connect_timeout: Duration::from_secs(2),
    }
}

fn bridge_in(dir: &TempDir) -> Arc<PipeBridge> {
    Arc::new(PipeBridge::new(BridgeConfig {
        pipe_dir: dir.path().to_path_buf(),
        ..Default::default()
    }))
}

/// Join the broker over raw TCP and swallow the handshake ack
async fn raw_join(addr: std::net::SocketAddr, role: Role) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(role.token().as_bytes()).await.unwrap();
    let mut buf = [0u8; 256];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("no handshake ack")
        .unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).contains("CONNECTED"));
    stream
}

async fn wait_for_state(
    events: &mut tokio::sync::mpsc::Receiver<EndpointEvent>,
    wanted: EndpointState,
) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for endpoint state")
            .expect("event channel closed");
        if let EndpointEvent::StateChanged(state) = event {
            if state == wanted {
                return;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Retry / Backoff
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_retry_budget_exhaustion_is_terminal() {
    let addr = dead_addr().await;
    let mut config = endpoint_config(addr, Role::Device);
    config.max_connect_attempts = 3;

    let endpoint = Endpoint::new(config, None);
    let (handle, mut events) = endpoint.start();

    // Count the connect attempts on the way to the terminal state
    let mut attempts = 0;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("endpoint never reached its error state")
            .expect("event channel closed early");
        match event {
            EndpointEvent::StateChanged(EndpointState::Connecting) => attempts += 1,
            EndpointEvent::StateChanged(EndpointState::Error) => break,
            _ => {}
        }
    }

    assert_eq!(attempts, 3);
    assert_eq!(handle.state(), EndpointState::Error);

    // Terminal: no further connect attempts show up
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, EndpointEvent::StateChanged(EndpointState::Connecting)),
            "endpoint retried after exhausting its budget"
        );
    }

    handle.stop();
}

#[tokio::test]
async fn test_failures_below_budget_keep_cycling() {
    let addr = dead_addr().await;
    let config = endpoint_config(addr, Role::Device); // budget 10

    let endpoint = Endpoint::new(config, None);
    let (handle, mut events) = endpoint.start();

    // Watch several failed cycles; the endpoint must keep alternating
    // between connecting and disconnected without giving up
    let mut attempts = 0;
    while attempts < 4 {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("endpoint stopped emitting events")
            .expect("event channel closed early");
        match event {
            EndpointEvent::StateChanged(EndpointState::Connecting) => attempts += 1,
            EndpointEvent::StateChanged(EndpointState::Error) => {
                panic!("reached the error state below the retry budget");
            }
            _ => {}
        }
    }

    assert_ne!(handle.state(), EndpointState::Error);
    handle.stop();
}

#[tokio::test]
async fn test_reconnect_after_lost_connection() {
    let (addr, broker_handle, broker_run) = start_broker().await;

    let endpoint = Endpoint::new(endpoint_config(addr, Role::Device), None);
    let (handle, mut events) = endpoint.start();
    wait_for_state(&mut events, EndpointState::Connected).await;

    // Kill the broker; the endpoint notices and starts a fresh retry cycle
    broker_handle.shutdown();
    let _ = broker_run.await;
    wait_for_state(&mut events, EndpointState::Disconnected).await;

    // Bring a broker back on the same port
    let config = BrokerConfig {
        bind_addr: addr.ip().to_string(),
        port: addr.port(),
    };
    let broker = Broker::bind(&config).await.unwrap();
    let broker_handle = broker.handle();
    let broker_run = tokio::spawn(broker.run());

    wait_for_state(&mut events, EndpointState::Connected).await;

    handle.stop();
    broker_handle.shutdown();
    let _ = broker_run.await;
}

// ─────────────────────────────────────────────────────────────────
// Classification
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_report_classified_and_cached() {
    let (addr, broker_handle, broker_run) = start_broker().await;
    let dir = TempDir::new().unwrap();
    let bridge = bridge_in(&dir);

    let endpoint = Endpoint::new(endpoint_config(addr, Role::Device), Some(Arc::clone(&bridge)));
    let (handle, mut events) = endpoint.start();
    wait_for_state(&mut events, EndpointState::Connected).await;

    // Provider payloads fan out to the device
    let mut provider = raw_join(addr, Role::Provider).await;
    provider
        .write_all(b"city: Springfield\nweather: Clear\ntemperature: 21.5C\nhumidity: 45%\n")
        .await
        .unwrap();

    let report = loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("report never arrived")
            .expect("event channel closed");
        if let EndpointEvent::ReportReceived(report) = event {
            break report;
        }
    };

    assert_eq!(report.city, "Springfield");
    assert_eq!(report.weather, "Clear");
    assert_eq!(report.temperature, "21.5");
    assert_eq!(report.humidity, "45");

    // The last-known-good cache holds the serialized record even though no
    // pipe reader was attached
    let cached = bridge.last_report().expect("report was not cached");
    assert!(cached.json.contains("\"city\":\"Springfield\""));
    assert!(cached.json.contains("\"humidity\":\"45\""));

    handle.stop();
    broker_handle.shutdown();
    let _ = broker_run.await;
}

#[tokio::test]
async fn test_peer_presence_surfaces_as_event() {
    let (addr, broker_handle, broker_run) = start_broker().await;

    let endpoint = Endpoint::new(endpoint_config(addr, Role::Provider), None);
    let (handle, mut events) = endpoint.start();
    wait_for_state(&mut events, EndpointState::Connected).await;

    let _device = raw_join(addr, Role::Device).await;

    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("presence notice never arrived")
            .expect("event channel closed");
        if let EndpointEvent::PeerPresent(role) = event {
            assert_eq!(role, Role::Device);
            break;
        }
    }

    handle.stop();
    broker_handle.shutdown();
    let _ = broker_run.await;
}

// ─────────────────────────────────────────────────────────────────
// Pipe Round Trip
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_command_pipe_round_trip_to_console() {
    let (addr, broker_handle, broker_run) = start_broker().await;
    let dir = TempDir::new().unwrap();
    let bridge = bridge_in(&dir);

    // Console listens on the raw socket; the device endpoint runs the bridge
    let mut console = raw_join(addr, Role::Console).await;

    let endpoint = Endpoint::new(endpoint_config(addr, Role::Device), Some(Arc::clone(&bridge)));
    let (handle, mut events) = endpoint.start();
    wait_for_state(&mut events, EndpointState::Connected).await;

    // A local producer writes a command record into the command pipe.
    // The write succeeds once the listener has the read side open.
    let mut wrote = false;
    for _ in 0..50 {
        if bridge.write_command("LED_ON").is_ok() {
            wrote = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(wrote, "command pipe never had a reader attached");

    // The record must reach the console byte-identical, via
    // pipe → listener → send_command → broker → routing Device→Console
    let mut buf = [0u8; 256];
    let n = tokio::time::timeout(Duration::from_secs(10), console.read(&mut buf))
        .await
        .expect("command never reached the console")
        .unwrap();
    assert_eq!(&buf[..n], b"LED_ON");

    handle.stop();
    broker_handle.shutdown();
    let _ = broker_run.await;
}

#[tokio::test]
async fn test_network_command_echoes_through_bridge() {
    let (addr, broker_handle, broker_run) = start_broker().await;
    let dir = TempDir::new().unwrap();
    let bridge = bridge_in(&dir);

    let mut console = raw_join(addr, Role::Console).await;

    let endpoint = Endpoint::new(endpoint_config(addr, Role::Device), Some(Arc::clone(&bridge)));
    let (handle, mut events) = endpoint.start();
    wait_for_state(&mut events, EndpointState::Connected).await;

    // A provider payload carrying a command token reaches the device, which
    // writes it to the command pipe; the listener picks it up and relays it
    // back out, landing at the console per the routing table
    // Let the listener get the pipe's read side open before the command
    // arrives, so the device-side pipe write has a reader
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut provider = raw_join(addr, Role::Provider).await;
    provider.write_all(b"BUZZER_OFF").await.unwrap();

    // First confirm the device classified it
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("command never classified")
            .expect("event channel closed");
        if let EndpointEvent::CommandReceived(cmd) = event {
            assert_eq!(cmd.token(), "BUZZER_OFF");
            break;
        }
    }

    // The console sees the token twice: once from the provider fan-out
    // directly, once echoed by the device's bridge. Reads may coalesce, so
    // accumulate until both copies arrived.
    let mut seen = String::new();
    let mut buf = [0u8; 256];
    while seen.matches("BUZZER_OFF").count() < 2 {
        let n = tokio::time::timeout(Duration::from_secs(10), console.read(&mut buf))
            .await
            .expect("echoed command never reached the console")
            .unwrap();
        assert!(n > 0, "console connection closed early");
        seen.push_str(&String::from_utf8_lossy(&buf[..n]));
    }

    handle.stop();
    broker_handle.shutdown();
    let _ = broker_run.await;
}

// ─────────────────────────────────────────────────────────────────
// send_command
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_send_command_reaches_routed_peer() {
    let (addr, broker_handle, broker_run) = start_broker().await;

    let mut console = raw_join(addr, Role::Console).await;

    let endpoint = Endpoint::new(endpoint_config(addr, Role::Device), None);
    let (handle, mut events) = endpoint.start();
    wait_for_state(&mut events, EndpointState::Connected).await;

    handle.send_command("hello from the device").await.unwrap();

    let mut buf = [0u8; 256];
    let n = tokio::time::timeout(Duration::from_secs(10), console.read(&mut buf))
        .await
        .expect("payload never arrived")
        .unwrap();
    assert_eq!(&buf[..n], b"hello from the device");

    handle.stop();
    broker_handle.shutdown();
    let _ = broker_run.await;
}

#[tokio::test]
async fn test_send_command_fails_when_disconnected() {
    let addr = dead_addr().await;
    let mut config = endpoint_config(addr, Role::Device);
    config.max_connect_attempts = 1;

    let endpoint = Endpoint::new(config, None);
    let (handle, mut events) = endpoint.start();
    wait_for_state(&mut events, EndpointState::Error).await;

    assert!(handle.send_command("LED_ON").await.is_err());
    handle.stop();
}
