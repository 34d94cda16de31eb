//! Operator console role
//!
//! Interactive terminal client: city names typed on stdin go to the
//! provider, actuator tokens end up at the device, and incoming weather
//! reports are printed. The relay echoes a command back from the device
//! side once it has been bridged, which doubles as delivery confirmation.

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, EndpointConfig, EndpointEvent, EndpointState};
use crate::error::Result;
use crate::protocol::Role;

/// Run the console role until `quit`, EOF or ctrl-c
pub async fn run(mut endpoint_config: EndpointConfig) -> Result<()> {
    endpoint_config.role = Role::Console;
    let endpoint = Endpoint::new(endpoint_config, None);
    let (handle, mut events) = endpoint.start();

    println!("wxrelay console");
    println!("  type a city name to change the weather query,");
    println!("  an actuator token (LED_ON, LED_OFF, BUZZER_ON, BUZZER_OFF),");
    println!("  or 'quit' to exit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                handle.stop();
                break;
            }

            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let input = line.trim();
                        if input.is_empty() {
                            continue;
                        }
                        if input == "quit" {
                            handle.stop();
                            break;
                        }
                        if !handle.is_connected() {
                            println!("(not connected yet, input dropped)");
                            continue;
                        }
                        match handle.send_command(input).await {
                            Ok(()) => debug!(input = %input, "Input sent"),
                            Err(e) => warn!(error = %e, "Failed to send input"),
                        }
                    }
                    Ok(None) => {
                        info!("Stdin closed");
                        handle.stop();
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Stdin read failed");
                        handle.stop();
                        break;
                    }
                }
            }

            event = events.recv() => {
                let Some(event) = event else {
                    info!("Endpoint event channel closed");
                    break;
                };

                match event {
                    EndpointEvent::ReportReceived(report) => {
                        println!();
                        println!("  city:        {}", report.city);
                        println!("  weather:     {}", report.weather);
                        println!("  temperature: {} C", report.temperature);
                        println!("  humidity:    {} %", report.humidity);
                        println!();
                    }

                    EndpointEvent::CommandReceived(cmd) => {
                        println!("(device echoed {})", cmd);
                    }

                    EndpointEvent::Unrecognized(text) => {
                        // Provider error texts and anything else readable
                        println!("{}", text);
                    }

                    EndpointEvent::StateChanged(EndpointState::Connected) => {
                        println!("(connected to broker)");
                    }

                    EndpointEvent::StateChanged(EndpointState::Error) => {
                        warn!("Endpoint gave up reconnecting, exiting");
                        break;
                    }

                    EndpointEvent::StateChanged(state) => {
                        debug!(state = ?state, "Endpoint state");
                    }

                    EndpointEvent::PeerPresent(peer) => {
                        debug!(peer = %peer, "Peer presence notice");
                    }
                }
            }
        }
    }

    Ok(())
}
