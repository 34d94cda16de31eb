//! wxrelay - role-based weather/actuator relay
//!
//! This is the main entry point for the wxrelay binary. One executable
//! hosts all four roles: the relay broker, the device endpoint with its
//! named-pipe bridge, the weather provider, and the operator console.

use std::sync::Arc;

use clap::Parser;
use tracing::{debug, info, warn};

use wxrelay::broker::Broker;
use wxrelay::cli::{Cli, Commands, ConfigSubcommand};
use wxrelay::config::{self, RelayConfig};
use wxrelay::endpoint::{Endpoint, EndpointEvent, EndpointState, PipeBridge};
use wxrelay::error::{Error, Result};
use wxrelay::logging::{self, LogGuards};
use wxrelay::protocol::Role;
use wxrelay::{console, provider, version};

fn main() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    // For commands that don't need full logging, use simple setup
    match &cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(subcommand.clone());
        }
        _ => {}
    }

    // Load configuration
    let config_path = match &cli.command {
        Commands::Broker { config, .. }
        | Commands::Device { config, .. }
        | Commands::Provider { config, .. }
        | Commands::Console { config, .. } => config.clone(),
        _ => None,
    };

    let mut config = match RelayConfig::load(config_path.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
    };

    // CLI overrides beat file and environment values
    apply_cli_overrides(&mut config, &cli.command);
    if let Err(e) = config.validate() {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }

    // Initialize logging with config settings.
    // The guards must be kept alive for the lifetime of the program.
    let _log_guards: LogGuards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    // Log version info at startup
    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        host = %local_hostname(),
        "Starting wxrelay"
    );

    // Build and run the tokio runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().min(4))
        .thread_name("wxrelay")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    match cli.command {
        Commands::Broker { .. } => runtime.block_on(run_broker(config)),
        Commands::Device { .. } => runtime.block_on(run_device(config)),
        Commands::Provider { .. } => {
            runtime.block_on(provider::run(config.provider_config(), config.endpoint_config()))
        }
        Commands::Console { .. } => runtime.block_on(console::run(config.endpoint_config())),
        Commands::Version | Commands::Config { .. } => {
            // Already handled above
            unreachable!();
        }
    }
}

/// Fold per-subcommand CLI flags into the loaded configuration
fn apply_cli_overrides(config: &mut RelayConfig, command: &Commands) {
    match command {
        Commands::Broker { bind, port, .. } => {
            if let Some(bind) = bind {
                config.broker.bind_addr = bind.clone();
            }
            if let Some(port) = port {
                config.broker.port = *port;
            }
        }
        Commands::Device { server, port, pipe_dir, .. } => {
            if let Some(server) = server {
                config.endpoint.server_host = server.clone();
            }
            if let Some(port) = port {
                config.endpoint.server_port = *port;
            }
            if let Some(pipe_dir) = pipe_dir {
                config.bridge.pipe_dir = pipe_dir.clone();
            }
            config.endpoint.role = Role::Device.token().to_string();
        }
        Commands::Provider { server, port, city, api_key, .. } => {
            if let Some(server) = server {
                config.endpoint.server_host = server.clone();
            }
            if let Some(port) = port {
                config.endpoint.server_port = *port;
            }
            if let Some(city) = city {
                config.provider.default_city = city.clone();
            }
            if let Some(api_key) = api_key {
                config.provider.api_key = api_key.clone();
            }
            config.endpoint.role = Role::Provider.token().to_string();
        }
        Commands::Console { server, port, .. } => {
            if let Some(server) = server {
                config.endpoint.server_host = server.clone();
            }
            if let Some(port) = port {
                config.endpoint.server_port = *port;
            }
            config.endpoint.role = Role::Console.token().to_string();
        }
        Commands::Version | Commands::Config { .. } => {}
    }
}

/// Best-effort local hostname for the startup log line
fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

// ─────────────────────────────────────────────────────────────────
// Role Runners
// ─────────────────────────────────────────────────────────────────

/// Run the relay broker until ctrl-c
async fn run_broker(config: RelayConfig) -> Result<()> {
    let broker = Broker::bind(&config.broker_config()).await?;
    let handle = broker.handle();
    let addr = broker.local_addr()?;

    info!(addr = %addr, "Broker ready, waiting for role handshakes");

    let run = tokio::spawn(broker.run());

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Internal(format!("Failed to listen for ctrl-c: {}", e)))?;
    info!("Shutdown signal received");
    handle.shutdown();

    run.await
        .map_err(|e| Error::Internal(format!("Broker task failed: {}", e)))?
}

/// Run the device endpoint and its bridge until ctrl-c
async fn run_device(config: RelayConfig) -> Result<()> {
    let bridge = Arc::new(PipeBridge::new(config.bridge_config()));
    info!(
        command_pipe = %bridge.command_path().display(),
        report_pipe = %bridge.report_path().display(),
        "Bridge pipes configured"
    );

    let mut endpoint_config = config.endpoint_config();
    endpoint_config.role = Role::Device;

    let endpoint = Endpoint::new(endpoint_config, Some(Arc::clone(&bridge)));
    let (handle, mut events) = endpoint.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                handle.stop();
                break;
            }

            event = events.recv() => {
                let Some(event) = event else {
                    info!("Endpoint event channel closed");
                    break;
                };

                match event {
                    EndpointEvent::StateChanged(EndpointState::Error) => {
                        warn!("Retry budget exhausted");
                        return Err(Error::RetryBudgetExhausted {
                            attempts: config.endpoint.max_connect_attempts,
                        });
                    }
                    EndpointEvent::StateChanged(state) => {
                        debug!(state = ?state, "Endpoint state");
                    }
                    EndpointEvent::ReportReceived(report) => {
                        debug!(city = %report.city, "Report bridged");
                    }
                    EndpointEvent::CommandReceived(cmd) => {
                        debug!(command = %cmd, "Command bridged");
                    }
                    EndpointEvent::PeerPresent(peer) => {
                        debug!(peer = %peer, "Peer presence notice");
                    }
                    EndpointEvent::Unrecognized(_) => {}
                }
            }
        }
    }

    Ok(())
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = RelayConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            config::init_config(path.as_deref(), force)?;
        }
        ConfigSubcommand::Validate { config } => {
            let path = config.as_deref();
            match RelayConfig::load(path) {
                Ok(_) => {
                    println!("Configuration is valid.");
                }
                Err(e) => {
                    eprint!("{}", e.format_for_terminal());
                    std::process::exit(e.exit_code());
                }
            }
        }
    }

    Ok(())
}
