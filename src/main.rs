//! Harmony - Auto-tuning session server
//!
//! Applications register tuning variables with a Harmony server, report
//! performance, and receive new values to try.

mod binding;
mod config;
mod network;
mod protocol;
mod session;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use binding::PullMode;
use config::Config;
use network::{resolve_host, Server, ServerEvent, TuningClient};
use protocol::{MessageKind, VarKind};
use session::SessionEvent;

/// Harmony - Auto-tuning session server
#[derive(Parser)]
#[command(name = "harmony")]
#[command(author = "Harmony Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Serve and drive auto-tuning sessions", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the session server
    Server {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Search strategy
        #[arg(short, long)]
        strategy: Option<String>,
    },

    /// Run a tuning client against a server
    Tune {
        /// Application name to register
        #[arg(short, long)]
        app: Option<String>,

        /// Variable to declare, as KIND:NAME (e.g. int:tile, str:algo)
        #[arg(long = "var", value_parser = parse_var_arg)]
        vars: Vec<(VarKind, String)>,

        /// Number of report/pull rounds
        #[arg(short, long, default_value_t = 10)]
        iterations: u32,

        /// Server host; when given, the HARMONY_S_* variables are ignored
        #[arg(long)]
        host: Option<String>,

        /// Server port, overriding HARMONY_S_PORT and config
        #[arg(short, long)]
        port: Option<u16>,

        /// How server values reach the live variables
        #[arg(short, long, value_enum)]
        mode: Option<PullMode>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

fn parse_var_arg(arg: &str) -> Result<(VarKind, String), String> {
    let (kind, name) = match arg.split_once(':') {
        Some(("int", name)) => (VarKind::Integer, name),
        Some(("str", name)) => (VarKind::String, name),
        Some((kind, _)) => return Err(format!("unknown variable kind '{}'", kind)),
        None => (VarKind::Integer, arg),
    };
    if name.is_empty() {
        return Err("variable name is empty".to_string());
    }
    Ok((kind, name.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Server { port, strategy } => {
            run_server(config, port, strategy).await?;
        }
        Commands::Tune {
            app,
            vars,
            iterations,
            host,
            port,
            mode,
        } => {
            run_tuner(config, app, vars, iterations, host, port, mode).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_protocol_info();
        }
    }

    Ok(())
}

/// Run the session server
async fn run_server(
    mut config: Config,
    port: Option<u16>,
    strategy: Option<String>,
) -> anyhow::Result<()> {
    if let Some(name) = strategy {
        config.server.strategy = name;
    }
    let strategy = config.server.strategy()?;
    let net_config = config.net_config(port);

    tracing::info!(
        "Starting Harmony server '{}' on port {} (strategy: {})",
        config.general.name,
        net_config.port,
        strategy.name()
    );

    let mut server = Server::new(net_config, strategy);
    let mut event_rx = server
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("server event receiver already taken"))?;

    let bind_addr = server.start().await?;

    println!("\n========================================");
    println!("  Harmony Server Running");
    println!("========================================");
    println!("  Host: {}", config.general.name);
    println!("  Listening: {}", bind_addr);
    println!("  Strategy: {}", config.server.strategy);
    println!("  Client slots: {}", config.server.max_clients);
    println!("========================================");
    println!("\nWaiting for clients to connect...");
    println!("Press Ctrl+C to stop.\n");

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::ClientConnected { addr, conn } => {
                        tracing::debug!("Connection {} from {}", conn, addr);
                    }
                    ServerEvent::ClientDisconnected { addr, conn, reason } => {
                        tracing::debug!("Connection {} from {} closed: {}", conn, addr, reason);
                    }
                    ServerEvent::Session { addr, event } => match event {
                        SessionEvent::Registered { client, signal_mode } => {
                            println!(
                                "+ {} registered from {} (signal mode: {})",
                                client, addr, signal_mode
                            );
                        }
                        SessionEvent::Migrated { client, .. } => {
                            println!("~ {} resumed from {}", client, addr);
                        }
                        SessionEvent::VariableRegistered { client, name } => {
                            println!("  {} declared '{}'", client, name);
                        }
                        SessionEvent::PerformanceReported { client, performance, stale } => {
                            let note = if stale { " (stale)" } else { "" };
                            tracing::info!("{} reported {}{}", client, performance, note);
                        }
                        SessionEvent::Revoked { client, app_name } => {
                            let app = app_name.as_deref().unwrap_or("unnamed");
                            println!("- {} ({}) left", client, app);
                        }
                    },
                    ServerEvent::Error { message } => {
                        tracing::error!("Server error: {}", message);
                    }
                    ServerEvent::Started { .. } | ServerEvent::Stopped => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.stop().await?;
    tracing::info!("Server stopped");

    Ok(())
}

/// Drive a tuning session: declare variables, then report and pull
async fn run_tuner(
    config: Config,
    app: Option<String>,
    vars: Vec<(VarKind, String)>,
    iterations: u32,
    host: Option<String>,
    port: Option<u16>,
    mode: Option<PullMode>,
) -> anyhow::Result<()> {
    let mode = mode.unwrap_or(config.client.mode);
    let net_config = config.net_config(None);
    let target = config.client_target(host, port, |name| std::env::var(name).ok());

    let addr = resolve_host(&target.host, target.port).await?;
    let mut client = TuningClient::connect(addr, &net_config, mode).await?;

    let app_name = app.unwrap_or_else(|| config.app_name());
    let client_id = client.register(Some(&app_name), None).await?;
    println!("Registered '{}' as client {}", app_name, client_id);

    let mut handles = Vec::with_capacity(vars.len());
    for (kind, name) in &vars {
        handles.push((client.add_variable(name, *kind).await?, *kind));
    }

    for round in 1..=iterations {
        client.pull_all().await?;

        // Stand-in workload: smaller integer values score better.
        let mut performance = 0i32;
        let mut point = Vec::with_capacity(handles.len());
        for (handle, kind) in &handles {
            let var = client.variables().get(*handle)?;
            if *kind == VarKind::Integer {
                let value = client.int(*handle)?;
                performance = performance.saturating_sub(value.saturating_abs());
            }
            point.push(format!("{}={}", var.name, var.value));
        }

        client.report_performance(performance).await?;
        println!(
            "round {:>3}: [{}] -> {} (timestamp {})",
            round,
            point.join(", "),
            performance,
            client.timestamp()
        );
    }

    client.unregister().await?;
    println!("Session closed");

    Ok(())
}

/// Print protocol information
fn print_protocol_info() {
    println!("Harmony Protocol Information");
    println!("============================\n");

    println!("Protocol version: {}", protocol::PROTOCOL_VERSION);
    println!("Default port: {}", protocol::DEFAULT_PORT);
    println!("String limit: {} bytes", protocol::MAX_STRING_LEN - 1);

    println!("\nMessage kinds:");
    for kind in MessageKind::ALL {
        let shape = kind
            .shape()
            .map(|s| format!("{:?}", s))
            .unwrap_or_else(|| "-".to_string());
        println!("  {:>2}  {:<16} {}", kind.as_u32(), kind.as_str(), shape);
    }

    println!("\nClient environment:");
    println!("  {}  server host", config::HOST_ENV);
    println!("  {}  server port", config::PORT_ENV);

    if let Some(dir) = dirs::config_dir() {
        println!("\nConfig file: {}", dir.join("harmony/config.toml").display());
    }
}
