//! CLI entry point for pqn
//!
//! - `pqn serve` runs a device server for the devices in the node config
//! - `pqn ping | devices | info | call` talk to a running server
//!
//! # Usage
//!
//! ```bash
//! pqn serve --config config/node.toml
//! pqn call --server lab-a --device rotator --op move_to --args '[45.0]'
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use pqn_stack::config::NodeConfig;
use pqn_stack::device::drivers::DriverContext;
use pqn_stack::device::registry::DeviceRegistry;
use pqn_stack::device::Arguments;
use pqn_stack::logging;
use pqn_stack::network::{Client, DeviceServer};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "pqn")]
#[command(about = "Networked lab instrument control", long_about = None)]
struct Cli {
    /// Node configuration file
    #[arg(long, global = true, default_value = pqn_stack::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the configured devices until Ctrl-C
    Serve,

    /// Round trip to a server
    Ping {
        #[arg(long)]
        server: String,
    },

    /// List every device on a server
    Devices {
        #[arg(long)]
        server: String,
    },

    /// Show one device's status and operations
    Info {
        #[arg(long)]
        server: String,
        #[arg(long)]
        device: String,
    },

    /// Invoke one operation and print the result
    Call {
        #[arg(long)]
        server: String,
        #[arg(long)]
        device: String,
        #[arg(long)]
        op: String,
        /// JSON array of positional arguments
        #[arg(long, default_value = "[]")]
        args: String,
        /// JSON object of keyword arguments
        #[arg(long, default_value = "{}")]
        kwargs: String,
        /// Deadline, e.g. "30s"
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        timeout: Option<Duration>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = NodeConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate().map_err(|e| anyhow!(e))?;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    let client = Client::from_directory(&config.directory, config.client.clone());

    let outcome = match cli.command {
        Commands::Serve => serve(config, client.clone()).await,
        Commands::Ping { server } => {
            let reply = client.ping(&server).await?;
            print_json(&reply)
        }
        Commands::Devices { server } => {
            let devices = client.list_devices(&server).await?;
            print_json(&devices)
        }
        Commands::Info { server, device } => {
            let info = client.device_info(&server, &device).await?;
            print_json(&info)
        }
        Commands::Call {
            server,
            device,
            op,
            args,
            kwargs,
            timeout,
        } => {
            let args: Vec<Value> =
                serde_json::from_str(&args).context("--args must be a JSON array")?;
            let kwargs: Map<String, Value> =
                serde_json::from_str(&kwargs).context("--kwargs must be a JSON object")?;

            let mut remote = client.get_device(&server, &device).await?;
            if let Some(timeout) = timeout {
                remote = remote.with_timeout(timeout);
            }
            let result = remote.call(&op, Arguments::from_json(args, kwargs)).await?;
            print_json(&result)
        }
    };

    client.shutdown().await;
    outcome
}

async fn serve(config: NodeConfig, client: Client) -> Result<()> {
    Client::install_global(client.clone())?;

    let registry = Arc::new(DeviceRegistry::with_policy(config.node.busy_policy));
    let ctx = DriverContext::with_client(client);
    let started = registry.register_all(&config.devices, &ctx).await;
    let wanted = config.enabled_devices().count();
    if started.len() < wanted {
        warn!(started = started.len(), configured = wanted, "Some devices failed to start");
    }
    info!(node = %config.node.name, devices = ?registry.names(), "Devices ready");

    let server = DeviceServer::bind(&config.node.bind_addr(), &config.node.name, registry.clone())
        .await?
        .with_idle_timeout(config.node.idle_timeout);
    let shutdown = server.shutdown_token();
    let server_task = tokio::spawn(server.run());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown.cancel();
    server_task.await??;

    registry.shutdown().await;
    info!("Node stopped");
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
