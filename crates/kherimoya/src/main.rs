//! `kherimoya` command-line entry point.
//!
//! Loads configuration, sets up logging and runs one registry command against
//! the configured root.

mod cli;
mod config;
mod logging;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use cli::{Args, Command};
use config::AppConfig;
use kherimoya_core::{ControlMethod, ServerEntity, ServerRegistry, SessionController, TmuxBackend};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load_from_file(&args.config)
        .await
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
    if let Some(root) = &args.root {
        config.registry.root = root.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {e}"))?;

    logging::setup_logging(&config.logging, args.json_logs)?;
    debug!("Using configuration {:?}", config);

    let registry = build_registry(&config);
    run(&registry, args.command).await
}

fn build_registry(config: &AppConfig) -> ServerRegistry {
    let registry_config = config.to_registry_config();
    let backend = Arc::new(TmuxBackend::with_program(config.session.tmux_program.clone()));
    let sessions = SessionController::new(
        backend,
        registry_config.launcher.clone(),
        registry_config.polling.clone(),
    );
    ServerRegistry::new(&config.registry.root, registry_config, sessions)
}

async fn run(registry: &ServerRegistry, command: Command) -> Result<()> {
    match command {
        Command::List => {
            let mut servers = registry.list_entities().await?;
            if servers.is_empty() {
                println!("No servers in {}", registry.servers_dir().display());
                return Ok(());
            }
            servers.sort_by(|a, b| a.name().cmp(b.name()));
            println!("{:<24} {:<12} {}", "NAME", "ID", "STATE");
            for server in &servers {
                let state = if server.running() { "running" } else { "stopped" };
                println!(
                    "{:<24} {:<12} {}",
                    server.name(),
                    server.identifier().unwrap_or("-"),
                    state
                );
            }
        }
        Command::Create {
            name,
            install_timeout,
            no_timeout,
        } => {
            let timeout = if no_timeout {
                None
            } else {
                match install_timeout {
                    Some(0) => None,
                    Some(secs) => Some(Duration::from_secs(secs)),
                    None => registry.config().install_timeout,
                }
            };
            println!("Creating {name}, this can take a few minutes...");
            let server = registry.create(name, timeout).await?;
            println!("Created {} at {}", server, server.path().display());
        }
        Command::Delete { id } => {
            let server = find(registry, &id).await?;
            let label = server.to_string();
            registry.delete(server).await?;
            println!("Deleted {label}");
        }
        Command::Rename { id, new_name } => {
            let mut server = find(registry, &id).await?;
            let old = server.to_string();
            registry.rename(&mut server, &new_name).await?;
            println!("Renamed {old} to {server}");
        }
        Command::Start { id } => {
            let mut server = find(registry, &id).await?;
            registry.start(&mut server, ControlMethod::Tmux).await?;
            println!("Started {server}");
        }
        Command::Stop { id } => {
            let mut server = find(registry, &id).await?;
            registry.sync_running(&mut server).await?;
            registry.stop(&mut server, ControlMethod::Tmux).await?;
            println!("Sent stop to {server}");
        }
        Command::Info { id } => {
            let server = find(registry, &id).await?;
            let live = registry.is_running(&server).await;
            println!("Name:       {}", server.name());
            println!("Identifier: {}", server.identifier().unwrap_or("-"));
            println!("Path:       {}", server.path().display());
            println!("Session:    {}", server.session_name().unwrap_or_default());
            println!("Recorded:   {}", if server.running() { "running" } else { "stopped" });
            println!("Live:       {}", if live { "running" } else { "stopped" });
        }
        Command::ResolveConflicts => {
            if registry.resolve_conflicts().await? {
                println!("Resolved identifier conflicts");
            } else {
                println!("No identifier conflicts found");
            }
        }
    }

    Ok(())
}

async fn find(registry: &ServerRegistry, id: &str) -> Result<ServerEntity> {
    registry
        .find_by_id(id)
        .await?
        .ok_or_else(|| anyhow!("No server with identifier {id}"))
}
