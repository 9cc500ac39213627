use anyhow::Context;
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use aeronyx_inference_gateway::auth::{ClientIdentity, ClientRegistry};
use aeronyx_inference_gateway::config::{Command, ServerArgs, ServerConfig};
use aeronyx_inference_gateway::crypto::keys::ClientKeypair;
use aeronyx_inference_gateway::server::GatewayServer;
use aeronyx_inference_gateway::utils::logging::{init_file_logging, init_logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = ServerArgs::parse();

    // Initialize logging; the guard keeps the file writer alive
    let _log_guard: Option<WorkerGuard> = match &args.log_file {
        Some(file) => Some(init_file_logging(&args.log_level, file)?),
        None => {
            init_logging(&args.log_level)?;
            None
        }
    };

    let config = ServerConfig::from_args(&args).context("Invalid configuration")?;

    match args.command.clone() {
        Some(command) => run_admin(command, &config).await,
        None => serve(config).await,
    }
}

/// Administrative subcommands against the registry in the data directory
async fn run_admin(command: Command, config: &ServerConfig) -> anyhow::Result<()> {
    if let Command::GenerateKeypair = command {
        let keypair = ClientKeypair::generate()?;
        println!("public_key: {}", keypair.public_key_base64());
        println!("secret_key: {}", keypair.secret_base64());
        return Ok(());
    }

    let (registry, report) = ClientRegistry::open(&config.data_dir, config.max_backups)
        .with_context(|| format!("Failed to open registry in {}", config.data_dir.display()))?;
    for warning in &report.warnings {
        tracing::warn!("Registry: {}", warning);
    }

    match command {
        Command::AddClient {
            client_id,
            public_key,
            label,
        } => {
            registry
                .add(ClientIdentity::new(client_id.clone(), public_key, label))
                .await
                .with_context(|| format!("Failed to add client {}", client_id))?;
            println!("Added client {}", client_id);
            println!("A running gateway picks this up after a registry reload (SIGHUP).");
        }
        Command::RevokeClient { client_id, reason } => {
            let record = registry
                .revoke(&client_id, &reason)
                .await
                .with_context(|| format!("Failed to revoke client {}", client_id))?;
            println!("Revoked client {} at {}", record.client_id, record.revoked_at.to_rfc3339());
        }
        Command::ListClients => {
            let clients = registry.list();
            if clients.is_empty() {
                println!("No registered clients");
            }
            for client in clients {
                let status = match client.revoked_at {
                    Some(at) => format!("revoked {}", at.to_rfc3339()),
                    None => "active".to_string(),
                };
                println!(
                    "{}\t{}\t{}\t{}",
                    client.client_id,
                    status,
                    client.added_at.to_rfc3339(),
                    client.label.as_deref().unwrap_or("-")
                );
            }
        }
        Command::GenerateKeypair => {}
    }
    Ok(())
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    tracing::info!("Starting AeroNyx Inference Gateway");
    tracing::info!("Server version: {}", env!("CARGO_PKG_VERSION"));

    let server = GatewayServer::new(config)?;
    server.start().await?;

    wait_for_shutdown(&server).await;

    server.shutdown().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(server: &GatewayServer) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::warn!("SIGHUP handler unavailable ({}); registry reload disabled", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = hangup.recv() => {
                tracing::info!("SIGHUP received, reloading client registry");
                if let Err(e) = server.reload_registry().await {
                    tracing::error!("Registry reload failed: {}", e);
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_server: &GatewayServer) {
    let _ = tokio::signal::ctrl_c().await;
}
