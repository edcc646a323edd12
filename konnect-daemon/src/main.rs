mod api;
mod config;
mod icon;

use anyhow::{Context, Result};
use api::AppState;
use clap::Parser;
use config::{AdminBind, Config};
use icon::IconCache;
use konnect_protocol::{
    tls, CertificateInfo, Database, Discovery, PeerServer, Registry, ServerContext,
    TransferManager,
};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    config.validate()?;

    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config_dir = config.config_dir();
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("failed to create config directory {:?}", config_dir))?;

    let database = Arc::new(
        Database::open(config_dir.join("konnect.db")).context("failed to open trust store")?,
    );

    let identity =
        CertificateInfo::load_or_generate(&config_dir).context("failed to load certificate")?;
    let identifier = identity.device_id.clone();

    info!(
        "Starting konnectd {} as {} ({})",
        env!("CARGO_PKG_VERSION"),
        config.name,
        identifier
    );

    let connector = tls::create_connector(&identity)?;
    let acceptor = tls::create_acceptor(&identity)?;

    let transfers = Arc::new(TransferManager::new(
        acceptor,
        connector.clone(),
        config.transfer_port,
        config.max_transfer_ports,
    ));

    let registry = Arc::new(Registry::new());

    let ctx = Arc::new(ServerContext {
        identity,
        device_name: config.name.clone(),
        service_port: config.service_port,
        connector,
        database,
        registry,
        transfers,
    });

    let server = PeerServer::bind(ctx.clone(), config.service_port)
        .await
        .context("failed to bind service port")?;

    let discovery = Arc::new(
        Discovery::bind(
            identifier,
            config.name.clone(),
            config.discovery_port,
            config.service_port,
            config.receiver,
        )
        .await
        .context("failed to bind discovery port")?,
    );

    // Announce ourselves once at startup, then keep ingesting.
    if let Err(e) = discovery.announce().await {
        error!("Failed to broadcast identity packet: {}", e);
    }

    let icons = Arc::new(IconCache::new(config_dir.join("icons"))?);

    let state = AppState {
        ctx,
        discovery: discovery.clone(),
        icons,
        debug: config.debug,
    };
    let app = api::router(state);

    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("Service listener failed: {}", e);
        }
    });

    let ingest = discovery.clone();
    tokio::spawn(async move {
        if let Err(e) = ingest.run().await {
            error!("Discovery listener failed: {}", e);
        }
    });

    match config.admin_bind {
        AdminBind::Tcp => {
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.admin_port))
                .await
                .context("failed to bind admin port")?;
            info!("Admin API on 127.0.0.1:{}", config.admin_port);
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
        AdminBind::Socket => {
            let path = config.admin_socket();
            let _ = std::fs::remove_file(&path);
            let listener = tokio::net::UnixListener::bind(&path)
                .with_context(|| format!("failed to bind admin socket {:?}", path))?;
            info!("Admin API on {:?}", path);
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
            let _ = std::fs::remove_file(&path);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        error!("Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");
}
