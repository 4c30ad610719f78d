use bastion_relay::config::Config;
use bastion_relay::server::{RelayServer, PKG_NAME, VERSION};
use bastion_relay::tls::{client_server_config, load_pem, self_signed_cert, AllowList, StaticCertResolver, TlsOverlay};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bastion_relay=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Certificate for public clients: file-based, or self-signed
    let (certs, key) = match (&config.server.tls_cert, &config.server.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            let (certs, key) = load_pem(cert_path, key_path)?;
            info!(cert = %cert_path, key = %key_path, "TLS enabled with provided certificates");
            (certs, key)
        }
        _ => {
            let (certs, key) = self_signed_cert(&["localhost", "127.0.0.1"])?;
            warn!("TLS enabled with auto-generated self-signed certificate (not for production)");
            (certs, key)
        }
    };

    // Certificate for backends: its own pair if configured, the public one otherwise
    let backend_resolver = match (&config.server.backend_tls_cert, &config.server.backend_tls_key) {
        (Some(cert_path), Some(key_path)) => {
            info!(cert = %cert_path, key = %key_path, "Using dedicated certificate for backends");
            let (certs, key) = load_pem(cert_path, key_path)?;
            cert_resolver(certs, key)?
        }
        _ => cert_resolver(certs.clone(), key.clone_key())?,
    };

    let base = client_server_config(cert_resolver(certs, key)?, &[b"h2", b"http/1.1"])
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

    let allow_list = AllowList::new(config.relay.allowed_backends.iter().copied());
    if allow_list.is_empty() {
        warn!("No backends in allowed_backends, every backend connection will be refused");
    }

    let overlay = TlsOverlay::new(Arc::new(base), backend_resolver, Arc::new(allow_list))
        .map_err(|e| anyhow::anyhow!("Backend TLS configuration error: {}", e))?;

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = RelayServer::new(bind_addr, overlay, config.relay.session_config(), shutdown_rx)
        .with_handshake_timeout(config.server.handshake_timeout());

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Relay server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for the listener to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting relay server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        tls_files = config.server.has_tls_files(),
        backend_tls_files = config.server.has_backend_tls_files(),
        handshake_timeout_secs = config.server.handshake_timeout_secs,
        "Server configuration"
    );
    info!(
        keepalive_interval_secs = config.relay.keepalive_interval_secs,
        keepalive_timeout_secs = config.relay.keepalive_timeout_secs,
        ping_timeout_secs = config.relay.ping_timeout_secs,
        drain_timeout_secs = config.relay.drain_timeout_secs,
        "Backend session settings"
    );
    info!(
        backend_count = config.relay.allowed_backends.len(),
        backends = ?config.relay.allowed_backends.iter().map(|b| b.to_hex()).collect::<Vec<_>>(),
        "Allowed backends"
    );
}

fn cert_resolver(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> anyhow::Result<Arc<StaticCertResolver>> {
    let resolver = StaticCertResolver::new(certs, key)
        .map_err(|e| anyhow::anyhow!("Unsupported TLS private key: {}", e))?;
    Ok(Arc::new(resolver))
}
