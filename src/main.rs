use corsgate::config::Config;
use corsgate::pipeline::Pipeline;
use corsgate::server::DevServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Version information
const VERSION: &str = env!("CARGO_PKG_VERSION");
const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("corsgate=info".parse().expect("valid log directive")),
        )
        .init();

    // Optional config path; defaults apply when none is found
    let config_path = std::env::args().nth(1).map(PathBuf::from);

    let config = Config::load_or_default(config_path.as_deref()).map_err(|e| {
        error!(path = ?config_path, error = %e, "Failed to load configuration");
        e
    })?;

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let pipeline = Arc::new(Pipeline::from_config(&config)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = DevServer::bind(bind_addr, Arc::clone(&pipeline), shutdown_rx)
        .await?
        .with_grace_period(config.server.shutdown_grace());

    print_startup_banner(&config, server.local_addr());

    if let Some(files) = pipeline.static_files() {
        if !files.fallback().is_file() {
            warn!(
                fallback = %files.fallback().display(),
                "Fallback document not found; unmatched routes will fail until the bundle is built"
            );
        }
    }

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Dev server error");
        }
    });

    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);

    // Returns once open connections drained or the grace period ran out
    let _ = server_handle.await;

    if let Some(forwarder) = pipeline.forwarder() {
        let stats = forwarder.pool().stats();
        info!(
            forwarded = stats.get_total_requests(),
            failed = stats.get_failed_requests(),
            "Upstream statistics"
        );
    }

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

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
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config, local_addr: SocketAddr) {
    info!(name = PKG_NAME, version = VERSION, "Starting dev server");
    info!(
        url = %format!("http://localhost:{}", local_addr.port()),
        bind = %local_addr,
        "CORS dev server running"
    );
    info!(
        prefix = %config.proxy.prefix,
        upstream = %config.proxy.upstream,
        rewrite = ?config.proxy.rewrite,
        request_timeout_secs = config.proxy.request_timeout_secs,
        "Proxying API requests"
    );
    info!(
        root = %config.static_files.root,
        fallback = %config.static_files.fallback,
        "Serving web app"
    );
    info!(
        allow_origin = %config.cors.allow_origin,
        allow_methods = ?config.cors.allow_methods,
        allow_headers = ?config.cors.allow_headers,
        "CORS policy"
    );
}
