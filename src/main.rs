use sitehost::admin::{SiteApi, PKG_NAME, VERSION};
use sitehost::config::Config;
use sitehost::pool::ConnectionPool;
use sitehost::proxy::ReverseProxy;
use sitehost::registry::SiteRegistry;
use sitehost::router::Router;
use sitehost::server::HostingServer;
use sitehost::site::{InMemorySiteStore, SiteStore};
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
                .add_directive("sitehost=debug".parse().expect("valid log directive")),
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

    let registry = Arc::new(SiteRegistry::new(config.host_pool()));
    let store: Arc<dyn SiteStore> = Arc::new(InMemorySiteStore::new());
    let pool = Arc::new(ConnectionPool::new(config.pool_config()));
    let proxy = Arc::new(ReverseProxy::new(Arc::clone(&pool), config.proxy_settings()));

    let router = Arc::new(Router::new(
        Arc::clone(&registry),
        Arc::new(config.workspace_store()),
        Arc::new(config.workspace_access()),
        proxy,
    ));

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated site API token (configure admin_token to set a fixed value)");
        token
    });

    let api = Arc::new(SiteApi::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        pool.stats(),
        admin_token,
    ));

    let edit_server = format!("http://127.0.0.1:{}", config.server.port);
    provision_sites(&config, store.as_ref(), &registry, &edit_server);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = HostingServer::new(bind_addr, router, api, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Hosting server error");
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

    // Hosted sites live only in memory
    info!(running = registry.len(), "Dropping hosted sites");

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Load `[[sites]]` into the store and start those marked `started`
fn provision_sites(config: &Config, store: &dyn SiteStore, registry: &SiteRegistry, edit_server: &str) {
    for entry in &config.sites {
        let site = store.insert(&entry.user, entry.to_configuration());
        info!(site = %site.id, user = %entry.user, name = %site.name, "Provisioned site configuration");

        if entry.started {
            match registry.start(&site, &entry.user, edit_server, "http") {
                Ok(hosted) => info!(site = %site.id, url = %hosted.url, "Site is hosted"),
                Err(e) => warn!(site = %site.id, error = %e, "Failed to start provisioned site"),
            }
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting site hosting server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        hosting_port = config.hosting_port(),
        "Server configuration"
    );
    info!(pool = %config.host_pool(), "Virtual host pool");
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        connect_timeout_secs = config.hosting.connect_timeout_secs,
        response_timeout_secs = config.hosting.response_timeout_secs,
        max_forwards = config.hosting.max_forwards,
        "Upstream settings"
    );
    info!(
        workspaces = ?config.workspaces.keys().collect::<Vec<_>>(),
        sites = config.sites.len(),
        "Configured content"
    );
}
