mod auth;
mod config;
mod health;
mod http;
mod metrics;
mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, DownloadMode, Overrides, StorageBackend, StorageConfig};
use crate::metrics::MetricsRegistry;
use crate::storage::memory::MemoryStore;
use crate::storage::s3::S3Store;
use crate::storage::ObjectStore;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "nxcache", about = "Self-hosted remote build cache", version)]
struct Cli {
    /// Optional YAML configuration file.  Flags and environment variables
    /// override its values.
    #[arg(short, long, env = "NXCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Interface to listen on.
    #[arg(long, env = "NXCACHE_HOST")]
    host: Option<String>,

    /// Port to listen on.
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Shared secret clients must send as `Authorization: Bearer <token>`.
    #[arg(long, env = "NX_CACHE_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    #[arg(long, env = "S3_BUCKET_NAME")]
    bucket: Option<String>,

    /// Endpoint of an S3-compatible service (path-style addressing is used).
    #[arg(long, env = "S3_ENDPOINT_URL")]
    endpoint_url: Option<String>,

    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    access_key_id: Option<String>,

    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    secret_access_key: Option<String>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            host: self.host.clone(),
            port: self.port,
            access_token: self.access_token.clone(),
            region: self.region.clone(),
            bucket: self.bucket.clone(),
            endpoint_url: self.endpoint_url.clone(),
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every request handler.  Immutable after start-up.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ObjectStore>,
    /// Client used to fetch presigned download URLs.
    pub http_client: reqwest::Client,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// Object store setup
// ---------------------------------------------------------------------------

async fn build_s3_client(storage: &StorageConfig) -> Result<aws_sdk_s3::Client> {
    let mut aws_config_loader =
        aws_config::from_env().region(aws_config::Region::new(storage.region.clone()));

    if let (Some(key_id), Some(secret)) = (&storage.access_key_id, &storage.secret_access_key) {
        aws_config_loader = aws_config_loader.credentials_provider(
            aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "nxcache-config"),
        );
    }

    if let Some(ref endpoint) = storage.endpoint_url {
        aws_config_loader = aws_config_loader.endpoint_url(endpoint);
    }

    let aws_config = aws_config_loader.load().await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(storage.force_path_style)
        .build();

    let client = aws_sdk_s3::Client::from_conf(s3_config);
    tracing::info!(
        bucket = %storage.bucket,
        region = %storage.region,
        endpoint = storage.endpoint_url.as_deref().unwrap_or("aws"),
        path_style = storage.force_path_style,
        "S3 client initialised"
    );
    Ok(client)
}

async fn build_store(storage: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    match storage.backend {
        StorageBackend::S3 => {
            let client = build_s3_client(storage).await?;
            Ok(Arc::new(S3Store::new(client, storage.bucket.clone())))
        }
        StorageBackend::Memory => {
            tracing::warn!("using in-memory store; artifacts are lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let host = state.config.server.host.clone();
    let port = state.config.server.port;
    let app = http::handler::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("failed to bind HTTP listener on {host}:{port}"))?;

    let listen_addr = listener
        .local_addr()
        .context("failed to read listener address")?;
    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let mut config = config::load_config(cli.config.as_deref(), cli.overrides())?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = ?cli.config, "starting nxcache");

    if config.storage.backend == StorageBackend::Memory
        && config.storage.download_mode == DownloadMode::Presigned
    {
        tracing::info!("memory store cannot presign URLs; serving downloads directly");
        config.storage.download_mode = DownloadMode::Direct;
    }
    let config = Arc::new(config);

    // ---- Infrastructure clients ----
    let store = build_store(&config.storage).await?;

    let http_client = reqwest::Client::builder()
        .user_agent(concat!("nxcache/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build reqwest client")?;

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        store,
        http_client,
        metrics: MetricsRegistry::new(),
    };

    run_http_server(state).await?;

    tracing::info!("nxcache shut down cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    fn env_of(id: &str) -> Option<String> {
        Cli::command()
            .get_arguments()
            .find(|arg| arg.get_id() == id)
            .and_then(|arg| arg.get_env())
            .map(|env| env.to_string_lossy().into_owned())
    }

    #[test]
    fn flags_read_documented_environment_variables() {
        assert_eq!(env_of("host").as_deref(), Some("NXCACHE_HOST"));
        assert_eq!(env_of("port").as_deref(), Some("PORT"));
        assert_eq!(env_of("access_token").as_deref(), Some("NX_CACHE_ACCESS_TOKEN"));
        assert_eq!(env_of("bucket").as_deref(), Some("S3_BUCKET_NAME"));
        assert_eq!(env_of("endpoint_url").as_deref(), Some("S3_ENDPOINT_URL"));
        assert_eq!(env_of("config").as_deref(), Some("NXCACHE_CONFIG"));
    }

    #[test]
    fn host_flag_overrides_default_listen_address() {
        let cli = Cli::try_parse_from([
            "nxcache",
            "--host",
            "127.0.0.1",
            "--port",
            "4000",
            "--access-token",
            "secret",
        ])
        .unwrap();

        let config = config::load_config(None, cli.overrides()).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 4000);
    }
}
