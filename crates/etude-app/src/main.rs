use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use etude_app::{AppState, Database, StoreManager, build_router};
use etude_core::{Config, Server, logging};
use etude_pool::{Pool, PoolConfig};
use mimalloc::MiMalloc;
use tracing::info;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "etude")]
#[command(about = "Credential and image-upload demo on the Etude HTTP engine")]
#[command(version)]
struct Cli {
    /// Listening port (overrides SERVER_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Interface to bind (overrides SERVER_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Serve HTTPS
    #[arg(long)]
    tls: bool,

    /// PEM certificate chain
    #[arg(long)]
    cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long)]
    key: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit one JSON object per log line
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if self.tls {
            config.tls = true;
        }
        if let Some(cert) = self.cert {
            config.tls_cert_path = cert;
        }
        if let Some(key) = self.key {
            config.tls_key_path = key;
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.json_logs {
        logging::init_logging_json(&cli.log_level);
    } else {
        logging::init_logging_with_level(&cli.log_level);
    }

    let mut config = Config::from_env();
    cli.apply(&mut config);
    config.validate()?;

    let db = Arc::new(Database::new());
    let pool = Pool::new(
        StoreManager::new(db),
        PoolConfig {
            min: config.db_pool_min,
            max: config.db_pool_max,
            check_interval: config.db_check_interval(),
            ..PoolConfig::default()
        },
    )
    .context("failed to open the store")?;
    let pool = Arc::new(pool);

    let router = build_router(AppState::new(pool.clone(), config.acquire_timeout()));
    let server = Server::bind(config, router).context("failed to start server")?;

    let handle = server.shutdown_handle();
    ctrlc::set_handler(move || handle.shutdown()).context("failed to install Ctrl-C handler")?;

    server.serve()?;

    pool.shutdown();
    info!("bye");
    Ok(())
}
