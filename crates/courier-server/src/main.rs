//! Courier server binary.
//!
//! # Usage
//!
//! ```bash
//! # Self-signed certificate, in-memory broker (development)
//! courier-server --bind 0.0.0.0:4433
//!
//! # TLS certificate, durable broker, settings from a file
//! courier-server --config courier.toml --cert cert.pem --key key.pem --data-dir /var/lib/courier
//! ```
//!
//! Any setting can also come from `COURIER_*` environment variables, e.g.
//! `COURIER_QUEUE__BATCH_SIZE=50`. Flags given here override both.

use std::path::PathBuf;

use clap::Parser;
use courier_server::{
    Broker, CourierConfig, MemoryBroker, RedbBroker, Server, ServerError, ServerRuntimeConfig,
    TlsSource,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Courier delivery server
#[derive(Parser, Debug)]
#[command(name = "courier-server")]
#[command(about = "Courier real-time delivery server")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind to, overrides `server.bind_address`
    #[arg(short, long)]
    bind: Option<String>,

    /// Instance id, overrides `server.server_id`
    #[arg(long)]
    server_id: Option<String>,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long)]
    cert: Option<PathBuf>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Directory for the durable broker. In-memory when omitted.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let mut courier = CourierConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        courier.server.bind_address = bind;
    }
    if let Some(server_id) = args.server_id {
        courier.server.server_id = server_id;
    }
    courier.validate()?;

    tracing::info!(server_id = %courier.server.server_id, "Courier server starting");

    let config = ServerRuntimeConfig { courier, tls: TlsSource::from_paths(args.cert, args.key) };

    match args.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            let broker = RedbBroker::open(dir.join("courier.redb"))?;
            tracing::info!(path = %dir.display(), "using durable broker");
            serve(config, broker).await?;
        },
        None => {
            tracing::warn!("using in-memory broker, state is lost on exit");
            serve(config, MemoryBroker::new()).await?;
        },
    }

    Ok(())
}

async fn serve<B: Broker>(config: ServerRuntimeConfig, broker: B) -> Result<(), ServerError> {
    let server = Server::bind(config, broker)?;
    tracing::info!("Server listening on {}", server.local_addr()?);
    server.run().await
}
