//! Palisade CLI entry point

// Use mimalloc as global allocator for better tail latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use palisade::{Config, Server, VERSION};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "palisade")]
#[command(version = VERSION)]
#[command(about = "Filtering forward HTTP/1.1 proxy")]
struct Args {
    /// Listen address
    #[arg(long = "host", default_value = "127.0.0.1")]
    host: String,

    /// Listen port
    #[arg(short = 'p', long = "port", default_value_t = 8888)]
    port: u16,

    /// Path to the blacklist file
    #[arg(long = "blacklist")]
    blacklist: Option<PathBuf>,

    /// Path to a credentials file; enables proxy authentication
    #[arg(long = "auth-file")]
    auth_file: Option<PathBuf>,

    /// Enable the GET response cache
    #[arg(long = "cache")]
    cache: bool,

    /// Cache budget in bytes
    #[arg(long = "cache-bytes", default_value_t = palisade::cache::DEFAULT_CAPACITY_BYTES)]
    cache_bytes: usize,

    /// Directory for the access log
    #[arg(long = "log-dir", default_value = "logs")]
    log_dir: PathBuf,

    /// Maximum concurrent connections
    #[arg(long = "max-connections", default_value_t = 10_000)]
    max_connections: usize,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("palisade-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("palisade=info".parse()?),
        )
        .init();

    let args = Args::parse();
    info!("Palisade v{}", VERSION);

    let config = Config {
        host: args.host,
        port: args.port,
        blacklist: args.blacklist,
        auth_file: args.auth_file,
        cache: args.cache,
        cache_bytes: args.cache_bytes,
        log_dir: args.log_dir,
        max_connections: args.max_connections,
        ..Config::default()
    };

    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(palisade::Error::Io(e)) => {
            error!("failed to bind listener: {}", e);
            std::process::exit(2);
        }
        Err(e) => {
            error!("fatal configuration error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("server error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
