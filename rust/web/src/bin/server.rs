//! Standalone session server.
//!
//! Usage: cargo run -p tavern_web --bin tavern-server -- --port 8080
//!
//! Set `REDIS_URL` (or `--redis-url`) to share state with other instances.

use clap::Parser;
use tavern_web::{init_logging, AppContext, AppSettings, LogFormat, ServerConfig, WebServer};

#[derive(Parser, Debug)]
#[command(name = "tavern-server", version, about = "Tavern real-time session server")]
struct Args {
    /// Address to bind
    #[arg(long, env = "TAVERN_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind (0 picks a free one)
    #[arg(short, long, env = "TAVERN_PORT", default_value_t = 8080)]
    port: u16,

    /// Shared Redis server; without it all state stays in this process
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    init_logging(args.log_format)?;

    let settings = AppSettings::from_env()?;
    let config = ServerConfig::new(args.host, args.port);
    let context = match args.redis_url.as_deref() {
        Some(url) => AppContext::connect_redis(config, settings, url)?,
        None => AppContext::new(config, settings)?,
    };
    let server = WebServer::from_context(context);
    let handle = server.start().await?;
    tracing::info!(address = %handle.address(), "press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    handle.shutdown().await?;
    Ok(())
}
