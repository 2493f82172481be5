use anyhow::Context;
use clap::Parser;
use ratelimitd::config::Config;
use ratelimitd::server::Server;
use tracing_subscriber::EnvFilter;

/// A distributed, multi-algorithm rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "ratelimitd", version, about)]
struct Args {
    /// Address to bind, e.g. 0.0.0.0:8080. Overrides the environment.
    #[arg(long)]
    bind: Option<String>,

    /// Redis URL for distributed mode. Overrides the environment; an empty
    /// value forces the in-process backend.
    #[arg(long)]
    redis_url: Option<String>,

    /// Deny requests when the backend is unreachable instead of allowing
    /// them.
    #[arg(long)]
    fail_closed: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(redis_url) = args.redis_url {
        config.redis_url = redis_url;
    }
    if args.fail_closed {
        config.fail_open = false;
    }

    tracing::info!(
        bind = %config.bind_address,
        backend = if config.uses_redis() { "redis" } else { "memory" },
        fail_open = config.fail_open,
        "starting ratelimitd"
    );

    let server = Server::new(config)
        .await
        .map_err(|e| anyhow::anyhow!("server setup failed: {e}"))?;
    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("server terminated: {e}"))?;
    Ok(())
}
