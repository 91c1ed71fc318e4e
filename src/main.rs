//! JamAI - multi-tenant LLM serving gateway and generative table engine
//!
//! Server entry point.

#![forbid(unsafe_code)]

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod middleware;
mod server;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stderr());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jamai=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
        .init();

    let config = server::ServerConfig::load()?;
    info!("starting jamai v{}", env!("CARGO_PKG_VERSION"));
    server::run(config).await
}
