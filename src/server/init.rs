//! Server startup

use super::config::ServerConfig;
use super::state::AppState;
use tracing::info;

/// Build the state, bind and serve until shutdown.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.jamai_host, config.jamai_port);
    let state = AppState::build(config).await?;
    let app = crate::api::router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "jamai listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}
