use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use invoicer::store::MemoryStore;
use invoicer::{api, App, AppState, Config, RunMode, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let default_filter = match config.mode {
        RunMode::Debug => "invoicer=debug",
        RunMode::Release => "invoicer=info",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = tokio::fs::create_dir_all(&config.uploads_dir).await {
        tracing::warn!(dir = %config.uploads_dir.display(), "cannot create uploads directory: {e}");
    }

    tracing::info!(
        mode = config.mode.as_str(),
        frontend = %config.frontend_origin,
        rate_limit = config.rate_limit.max_requests,
        window_secs = config.rate_limit.window.as_secs(),
        "starting invoicer",
    );

    let bind = config.bind;
    let state = Arc::new(AppState::new(config, Arc::new(MemoryStore::new())));
    Server::bind(bind).serve(App::new(state, api::routes())).await?;
    Ok(())
}
