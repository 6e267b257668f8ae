//! Spectacle daemon - runs terminal agents on the user's desktop.

use spectacle::config::DaemonConfig;
use spectacle::daemon::{run_daemon, LlmObserver};
use spectacle::llm::{GeminiModel, GeminiService, RetryingService};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spectacle=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DaemonConfig::from_env();

    let gemini_key = config.gemini_api_key.clone().ok_or(
        "GEMINI_API_KEY is required: the observer classifies terminal output",
    )?;
    let observer = Arc::new(LlmObserver::new(Arc::new(RetryingService::new(Arc::new(
        GeminiService::new(gemini_key, GeminiModel::Flash),
    )))));

    run_daemon(config, observer).await?;
    Ok(())
}
