//! Spectacle server - cloud side of the agent orchestration platform.

use spectacle::api::{create_router, AppState};
use spectacle::config::ServerConfig;
use spectacle::conversation::ConversationService;
use spectacle::db::Database;
use spectacle::llm::{AnthropicModel, AnthropicService, LlmService, RetryingService};
use spectacle::master_agent::{MasterAgent, MasterAgentConfig};
use spectacle::registry::DaemonRegistry;
use spectacle::tools::ToolRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spectacle=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = ServerConfig::from_env();

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path, "Opening database");
    let db = Database::open(&config.db_path)?;

    // Planner on the fast tier, synthesis on the stronger one, both behind
    // the transient-retry wrapper.
    let api_key = config.anthropic_api_key.clone().unwrap_or_default();
    if api_key.is_empty() {
        tracing::warn!("ANTHROPIC_API_KEY not set; queries will fail at the planner");
    }
    let planner: Arc<dyn LlmService> = Arc::new(RetryingService::new(Arc::new(
        AnthropicService::new(api_key.clone(), AnthropicModel::Claude45Haiku),
    )));
    let synthesizer: Arc<dyn LlmService> = Arc::new(RetryingService::new(Arc::new(
        AnthropicService::new(api_key, AnthropicModel::Claude45Sonnet),
    )));

    let registry = Arc::new(DaemonRegistry::new(db.clone(), &config));
    let conversations = ConversationService::new(db.clone(), config.conversation_ttl);
    let master_agent = Arc::new(MasterAgent::new(
        db.clone(),
        conversations.clone(),
        Arc::clone(&registry),
        ToolRegistry::new(),
        planner,
        synthesizer,
        MasterAgentConfig::from_server(&config),
    ));

    let state = AppState {
        db,
        registry,
        master_agent,
        conversations,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state).layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Spectacle server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
