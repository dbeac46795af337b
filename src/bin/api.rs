use budget_chat_agent::{
    agent::Agent,
    api::start_server,
    config::AgentConfig,
    oracle::GeminiOracle,
    store::PgFinanceStore,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AgentConfig::from_env().map_err(|e| {
        error!("{}", e);
        eprintln!("⚠️  {}", e);
        eprintln!("📌 Set DATABASE_URL and GEMINI_API_KEY in .env");
        e
    })?;

    info!("🚀 Budget Chat Agent - API Server");
    info!(port = config.port, model = %config.gemini_model, "Configuration loaded");

    let store = Arc::new(PgFinanceStore::connect_lazy(&config.database_url)?);
    let oracle = Arc::new(GeminiOracle::new(
        config.gemini_api_key.clone(),
        &config.gemini_model,
        config.limits.oracle_timeout,
    )?);

    let agent = Arc::new(Agent::new(oracle, store, config.limits, config.currency.clone()));

    info!("✅ Agent initialized");
    info!("📡 Starting API server...");

    start_server(agent, config.port, config.max_sessions).await?;

    Ok(())
}
