use budget_chat_agent::{
    agent::Agent,
    config::AgentConfig,
    memory::ConversationState,
    oracle::GeminiOracle,
    store::{FinanceStore, InMemoryFinanceStore, PgFinanceStore},
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let in_memory = std::env::args().skip(1).any(|arg| arg == "--in-memory");

    let config = if in_memory {
        AgentConfig::from_env_without_database()?
    } else {
        AgentConfig::from_env()?
    };

    let store: Arc<dyn FinanceStore> = if in_memory {
        info!("Using in-memory store");
        Arc::new(InMemoryFinanceStore::new())
    } else {
        Arc::new(PgFinanceStore::connect_lazy(&config.database_url)?)
    };

    let oracle = Arc::new(GeminiOracle::new(
        config.gemini_api_key.clone(),
        &config.gemini_model,
        config.limits.oracle_timeout,
    )?);
    let agent = Agent::new(oracle, store, config.limits, config.currency.clone());

    let session_id = std::env::var("SESSION_ID").unwrap_or_else(|_| Uuid::new_v4().to_string());
    let mut state = ConversationState::new(session_id.clone());

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    stdout
        .write_all(format!("MakwentaBot ready (session {}). Type 'exit' to quit.\n", session_id).as_bytes())
        .await?;

    loop {
        stdout.write_all(b"\nYou: ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let message = line.trim();

        if message.is_empty() {
            continue;
        }
        if message.eq_ignore_ascii_case("exit") || message.eq_ignore_ascii_case("quit") {
            break;
        }

        match agent.run_turn(state.clone(), message).await {
            Ok(outcome) => {
                state = outcome.state;
                stdout
                    .write_all(format!("Assistant: {}\n", outcome.answer).as_bytes())
                    .await?;
            }
            Err(e) => {
                warn!(error = %e, "Turn failed");
                stdout
                    .write_all(format!("Assistant: Something went wrong ({}). Please try again.\n", e).as_bytes())
                    .await?;
            }
        }
    }

    stdout.write_all(b"Goodbye!\n").await?;
    stdout.flush().await?;

    Ok(())
}
