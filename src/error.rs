//! Error types for the budget chat agent

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Dispatch Loop Errors
    // =============================

    #[error("Planning error: {0}")]
    PlanningError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("unknown operation '{0}'")]
    ToolNotFound(String),

    #[error("Invalid operation input: {0}")]
    InvalidToolInput(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Conversation state error: {0}")]
    StateError(String),

    // =============================
    // Infrastructure Errors
    // =============================

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("SQL error: {0}")]
    SqlError(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
