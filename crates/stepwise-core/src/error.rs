use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepwiseError {
    // Plan errors
    #[error("Plan parse error: {0}")]
    PlanParse(String),

    // Tool errors
    #[error("Tool catalog error: {0}")]
    Catalog(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // MCP errors
    #[error("MCP error: {0}")]
    Mcp(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StepwiseError>;
