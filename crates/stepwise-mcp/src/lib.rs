//! Tool catalog and tool execution over MCP (Model Context Protocol).

mod client;
mod convert;
mod handler;
mod provider;

pub use client::McpClientManager;
pub use convert::{reply_from_result, reply_from_text, tool_definition};
pub use handler::StepwiseClientHandler;
pub use provider::McpToolProvider;

use stepwise_core::config::AppConfig;
use stepwise_core::error::Result;

/// Connect to the server named by `[catalog].server`.
pub async fn connect_catalog_server(config: &AppConfig) -> Result<McpToolProvider> {
    let server = config.catalog_server()?;
    McpToolProvider::connect(&config.catalog.server, server).await
}
