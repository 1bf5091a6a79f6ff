use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use stepwise_core::config::McpServerConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::{CatalogSource, ToolProvider};
use stepwise_core::types::{ToolDefinition, ToolReply};

use crate::client::McpClientManager;
use crate::convert::tool_definition;

/// Executes tools and lists the catalog of one MCP server.
#[derive(Clone)]
pub struct McpToolProvider {
    manager: Arc<McpClientManager>,
    server: String,
}

impl McpToolProvider {
    pub fn new(manager: Arc<McpClientManager>, server: impl Into<String>) -> Self {
        Self {
            manager,
            server: server.into(),
        }
    }

    /// Connect to `server` with a fresh manager.
    pub async fn connect(server: &str, config: &McpServerConfig) -> Result<Self> {
        let manager = Arc::new(McpClientManager::new());
        manager.connect(server, config).await?;
        Ok(Self::new(manager, server))
    }

    pub fn manager(&self) -> &Arc<McpClientManager> {
        &self.manager
    }
}

impl ToolProvider for McpToolProvider {
    fn call_tool(&self, name: &str, parameters: Map<String, Value>) -> BoxFuture<'_, Result<ToolReply>> {
        let name = name.to_string();
        Box::pin(async move { self.manager.call_tool(&self.server, &name, parameters).await })
    }
}

impl CatalogSource for McpToolProvider {
    fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ToolDefinition>>> {
        Box::pin(async move {
            let tools = self
                .manager
                .list_tools(&self.server)
                .await
                .map_err(|e| StepwiseError::Catalog(e.to_string()))?;
            Ok(tools
                .iter()
                .map(|t| tool_definition(&self.server, t))
                .collect())
        })
    }
}
