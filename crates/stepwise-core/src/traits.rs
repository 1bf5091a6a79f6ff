use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{ToolDefinition, ToolReply};

/// Remote tool execution: the backend that actually runs a tool.
///
/// Implementations report tool-level failures through `ToolReply::success`
/// and reserve `Err` for transport problems (connection lost, protocol
/// error). Both end up as step errors; neither aborts a run.
pub trait ToolProvider: Send + Sync + 'static {
    /// Call a tool with already-resolved parameters.
    fn call_tool(
        &self,
        name: &str,
        parameters: serde_json::Map<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<ToolReply>>;
}

/// Source of tool definitions used to populate the catalog.
pub trait CatalogSource: Send + Sync {
    /// List every tool the backend serves.
    fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ToolDefinition>>>;
}
