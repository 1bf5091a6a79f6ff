use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use stepwise_core::traits::ToolProvider;
use stepwise_core::types::{parameters_to_map, Parameters, Step};

use crate::catalog::ToolCatalog;

/// Why a single step failed. Always local to that step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokeError {
    #[error("Tool \"{0}\" not found")]
    ToolNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// The tool ran and reported failure.
    #[error("{0}")]
    Remote(String),

    /// The call never produced a reply.
    #[error("{0}")]
    Transport(String),

    #[error("Invalid tool output: {0}")]
    Decode(String),

    #[error("Tool \"{tool}\" timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("cancelled")]
    Cancelled,
}

/// Decode a step's parameters, accepting the JSON-string form.
pub fn decode_parameters(step: &Step) -> Result<Parameters, InvokeError> {
    step.parameters
        .decode()
        .map_err(|e| InvokeError::InvalidParameters(e.to_string()))
}

/// Calls tools on the remote provider and normalizes their replies.
#[derive(Clone)]
pub struct ToolInvoker {
    catalog: Arc<ToolCatalog>,
    provider: Arc<dyn ToolProvider>,
    timeout: Option<Duration>,
}

impl ToolInvoker {
    pub fn new(catalog: Arc<ToolCatalog>, provider: Arc<dyn ToolProvider>) -> Self {
        Self {
            catalog,
            provider,
            timeout: None,
        }
    }

    /// Bound every remote call. `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Invoke a tool and return its decoded output.
    ///
    /// Unknown tools fail without contacting the provider.
    pub async fn invoke(&self, tool_name: &str, parameters: &Parameters) -> Result<Value, InvokeError> {
        if !self.catalog.contains(tool_name) {
            return Err(InvokeError::ToolNotFound(tool_name.to_string()));
        }

        let arguments = parameters_to_map(parameters);
        debug!(tool = %tool_name, "Calling tool");

        let call = self.provider.call_tool(tool_name, arguments);
        let reply = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(reply) => reply,
                Err(_) => {
                    warn!(tool = %tool_name, timeout_secs = limit.as_secs(), "Tool call timed out");
                    return Err(InvokeError::Timeout {
                        tool: tool_name.to_string(),
                        timeout_secs: limit.as_secs(),
                    });
                }
            },
            None => call.await,
        };

        let reply = reply.map_err(|e| InvokeError::Transport(e.to_string()))?;

        if !reply.success {
            let message = if reply.message.is_empty() {
                "Execution failed".to_string()
            } else {
                reply.message
            };
            return Err(InvokeError::Remote(message));
        }

        decode_output(&reply.output)
    }
}

/// Parse a successful reply's output. An empty output decodes to `null`.
fn decode_output(output: &str) -> Result<Value, InvokeError> {
    if output.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(output).map_err(|e| InvokeError::Decode(e.to_string()))
}
