use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use rmcp::model::{CallToolRequestParams, Tool as McpTool};
use rmcp::service::{Peer, RunningService};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransport;
use rmcp::{RoleClient, ServiceExt};

use stepwise_core::config::{McpServerConfig, McpTransport};
use stepwise_core::error::StepwiseError;
use stepwise_core::types::ToolReply;

use crate::convert::reply_from_result;
use crate::handler::StepwiseClientHandler;

type McpConnection = RunningService<RoleClient, StepwiseClientHandler>;

/// A live connection tagged with the connect attempt that opened it.
struct Connection {
    service: McpConnection,
    generation: u64,
}

/// Manages connections to tool servers.
#[derive(Default)]
pub struct McpClientManager {
    connections: Mutex<HashMap<String, Connection>>,
    server_configs: Mutex<HashMap<String, McpServerConfig>>,
    /// One reconnect at a time per server.
    reconnect_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    generations: AtomicU64,
}

impl McpClientManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to an MCP server.
    pub async fn connect(&self, name: &str, config: &McpServerConfig) -> Result<(), StepwiseError> {
        let handler = StepwiseClientHandler::new(name);

        let client = match &config.transport {
            McpTransport::Stdio { command, args, env } => {
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(args);
                for (k, v) in env {
                    cmd.env(k, v);
                }

                let transport = rmcp::transport::TokioChildProcess::new(cmd).map_err(|e| {
                    StepwiseError::Mcp(format!("Failed to spawn {}: {}", command, e))
                })?;

                <StepwiseClientHandler as ServiceExt<RoleClient>>::serve(handler, transport)
                    .await
                    .map_err(|e| {
                        StepwiseError::Mcp(format!(
                            "Failed to initialize MCP client for {}: {}",
                            name, e
                        ))
                    })?
            }
            McpTransport::Sse { url } => {
                let transport = StreamableHttpClientTransport::from_uri(url.as_str());

                <StepwiseClientHandler as ServiceExt<RoleClient>>::serve(handler, transport)
                    .await
                    .map_err(|e| StepwiseError::Mcp(format!("MCP init for '{}' failed: {}", name, e)))?
            }
        };

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        info!(server = %name, generation, "MCP server connected");

        let previous = self.connections.lock().await.insert(
            name.to_string(),
            Connection {
                service: client,
                generation,
            },
        );
        if let Some(mut previous) = previous {
            let _ = previous.service.close().await;
        }
        self.server_configs
            .lock()
            .await
            .insert(name.to_string(), config.clone());
        Ok(())
    }

    /// Replace the connection a failed call went through.
    ///
    /// Concurrent callers that saw the same broken connection queue on the
    /// server's gate; only the first reconnects, the rest reuse its connection.
    async fn reconnect(&self, server_name: &str, failed_generation: u64) -> Result<(), StepwiseError> {
        let gate = self.reconnect_gate(server_name).await;
        let _guard = gate.lock().await;

        let current = self
            .connections
            .lock()
            .await
            .get(server_name)
            .map(|c| (c.generation, c.service.is_closed()));
        if !needs_reconnect(current, failed_generation) {
            debug!(server = %server_name, "Connection already replaced by a concurrent call");
            return Ok(());
        }

        let config = self.get_config(server_name).await.ok_or_else(|| {
            StepwiseError::Mcp(format!("No stored config for server '{}'", server_name))
        })?;

        if let Some(mut old) = self.connections.lock().await.remove(server_name) {
            let _ = old.service.close().await;
        }

        self.connect(server_name, &config).await
    }

    async fn reconnect_gate(&self, server_name: &str) -> Arc<Mutex<()>> {
        self.reconnect_gates
            .lock()
            .await
            .entry(server_name.to_string())
            .or_default()
            .clone()
    }

    pub async fn get_config(&self, server_name: &str) -> Option<McpServerConfig> {
        let configs = self.server_configs.lock().await;
        configs.get(server_name).cloned()
    }

    /// A handle for issuing requests without holding the connection table lock,
    /// with the generation of the connection behind it.
    async fn peer(&self, server_name: &str) -> Result<(Peer<RoleClient>, u64), StepwiseError> {
        let conns = self.connections.lock().await;
        conns
            .get(server_name)
            .map(|c| (c.service.peer().clone(), c.generation))
            .ok_or_else(|| StepwiseError::Mcp(format!("Server '{}' not connected", server_name)))
    }

    /// List tools from a connected server.
    pub async fn list_tools(&self, server_name: &str) -> Result<Vec<McpTool>, StepwiseError> {
        let (peer, _) = self.peer(server_name).await?;

        let tools = peer.list_all_tools().await.map_err(|e| {
            StepwiseError::Mcp(format!("Failed to list tools from '{}': {}", server_name, e))
        })?;

        debug!(server = %server_name, count = tools.len(), "Listed MCP tools");
        Ok(tools)
    }

    /// Call a tool, reconnecting once if the transport was closed.
    pub async fn call_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<ToolReply, StepwiseError> {
        let (peer, generation) = self.peer(server_name).await?;
        let result = self
            .call_tool_on(&peer, server_name, tool_name, arguments.clone())
            .await;

        if let Err(ref e) = result {
            let err_str = e.to_string();
            if err_str.contains("closed") || err_str.contains("Transport") {
                warn!(server = %server_name, "MCP transport closed, attempting reconnect");
                if self.reconnect(server_name, generation).await.is_ok() {
                    let (peer, _) = self.peer(server_name).await?;
                    return self.call_tool_on(&peer, server_name, tool_name, arguments).await;
                }
            }
        }

        result
    }

    async fn call_tool_on(
        &self,
        peer: &Peer<RoleClient>,
        server_name: &str,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<ToolReply, StepwiseError> {
        let timeout_secs = self
            .get_config(server_name)
            .await
            .map(|c| c.timeout_secs)
            .unwrap_or(120);

        let params = CallToolRequestParams {
            name: tool_name.to_string().into(),
            arguments: Some(arguments),
            meta: None,
            task: None,
        };

        let result = tokio::time::timeout(Duration::from_secs(timeout_secs), peer.call_tool(params))
            .await
            .map_err(|_| {
                StepwiseError::Mcp(format!(
                    "Tool call '{}.{}' got no reply within {}s",
                    server_name, tool_name, timeout_secs
                ))
            })?
            .map_err(|e| {
                StepwiseError::Mcp(format!(
                    "Tool call '{}.{}' failed: {}",
                    server_name, tool_name, e
                ))
            })?;

        Ok(reply_from_result(&result))
    }

    /// Disconnect from all servers.
    pub async fn disconnect_all(&self) {
        let mut conns = self.connections.lock().await;
        for (name, mut conn) in conns.drain() {
            let _ = conn.service.close().await;
            info!(server = %name, "MCP server disconnected");
        }
    }
}

/// Whether a call that failed on connection `failed_generation` should tear
/// down the current one, given its generation and closed flag.
fn needs_reconnect(current: Option<(u64, bool)>, failed_generation: u64) -> bool {
    match current {
        Some((generation, closed)) => generation == failed_generation || closed,
        None => true,
    }
}
