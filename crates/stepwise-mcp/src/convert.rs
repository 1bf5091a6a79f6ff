//! Mapping between MCP wire types and catalog/reply types.

use serde_json::Value;

use rmcp::model::{CallToolResult, RawContent, Tool as McpTool};

use stepwise_core::types::{ToolDefinition, ToolReply};
use stepwise_tools::schema_to_parameters;

/// Catalog entry for a tool served by `server`. The server name is the category.
pub fn tool_definition(server: &str, tool: &McpTool) -> ToolDefinition {
    let description = tool
        .description
        .as_ref()
        .map(|d| d.to_string())
        .unwrap_or_else(|| format!("MCP tool: {}", tool.name));

    let schema = Value::Object((*tool.input_schema).clone());

    let mut definition = ToolDefinition::new(tool.name.to_string(), description).with_category(server);
    definition.parameters = schema_to_parameters(&schema);
    definition.input_schema = Some(schema);
    definition
}

/// Normalize a tool call result.
pub fn reply_from_result(result: &CallToolResult) -> ToolReply {
    let text: Vec<String> = result
        .content
        .iter()
        .map(|c| match c.raw {
            RawContent::Text(ref t) => t.text.to_string(),
            _ => format!("{:?}", c.raw),
        })
        .collect();

    reply_from_text(&text.join("\n"), result.is_error.unwrap_or(false))
}

/// Normalize the text of a tool call result.
///
/// Servers that speak the `{success, message, output}` envelope have it
/// unwrapped; any other text is the output itself.
pub fn reply_from_text(text: &str, is_error: bool) -> ToolReply {
    if let Some(mut reply) = envelope(text) {
        reply.success &= !is_error;
        return reply;
    }
    if is_error {
        ToolReply::failure(text)
    } else {
        ToolReply::success("", text)
    }
}

fn envelope(text: &str) -> Option<ToolReply> {
    let Value::Object(obj) = serde_json::from_str::<Value>(text).ok()? else {
        return None;
    };
    let success = obj.get("success")?.as_bool()?;
    if !obj.contains_key("message") && !obj.contains_key("output") {
        return None;
    }

    let message = obj
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let output = match obj.get("output") {
        Some(Value::String(s)) => s.clone(),
        None | Some(Value::Null) => String::new(),
        Some(other) => other.to_string(),
    };

    Some(ToolReply {
        success,
        message,
        output,
    })
}
