//! Planner output parsing.
//!
//! The planner asks an LLM for a JSON document of the shape
//! `{"plan": "...", "tools": [{"name", "parameters", "dependsOn", "outputMapping"}], "executionOrder": [...]}`
//! and hands the result to the engine. LLM replies are frequently wrapped
//! in markdown code fences, which are stripped before parsing.

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, StepwiseError};
use crate::types::{ParamValue, Parameters, Step, StepParameters};

const DEFAULT_PLAN_TEXT: &str = "Execute tools in specified order";

/// A plan proposed by the planner.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanDocument {
    pub plan: String,
    pub steps: Vec<Step>,
    pub execution_order: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPlan {
    #[serde(default)]
    plan: Option<String>,
    tools: Option<Value>,
    execution_order: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTool {
    name: String,
    #[serde(default)]
    parameters: Option<Parameters>,
    #[serde(default)]
    depends_on: Option<String>,
    #[serde(default)]
    output_mapping: Option<BTreeMap<String, String>>,
}

/// Strip surrounding markdown code fences from an LLM reply.
pub fn strip_code_fences(response: &str) -> &str {
    let mut cleaned = response.trim();
    if let Some(rest) = cleaned.strip_prefix("```json") {
        cleaned = rest;
    }
    if let Some(rest) = cleaned.strip_prefix("```") {
        cleaned = rest;
    }
    if let Some(rest) = cleaned.strip_suffix("```") {
        cleaned = rest;
    }
    cleaned.trim()
}

impl PlanDocument {
    /// Parse a planner reply.
    pub fn parse(response: &str) -> Result<Self> {
        let raw: RawPlan = serde_json::from_str(strip_code_fences(response))
            .map_err(|e| StepwiseError::PlanParse(e.to_string()))?;

        let tools = match raw.tools {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(StepwiseError::PlanParse(
                    "missing or invalid tools array".into(),
                ))
            }
        };

        let execution_order: Vec<String> = match raw.execution_order {
            Some(order @ Value::Array(_)) => serde_json::from_value(order)
                .map_err(|e| StepwiseError::PlanParse(format!("invalid executionOrder: {}", e)))?,
            _ => {
                return Err(StepwiseError::PlanParse(
                    "missing or invalid executionOrder array".into(),
                ))
            }
        };

        let steps = tools
            .into_iter()
            .map(|item| {
                let tool: RawTool = serde_json::from_value(item)
                    .map_err(|e| StepwiseError::PlanParse(format!("invalid tool entry: {}", e)))?;
                Ok(Step {
                    tool_name: tool.name,
                    parameters: StepParameters::Structured(tool.parameters.unwrap_or_default()),
                    depends_on: tool.depends_on.filter(|d| !d.is_empty()),
                    output_mapping: tool.output_mapping,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            plan: raw
                .plan
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PLAN_TEXT.to_string()),
            steps,
            execution_order,
        })
    }

    /// Problems that make this plan unfit to run. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.steps.is_empty() {
            problems.push("no tools selected".to_string());
        }
        if self.execution_order.is_empty() {
            problems.push("execution order is empty".to_string());
        }

        let names: HashSet<&str> = self.steps.iter().map(|s| s.tool_name.as_str()).collect();
        for name in &self.execution_order {
            if !names.contains(name.as_str()) {
                problems.push(format!(
                    "tool {} in executionOrder not found in tools array",
                    name
                ));
            }
        }

        for step in &self.steps {
            let Ok(params) = step.parameters.decode() else {
                problems.push(format!("{}: parameters are not valid JSON", step.tool_name));
                continue;
            };
            for (key, value) in &params {
                if let ParamValue::Literal(v) = value {
                    if is_placeholder(v) {
                        problems.push(format!(
                            "invalid placeholder value for {}.{}: {}",
                            step.tool_name, key, v
                        ));
                    }
                }
            }
        }

        problems
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }
}

/// LLMs sometimes fill values they could not infer with "extracted" filler.
fn is_placeholder(value: &Value) -> bool {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    text.to_lowercase().contains("extracted")
}
