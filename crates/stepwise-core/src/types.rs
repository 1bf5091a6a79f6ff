use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A reference to another step's output, written `{{tool.field.field}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRef {
    /// Tool whose output is referenced (first path segment).
    pub tool: String,
    /// Field accesses into that tool's output.
    pub path: Vec<String>,
    /// The template text exactly as it was written.
    raw: String,
}

fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\{\{\s*([^{}\s]+)\s*\}\}$").expect("template regex is valid"))
}

impl OutputRef {
    /// Parse a whole string as a template reference.
    ///
    /// Only strings that are entirely `{{...}}` qualify; a template embedded
    /// in surrounding text is not a reference. Empty segments (`{{a..b}}`)
    /// disqualify the string.
    pub fn parse(s: &str) -> Option<Self> {
        let caps = template_regex().captures(s)?;
        let inner = caps.get(1)?.as_str();
        let mut segments = inner.split('.').map(str::to_string);
        let tool = segments.next()?;
        let path: Vec<String> = segments.collect();
        if tool.is_empty() || path.iter().any(|p| p.is_empty()) {
            return None;
        }
        Some(Self {
            tool,
            path,
            raw: s.to_string(),
        })
    }

    /// Build a reference from parts.
    pub fn new(tool: impl Into<String>, path: &[&str]) -> Self {
        let tool = tool.into();
        let path: Vec<String> = path.iter().map(|p| p.to_string()).collect();
        let raw = if path.is_empty() {
            format!("{{{{{}}}}}", tool)
        } else {
            format!("{{{{{}.{}}}}}", tool, path.join("."))
        };
        Self { tool, path, raw }
    }

    /// The literal template text.
    pub fn as_template(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for OutputRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A single parameter value: either a literal or an unresolved output reference.
///
/// On the wire both are plain JSON. A top-level string of the exact form
/// `{{tool.field}}` deserializes to `Reference`; a reference serializes back
/// to its literal template text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum ParamValue {
    Literal(Value),
    Reference(OutputRef),
}

impl ParamValue {
    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference(_))
    }

    pub fn as_reference(&self) -> Option<&OutputRef> {
        match self {
            Self::Reference(r) => Some(r),
            Self::Literal(_) => None,
        }
    }

    /// The JSON value sent to a tool for this parameter.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Reference(r) => Value::String(r.as_template().to_string()),
        }
    }
}

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => match OutputRef::parse(&s) {
                Some(r) => Self::Reference(r),
                None => Self::Literal(Value::String(s)),
            },
            other => Self::Literal(other),
        }
    }
}

impl From<ParamValue> for Value {
    fn from(value: ParamValue) -> Self {
        match value {
            ParamValue::Literal(v) => v,
            ParamValue::Reference(r) => Value::String(r.raw),
        }
    }
}

/// Parameters for one tool call, keyed by parameter name.
pub type Parameters = BTreeMap<String, ParamValue>;

/// Convert parameters to the JSON object sent to a tool.
pub fn parameters_to_map(params: &Parameters) -> serde_json::Map<String, Value> {
    params
        .iter()
        .map(|(k, v)| (k.clone(), v.to_value()))
        .collect()
}

/// Step parameters as supplied by the caller.
///
/// Plans that went through storage sometimes carry their parameters as a
/// JSON-encoded string instead of an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepParameters {
    Structured(Parameters),
    Serialized(String),
}

impl StepParameters {
    /// Decode into a parameter map.
    pub fn decode(&self) -> std::result::Result<Parameters, serde_json::Error> {
        match self {
            Self::Structured(p) => Ok(p.clone()),
            Self::Serialized(s) => serde_json::from_str(s),
        }
    }
}

impl Default for StepParameters {
    fn default() -> Self {
        Self::Structured(Parameters::new())
    }
}

/// `"parameters": null` reads the same as an absent field.
fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<StepParameters, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<StepParameters>::deserialize(deserializer)?.unwrap_or_default())
}

/// One tool invocation within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Tool to invoke. Unique within a plan.
    pub tool_name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub parameters: StepParameters,
    /// The single step this one must follow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
    /// Advisory description of how this step's output feeds dependents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_mapping: Option<BTreeMap<String, String>>,
}

impl Step {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters: StepParameters::default(),
            depends_on: None,
            output_mapping: None,
        }
    }

    /// Add a parameter. Strings of the form `{{tool.field}}` become references.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut params = self.parameters.decode().unwrap_or_default();
        params.insert(key.into(), ParamValue::from(value.into()));
        self.parameters = StepParameters::Structured(params);
        self
    }

    /// Set the single predecessor.
    pub fn after(mut self, tool_name: impl Into<String>) -> Self {
        self.depends_on = Some(tool_name.into());
        self
    }

    /// Whether any structured parameter is a template reference.
    pub fn has_references(&self) -> bool {
        match &self.parameters {
            StepParameters::Structured(p) => p.values().any(ParamValue::is_reference),
            StepParameters::Serialized(s) => s.contains("{{"),
        }
    }
}

/// Lifecycle status of an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Completed,
    Error,
}

/// Per-run state for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub tool_name: String,
    /// Parameters as sent (resolved in chained mode).
    pub parameters: Parameters,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn pending(tool_name: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters,
            status: ExecutionStatus::Pending,
            result: None,
            error: None,
        }
    }

    /// Mark completed. Ignored unless the record is still pending.
    pub fn complete(&mut self, output: Value) {
        if self.status == ExecutionStatus::Pending {
            self.status = ExecutionStatus::Completed;
            self.result = Some(output);
        }
    }

    /// Mark failed. Ignored unless the record is still pending.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.status == ExecutionStatus::Pending {
            self.status = ExecutionStatus::Error;
            self.error = Some(message.into());
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ExecutionStatus::Pending
    }

    /// The `"toolName: message"` line reported for a failed record.
    pub fn error_line(&self) -> Option<String> {
        self.error
            .as_ref()
            .map(|e| format!("{}: {}", self.tool_name, e))
    }
}

/// Successful outputs of the current run, keyed by tool name.
pub type OutputTable = BTreeMap<String, Value>;

/// How a run schedules its steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// All steps at once with parameters as given.
    Parallel,
    /// One step at a time in input order, resolving references as it goes.
    Chained,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parallel => f.write_str("parallel"),
            Self::Chained => f.write_str("chained"),
        }
    }
}

/// A successful step in the aggregated report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool: String,
    pub output: Value,
}

/// Aggregated counts and outputs of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total_executions: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<ToolOutput>,
}

/// Terminal state of a plan after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanState {
    Completed,
    Failed,
}

/// Final report of one engine run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    pub plan: String,
    pub mode: ExecutionMode,
    pub executions: Vec<ExecutionRecord>,
    pub results: RunSummary,
    pub errors: Vec<String>,
    /// Output table of a chained run, for the caller to persist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_outputs: Option<OutputTable>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    pub fn state(&self) -> PlanState {
        if self.results.failed == 0 {
            PlanState::Completed
        } else {
            PlanState::Failed
        }
    }

    /// Output of a successful step, if any.
    pub fn output_of(&self, tool: &str) -> Option<&Value> {
        self.results
            .results
            .iter()
            .find(|r| r.tool == tool)
            .map(|r| &r.output)
    }
}

/// Declared type and requiredness of one tool parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
}

/// A tool as listed in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            category: None,
            parameters: BTreeMap::new(),
            input_schema: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, kind: impl Into<String>, required: bool) -> Self {
        self.parameters.insert(
            name.into(),
            ParameterSpec {
                kind: kind.into(),
                required,
            },
        );
        self
    }

    /// Names of required parameters.
    pub fn required_parameters(&self) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|(_, spec)| spec.required)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Reply of a remote tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolReply {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    /// JSON-encoded output; meaningful only on success.
    #[serde(default)]
    pub output: String,
}

impl ToolReply {
    pub fn success(message: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            output: output.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            output: String::new(),
        }
    }
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Steps prepared, run about to start.
    RunStarted {
        run_id: String,
        mode: ExecutionMode,
        steps: usize,
    },
    /// A tool call is about to be made.
    StepStarted { run_id: String, tool: String },
    /// A tool call succeeded.
    StepCompleted { run_id: String, tool: String },
    /// A step failed.
    StepFailed {
        run_id: String,
        tool: String,
        error: String,
    },
    /// Results aggregated.
    RunCompleted { run_id: String, summary: RunSummary },
}
