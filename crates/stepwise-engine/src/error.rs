use thiserror::Error;

/// Plan-level rejection. Raised before any tool is called.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("step {index} has an empty tool name")]
    EmptyToolName { index: usize },

    #[error("duplicate tool name in plan: {0}")]
    DuplicateTool(String),

    #[error("execution order names a tool that is not in the plan: {0}")]
    UnknownOrderEntry(String),

    #[error("cyclic dependency: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),
}
