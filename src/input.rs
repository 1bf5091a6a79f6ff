use std::path::Path;

use anyhow::Context;
use clap::ValueEnum;
use tracing::warn;

use stepwise_core::config::ModePreference;
use stepwise_core::plan::strip_code_fences;
use stepwise_core::types::ExecutionMode;
use stepwise_core::PlanDocument;
use stepwise_engine::{checked_order, sort_steps, EngineError, RunRequest};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Pick per plan: chained when it has ordering or references
    Auto,
    Parallel,
    Chained,
}

impl From<ModeArg> for ModePreference {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Auto => ModePreference::Auto,
            ModeArg::Parallel => ModePreference::Parallel,
            ModeArg::Chained => ModePreference::Chained,
        }
    }
}

/// Read a run request from `path`.
///
/// The file holds either a bare `{plan, steps, order}` request or a planner
/// reply (`{plan, tools, executionOrder}`, optionally fenced).
pub fn load_request(path: &Path) -> anyhow::Result<RunRequest> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_request(&text).with_context(|| format!("Invalid plan in {}", path.display()))
}

pub fn parse_request(text: &str) -> anyhow::Result<RunRequest> {
    if let Ok(request) = serde_json::from_str::<RunRequest>(strip_code_fences(text)) {
        return Ok(request);
    }

    let doc = PlanDocument::parse(text)?;
    for problem in doc.validate() {
        warn!(%problem, "Plan document problem");
    }
    Ok(RunRequest::from(doc))
}

/// Apply the `run` flags to a loaded request.
///
/// `sorted` reorders the steps by dependency and forces chained mode. An
/// explicit `mode` replaces whatever the file asked for; the returned
/// preference must also replace the configured engine default, so that
/// `auto` really selects per plan.
pub fn apply_run_flags(
    request: &mut RunRequest,
    mode: Option<ModeArg>,
    sorted: bool,
) -> Result<Option<ModePreference>, EngineError> {
    if sorted {
        let order = checked_order(&request.steps)?;
        request.steps = sort_steps(&request.steps, &order);
        request.order = Some(order);
        request.mode = Some(ExecutionMode::Chained);
        return Ok(None);
    }
    let Some(mode) = mode else {
        return Ok(None);
    };
    let preference = ModePreference::from(mode);
    request.mode = preference.forced();
    Ok(Some(preference))
}
