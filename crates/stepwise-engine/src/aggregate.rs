use stepwise_core::types::{ExecutionRecord, ExecutionStatus, RunSummary, ToolOutput};

/// Summarize finished records. Successful outputs keep record order.
pub fn aggregate(records: &[ExecutionRecord]) -> RunSummary {
    let results: Vec<ToolOutput> = records
        .iter()
        .filter(|r| r.status == ExecutionStatus::Completed)
        .map(|r| ToolOutput {
            tool: r.tool_name.clone(),
            output: r.result.clone().unwrap_or_default(),
        })
        .collect();

    let failed = records
        .iter()
        .filter(|r| r.status == ExecutionStatus::Error)
        .count();

    RunSummary {
        total_executions: records.len(),
        successful: results.len(),
        failed,
        results,
    }
}

/// One `"toolName: message"` line per failed record, in record order.
pub fn collect_errors(records: &[ExecutionRecord]) -> Vec<String> {
    records.iter().filter_map(ExecutionRecord::error_line).collect()
}
