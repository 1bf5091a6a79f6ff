//! Output reference resolution for chained runs.

use serde_json::Value;
use tracing::debug;

use stepwise_core::types::{OutputRef, OutputTable, ParamValue, Parameters};

/// Substitute every reference whose tool has an entry in `outputs`.
///
/// References to tools with no recorded output are left untouched, so a
/// later pass with a fuller table can still resolve them. A reference whose
/// tool is present but whose field path does not exist resolves to `null`.
pub fn resolve_parameters(params: &Parameters, outputs: &OutputTable) -> Parameters {
    params
        .iter()
        .map(|(key, value)| (key.clone(), resolve_value(value, outputs)))
        .collect()
}

/// Resolve a single parameter value.
pub fn resolve_value(value: &ParamValue, outputs: &OutputTable) -> ParamValue {
    let ParamValue::Reference(reference) = value else {
        return value.clone();
    };
    let Some(output) = outputs.get(&reference.tool) else {
        return value.clone();
    };
    match lookup(output, &reference.path) {
        Some(found) => ParamValue::Literal(found.clone()),
        None => {
            debug!(reference = %reference, "Referenced field is missing, using null");
            ParamValue::Literal(Value::Null)
        }
    }
}

/// Keys whose values are still references.
pub fn unresolved_references(params: &Parameters) -> Vec<(&str, &OutputRef)> {
    params
        .iter()
        .filter_map(|(key, value)| value.as_reference().map(|r| (key.as_str(), r)))
        .collect()
}

/// Walk `path` into `value`. Numeric segments index arrays.
fn lookup<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
