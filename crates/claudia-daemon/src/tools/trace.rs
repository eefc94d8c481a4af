//! memory.trace: provenance chain for one memory.

use std::sync::Arc;

use serde_json::Value;

use crate::services::Services;

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "memory_id": {
                "type": "integer",
                "description": "Memory to trace"
            }
        },
        "required": ["memory_id"]
    })
}

pub fn execute(services: &Arc<Services>, args: Option<Value>) -> Result<Value, String> {
    let args = args.ok_or("Missing arguments")?;
    let memory_id = args["memory_id"]
        .as_i64()
        .ok_or("'memory_id' is required")?;

    let trace = services
        .recall
        .trace_memory(memory_id)
        .map_err(|e| e.to_string())?;
    serde_json::to_value(trace).map_err(|e| e.to_string())
}
