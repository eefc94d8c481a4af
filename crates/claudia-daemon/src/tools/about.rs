//! memory.about: everything known about an entity.

use std::sync::Arc;

use serde_json::Value;

use crate::services::Services;
use crate::tools::string_array;

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "entity": {
                "type": "string",
                "description": "Name of the person, project or entity"
            },
            "limit": {
                "type": "integer",
                "description": "Maximum number of memories to return",
                "default": 20
            },
            "types": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Filter by memory types"
            },
            "include_historical": {
                "type": "boolean",
                "description": "Include superseded relationships with their validity intervals",
                "default": false
            }
        },
        "required": ["entity"]
    })
}

pub fn execute(services: &Arc<Services>, args: Option<Value>) -> Result<Value, String> {
    let args = args.ok_or("Missing arguments")?;
    let entity = args["entity"].as_str().ok_or("'entity' is required")?;

    let report = services
        .recall
        .recall_about(
            entity,
            args["limit"].as_i64().map(|l| l.max(1) as usize),
            &string_array(&args["types"]),
            args["include_historical"].as_bool().unwrap_or(false),
        )
        .map_err(|e| e.to_string())?;

    serde_json::to_value(report).map_err(|e| e.to_string())
}
