//! memory.predictions: proactive suggestions, reminders and insights.

use std::sync::Arc;

use serde_json::Value;

use crate::services::Services;
use crate::tools::string_array;

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "limit": {
                "type": "integer",
                "description": "Maximum number of predictions",
                "default": 5
            },
            "types": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Filter by type (reminder, suggestion, warning, insight)"
            },
            "include_shown": {
                "type": "boolean",
                "description": "Include predictions already shown",
                "default": false
            }
        }
    })
}

pub fn execute(services: &Arc<Services>, args: Option<Value>) -> Result<Value, String> {
    let args = args.unwrap_or_else(|| serde_json::json!({}));

    let predictions = services
        .consolidator
        .get_predictions(
            args["limit"].as_i64().unwrap_or(5).max(1) as usize,
            &string_array(&args["types"]),
            args["include_shown"].as_bool().unwrap_or(false),
        )
        .map_err(|e| e.to_string())?;

    // Returned predictions count as shown for the feedback loop
    for prediction in &predictions {
        if let Some(id) = prediction["id"].as_i64() {
            let _ = services.consolidator.mark_prediction_shown(id);
        }
    }

    Ok(serde_json::json!({ "predictions": predictions }))
}
