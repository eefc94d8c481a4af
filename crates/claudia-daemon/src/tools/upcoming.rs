//! memory.upcoming: commitments with deadlines inside a window.

use std::sync::Arc;

use serde_json::Value;

use crate::services::Services;

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "days": {
                "type": "integer",
                "description": "Look-ahead window in days (overdue items always included)",
                "default": 14
            }
        }
    })
}

pub fn execute(services: &Arc<Services>, args: Option<Value>) -> Result<Value, String> {
    let args = args.unwrap_or_else(|| serde_json::json!({}));
    let days = args["days"].as_i64().unwrap_or(14).max(0);

    let deadlines = services
        .recall
        .recall_upcoming_deadlines(days)
        .map_err(|e| e.to_string())?;

    Ok(serde_json::json!({
        "days": days,
        "total": deadlines.len(),
        "deadlines": deadlines,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::test_services;

    #[test]
    fn upcoming_defaults_to_fourteen_days() {
        let (services, _dir) = test_services();
        let result = execute(&services, None).unwrap();
        assert_eq!(result["days"], 14);
        assert_eq!(result["total"], 0);
    }
}
