//! memory.recall: hybrid search over stored memories.

use std::sync::Arc;

use serde_json::Value;

use claudia_core::recall::RecallQuery;

use crate::services::Services;
use crate::tools::string_array;

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": "What to search for"
            },
            "limit": {
                "type": "integer",
                "description": "Maximum number of results",
                "default": 10,
                "minimum": 1,
                "maximum": 100
            },
            "types": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Filter by memory types"
            },
            "about": {
                "type": "string",
                "description": "Filter to memories about a specific entity"
            },
            "min_importance": {
                "type": "number",
                "description": "Minimum importance threshold"
            },
            "include_low_importance": {
                "type": "boolean",
                "description": "Include memories below the default threshold",
                "default": false
            }
        },
        "required": ["query"]
    })
}

pub fn execute(services: &Arc<Services>, args: Option<Value>) -> Result<Value, String> {
    let args = args.ok_or("Missing arguments")?;
    let query_text = args["query"].as_str().ok_or("'query' is required")?;
    if query_text.trim().is_empty() {
        return Err("Query cannot be empty".into());
    }

    let query = RecallQuery {
        query: query_text.to_string(),
        limit: args["limit"]
            .as_i64()
            .map(|l| l.clamp(1, 100) as usize),
        memory_types: string_array(&args["types"]),
        about_entity: args["about"].as_str().map(|s| s.to_string()),
        min_importance: args["min_importance"].as_f64(),
        include_low_importance: args["include_low_importance"].as_bool().unwrap_or(false),
        date_after: args["after"].as_str().map(|s| s.to_string()),
        date_before: args["before"].as_str().map(|s| s.to_string()),
    };

    let results = services.recall.recall(&query).map_err(|e| e.to_string())?;

    Ok(serde_json::json!({
        "query": query_text,
        "total": results.len(),
        "results": results,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::test_services;
    use claudia_core::remember::FactInput;

    #[test]
    fn recall_finds_stored_memories() {
        let (services, _dir) = test_services();
        services
            .remember
            .remember_fact(FactInput::new("The board meeting moved to Thursday"))
            .unwrap();

        let args = serde_json::json!({"query": "board meeting"});
        let result = execute(&services, Some(args)).unwrap();
        assert_eq!(result["total"], 1);
        assert!(result["results"][0]["content"]
            .as_str()
            .unwrap()
            .contains("board meeting"));
    }

    #[test]
    fn recall_validates_query() {
        let (services, _dir) = test_services();
        assert!(execute(&services, Some(serde_json::json!({"query": ""})))
            .is_err());
        assert!(execute(&services, None).is_err());
    }

    #[test]
    fn recall_clamps_limit() {
        let (services, _dir) = test_services();
        for i in 0..5 {
            services
                .remember
                .remember_fact(FactInput::new(format!("Item number {}", i)))
                .unwrap();
        }
        let args = serde_json::json!({"query": "item", "limit": 2});
        let result = execute(&services, Some(args)).unwrap();
        assert!(result["results"].as_array().unwrap().len() <= 2);
    }
}
