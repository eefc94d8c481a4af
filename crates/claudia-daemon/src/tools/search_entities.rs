//! memory.search_entities: find entities by name or description.

use std::sync::Arc;

use serde_json::Value;

use crate::services::Services;
use crate::tools::string_array;

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": "Search query"
            },
            "types": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Filter by entity types"
            },
            "limit": {
                "type": "integer",
                "description": "Maximum results",
                "default": 10
            }
        },
        "required": ["query"]
    })
}

pub fn execute(services: &Arc<Services>, args: Option<Value>) -> Result<Value, String> {
    let args = args.ok_or("Missing arguments")?;
    let query = args["query"].as_str().ok_or("'query' is required")?;

    let entities = services
        .recall
        .search_entities(
            query,
            &string_array(&args["types"]),
            args["limit"].as_i64().unwrap_or(10).max(1) as usize,
        )
        .map_err(|e| e.to_string())?;

    Ok(serde_json::json!({ "entities": entities }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::test_services;

    #[test]
    fn search_entities_by_substring() {
        let (services, _dir) = test_services();
        services
            .remember
            .remember_entity("Acme Corp", "organization", None, &[], None, None)
            .unwrap();

        let result = execute(&services, Some(serde_json::json!({"query": "acme"})))
            .unwrap();
        let entities = result["entities"].as_array().unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0]["name"], "Acme Corp");
    }
}
