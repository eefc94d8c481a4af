//! memory.remember: store a fact, preference, observation or commitment.

use std::sync::Arc;

use serde_json::Value;

use claudia_core::remember::FactInput;

use crate::services::Services;
use crate::tools::string_array;

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "content": {
                "type": "string",
                "description": "The information to remember"
            },
            "type": {
                "type": "string",
                "enum": ["fact", "preference", "observation", "learning", "commitment"],
                "description": "Type of memory",
                "default": "fact"
            },
            "about": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Entity names this memory relates to"
            },
            "importance": {
                "type": "number",
                "description": "Importance score from 0.0 to 1.0",
                "default": 1.0
            },
            "confidence": {
                "type": "number",
                "description": "Confidence from 0.0 to 1.0",
                "default": 1.0
            },
            "source": {
                "type": "string",
                "description": "Where this information came from"
            }
        },
        "required": ["content"]
    })
}

pub fn execute(services: &Arc<Services>, args: Option<Value>) -> Result<Value, String> {
    let args = args.ok_or("Missing arguments")?;
    let content = args["content"]
        .as_str()
        .ok_or("'content' is required")?
        .to_string();
    if content.trim().is_empty() {
        return Err("Content cannot be empty".into());
    }

    let input = FactInput {
        content,
        memory_type: args["type"].as_str().unwrap_or("fact").to_string(),
        about_entities: string_array(&args["about"]),
        importance: args["importance"].as_f64().unwrap_or(1.0),
        confidence: args["confidence"].as_f64().unwrap_or(1.0),
        origin_type: "user_stated".into(),
        source: args["source"].as_str().map(|s| s.to_string()),
        source_id: None,
        metadata: None,
        precomputed_embedding: None,
    };

    let outcome = services
        .remember
        .remember_fact(input)
        .map_err(|e| e.to_string())?;

    Ok(serde_json::json!({
        "success": true,
        "memory_id": outcome.memory_id,
        "created": outcome.created,
        "warnings": outcome.warnings,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::test_services;

    #[test]
    fn remember_stores_and_deduplicates() {
        let (services, _dir) = test_services();

        let args = serde_json::json!({"content": "The retreat is in September"});
        let first = execute(&services, Some(args.clone())).unwrap();
        assert_eq!(first["success"], true);
        assert_eq!(first["created"], true);

        let second = execute(&services, Some(args)).unwrap();
        assert_eq!(second["created"], false);
        assert_eq!(second["memory_id"], first["memory_id"]);
    }

    #[test]
    fn remember_rejects_empty_content() {
        let (services, _dir) = test_services();
        let result = execute(&services, Some(serde_json::json!({"content": "  "})));
        assert!(result.is_err());

        let missing = execute(&services, None);
        assert!(missing.is_err());
    }

    #[test]
    fn remember_links_about_entities() {
        let (services, _dir) = test_services();
        let args = serde_json::json!({
            "content": "Sarah Chen owns the launch",
            "type": "fact",
            "about": ["Sarah Chen"],
        });
        let result = execute(&services, Some(args)).unwrap();
        assert_eq!(result["success"], true);

        assert_eq!(services.store.count("entities").unwrap(), 1);
    }
}
