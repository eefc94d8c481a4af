//! memory.relate: create, strengthen or supersede a relationship.

use std::sync::Arc;

use serde_json::Value;

use claudia_core::remember::RelateInput;

use crate::services::Services;

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "source": {
                "type": "string",
                "description": "Source entity name"
            },
            "target": {
                "type": "string",
                "description": "Target entity name"
            },
            "relationship": {
                "type": "string",
                "description": "Type of relationship (works_with, manages, employed_by, ...)"
            },
            "strength": {
                "type": "number",
                "description": "Relationship strength from 0.0 to 1.0",
                "default": 1.0
            },
            "direction": {
                "type": "string",
                "enum": ["forward", "backward", "bidirectional"],
                "default": "bidirectional"
            },
            "supersedes": {
                "type": "boolean",
                "description": "Close the current relationship of this type and open a new one",
                "default": false
            }
        },
        "required": ["source", "target", "relationship"]
    })
}

pub fn execute(services: &Arc<Services>, args: Option<Value>) -> Result<Value, String> {
    let args = args.ok_or("Missing arguments")?;

    let input = RelateInput {
        source: args["source"]
            .as_str()
            .ok_or("'source' is required")?
            .to_string(),
        target: args["target"]
            .as_str()
            .ok_or("'target' is required")?
            .to_string(),
        relationship_type: args["relationship"]
            .as_str()
            .ok_or("'relationship' is required")?
            .to_string(),
        strength: args["strength"].as_f64().unwrap_or(1.0),
        direction: args["direction"]
            .as_str()
            .unwrap_or("bidirectional")
            .to_string(),
        supersedes: args["supersedes"].as_bool().unwrap_or(false),
        metadata: None,
    };

    let relationship_id = services
        .remember
        .relate_entities(input)
        .map_err(|e| e.to_string())?;

    Ok(serde_json::json!({
        "success": true,
        "relationship_id": relationship_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::test_services;

    #[test]
    fn relate_creates_and_strengthens() {
        let (services, _dir) = test_services();

        let args = serde_json::json!({
            "source": "Sarah Chen",
            "target": "Acme Corp",
            "relationship": "works_at",
            "strength": 0.5,
        });
        let first = execute(&services, Some(args.clone())).unwrap();
        let second = execute(&services, Some(args)).unwrap();
        assert_eq!(first["relationship_id"], second["relationship_id"]);
    }

    #[test]
    fn relate_supersedes_old_relationship() {
        let (services, _dir) = test_services();

        execute(
            &services,
            Some(serde_json::json!({
                "source": "Sarah Chen", "target": "Acme Corp", "relationship": "works_at",
            })),
        )
        .unwrap();
        let superseded = execute(
            &services,
            Some(serde_json::json!({
                "source": "Sarah Chen", "target": "Beta Corp",
                "relationship": "works_at", "supersedes": true,
            })),
        )
        .unwrap();
        assert_eq!(superseded["success"], true);

        let report = services
            .recall
            .recall_about("Sarah Chen", None, &[], false)
            .unwrap();
        let current: Vec<_> = report
            .relationships
            .iter()
            .filter(|r| r.relationship_type == "works_at")
            .collect();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].other_entity, "Beta Corp");
    }

    #[test]
    fn relate_requires_endpoints() {
        let (services, _dir) = test_services();
        let result = execute(&services, Some(serde_json::json!({"source": "A"})));
        assert!(result.is_err());
    }
}
