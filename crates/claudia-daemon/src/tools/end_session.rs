//! memory.end_session: finalize an episode with a narrative and extracted
//! knowledge.

use std::sync::Arc;

use serde_json::Value;

use claudia_core::remember::{SessionEntity, SessionFact, SessionRelationship};

use crate::services::Services;

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "episode_id": {
                "type": "integer",
                "description": "Episode to finalize (a fresh one is created when stale)"
            },
            "narrative": {
                "type": "string",
                "description": "Long-form summary of the session"
            },
            "facts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "content": {"type": "string"},
                        "memory_type": {"type": "string"},
                        "about": {"type": "array", "items": {"type": "string"}},
                        "importance": {"type": "number"}
                    },
                    "required": ["content"]
                },
                "description": "Facts extracted from the session"
            },
            "entities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "type": {"type": "string"},
                        "description": {"type": "string"}
                    },
                    "required": ["name"]
                },
                "description": "Entities observed in the session"
            },
            "relationships": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "source": {"type": "string"},
                        "target": {"type": "string"},
                        "relationship": {"type": "string"},
                        "supersedes": {"type": "boolean"}
                    },
                    "required": ["source", "target", "relationship"]
                },
                "description": "Relationships observed in the session"
            }
        },
        "required": ["narrative"]
    })
}

pub fn execute(services: &Arc<Services>, args: Option<Value>) -> Result<Value, String> {
    let args = args.ok_or("Missing arguments")?;
    let narrative = args["narrative"]
        .as_str()
        .ok_or("'narrative' is required")?;

    let facts: Vec<SessionFact> = parse_list(&args["facts"])?;
    let entities: Vec<SessionEntity> = parse_list(&args["entities"])?;
    let relationships: Vec<SessionRelationship> = parse_list(&args["relationships"])?;

    let counts = services
        .remember
        .end_session(
            args["episode_id"].as_i64(),
            narrative,
            &facts,
            &entities,
            &relationships,
        )
        .map_err(|e| e.to_string())?;

    serde_json::to_value(counts).map_err(|e| e.to_string())
}

fn parse_list<T: serde::de::DeserializeOwned>(value: &Value) -> Result<Vec<T>, String> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(value.clone()).map_err(|e| format!("Invalid list argument: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::test_services;

    #[test]
    fn end_session_stores_narrative_and_facts() {
        let (services, _dir) = test_services();

        let buffered = services.remember.buffer_turn("hello", "hi", None).unwrap();
        let result = execute(
            &services,
            Some(serde_json::json!({
                "episode_id": buffered.episode_id,
                "narrative": "Planned the retreat with Sarah Chen.",
                "facts": [
                    {"content": "Retreat is in September", "about": ["Sarah Chen"]}
                ],
                "entities": [
                    {"name": "Sarah Chen", "type": "person"}
                ],
                "relationships": [
                    {"source": "Sarah Chen", "target": "Acme Corp", "relationship": "works_at"}
                ],
            })),
        )
        .unwrap();

        assert_eq!(result["episode_id"], buffered.episode_id);
        assert_eq!(result["facts"], 1);
        assert_eq!(result["entities"], 1);
        assert_eq!(result["relationships"], 1);
    }

    #[test]
    fn end_session_requires_narrative() {
        let (services, _dir) = test_services();
        assert!(execute(&services, Some(serde_json::json!({}))).is_err());
    }
}
