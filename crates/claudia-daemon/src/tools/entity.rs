//! memory.entity: create or update an entity.

use std::sync::Arc;

use serde_json::Value;

use crate::services::Services;
use crate::tools::string_array;

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "name": {
                "type": "string",
                "description": "Entity name"
            },
            "type": {
                "type": "string",
                "enum": ["person", "organization", "project", "concept", "location"],
                "description": "Type of entity",
                "default": "person"
            },
            "description": {
                "type": "string",
                "description": "Description of the entity"
            },
            "aliases": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Alternative names or spellings"
            },
            "metadata": {
                "type": "object",
                "description": "Free-form attributes (company, role, geography, ...)"
            }
        },
        "required": ["name"]
    })
}

pub fn execute(services: &Arc<Services>, args: Option<Value>) -> Result<Value, String> {
    let args = args.ok_or("Missing arguments")?;
    let name = args["name"].as_str().ok_or("'name' is required")?;

    let metadata = if args["metadata"].is_object() {
        Some(args["metadata"].clone())
    } else {
        None
    };

    let entity_id = services
        .remember
        .remember_entity(
            name,
            args["type"].as_str().unwrap_or("person"),
            args["description"].as_str(),
            &string_array(&args["aliases"]),
            metadata.as_ref(),
            None,
        )
        .map_err(|e| e.to_string())?;

    Ok(serde_json::json!({
        "success": true,
        "entity_id": entity_id,
    }))
}
