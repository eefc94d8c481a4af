//! memory.buffer_turn: append a user/assistant turn to the open episode.

use std::sync::Arc;

use serde_json::Value;

use crate::services::Services;

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "user": {
                "type": "string",
                "description": "User message content"
            },
            "assistant": {
                "type": "string",
                "description": "Assistant message content"
            },
            "episode_id": {
                "type": "integer",
                "description": "Episode to append to (a new one is opened when absent or stale)"
            }
        },
        "required": ["user", "assistant"]
    })
}

pub fn execute(services: &Arc<Services>, args: Option<Value>) -> Result<Value, String> {
    let args = args.ok_or("Missing arguments")?;
    let user = args["user"].as_str().ok_or("'user' is required")?;
    let assistant = args["assistant"].as_str().ok_or("'assistant' is required")?;

    let outcome = services
        .remember
        .buffer_turn(user, assistant, args["episode_id"].as_i64())
        .map_err(|e| e.to_string())?;

    serde_json::to_value(outcome).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::test_services;

    #[test]
    fn buffer_turn_tracks_turn_numbers() {
        let (services, _dir) = test_services();

        let first = execute(
            &services,
            Some(serde_json::json!({"user": "hello", "assistant": "hi"})),
        )
        .unwrap();
        assert_eq!(first["turn_number"], 1);

        let second = execute(
            &services,
            Some(serde_json::json!({
                "user": "more",
                "assistant": "sure",
                "episode_id": first["episode_id"],
            })),
        )
        .unwrap();
        assert_eq!(second["turn_number"], 2);
        assert_eq!(second["episode_id"], first["episode_id"]);
    }
}
