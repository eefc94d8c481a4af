//! Tool-call server
//!
//! Maps external tool names to core operations, coerces loosely-typed
//! arguments (an external model's whim decides whether "5" arrives as a
//! number, a string or a float) and shapes JSON responses. Tool failures
//! become `{error}` payloads with `isError` so the stdio loop never crashes.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::protocol::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION};
use crate::services::Services;
use crate::tools;

/// Static descriptor for one exposed tool: schema plus the parameters the
/// coercers must normalize. Explicit per-parameter lists, never reflection.
struct ToolDef {
    name: &'static str,
    description: &'static str,
    schema: fn() -> Value,
    int_params: &'static [&'static str],
    array_params: &'static [&'static str],
}

const TOOLS: &[ToolDef] = &[
    ToolDef {
        name: "memory.remember",
        description: "Store information in memory: facts, preferences, observations, learnings or commitments about people and projects.",
        schema: tools::remember::schema,
        int_params: &[],
        array_params: &["about"],
    },
    ToolDef {
        name: "memory.recall",
        description: "Search memory with hybrid retrieval (semantic, full-text, graph proximity).",
        schema: tools::recall::schema,
        int_params: &["limit"],
        array_params: &["types"],
    },
    ToolDef {
        name: "memory.about",
        description: "Get all context about a specific person, project or entity: memories, relationships and metadata.",
        schema: tools::about::schema,
        int_params: &["limit"],
        array_params: &["types"],
    },
    ToolDef {
        name: "memory.relate",
        description: "Create, strengthen or supersede a relationship between two entities.",
        schema: tools::relate::schema,
        int_params: &[],
        array_params: &[],
    },
    ToolDef {
        name: "memory.predictions",
        description: "Get proactive suggestions, reminders and insights generated by pattern analysis.",
        schema: tools::predictions::schema,
        int_params: &["limit"],
        array_params: &["types"],
    },
    ToolDef {
        name: "memory.consolidate",
        description: "Manually trigger memory consolidation (decay, merging, pattern detection, predictions).",
        schema: tools::consolidate::schema,
        int_params: &[],
        array_params: &[],
    },
    ToolDef {
        name: "memory.entity",
        description: "Create or update an entity (person, organization, project, concept, location).",
        schema: tools::entity::schema,
        int_params: &[],
        array_params: &["aliases"],
    },
    ToolDef {
        name: "memory.search_entities",
        description: "Search for entities by name or description.",
        schema: tools::search_entities::schema,
        int_params: &["limit"],
        array_params: &["types"],
    },
    ToolDef {
        name: "memory.upcoming",
        description: "Commitments with deadlines in the coming days; overdue items lead.",
        schema: tools::upcoming::schema,
        int_params: &["days"],
        array_params: &[],
    },
    ToolDef {
        name: "memory.trace",
        description: "Provenance chain for one memory: origin, entities, sources, corrections.",
        schema: tools::trace::schema,
        int_params: &["memory_id"],
        array_params: &[],
    },
    ToolDef {
        name: "memory.end_session",
        description: "Finalize a conversation episode with a narrative and extracted knowledge.",
        schema: tools::end_session::schema,
        int_params: &["episode_id"],
        array_params: &["facts", "entities", "relationships"],
    },
    ToolDef {
        name: "memory.buffer_turn",
        description: "Buffer a user/assistant turn pair into the open episode.",
        schema: tools::buffer_turn::schema,
        int_params: &["episode_id"],
        array_params: &[],
    },
];

pub struct McpServer {
    services: Arc<Services>,
}

impl McpServer {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Handle one request. Notifications (no id) get no response.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let is_notification = request.id.is_none();

        let response = match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(
                request.id.clone(),
                serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": "claudia-memory",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            ),
            "ping" => JsonRpcResponse::success(request.id.clone(), serde_json::json!({})),
            "tools/list" => {
                let tool_list: Vec<Value> = TOOLS
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "name": t.name,
                            "description": t.description,
                            "inputSchema": (t.schema)(),
                        })
                    })
                    .collect();
                JsonRpcResponse::success(
                    request.id.clone(),
                    serde_json::json!({ "tools": tool_list }),
                )
            }
            "tools/call" => self.handle_tool_call(&request).await,
            "notifications/initialized" | "notifications/cancelled" => return None,
            other => JsonRpcResponse::error(
                request.id.clone(),
                JsonRpcError::method_not_found(other),
            ),
        };

        if is_notification {
            None
        } else {
            Some(response)
        }
    }

    async fn handle_tool_call(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let params = match &request.params {
            Some(p) => p,
            None => {
                return JsonRpcResponse::error(
                    request.id.clone(),
                    JsonRpcError::invalid_params("tools/call requires params"),
                )
            }
        };
        let name = match params["name"].as_str() {
            Some(n) => n,
            None => {
                return JsonRpcResponse::error(
                    request.id.clone(),
                    JsonRpcError::invalid_params("missing tool name"),
                )
            }
        };

        let mut arguments = params.get("arguments").cloned().filter(|v| !v.is_null());
        if let Some(def) = TOOLS.iter().find(|t| t.name == name) {
            if let Some(args) = arguments.as_mut() {
                coerce_arguments(args, def.int_params, def.array_params);
            }
        }

        // Core services are synchronous and may block on embedding HTTP;
        // run the dispatch off the async workers.
        let services = Arc::clone(&self.services);
        let name_owned = name.to_string();
        let result = tokio::task::spawn_blocking(move || {
            dispatch(&services, &name_owned, arguments)
        })
        .await
        .unwrap_or_else(|e| Err(format!("tool task failed: {}", e)));
        let payload = match result {
            Ok(value) => serde_json::json!({
                "content": [{
                    "type": "text",
                    "text": value.to_string(),
                }],
            }),
            Err(message) => serde_json::json!({
                "content": [{
                    "type": "text",
                    "text": serde_json::json!({ "error": message }).to_string(),
                }],
                "isError": true,
            }),
        };
        JsonRpcResponse::success(request.id.clone(), payload)
    }

}

/// Route a tool call to its module. Runs on a blocking thread.
fn dispatch(services: &Arc<Services>, name: &str, args: Option<Value>) -> Result<Value, String> {
    match name {
        "memory.remember" => tools::remember::execute(services, args),
        "memory.recall" => tools::recall::execute(services, args),
        "memory.about" => tools::about::execute(services, args),
        "memory.relate" => tools::relate::execute(services, args),
        "memory.predictions" => tools::predictions::execute(services, args),
        "memory.consolidate" => tools::consolidate::execute(services, args),
        "memory.entity" => tools::entity::execute(services, args),
        "memory.search_entities" => tools::search_entities::execute(services, args),
        "memory.upcoming" => tools::upcoming::execute(services, args),
        "memory.trace" => tools::trace::execute(services, args),
        "memory.end_session" => tools::end_session::execute(services, args),
        "memory.buffer_turn" => tools::buffer_turn::execute(services, args),
        other => Err(format!("Unknown tool: {}", other)),
    }
}

// ============================================================================
// ARGUMENT COERCION
// ============================================================================

/// Normalize loosely-typed arguments in place.
pub fn coerce_arguments(args: &mut Value, int_params: &[&str], array_params: &[&str]) {
    for key in int_params {
        coerce_int(args, key);
    }
    for key in array_params {
        coerce_array(args, key);
    }
}

/// Numeric strings and whole-number floats become integers. Booleans are
/// left alone; a string that does not parse is logged and left as-is.
fn coerce_int(args: &mut Value, key: &str) {
    let Some(current) = args.get(key) else { return };
    let replacement = match current {
        Value::String(s) => match s.trim().parse::<i64>() {
            Ok(n) => Some(Value::from(n)),
            Err(_) => match s.trim().parse::<f64>() {
                Ok(f) if f.fract() == 0.0 => Some(Value::from(f as i64)),
                _ => {
                    warn!("parameter '{}' is a non-numeric string: {:?}", key, s);
                    None
                }
            },
        },
        Value::Number(n) => {
            if n.is_f64() {
                let f = n.as_f64().unwrap_or(0.0);
                if f.fract() == 0.0 {
                    Some(Value::from(f as i64))
                } else {
                    None
                }
            } else {
                None
            }
        }
        _ => None,
    };
    if let Some(value) = replacement {
        args[key] = value;
    }
}

/// A JSON-string array becomes the parsed array. A string whose parse does
/// not yield an array is left untouched.
fn coerce_array(args: &mut Value, key: &str) {
    let Some(Value::String(raw)) = args.get(key) else {
        return;
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(parsed @ Value::Array(_)) => {
            args[key] = parsed;
        }
        _ => {
            warn!("parameter '{}' is a string that is not a JSON array", key);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::test_services;

    fn call(name: &str, arguments: Value) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id: Some(Value::from(1)),
            method: "tools/call".into(),
            params: Some(serde_json::json!({ "name": name, "arguments": arguments })),
        }
    }

    #[test]
    fn int_coercion_handles_strings_and_floats() {
        let mut args = serde_json::json!({
            "limit": "15",
            "days": 7.0,
            "flag": true,
            "noise": "not-a-number",
        });
        coerce_arguments(&mut args, &["limit", "days", "flag", "noise"], &[]);
        assert_eq!(args["limit"], 15);
        assert_eq!(args["days"], 7);
        assert_eq!(args["flag"], true); // booleans untouched
        assert_eq!(args["noise"], "not-a-number"); // logged, left alone
    }

    #[test]
    fn fractional_floats_are_not_coerced() {
        let mut args = serde_json::json!({"limit": 7.5});
        coerce_arguments(&mut args, &["limit"], &[]);
        assert_eq!(args["limit"], 7.5);
    }

    #[test]
    fn array_coercion_parses_json_strings() {
        let mut args = serde_json::json!({
            "types": "[\"fact\", \"commitment\"]",
            "about": "just a plain string",
            "already": ["ok"],
        });
        coerce_arguments(&mut args, &[], &["types", "about", "already"]);
        assert_eq!(args["types"], serde_json::json!(["fact", "commitment"]));
        assert_eq!(args["about"], "just a plain string"); // non-array parse, left
        assert_eq!(args["already"], serde_json::json!(["ok"]));
    }

    #[tokio::test]
    async fn initialize_and_tools_list() {
        let (services, _dir) = test_services();
        let server = McpServer::new(services);

        let init = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id: Some(Value::from(1)),
            method: "initialize".into(),
            params: None,
        };
        let response = server.handle_request(init).await.unwrap();
        assert_eq!(
            response.result.unwrap()["serverInfo"]["name"],
            "claudia-memory"
        );

        let list = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id: Some(Value::from(2)),
            method: "tools/list".into(),
            params: None,
        };
        let response = server.handle_request(list).await.unwrap();
        let listed = response.result.unwrap();
        let names: Vec<&str> = listed["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names.len(), 12);
        for expected in [
            "memory.remember",
            "memory.recall",
            "memory.about",
            "memory.relate",
            "memory.predictions",
            "memory.consolidate",
            "memory.entity",
            "memory.search_entities",
            "memory.upcoming",
            "memory.trace",
            "memory.end_session",
            "memory.buffer_turn",
        ] {
            assert!(names.contains(&expected), "missing {}", expected);
        }
    }

    #[tokio::test]
    async fn tool_call_wraps_result_as_text_content() {
        let (services, _dir) = test_services();
        let server = McpServer::new(services);

        let response = server
            .handle_request(call(
                "memory.remember",
                serde_json::json!({"content": "wrapped response test"}),
            ))
            .await
            .unwrap();
        let result = response.result.unwrap();
        let text = result["content"][0]["text"].as_str().unwrap();
        let inner: Value = serde_json::from_str(text).unwrap();
        assert_eq!(inner["success"], true);
        assert!(result.get("isError").is_none());
    }

    #[tokio::test]
    async fn tool_errors_become_error_payloads() {
        let (services, _dir) = test_services();
        let server = McpServer::new(services);

        let response = server
            .handle_request(call("memory.recall", serde_json::json!({"query": ""})))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        let text = result["content"][0]["text"].as_str().unwrap();
        let inner: Value = serde_json::from_str(text).unwrap();
        assert!(inner["error"].as_str().unwrap().contains("empty"));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_payload() {
        let (services, _dir) = test_services();
        let server = McpServer::new(services);

        let response = server
            .handle_request(call("memory.nope", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.result.unwrap()["isError"], true);
    }

    #[tokio::test]
    async fn coerced_arguments_flow_through_a_call() {
        let (services, _dir) = test_services();
        services
            .remember
            .remember_fact(claudia_core::remember::FactInput::new(
                "Coercion target memory",
            ))
            .unwrap();
        let server = McpServer::new(services);

        // limit arrives as a string, types as a JSON-string array
        let response = server
            .handle_request(call(
                "memory.recall",
                serde_json::json!({"query": "coercion", "limit": "5", "types": "[]"}),
            ))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert!(result.get("isError").is_none());
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let (services, _dir) = test_services();
        let server = McpServer::new(services);

        let notification = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id: None,
            method: "notifications/initialized".into(),
            params: None,
        };
        assert!(server.handle_request(notification).await.is_none());
    }
}
