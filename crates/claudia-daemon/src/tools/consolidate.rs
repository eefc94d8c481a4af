//! memory.consolidate: manually trigger a full consolidation run.

use std::sync::Arc;

use serde_json::Value;

use crate::services::Services;

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {}
    })
}

pub fn execute(services: &Arc<Services>, _args: Option<Value>) -> Result<Value, String> {
    let report = services.consolidator.run_full_consolidation();
    serde_json::to_value(report).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::test_services;
    use claudia_core::remember::FactInput;

    #[test]
    fn consolidate_returns_phase_counts() {
        let (services, _dir) = test_services();
        services
            .remember
            .remember_fact(FactInput::new("Something to decay"))
            .unwrap();

        let result = execute(&services, None).unwrap();
        assert!(result["decay"]["memories"].as_u64().unwrap() >= 1);
        assert!(result["duration_ms"].is_number());
    }
}
