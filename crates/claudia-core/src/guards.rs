//! Guards
//!
//! Synchronous pre-write validation. Guards are advisory: they warn and
//! auto-correct, never block a write. The one exception is an empty entity
//! name, which is fatal.

use std::sync::LazyLock;

use regex::Regex;
use similar::TextDiff;

/// Content length that earns a warning.
const CONTENT_WARN_CHARS: usize = 500;
/// Content length past which content is truncated.
const CONTENT_MAX_CHARS: usize = 1000;
/// Sequence ratio above which two names are considered near-duplicates.
pub const NEAR_DUPLICATE_RATIO: f32 = 0.85;

/// Deadline shapes a commitment is expected to contain. Shared with the
/// background verifier's re-check.
pub static DEADLINE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)\b(by|before|due|until|deadline)\s+\w+").unwrap(),
        Regex::new(r"\b\d{1,2}[/-]\d{1,2}([/-]\d{2,4})?\b").unwrap(),
        Regex::new(r"(?i)\b(january|february|march|april|may|june|july|august|september|october|november|december)\s+\d{1,2}\b")
            .unwrap(),
        Regex::new(r"(?i)\b(monday|tuesday|wednesday|thursday|friday|saturday|sunday)\b").unwrap(),
        Regex::new(r"(?i)\b(tomorrow|tonight|next week|next month|end of (week|month|day|year))\b")
            .unwrap(),
        Regex::new(r"\bEOD\b|\bEOW\b|\bEOM\b").unwrap(),
    ]
});

/// Result of a validation pass. Warnings are advisory; adjusted fields must
/// be applied by the caller before writing.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub warnings: Vec<String>,
    pub adjusted_content: Option<String>,
    pub adjusted_importance: Option<f64>,
    pub adjusted_strength: Option<f64>,
    pub adjusted_entity_type: Option<String>,
}

impl ValidationResult {
    fn ok() -> Self {
        Self {
            is_valid: true,
            ..Default::default()
        }
    }
}

/// True when any deadline pattern matches the content.
pub fn has_deadline_pattern(content: &str) -> bool {
    DEADLINE_PATTERNS.iter().any(|p| p.is_match(content))
}

/// difflib-style similarity ratio between two strings.
pub fn sequence_ratio(a: &str, b: &str) -> f32 {
    TextDiff::from_chars(a, b).ratio()
}

/// Validate a memory before storage: length clamp, importance clamp,
/// commitment deadline presence.
pub fn validate_memory(content: &str, memory_type: &str, importance: f64) -> ValidationResult {
    let mut result = ValidationResult::ok();

    let char_count = content.chars().count();
    if char_count > CONTENT_MAX_CHARS {
        result.warnings.push(format!(
            "Content truncated from {} to {} characters",
            char_count, CONTENT_MAX_CHARS
        ));
        result.adjusted_content = Some(content.chars().take(CONTENT_MAX_CHARS).collect());
    } else if char_count > CONTENT_WARN_CHARS {
        result.warnings.push(format!(
            "Long content ({} chars) -- consider breaking into multiple memories",
            char_count
        ));
    }

    if importance < 0.0 {
        result
            .warnings
            .push(format!("Importance {} clamped to 0.0", importance));
        result.adjusted_importance = Some(0.0);
    } else if importance > 1.0 {
        result
            .warnings
            .push(format!("Importance {} clamped to 1.0", importance));
        result.adjusted_importance = Some(1.0);
    }

    if memory_type == "commitment" && !has_deadline_pattern(content) {
        result
            .warnings
            .push("Commitment has no detected deadline -- consider adding a target date".into());
    }

    result
}

/// Validate an entity before storage: name required, type defaulted,
/// near-duplicate fuzz against existing canonical names.
pub fn validate_entity(
    name: &str,
    entity_type: &str,
    existing_canonical_names: &[String],
) -> ValidationResult {
    let mut result = ValidationResult::ok();

    if name.trim().is_empty() {
        result.is_valid = false;
        result.warnings.push("Entity name cannot be empty".into());
        return result;
    }

    if entity_type.trim().is_empty() {
        result
            .warnings
            .push("Entity type is required but was empty -- defaulting to 'person'".into());
        result.adjusted_entity_type = Some("person".into());
    }

    let canonical = name.trim().to_lowercase();
    for existing in existing_canonical_names {
        let existing_lower = existing.to_lowercase();
        if canonical == existing_lower {
            continue;
        }
        let ratio = sequence_ratio(&canonical, &existing_lower);
        if ratio > NEAR_DUPLICATE_RATIO {
            result.warnings.push(format!(
                "Near-duplicate entity name: '{}' is similar to existing '{}' (similarity: {:.2})",
                name, existing, ratio
            ));
        }
    }

    result
}

/// Validate a relationship before storage: strength clamp.
pub fn validate_relationship(strength: f64) -> ValidationResult {
    let mut result = ValidationResult::ok();

    if strength < 0.0 {
        result
            .warnings
            .push(format!("Relationship strength {} clamped to 0.0", strength));
        result.adjusted_strength = Some(0.0);
    } else if strength > 1.0 {
        result
            .warnings
            .push(format!("Relationship strength {} clamped to 1.0", strength));
        result.adjusted_strength = Some(1.0);
    }

    result
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_content_passes_clean() {
        let result = validate_memory("Prefers async standups", "preference", 0.8);
        assert!(result.is_valid);
        assert!(result.warnings.is_empty());
        assert!(result.adjusted_content.is_none());
    }

    #[test]
    fn long_content_warns_very_long_truncates() {
        let long = "x".repeat(600);
        let result = validate_memory(&long, "fact", 1.0);
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.adjusted_content.is_none());

        let very_long = "y".repeat(1500);
        let result = validate_memory(&very_long, "fact", 1.0);
        assert!(result.is_valid);
        let truncated = result.adjusted_content.unwrap();
        assert_eq!(truncated.chars().count(), 1000);
    }

    #[test]
    fn importance_clamps_both_ends() {
        let result = validate_memory("x", "fact", -0.5);
        assert_eq!(result.adjusted_importance, Some(0.0));

        let result = validate_memory("x", "fact", 1.5);
        assert_eq!(result.adjusted_importance, Some(1.0));

        let result = validate_memory("x", "fact", 0.5);
        assert!(result.adjusted_importance.is_none());
    }

    #[test]
    fn commitment_without_deadline_warns() {
        let result = validate_memory("I'll handle the rollout", "commitment", 1.0);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("no detected deadline")));

        let result = validate_memory("I'll handle the rollout by Friday", "commitment", 1.0);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn deadline_patterns_cover_common_shapes() {
        for text in [
            "due tomorrow",
            "by Monday",
            "before 3/15",
            "January 15 at the latest",
            "EOD",
            "end of month",
        ] {
            assert!(has_deadline_pattern(text), "expected deadline in {:?}", text);
        }
        assert!(!has_deadline_pattern("no date in sight"));
    }

    #[test]
    fn empty_entity_name_is_fatal() {
        let result = validate_entity("  ", "person", &[]);
        assert!(!result.is_valid);
    }

    #[test]
    fn blank_type_defaults_to_person() {
        let result = validate_entity("Sarah Chen", "", &[]);
        assert!(result.is_valid);
        assert_eq!(result.adjusted_entity_type.as_deref(), Some("person"));
    }

    #[test]
    fn near_duplicate_names_warn() {
        let existing = vec!["john smith".to_string()];
        let result = validate_entity("Jon Smith", "person", &existing);
        assert!(result.is_valid);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("Near-duplicate")));

        // Identical names are the same entity, not near-duplicates
        let result = validate_entity("John Smith", "person", &existing);
        assert!(result.warnings.is_empty());

        // Clearly different names pass clean
        let result = validate_entity("Maria Garcia", "person", &existing);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn relationship_strength_clamps() {
        assert_eq!(validate_relationship(-1.0).adjusted_strength, Some(0.0));
        assert_eq!(validate_relationship(2.0).adjusted_strength, Some(1.0));
        assert!(validate_relationship(0.7).adjusted_strength.is_none());
    }
}
