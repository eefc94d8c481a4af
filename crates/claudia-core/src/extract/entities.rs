//! Entity and Memory Extraction
//!
//! Regex passes that surface candidate people, organizations, projects,
//! commitments and preferences from free text. Confidences reflect the
//! tier that produced the candidate: persons 0.6, organizations and
//! projects 0.5, commitments 0.7, preferences 0.6.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// An entity candidate surfaced from text.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: String,
    pub canonical_name: String,
    pub confidence: f64,
    pub span: (usize, usize),
}

/// A memory candidate (commitment or preference) surfaced from text.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedMemory {
    pub content: String,
    pub memory_type: String,
    /// Entity names mentioned inside the content (substring match).
    pub entities: Vec<String>,
    pub confidence: f64,
}

static PERSON_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        // Full names, optionally titled
        Regex::new(r"\b(?:Dr\.?|Mr\.?|Mrs\.?|Ms\.?|Prof\.?)?\s*([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)\b")
            .unwrap(),
        // Possessive first names (Sarah's, Mike's)
        Regex::new(r"\b([A-Z][a-z]+)'s\b").unwrap(),
        // Names introduced by role markers
        Regex::new(r"\b(?:with|from|to|about|called|named|meet(?:ing)?)\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)?)\b")
            .unwrap(),
    ]
});

static ORGANIZATION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        // Corporate suffixes
        Regex::new(
            r"\b([A-Z][A-Za-z]+(?:\s+[A-Z][A-Za-z]+)*\s+(?:Inc\.?|Corp\.?|LLC|Ltd\.?|Co\.?|Company|Group|Partners|Consulting))\b",
        )
        .unwrap(),
        // 2-5 char all-caps acronyms
        Regex::new(r"\b([A-Z]{2,5})\b(?:\s+(?:team|company|client|project))?").unwrap(),
    ]
});

static PROJECT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)\b(?:the\s+)?([A-Z][a-z]+(?:\s+[A-Z][a-z]+)*)\s+(?:project|initiative|proposal|deal)\b")
            .unwrap(),
        // Q-prefixed tokens (Q4 review, Q2 planning)
        Regex::new(r"\b(Q[1-4]\s+[A-Za-z]+)\b").unwrap(),
    ]
});

static COMMITMENT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)(?:I'll|I will|I'm going to|we'll|we will)\s+(.+?)(?:\.|$)").unwrap(),
        Regex::new(r"(?i)(?:by|before|until)\s+(\w+day|\d+[/-]\d+|\w+\s+\d+)").unwrap(),
        Regex::new(r"(?i)(?:send|deliver|complete|finish|submit)\s+(?:the\s+)?(.+?)(?:\s+(?:by|to|before)|\.|$)")
            .unwrap(),
    ]
});

static PREFERENCE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)(?:I |he |she |they )(?:prefer|like|want|need)\s+(.+?)(?:\.|$)").unwrap(),
        Regex::new(r"(?i)(?:better|best|rather)\s+(?:to |if |when )?(.+?)(?:\.|$)").unwrap(),
    ]
});

static TITLE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:Dr\.?|Mr\.?|Mrs\.?|Ms\.?|Prof\.?)\s*").unwrap());

static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Words a capitalized token may be without naming anything.
static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday",
        "january", "february", "march", "april", "may", "june", "july", "august",
        "september", "october", "november", "december",
        "today", "tomorrow", "yesterday", "morning", "afternoon", "evening", "night",
        "the", "this", "that", "these", "those", "here", "there", "where", "when",
        "what", "which", "who", "how", "just", "only", "also", "even", "still",
    ]
    .into_iter()
    .collect()
});

/// Normalize a display name for identity matching: strip titles, lowercase,
/// trim, collapse internal whitespace.
pub fn canonical_name(name: &str) -> String {
    let stripped = TITLE_PREFIX.replace(name, "");
    let lowered = stripped.to_lowercase();
    WHITESPACE_RUN.replace_all(lowered.trim(), " ").to_string()
}

/// Extract all entity candidates, deduplicated by canonical name. Earlier
/// passes win: persons over organizations over projects.
pub fn extract_entities(text: &str) -> Vec<ExtractedEntity> {
    let mut entities = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    let push = |name: &str, entity_type: &str, confidence: f64, span: (usize, usize),
                    min_len: usize,
                    seen: &mut HashSet<String>,
                    out: &mut Vec<ExtractedEntity>| {
        let canonical = canonical_name(name);
        if canonical.len() <= min_len
            || seen.contains(&canonical)
            || STOP_WORDS.contains(canonical.as_str())
        {
            return;
        }
        seen.insert(canonical.clone());
        out.push(ExtractedEntity {
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            canonical_name: canonical,
            confidence,
            span,
        });
    };

    for pattern in PERSON_PATTERNS.iter() {
        for caps in pattern.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                push(m.as_str(), "person", 0.6, (m.start(), m.end()), 1, &mut seen, &mut entities);
            }
        }
    }

    for pattern in ORGANIZATION_PATTERNS.iter() {
        for caps in pattern.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                push(m.as_str(), "organization", 0.5, (m.start(), m.end()), 1, &mut seen, &mut entities);
            }
        }
    }

    for pattern in PROJECT_PATTERNS.iter() {
        for caps in pattern.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                push(m.as_str(), "project", 0.5, (m.start(), m.end()), 2, &mut seen, &mut entities);
            }
        }
    }

    entities
}

/// Extract commitment and preference candidates, linking each to the
/// entity names that appear inside it (case-insensitive substring; callers
/// that need exact provenance pass entities explicitly).
pub fn extract_memories(text: &str, entities: &[ExtractedEntity]) -> Vec<ExtractedMemory> {
    let mut memories = Vec::new();

    let related = |content: &str| -> Vec<String> {
        let lowered = content.to_lowercase();
        entities
            .iter()
            .filter(|e| lowered.contains(&e.name.to_lowercase()))
            .map(|e| e.name.clone())
            .collect()
    };

    for pattern in COMMITMENT_PATTERNS.iter() {
        for m in pattern.find_iter(text) {
            let content = m.as_str().trim();
            if content.len() > 10 {
                memories.push(ExtractedMemory {
                    content: content.to_string(),
                    memory_type: "commitment".to_string(),
                    entities: related(content),
                    confidence: 0.7,
                });
            }
        }
    }

    for pattern in PREFERENCE_PATTERNS.iter() {
        for m in pattern.find_iter(text) {
            let content = m.as_str().trim();
            if content.len() > 10 {
                memories.push(ExtractedMemory {
                    content: content.to_string(),
                    memory_type: "preference".to_string(),
                    entities: related(content),
                    confidence: 0.6,
                });
            }
        }
    }

    memories
}

/// Extract both entities and memories in one pass.
pub fn extract_all(text: &str) -> (Vec<ExtractedEntity>, Vec<ExtractedMemory>) {
    let entities = extract_entities(text);
    let memories = extract_memories(text, &entities);
    (entities, memories)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_name_strips_titles_and_whitespace() {
        assert_eq!(canonical_name("Dr. Sarah Chen"), "sarah chen");
        assert_eq!(canonical_name("  Mr Smith "), "smith");
        assert_eq!(canonical_name("Sarah   Chen"), "sarah chen");
        assert_eq!(canonical_name("PROF. Jones"), "jones");
    }

    #[test]
    fn extracts_full_names_as_persons() {
        let entities = extract_entities("Had a call with Sarah Chen about the roadmap.");
        let sarah = entities.iter().find(|e| e.canonical_name == "sarah chen");
        assert!(sarah.is_some());
        let sarah = sarah.unwrap();
        assert_eq!(sarah.entity_type, "person");
        assert!((sarah.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn extracts_possessive_names() {
        let entities = extract_entities("Reviewed Mike's proposal yesterday.");
        assert!(entities.iter().any(|e| e.canonical_name == "mike"));
    }

    #[test]
    fn extracts_organizations_by_suffix() {
        let entities = extract_entities("Acme Corp signed the contract.");
        let acme = entities
            .iter()
            .find(|e| e.entity_type == "organization")
            .unwrap();
        assert_eq!(acme.canonical_name, "acme corp");
        assert!((acme.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn extracts_acronyms_as_organizations() {
        let entities = extract_entities("The NASA team sent their review.");
        assert!(entities
            .iter()
            .any(|e| e.entity_type == "organization" && e.canonical_name == "nasa"));
    }

    #[test]
    fn extracts_projects() {
        let entities = extract_entities("We kicked off the Phoenix project last week.");
        assert!(entities
            .iter()
            .any(|e| e.entity_type == "project" && e.canonical_name == "phoenix"));
    }

    #[test]
    fn stop_words_are_filtered() {
        let entities = extract_entities("Monday and Tuesday were busy. This morning too.");
        assert!(entities.is_empty());
    }

    #[test]
    fn dedupes_by_canonical_name() {
        let entities = extract_entities("Sarah Chen met Sarah Chen's team.");
        let count = entities
            .iter()
            .filter(|e| e.canonical_name == "sarah chen")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn extracts_commitments_with_linked_entities() {
        let (entities, memories) =
            extract_all("I'll send the report to Sarah Chen by Friday.");
        let commitment = memories
            .iter()
            .find(|m| m.memory_type == "commitment")
            .unwrap();
        assert!((commitment.confidence - 0.7).abs() < 1e-9);
        assert!(commitment.entities.contains(&"Sarah Chen".to_string()));
        assert!(!entities.is_empty());
    }

    #[test]
    fn extracts_preferences() {
        let memories = extract_memories("I prefer morning meetings over afternoon ones.", &[]);
        let pref = memories
            .iter()
            .find(|m| m.memory_type == "preference")
            .unwrap();
        assert!((pref.confidence - 0.6).abs() < 1e-9);
        assert!(pref.content.contains("morning meetings"));
    }

    #[test]
    fn short_fragments_are_ignored() {
        // "I'll go." is under the 10-char floor after the match
        let memories = extract_memories("I'll go.", &[]);
        assert!(memories.is_empty());
    }
}
