//! End-to-end journeys through the memory engine: duplicate storage,
//! bi-temporal supersession, deadlines, merging and session round-trips.

use claudia_core::recall::RecallQuery;
use claudia_core::remember::{FactInput, RelateInput, SessionFact};
use claudia_e2e_tests::TestMemory;

#[test]
fn duplicate_store_returns_one_id() {
    let memory = TestMemory::new();

    let first = memory
        .remember
        .remember_fact(FactInput::new(
            "The annual company retreat is in September",
        ))
        .unwrap();
    let second = memory
        .remember
        .remember_fact(FactInput::new(
            "The annual company retreat is in September",
        ))
        .unwrap();

    assert_eq!(first.memory_id, second.memory_id);
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(memory.store.count("memories").unwrap(), 1);
}

#[test]
fn bitemporal_supersede_closes_the_old_interval() {
    let memory = TestMemory::new();

    memory
        .remember
        .relate_entities(RelateInput {
            source: "Sarah Chen".into(),
            target: "Acme Corp".into(),
            relationship_type: "works_at".into(),
            strength: 1.0,
            direction: "bidirectional".into(),
            supersedes: false,
            metadata: None,
        })
        .unwrap();
    memory
        .remember
        .relate_entities(RelateInput {
            source: "Sarah Chen".into(),
            target: "Beta Corp".into(),
            relationship_type: "works_at".into(),
            strength: 1.0,
            direction: "bidirectional".into(),
            supersedes: true,
            metadata: None,
        })
        .unwrap();

    // The Acme row is closed with a renamed type
    memory
        .store
        .read(|conn| {
            let (rel_type, invalid_at): (String, Option<String>) = conn
                .query_row(
                    "SELECT r.relationship_type, r.invalid_at
                     FROM relationships r
                     JOIN entities t ON t.id = r.target_entity_id
                     WHERE t.canonical_name = 'acme corp'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .unwrap();
            assert!(rel_type.starts_with("works_at__superseded_"));
            assert!(invalid_at.is_some());
            Ok(())
        })
        .unwrap();

    // Default recall shows exactly one current works_at: Beta Corp
    let report = memory
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

    // Historical view returns both with validity bounds
    let historical = memory
        .recall
        .recall_about("Sarah Chen", None, &[], true)
        .unwrap();
    assert!(historical.relationships.len() >= 2);
    let closed: Vec<_> = historical
        .relationships
        .iter()
        .filter(|r| r.invalid_at.is_some())
        .collect();
    assert_eq!(closed.len(), 1);
    assert!(closed[0].valid_at.is_some());
}

#[test]
fn overdue_commitment_sorts_before_future_items() {
    let memory = TestMemory::new();

    let past = (chrono::Utc::now().date_naive() - chrono::Duration::days(2)).to_string();
    let future = (chrono::Utc::now().date_naive() + chrono::Duration::days(5)).to_string();

    memory
        .store
        .transaction(|tx| {
            let now = chrono::Utc::now().to_rfc3339();
            for (content, deadline, hash) in [
                ("Send the signed contract", &past, "h1"),
                ("Prepare the QBR deck", &future, "h2"),
            ] {
                tx.execute(
                    "INSERT INTO memories
                        (content, content_hash, type, importance, deadline_at,
                         created_at, updated_at)
                     VALUES (?1, ?2, 'commitment', 0.8, ?3, ?4, ?4)",
                    rusqlite::params![content, hash, deadline, now],
                )?;
            }
            Ok(())
        })
        .unwrap();

    let items = memory.recall.recall_upcoming_deadlines(14).unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].urgency, "overdue");
    assert_eq!(items[0].content, "Send the signed contract");
    assert!(items[0].deadline_at < items[1].deadline_at);
}

#[test]
fn merge_absorption_moves_everything_to_the_target() {
    let memory = TestMemory::new();

    let jon = memory
        .remember
        .remember_entity("Jon Smith", "person", None, &[], None, None)
        .unwrap();
    let john = memory
        .remember
        .remember_entity("John Smith", "person", None, &[], None, None)
        .unwrap();

    memory
        .remember
        .remember_fact(FactInput::new("Jon Smith presented the roadmap").about(vec!["Jon Smith".into()]))
        .unwrap();
    memory
        .remember
        .remember_fact(
            FactInput::new("Jon Smith joined the hiring panel").about(vec!["Jon Smith".into()]),
        )
        .unwrap();

    memory
        .remember
        .merge_entities(jon, john, Some("same person"))
        .unwrap();

    memory
        .store
        .read(|conn| {
            let deleted_at: Option<String> = conn
                .query_row("SELECT deleted_at FROM entities WHERE id = ?1", [jon], |r| {
                    r.get(0)
                })
                .unwrap();
            assert!(deleted_at.is_some());

            let linked: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM memory_entities WHERE entity_id = ?1",
                    [john],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(linked, 2);

            let alias_present: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM entity_aliases
                     WHERE entity_id = ?1 AND canonical_alias = 'jon smith'",
                    [john],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(alias_present, 1);
            Ok(())
        })
        .unwrap();

    // "Jon Smith" now resolves to John Smith
    let report = memory
        .recall
        .recall_about("Jon Smith", None, &[], false)
        .unwrap();
    assert_eq!(report.entity.unwrap().id, john);
    assert_eq!(report.memories.len(), 2);
}

#[test]
fn fts_fallback_still_finds_text_matches() {
    let memory = TestMemory::new();

    // The embedding client points at a dead port; recall runs on the
    // full-text and keyword paths only.
    memory
        .remember
        .remember_fact(FactInput::new("The board meeting is rescheduled to Thursday"))
        .unwrap();
    memory
        .remember
        .remember_fact(FactInput::new("Groceries include oat milk"))
        .unwrap();

    let results = memory
        .recall
        .recall(&RecallQuery::new("board meeting"))
        .unwrap();
    assert!(!results.is_empty());
    assert!(results[0].content.contains("board meeting"));
}

#[test]
fn session_round_trip_is_recallable_by_entity() {
    let memory = TestMemory::new();

    let buffered = memory
        .remember
        .buffer_turn(
            "Talked with Sarah Chen about the launch plan",
            "Noted the launch discussion.",
            None,
        )
        .unwrap();

    memory
        .remember
        .end_session(
            Some(buffered.episode_id),
            "Session about the launch: Sarah Chen will own the rollout timeline.",
            &[SessionFact {
                content: "Sarah Chen owns the rollout timeline".into(),
                memory_type: "fact".into(),
                about: vec!["Sarah Chen".into()],
                importance: 0.9,
            }],
            &[],
            &[],
        )
        .unwrap();

    // A recall for the entity mentioned in the narrative returns a memory
    // derived from the session
    let report = memory
        .recall
        .recall_about("Sarah Chen", None, &[], false)
        .unwrap();
    assert!(report
        .memories
        .iter()
        .any(|m| m.content.contains("rollout timeline")));

    let results = memory
        .recall
        .recall(&RecallQuery::new("rollout timeline"))
        .unwrap();
    assert!(!results.is_empty());
}

#[test]
fn verification_promotes_and_flags_in_one_pass() {
    let memory = TestMemory::new();

    let clean = memory
        .remember
        .remember_fact(FactInput::new("The office key code changed"))
        .unwrap();
    let vague = memory
        .remember
        .remember_fact(FactInput::new("I'll deal with the vendor mess").with_type("commitment"))
        .unwrap();

    // Age both past the verification buffer
    memory
        .store
        .transaction(|tx| {
            let old = (chrono::Utc::now() - chrono::Duration::minutes(10)).to_rfc3339();
            tx.execute("UPDATE memories SET created_at = ?1", [&old])?;
            Ok(())
        })
        .unwrap();

    let stats = memory.verifier.run_verification().unwrap();
    assert_eq!(stats.verified, 1);
    assert_eq!(stats.flagged, 1);

    assert!(memory.importance_of(vague.memory_id) < memory.importance_of(clean.memory_id));
}
