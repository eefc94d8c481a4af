//! Long-horizon behavior: decay monotonicity, consolidation idempotence and
//! the importance floor.

use claudia_core::remember::FactInput;
use claudia_e2e_tests::TestMemory;

#[test]
fn decay_is_monotone_and_floor_bounded() {
    let memory = TestMemory::new();

    let outcome = memory
        .remember
        .remember_fact(FactInput::new("A fact that must survive a hundred nights").importance(0.9))
        .unwrap();

    let initial = memory.importance_of(outcome.memory_id);
    assert!((initial - 0.9).abs() < 1e-9);

    memory.consolidator.run_decay().unwrap();
    let after_one = memory.importance_of(outcome.memory_id);
    assert!(after_one < initial);
    assert!(after_one > memory.config.min_importance_threshold);

    let mut previous = after_one;
    for _ in 0..100 {
        memory.consolidator.run_decay().unwrap();
        let current = memory.importance_of(outcome.memory_id);
        assert!(current <= previous);
        assert!(current >= memory.config.min_importance_threshold);
        previous = current;
    }
}

#[test]
fn consolidation_is_idempotent_without_new_data() {
    let memory = TestMemory::new();

    memory
        .remember
        .remember_fact(
            FactInput::new("Met Ada Osei about the partner program").about(vec!["Ada Osei".into()]),
        )
        .unwrap();

    // Age the mention so the cooling detector has something to find
    memory
        .store
        .transaction(|tx| {
            let old = (chrono::Utc::now() - chrono::Duration::days(45)).to_rfc3339();
            tx.execute("UPDATE memories SET created_at = ?1", [&old])?;
            Ok(())
        })
        .unwrap();

    let first = memory.consolidator.run_full_consolidation();
    let patterns_after_first = memory.store.count("patterns").unwrap();

    let second = memory.consolidator.run_full_consolidation();
    let patterns_after_second = memory.store.count("patterns").unwrap();

    // Patterns upsert by name: no new rows without new data
    assert_eq!(patterns_after_first, patterns_after_second);
    assert_eq!(first.patterns_detected, second.patterns_detected);
}

#[test]
fn rehearsal_keeps_read_memories_warmer() {
    let memory = TestMemory::new();

    let read_often = memory
        .remember
        .remember_fact(FactInput::new("The staging cluster lives in Frankfurt").importance(0.6))
        .unwrap();
    let never_read = memory
        .remember
        .remember_fact(FactInput::new("The legacy wiki is read-only now").importance(0.6))
        .unwrap();

    // Recall touches the first memory (rehearsal), not the second
    memory
        .recall
        .recall(&claudia_core::RecallQuery::new("staging cluster"))
        .unwrap();

    memory.consolidator.run_decay().unwrap();
    memory.consolidator.boost_accessed_memories().unwrap();

    assert!(memory.importance_of(read_often.memory_id) > memory.importance_of(never_read.memory_id));
}

#[test]
fn duplicate_suppression_survives_consolidation() {
    let memory = TestMemory::new();

    // Build an entity with enough linked memories to qualify for merging
    let mut ids = Vec::new();
    for i in 0..5 {
        let outcome = memory
            .remember
            .remember_fact(
                FactInput::new(format!("Fact {} about Priya Nair", i))
                    .about(vec!["Priya Nair".into()]),
            )
            .unwrap();
        ids.push(outcome.memory_id);
    }

    // Hand two of them identical vectors
    memory
        .store
        .transaction(|tx| {
            let vector = claudia_core::store::vector_to_bytes(&[0.5f32, 0.5, 0.0]);
            for id in &ids[..2] {
                tx.execute(
                    "INSERT OR REPLACE INTO memory_embeddings (memory_id, embedding)
                     VALUES (?1, ?2)",
                    rusqlite::params![id, vector],
                )?;
            }
            Ok(())
        })
        .unwrap();

    let merged = memory.consolidator.merge_similar_memories().unwrap();
    assert_eq!(merged, 1);

    // The duplicate is suppressed, never deleted
    assert_eq!(memory.store.count("memories").unwrap(), 5);
    let suppressed = ids
        .iter()
        .filter(|id| (memory.importance_of(**id) - 0.001).abs() < 1e-9)
        .count();
    assert_eq!(suppressed, 1);
}
