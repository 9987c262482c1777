//! Tests for the two-phase promotion pipeline and knowledge operations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use relay_events::{FanoutHub, DEFAULT_EVENT_ROOM};
use relay_memory::{MemoryGateway, MemoryHitMetadata, MemorySearchHit, MemoryWriteMetadata};
use relay_store::{
    KnowledgeCategory, KnowledgeListFilter, KnowledgeSource, MemoryRef, SqliteStore,
};

use super::{
    answer_from_content, CheckKnowledgeOutcome, KnowledgeError, KnowledgeService,
    KnowledgeServiceConfig, KnowledgeUpdate, PromoteKnowledge,
};

#[derive(Default)]
struct FakeGateway {
    fail_first_adds: AtomicUsize,
    fail_adds_always: bool,
    fail_update: bool,
    fail_delete: bool,
    add_calls: Mutex<Vec<(String, String)>>,
    update_calls: Mutex<Vec<(String, String)>>,
    delete_calls: Mutex<Vec<String>>,
    hits: Mutex<Vec<MemorySearchHit>>,
    id_sequence: AtomicUsize,
}

#[async_trait]
impl MemoryGateway for FakeGateway {
    async fn add(
        &self,
        question: &str,
        answer: &str,
        _metadata: &MemoryWriteMetadata,
    ) -> Result<String> {
        self.add_calls
            .lock()
            .expect("add calls lock")
            .push((question.to_string(), answer.to_string()));
        if self.fail_adds_always {
            bail!("gateway unavailable");
        }
        let remaining = self.fail_first_adds.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first_adds.store(remaining - 1, Ordering::SeqCst);
            bail!("transient gateway failure");
        }
        let sequence = self.id_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("mem-{sequence}"))
    }

    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<MemorySearchHit>> {
        let hits = self.hits.lock().expect("hits lock");
        Ok(hits.iter().take(limit).cloned().collect())
    }

    async fn update(
        &self,
        memory_id: &str,
        content: &str,
        _metadata: &MemoryWriteMetadata,
    ) -> Result<()> {
        if self.fail_update {
            bail!("gateway update rejected");
        }
        self.update_calls
            .lock()
            .expect("update calls lock")
            .push((memory_id.to_string(), content.to_string()));
        Ok(())
    }

    async fn delete(&self, memory_id: &str) -> Result<()> {
        self.delete_calls
            .lock()
            .expect("delete calls lock")
            .push(memory_id.to_string());
        if self.fail_delete {
            bail!("gateway delete rejected");
        }
        Ok(())
    }
}

struct Harness {
    _tempdir: tempfile::TempDir,
    store: Arc<SqliteStore>,
    gateway: Arc<FakeGateway>,
    hub: Arc<FanoutHub>,
    service: Arc<KnowledgeService>,
    worker: Option<super::IndexWorker>,
}

fn harness_with(gateway: FakeGateway) -> Harness {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(SqliteStore::new(tempdir.path().join("relay.sqlite")).expect("store"));
    let gateway = Arc::new(gateway);
    let hub = Arc::new(FanoutHub::new());
    let (service, worker) = KnowledgeService::new(
        Arc::clone(&store),
        Arc::clone(&gateway) as Arc<dyn MemoryGateway>,
        Arc::clone(&hub),
        KnowledgeServiceConfig {
            index_queue_capacity: 8,
            index_retry_max_attempts: 3,
            index_retry_base_delay_ms: 1,
        },
    );
    Harness {
        _tempdir: tempdir,
        store,
        gateway,
        hub,
        service,
        worker: Some(worker),
    }
}

fn harness() -> Harness {
    harness_with(FakeGateway::default())
}

fn sample_promotion() -> PromoteKnowledge {
    PromoteKnowledge {
        question: "Do you open Sundays?".to_string(),
        answer: "No, closed Sundays.".to_string(),
        category: KnowledgeCategory::Hours,
        tags: vec!["hours".to_string()],
        source: KnowledgeSource::Learned,
        source_request_id: Some("req-1".to_string()),
    }
}

async fn wait_for_ref(
    store: &SqliteStore,
    entry_id: &str,
    predicate: impl Fn(&MemoryRef) -> bool,
) {
    for _ in 0..500 {
        let entry = store.get_knowledge_entry(entry_id).expect("get entry");
        if predicate(&entry.memory_ref) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("memory reference never reached expected state for {entry_id}");
}

#[tokio::test]
async fn promote_round_trip_resolves_memory_ref_in_background() {
    let mut harness = harness();
    tokio::spawn(harness.worker.take().expect("worker").run());

    let (subscriber_id, mut events_rx) = harness.hub.register();
    harness.hub.subscribe(subscriber_id, DEFAULT_EVENT_ROOM);

    let entry = harness.service.promote(sample_promotion()).expect("promote");
    assert_eq!(entry.source, KnowledgeSource::Learned);
    assert_eq!(entry.source_request_id.as_deref(), Some("req-1"));
    // Durable phase returns before the index write happens.
    assert_eq!(entry.memory_ref, MemoryRef::Pending);

    let frame = events_rx.recv().await.expect("kb_updated frame");
    assert!(frame.contains("\"kb_updated\""));
    assert!(frame.contains("\"added\""));

    wait_for_ref(&harness.store, &entry.id, |memory_ref| {
        memory_ref.memory_id().is_some()
    })
    .await;

    let indexed = harness.store.get_knowledge_entry(&entry.id).expect("get");
    assert_eq!(indexed.question, entry.question);
    assert_eq!(indexed.answer, entry.answer);
}

#[tokio::test]
async fn index_worker_retries_transient_failures() {
    let mut harness = harness_with(FakeGateway {
        fail_first_adds: AtomicUsize::new(2),
        ..FakeGateway::default()
    });
    tokio::spawn(harness.worker.take().expect("worker").run());

    let entry = harness.service.promote(sample_promotion()).expect("promote");
    wait_for_ref(&harness.store, &entry.id, |memory_ref| {
        memory_ref.memory_id().is_some()
    })
    .await;

    assert_eq!(harness.gateway.add_calls.lock().expect("calls").len(), 3);
}

#[tokio::test]
async fn index_worker_marks_permanent_failures() {
    let mut harness = harness_with(FakeGateway {
        fail_adds_always: true,
        ..FakeGateway::default()
    });
    tokio::spawn(harness.worker.take().expect("worker").run());

    let entry = harness.service.promote(sample_promotion()).expect("promote");
    wait_for_ref(&harness.store, &entry.id, |memory_ref| {
        matches!(memory_ref, MemoryRef::Failed)
    })
    .await;

    // Entry stays usable on exact-lookup paths.
    let listed = harness
        .service
        .list(&KnowledgeListFilter::default())
        .expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(harness.gateway.add_calls.lock().expect("calls").len(), 3);
}

#[tokio::test]
async fn add_synced_stores_resolved_reference() {
    let harness = harness();
    let entry = harness
        .service
        .add_synced(sample_promotion())
        .await
        .expect("add");
    assert_eq!(entry.memory_ref.memory_id(), Some("mem-1"));
}

#[tokio::test]
async fn add_synced_gateway_failure_leaves_no_durable_row() {
    let harness = harness_with(FakeGateway {
        fail_adds_always: true,
        ..FakeGateway::default()
    });
    let result = harness.service.add_synced(sample_promotion()).await;
    assert!(matches!(result, Err(KnowledgeError::External(_))));
    assert!(harness
        .service
        .list(&KnowledgeListFilter::default())
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn add_synced_validates_required_fields() {
    let harness = harness();
    let result = harness
        .service
        .add_synced(PromoteKnowledge {
            answer: "  ".to_string(),
            ..sample_promotion()
        })
        .await;
    assert!(matches!(result, Err(KnowledgeError::Validation(_))));
}

#[tokio::test]
async fn update_with_answer_change_syncs_gateway_first() {
    let harness = harness();
    let entry = harness
        .service
        .add_synced(sample_promotion())
        .await
        .expect("add");

    let updated = harness
        .service
        .update(
            &entry.id,
            KnowledgeUpdate {
                answer: Some("Open Sundays from June.".to_string()),
                ..KnowledgeUpdate::default()
            },
        )
        .await
        .expect("update");
    assert_eq!(updated.answer, "Open Sundays from June.");

    let update_calls = harness.gateway.update_calls.lock().expect("calls");
    assert_eq!(update_calls.len(), 1);
    assert_eq!(update_calls[0].0, "mem-1");
    assert_eq!(
        update_calls[0].1,
        "Question: Do you open Sundays?\nAnswer: Open Sundays from June."
    );
}

#[tokio::test]
async fn update_gateway_failure_propagates_and_keeps_durable_state() {
    let harness = harness_with(FakeGateway {
        fail_update: true,
        ..FakeGateway::default()
    });
    let entry = harness
        .service
        .add_synced(sample_promotion())
        .await
        .expect("add");

    let result = harness
        .service
        .update(
            &entry.id,
            KnowledgeUpdate {
                answer: Some("New answer".to_string()),
                ..KnowledgeUpdate::default()
            },
        )
        .await;
    assert!(matches!(result, Err(KnowledgeError::External(_))));

    let current = harness.service.get(&entry.id).expect("get");
    assert_eq!(current.answer, "No, closed Sundays.");
}

#[tokio::test]
async fn update_without_answer_change_skips_gateway() {
    let harness = harness_with(FakeGateway {
        fail_update: true,
        ..FakeGateway::default()
    });
    let entry = harness
        .service
        .add_synced(sample_promotion())
        .await
        .expect("add");

    let updated = harness
        .service
        .update(
            &entry.id,
            KnowledgeUpdate {
                category: Some(KnowledgeCategory::Booking),
                ..KnowledgeUpdate::default()
            },
        )
        .await
        .expect("update");
    assert_eq!(updated.category, KnowledgeCategory::Booking);
}

#[tokio::test]
async fn update_unknown_entry_is_not_found() {
    let harness = harness();
    let result = harness
        .service
        .update("kb-missing", KnowledgeUpdate::default())
        .await;
    assert!(matches!(result, Err(KnowledgeError::NotFound(_))));
}

#[tokio::test]
async fn delete_is_soft_and_tolerates_gateway_failure() {
    let harness = harness_with(FakeGateway {
        fail_delete: true,
        ..FakeGateway::default()
    });
    let entry = harness
        .service
        .add_synced(sample_promotion())
        .await
        .expect("add");

    harness.service.delete(&entry.id).await.expect("delete");
    assert!(harness
        .service
        .list(&KnowledgeListFilter::default())
        .expect("list")
        .is_empty());
    assert_eq!(
        harness.gateway.delete_calls.lock().expect("calls").as_slice(),
        ["mem-1".to_string()]
    );

    // Row survives for provenance, flagged inactive.
    let raw = harness.store.get_knowledge_entry(&entry.id).expect("get");
    assert!(!raw.is_active);

    // The index delete failed, so the gateway still returns the hit; the
    // search façade must drop it against the durable soft-delete flag.
    *harness.gateway.hits.lock().expect("hits") =
        vec![hit("mem-1", "Do you open Sundays?", "No, closed Sundays.", 0.9)];
    let matches = harness.service.search("sundays", 5).await.expect("search");
    assert!(matches.is_empty());
}

fn hit(memory_id: &str, question: &str, answer: &str, score: f64) -> MemorySearchHit {
    MemorySearchHit {
        memory_id: memory_id.to_string(),
        content: format!("Question: {question}\nAnswer: {answer}"),
        score,
        metadata: MemoryHitMetadata {
            question: Some(question.to_string()),
            category: Some("hours".to_string()),
            source: Some("learned".to_string()),
            tags: Vec::new(),
        },
    }
}

#[tokio::test]
async fn search_preserves_gateway_ordering() {
    let harness = harness();
    *harness.gateway.hits.lock().expect("hits") = vec![
        hit("mem-a", "Q1", "A1", 0.95),
        hit("mem-b", "Q2", "A2", 0.60),
    ];

    let matches = harness.service.search("hours", 5).await.expect("search");
    assert_eq!(matches.len(), 2);
    assert_eq!(matches[0].memory_id, "mem-a");
    assert_eq!(matches[0].answer, "A1");
    assert_eq!(matches[1].memory_id, "mem-b");
    assert!(matches[0].relevance_score > matches[1].relevance_score);
}

#[tokio::test]
async fn check_question_tracks_usage_through_cross_reference() {
    let harness = harness();
    let entry = harness
        .service
        .add_synced(sample_promotion())
        .await
        .expect("add");

    *harness.gateway.hits.lock().expect("hits") = vec![
        hit("mem-1", "Do you open Sundays?", "No, closed Sundays.", 0.9),
        hit("mem-x", "Q2", "A2", 0.5),
        hit("mem-y", "Q3", "A3", 0.4),
        hit("mem-z", "Q4", "A4", 0.3),
    ];

    let outcome = harness
        .service
        .check_question("sunday hours")
        .await
        .expect("check");
    match outcome {
        CheckKnowledgeOutcome::Found {
            answer,
            confidence,
            kb_entry_id,
            alternatives,
        } => {
            assert_eq!(answer, "No, closed Sundays.");
            assert_eq!(kb_entry_id, entry.id);
            assert!((confidence - 0.9).abs() < f64::EPSILON);
            assert_eq!(alternatives.len(), 2);
            assert_eq!(alternatives[0].answer, "A2");
        }
        CheckKnowledgeOutcome::Miss => panic!("expected a hit"),
    }

    let tracked = harness.service.get(&entry.id).expect("get");
    assert_eq!(tracked.usage_count, 1);
}

#[tokio::test]
async fn check_question_without_hits_suggests_escalation() {
    let harness = harness();
    let outcome = harness
        .service
        .check_question("unknown topic")
        .await
        .expect("check");
    assert_eq!(outcome, CheckKnowledgeOutcome::Miss);
}

#[tokio::test]
async fn check_question_skips_tracking_for_unreferenced_hits() {
    let harness = harness();
    *harness.gateway.hits.lock().expect("hits") =
        vec![hit("mem-unknown", "Q", "A", 0.8)];

    let outcome = harness.service.check_question("q").await.expect("check");
    match outcome {
        CheckKnowledgeOutcome::Found { kb_entry_id, .. } => {
            assert_eq!(kb_entry_id, "mem-unknown");
        }
        CheckKnowledgeOutcome::Miss => panic!("expected a hit"),
    }
}

#[tokio::test]
async fn seeding_is_idempotent() {
    let mut harness = harness();
    tokio::spawn(harness.worker.take().expect("worker").run());

    let first = harness.service.seed_initial().expect("seed");
    assert_eq!(first, 5);
    let second = harness.service.seed_initial().expect("seed");
    assert_eq!(second, 0);

    let listed = harness
        .service
        .list(&KnowledgeListFilter {
            source: Some(KnowledgeSource::Initial),
            ..KnowledgeListFilter::default()
        })
        .expect("list");
    assert_eq!(listed.len(), 5);
}

#[test]
fn answer_extraction_handles_composed_and_raw_content() {
    assert_eq!(
        answer_from_content("Question: Q?\nAnswer: The answer."),
        "The answer."
    );
    assert_eq!(answer_from_content("free-form memory"), "free-form memory");
}
