use async_trait::async_trait;
use chrono::NaiveDate;
use finnews_aggregator::{
    AggregationStore, AggregatorError, ArticleFeed, CompletenessTracker, Component,
    CompletionStatus, MemoryComponentStore, MockExtractionProducer, PipelineConfig,
    PipelineOrchestrator, SessionStatus, SourceArticle, StaticFeed,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn temp_data_dir() -> PathBuf {
    std::env::temp_dir().join(format!("finnews-pipeline-test-{}", Uuid::new_v4()))
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
}

fn article(guid: &str, text: &str) -> SourceArticle {
    SourceArticle {
        title: format!("Headline {}", guid),
        category: "markets".to_string(),
        description: String::new(),
        full_text: text.to_string(),
        url: format!("https://news.example.com/{}", guid),
        guid: guid.to_string(),
        pub_date: "2024-01-01T08:00:00Z".to_string(),
    }
}

fn fast_config(batch_size: usize) -> PipelineConfig {
    PipelineConfig {
        batch_size,
        article_delay: Duration::ZERO,
        batch_delay: Duration::ZERO,
    }
}

fn orchestrator(
    articles: Vec<SourceArticle>,
    producer: MockExtractionProducer,
    component_store: Arc<MemoryComponentStore>,
    batch_size: usize,
) -> (Arc<PipelineOrchestrator>, Arc<AggregationStore>) {
    let store = Arc::new(AggregationStore::new(temp_data_dir()).unwrap());
    let orchestrator = PipelineOrchestrator::new(
        Arc::new(StaticFeed::new("test-feed", articles)),
        Arc::new(producer),
        Arc::new(CompletenessTracker::new(component_store)),
        Arc::clone(&store),
        fast_config(batch_size),
    );
    (Arc::new(orchestrator), store)
}

#[tokio::test]
async fn missing_content_fails_only_that_article() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    let articles = vec![
        article("a1", "VCB profit surge 10%"),
        article("a2", "FPT growth continues"),
        article("a3", ""),
        article("a4", "HPG steel output gain"),
        article("a5", "BID loss widens"),
    ];
    let (orchestrator, store) = orchestrator(
        articles,
        MockExtractionProducer::new("test"),
        Arc::new(MemoryComponentStore::new()),
        10,
    );

    let result = orchestrator.process_backlog(day()).await.unwrap();

    assert_eq!(result.processed, 5);
    assert_eq!(result.succeeded, 4);
    assert_eq!(result.failed, 1);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("a3"));

    let aggregate = store.load(day()).await.unwrap().unwrap();
    assert_eq!(aggregate.metadata.total_articles, 4);
    assert!(!aggregate.lookup_table.contains_key("a3"));

    let session = orchestrator.session(result.session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.successful_extractions, 4);
    assert_eq!(session.failed_extractions, 1);
}

#[tokio::test]
async fn failed_batch_does_not_abort_later_batches() {
    let articles = vec![
        article("b1", "VCB gain"),
        article("b2", "FPT gain"),
        article("b3", "HPG gain"),
        article("b4", "BID gain"),
        article("b5", "CTG gain"),
        article("b6", "MSN gain"),
    ];
    // Batch 2 (b3, b4) fails wholesale; batches 1 and 3 succeed.
    let (orchestrator, store) = orchestrator(
        articles,
        MockExtractionProducer::new("test").with_batch_poison("b3"),
        Arc::new(MemoryComponentStore::new()),
        2,
    );

    let result = orchestrator.process_backlog(day()).await.unwrap();

    assert_eq!(result.processed, 6);
    assert_eq!(result.succeeded, 4);
    assert_eq!(result.failed, 2);
    assert!(result.errors.iter().any(|e| e.contains("Batch 2")));

    let aggregate = store.load(day()).await.unwrap().unwrap();
    assert_eq!(aggregate.metadata.total_articles, 4);
    for guid in ["b1", "b2", "b5", "b6"] {
        assert!(aggregate.lookup_table.contains_key(guid));
    }
    for guid in ["b3", "b4"] {
        assert!(!aggregate.lookup_table.contains_key(guid));
    }

    let session = orchestrator.session(result.session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.completed_batches, 3);
}

#[tokio::test]
async fn individual_extraction_failures_are_isolated() {
    let articles = vec![
        article("c1", "VCB gain"),
        article("c2", "FPT gain"),
        article("c3", "HPG gain"),
    ];
    let (orchestrator, _store) = orchestrator(
        articles,
        MockExtractionProducer::new("test").with_failing_guids(vec!["c2".to_string()]),
        Arc::new(MemoryComponentStore::new()),
        10,
    );

    let result = orchestrator.process_backlog(day()).await.unwrap();
    assert_eq!(result.succeeded, 2);
    assert_eq!(result.failed, 1);
    assert!(result.errors.iter().any(|e| e.contains("c2")));
}

#[tokio::test]
async fn processed_articles_are_skipped_on_rerun() {
    let articles = vec![
        article("d1", "VCB gain"),
        article("d2", "FPT gain"),
        article("d3", "HPG gain"),
    ];
    let (orchestrator, store) = orchestrator(
        articles,
        MockExtractionProducer::new("test"),
        Arc::new(MemoryComponentStore::new()),
        10,
    );

    let first = orchestrator.process_backlog(day()).await.unwrap();
    assert_eq!(first.succeeded, 3);
    assert_eq!(first.already_processed, 0);

    let second = orchestrator.process_backlog(day()).await.unwrap();
    assert_eq!(second.total_candidates, 3);
    assert_eq!(second.already_processed, 3);
    assert_eq!(second.processed, 0);
    assert_eq!(second.succeeded, 0);

    // No duplicate entries landed in the aggregate.
    let aggregate = store.load(day()).await.unwrap().unwrap();
    assert_eq!(aggregate.metadata.total_articles, 3);
}

#[tokio::test]
async fn partially_saved_articles_still_count_as_processed() {
    let articles = vec![article("e1", "VCB gain"), article("e2", "FPT gain")];
    let component_store =
        Arc::new(MemoryComponentStore::new().with_failing_components([Component::Market]));
    let tracker = CompletenessTracker::new(component_store.clone());

    let (orchestrator, _store) = orchestrator(
        articles,
        MockExtractionProducer::new("test"),
        component_store,
        10,
    );

    let first = orchestrator.process_backlog(day()).await.unwrap();
    // The aggregate append succeeded, so articles count as succeeded even
    // though one component could not be persisted.
    assert_eq!(first.succeeded, 2);
    assert!(first.errors.iter().any(|e| e.contains("market")));

    let check = tracker.check_completeness("e1").await.unwrap();
    assert_eq!(check.completion_status, Some(CompletionStatus::Partial));
    assert_eq!(check.missing_components, vec![Component::Market]);

    // Partial records keep the guid out of the next backlog run.
    let second = orchestrator.process_backlog(day()).await.unwrap();
    assert_eq!(second.already_processed, 2);
    assert_eq!(second.processed, 0);
}

struct FailingFeed;

#[async_trait]
impl ArticleFeed for FailingFeed {
    fn source_name(&self) -> String {
        "failing-feed".to_string()
    }

    async fn articles_for(&self, _date: NaiveDate) -> finnews_aggregator::Result<Vec<SourceArticle>> {
        Err(AggregatorError::General("upstream source unavailable".to_string()))
    }
}

#[tokio::test]
async fn feed_failure_is_session_fatal() {
    let store = Arc::new(AggregationStore::new(temp_data_dir()).unwrap());
    let orchestrator = PipelineOrchestrator::new(
        Arc::new(FailingFeed),
        Arc::new(MockExtractionProducer::new("test")),
        Arc::new(CompletenessTracker::new(Arc::new(MemoryComponentStore::new()))),
        store,
        fast_config(10),
    );

    assert!(orchestrator.process_backlog(day()).await.is_err());

    let sessions = orchestrator.list_sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Failed);
    assert!(sessions[0].errors.iter().any(|e| e.contains("upstream")));
}

#[tokio::test]
async fn spawned_backlog_completes_in_background() {
    let articles = vec![article("f1", "VCB gain"), article("f2", "FPT gain")];
    let (orchestrator, store) = orchestrator(
        articles,
        MockExtractionProducer::new("test"),
        Arc::new(MemoryComponentStore::new()),
        10,
    );

    let session_id = orchestrator.spawn_backlog(day()).await;

    let mut status = SessionStatus::Created;
    for _ in 0..100 {
        if let Some(session) = orchestrator.session(session_id).await {
            status = session.status;
            if status == SessionStatus::Completed || status == SessionStatus::Failed {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(status, SessionStatus::Completed);
    let aggregate = store.load(day()).await.unwrap().unwrap();
    assert_eq!(aggregate.metadata.total_articles, 2);
}
