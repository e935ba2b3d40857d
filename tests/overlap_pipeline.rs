//! End-to-end overlap pipeline runs against the in-memory engine.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use epiquery::config::EngineConfig;
use epiquery::manager::Manager;
use epiquery::operations::OperationNode;
use epiquery::status::RequestStatus;
use epiquery::transport::{EngineTransport, MockEngine};

async fn connect() -> (Arc<MockEngine>, Manager) {
    let engine = Arc::new(MockEngine::new());
    let transport: Arc<dyn EngineTransport> = engine.clone();
    let config = EngineConfig {
        poll_min_ms: 1,
        poll_max_ms: 2,
        ..EngineConfig::default()
    };
    let manager = Manager::connect(transport, &config).await.unwrap();
    (engine, manager)
}

async fn finished(manager: &Manager, id: Uuid) -> RequestStatus {
    let status = manager.request(&id).expect("registered request");
    for _ in 0..400 {
        if status.is_finished() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("pipeline did not finish");
}

async fn select_queries(manager: &Manager, names: &[&str]) -> Vec<OperationNode> {
    let status = RequestStatus::new();
    let mut queries = Vec::with_capacity(names.len());
    for name in names {
        queries.push(
            manager
                .service()
                .select_experiment(name, &status)
                .await
                .unwrap(),
        );
    }
    queries
}

#[tokio::test]
async fn counts_every_query_against_every_experiment() {
    let (engine, manager) = connect().await;
    engine.set_polls_until_ready(1).await;
    engine.stage_result("count_regions", json!({"count": 7})).await;

    let queries = select_queries(&manager, &["Q1", "Q2"]).await;
    let experiments = vec!["E1".to_string(), "E2".to_string(), "E3".to_string()];

    let id = manager.start_count_overlaps(queries, experiments, vec![]);
    let status = finished(&manager, id).await;

    // 2 queries x 3 experiments x 3 steps.
    assert_eq!(status.total(), 18);
    assert_eq!(status.phase(), "Counting overlaps");

    let payload = status.snapshot();
    let records = payload.as_array().expect("overlap record list");
    assert_eq!(records.len(), 6);
    for record in records {
        assert_eq!(record["count"], 7);
        assert!(record["data_name"].is_string());
        assert!(record["error"].is_null());
    }

    assert_eq!(engine.calls_for("intersection").await, 6);
    assert_eq!(engine.calls_for("count_regions").await, 6);
    // 2 queries up front plus 3 experiments in the pipeline.
    assert_eq!(engine.calls_for("select_experiments").await, 5);
}

#[tokio::test]
async fn partial_records_appear_before_the_pipeline_finishes() {
    let (engine, manager) = connect().await;
    engine.stage_result("count_regions", json!({"count": 2})).await;

    let queries = select_queries(&manager, &["Q1"]).await;
    let id = manager.start_count_overlaps(queries, vec!["E1".to_string()], vec![]);

    let status = finished(&manager, id).await;
    let partials = status.partials();
    assert_eq!(partials.len(), 1);
    assert_eq!(partials[0]["count"], 2);
}

#[tokio::test]
async fn repeated_pipelines_reuse_cached_queries_and_results() {
    let (engine, manager) = connect().await;
    engine.stage_result("count_regions", json!({"count": 3})).await;

    let queries = select_queries(&manager, &["Q1"]).await;
    let experiments = vec!["E1".to_string(), "E2".to_string()];

    let first = manager.start_count_overlaps(queries.clone(), experiments.clone(), vec![]);
    let first_status = finished(&manager, first).await;

    let second = manager.start_count_overlaps(queries, experiments, vec![]);
    let second_status = finished(&manager, second).await;

    // The second run is answered entirely from the caches.
    assert_eq!(engine.calls_for("select_experiments").await, 3);
    assert_eq!(engine.calls_for("intersection").await, 2);
    assert_eq!(engine.calls_for("count_regions").await, 2);

    // Both runs still account their own work: 2 selects, 2
    // intersections, and 2 counts at two steps each, cached or not.
    assert_eq!(first_status.total(), 6);
    assert_eq!(second_status.total(), 6);
    assert_eq!(first_status.processed(), 8);
    assert_eq!(second_status.processed(), 8);

    let payload = second_status.snapshot();
    assert_eq!(payload.as_array().expect("records").len(), 2);
}

#[tokio::test]
async fn filtered_pipelines_intersect_the_filtered_experiments() {
    let (engine, manager) = connect().await;
    engine.stage_result("count_regions", json!({"count": 1})).await;

    let queries = select_queries(&manager, &["Q1"]).await;
    let filters = vec![epiquery::operations::FilterPredicate::column(
        "NAME", "==", "promoter", "string",
    )];

    let id = manager.start_count_overlaps(queries, vec!["E1".to_string()], filters);
    let status = finished(&manager, id).await;

    assert_eq!(engine.calls_for("regions_filter").await, 1);
    assert_eq!(engine.calls_for("intersection").await, 1);

    let payload = status.snapshot();
    let records = payload.as_array().expect("records");
    assert_eq!(records.len(), 1);
    // The filter side of the overlap reports the underlying experiment.
    assert_eq!(records[0]["filter_name"], "E1");
}

#[tokio::test]
async fn gene_model_pipelines_report_one_batch_per_modifier() {
    let (engine, manager) = connect().await;
    engine.stage_result("count_regions", json!({"count": 9})).await;

    let queries = select_queries(&manager, &["Q1"]).await;
    let modifiers = vec![epiquery::pipeline::RegionModifier::Extend {
        length: 2000,
        direction: "BOTH".to_string(),
        use_strand: false,
    }];

    let id = manager.start_count_gene_overlaps(queries, "gencode v19".to_string(), modifiers);
    let status = finished(&manager, id).await;

    let payload = status.snapshot();
    let batches = payload.as_array().expect("batch list");
    assert_eq!(batches.len(), 2);
    for batch in batches {
        assert_eq!(batch.as_array().expect("batch").len(), 1);
    }
    assert_eq!(engine.calls_for("extend").await, 1);
}
