//! Application context: one connected gateway, the query service with
//! its caches, the orchestrators, and the registry of live requests.
//!
//! Entry points register a fresh tracker, spawn the pipeline on the
//! runtime, and return the tracker's handle immediately; the surrounding
//! HTTP layer polls [`Manager::request`] for progress and the terminal
//! payload.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::enrichment::EnrichmentOrchestrator;
use crate::gateway::{Gateway, GatewayError};
use crate::operations::{EngineResult, FilterPredicate, OperationNode, QueryId};
use crate::pipeline::{overlap_record, PipelineOrchestrator, RegionModifier};
use crate::service::QueryService;
use crate::status::{RequestStatus, StatusRegistry};
use crate::transport::EngineTransport;

fn enrichment_payload(status: &RequestStatus) -> Value {
    json!({
        "results": status.enrichment_records(),
        "summary": status.enrichment_summary(),
    })
}

fn failure_payload(error: &dyn std::fmt::Display) -> Value {
    json!({ "error": error.to_string() })
}

pub struct Manager {
    service: Arc<QueryService>,
    pipeline: Arc<PipelineOrchestrator>,
    enrichment: Arc<EnrichmentOrchestrator>,
    registry: StatusRegistry,
}

impl Manager {
    /// Connect to the engine and build the full context.
    pub async fn connect(
        transport: Arc<dyn EngineTransport>,
        config: &EngineConfig,
    ) -> Result<Self, GatewayError> {
        let gateway = Arc::new(Gateway::connect(transport, config).await?);
        let service = Arc::new(QueryService::new(gateway));
        info!("Query manager connected");
        Ok(Self {
            pipeline: Arc::new(PipelineOrchestrator::new(service.clone())),
            enrichment: Arc::new(EnrichmentOrchestrator::new(service.clone())),
            service,
            registry: StatusRegistry::new(),
        })
    }

    pub fn service(&self) -> &Arc<QueryService> {
        &self.service
    }

    /// Tracker of a running or finished request.
    pub fn request(&self, id: &Uuid) -> Option<RequestStatus> {
        self.registry.get(id)
    }

    /// Stop every outstanding result poll at its next tick.
    pub fn cancel(&self) {
        self.service.gateway().cancel_polls();
    }

    fn start(&self, run: impl FnOnce(RequestStatus) -> tokio::task::JoinHandle<()>) -> Uuid {
        let status = RequestStatus::new();
        let id = self.registry.register(status.clone());
        let _detached = run(status);
        id
    }

    /// Count overlaps of each query against each named experiment.
    pub fn start_count_overlaps(
        &self,
        queries: Vec<OperationNode>,
        experiments: Vec<String>,
        filters: Vec<FilterPredicate>,
    ) -> Uuid {
        let pipeline = Arc::clone(&self.pipeline);
        self.start(move |status| {
            tokio::spawn(async move {
                match pipeline
                    .count_overlaps(&queries, &experiments, &filters, &status)
                    .await
                {
                    Ok(results) => status.finish(overlap_records(&results)),
                    Err(e) => {
                        error!(error = %e, "Overlap pipeline failed");
                        status.finish(failure_payload(&e));
                    }
                }
            })
        })
    }

    /// Count overlaps of each query against a gene model's regions.
    pub fn start_count_gene_overlaps(
        &self,
        queries: Vec<OperationNode>,
        gene_model: String,
        modifiers: Vec<RegionModifier>,
    ) -> Uuid {
        let pipeline = Arc::clone(&self.pipeline);
        self.start(move |status| {
            tokio::spawn(async move {
                match pipeline
                    .count_gene_overlaps(&queries, &gene_model, &modifiers, &status)
                    .await
                {
                    Ok(batches) => {
                        let records: Vec<Value> =
                            batches.iter().map(|batch| overlap_records(batch)).collect();
                        status.finish(json!(records));
                    }
                    Err(e) => {
                        error!(error = %e, "Gene overlap pipeline failed");
                        status.finish(failure_payload(&e));
                    }
                }
            })
        })
    }

    pub fn start_enrich_go_terms(
        &self,
        queries: Vec<OperationNode>,
        gene_model: String,
    ) -> Uuid {
        let enrichment = Arc::clone(&self.enrichment);
        self.start(move |status| {
            tokio::spawn(async move {
                match enrichment
                    .enrich_go_terms(&queries, &gene_model, &status)
                    .await
                {
                    Ok(_) => status.finish(enrichment_payload(&status)),
                    Err(e) => {
                        error!(error = %e, "GO term enrichment failed");
                        status.finish(failure_payload(&e));
                    }
                }
            })
        })
    }

    pub fn start_enrich_overlap(
        &self,
        queries: Vec<OperationNode>,
        genome: String,
        universe: QueryId,
        datasets: Value,
    ) -> Uuid {
        let enrichment = Arc::clone(&self.enrichment);
        self.start(move |status| {
            tokio::spawn(async move {
                match enrichment
                    .enrich_overlap(&queries, &genome, &universe, &datasets, &status)
                    .await
                {
                    Ok(results) => {
                        let records: Vec<Value> = results
                            .iter()
                            .map(|result| match result.error() {
                                Some(message) => json!({ "error": message }),
                                None => json!({ "enrichment": result.as_enrichment() }),
                            })
                            .collect();
                        status.finish(json!(records));
                    }
                    Err(e) => {
                        error!(error = %e, "Overlap enrichment failed");
                        status.finish(failure_payload(&e));
                    }
                }
            })
        })
    }

    pub fn start_enrich_fast(&self, query: OperationNode, genome: String) -> Uuid {
        let enrichment = Arc::clone(&self.enrichment);
        self.start(move |status| {
            tokio::spawn(async move {
                match enrichment.enrich_fast(&query, &genome, &status).await {
                    Ok(_) => status.finish(enrichment_payload(&status)),
                    Err(e) => {
                        error!(error = %e, "Fast enrichment failed");
                        status.finish(failure_payload(&e));
                    }
                }
            })
        })
    }
}

fn overlap_records(results: &[EngineResult]) -> Value {
    json!(results.iter().map(overlap_record).collect::<Vec<Value>>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::transport::MockEngine;

    async fn manager() -> (Arc<MockEngine>, Manager) {
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
        for _ in 0..200 {
            if status.is_finished() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("request did not finish");
    }

    #[tokio::test]
    async fn started_pipelines_report_through_the_registry() {
        let (engine, manager) = manager().await;
        engine.stage_result("count_regions", json!({"count": 4})).await;
        let status = RequestStatus::new();

        let query = manager
            .service()
            .select_experiment("Q1", &status)
            .await
            .unwrap();

        let id = manager.start_count_overlaps(
            vec![query],
            vec!["E1".to_string(), "E2".to_string()],
            vec![],
        );

        let status = finished(&manager, id).await;
        let payload = status.snapshot();
        let records = payload.as_array().expect("record list");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["count"], 4);
        assert_eq!(status.total(), 6);
    }

    #[tokio::test]
    async fn unknown_request_ids_answer_none() {
        let (_engine, manager) = manager().await;
        assert!(manager.request(&Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn failed_pipelines_finish_with_the_error() {
        let (engine, manager) = manager().await;
        engine
            .push_reply(
                "select_experiments",
                crate::transport::RpcReply::error("backend down".to_string()),
            )
            .await;

        let id = manager.start_count_overlaps(vec![], vec!["E1".to_string()], vec![]);

        let status = finished(&manager, id).await;
        let payload = status.snapshot();
        assert!(payload["error"]
            .as_str()
            .expect("error message")
            .contains("backend down"));
    }
}
