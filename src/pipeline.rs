//! Composite overlap pipelines.
//!
//! A pipeline is a sequence of fan-out stages joined by barriers: a stage
//! never starts before every branch of the previous stage has resolved.
//! Branches report progress through the shared [`RequestStatus`] and
//! append partial overlap records as counts arrive, so pollers see
//! results accumulate before the pipeline finishes.

use std::sync::Arc;

use futures::future::try_join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::operations::{EngineResult, FilterPredicate, OperationNode};
use crate::service::{QueryService, ServiceError};
use crate::status::RequestStatus;

/// Gene-region modifier applied before intersecting in the gene-overlap
/// pipeline. The identity modifier is always run in addition to these.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RegionModifier {
    Flank {
        start: i64,
        length: i64,
        #[serde(default)]
        use_strand: bool,
    },
    Extend {
        length: u64,
        direction: String,
        #[serde(default)]
        use_strand: bool,
    },
}

/// Flatten one count result into the overlap record reported to pollers.
pub fn overlap_record(result: &EngineResult) -> Value {
    json!({
        "data_name": result.data_name(),
        "data_query": result.data_query(),
        "filter_name": result.filter_name(),
        "filter_query": result.filter_query(),
        "count": result.as_count(),
        "error": result.error(),
    })
}

pub struct PipelineOrchestrator {
    service: Arc<QueryService>,
}

impl PipelineOrchestrator {
    pub fn new(service: Arc<QueryService>) -> Self {
        Self { service }
    }

    /// Select every named experiment concurrently.
    pub async fn select_experiments_batch(
        &self,
        experiments: &[String],
        status: &RequestStatus,
    ) -> Result<Vec<OperationNode>, ServiceError> {
        try_join_all(
            experiments
                .iter()
                .map(|name| self.service.select_experiment(name, status)),
        )
        .await
    }

    /// Apply filters sequentially: each predicate is fanned across all
    /// current operands, and the next predicate works on the filtered
    /// set.
    pub async fn apply_filters(
        &self,
        operations: Vec<OperationNode>,
        filters: &[FilterPredicate],
        status: &RequestStatus,
    ) -> Result<Vec<OperationNode>, ServiceError> {
        let mut current = operations;
        for predicate in filters {
            current = try_join_all(
                current
                    .iter()
                    .map(|op| self.service.filter_regions(op, predicate, status)),
            )
            .await?;
        }
        Ok(current)
    }

    /// Cross product of intersections, query-major order.
    pub async fn intersect_with(
        &self,
        queries: &[OperationNode],
        experiments: &[OperationNode],
        status: &RequestStatus,
    ) -> Result<Vec<OperationNode>, ServiceError> {
        try_join_all(queries.iter().flat_map(|query| {
            experiments
                .iter()
                .map(|experiment| self.service.intersection(query, experiment, status))
        }))
        .await
    }

    /// Count each operation; every completion appends its overlap record
    /// to the tracker before the branch resolves.
    pub async fn count_regions_batch(
        &self,
        operations: &[OperationNode],
        status: &RequestStatus,
    ) -> Result<Vec<EngineResult>, ServiceError> {
        try_join_all(operations.iter().map(|operation| async move {
            let result = self.service.count_regions(operation, status).await?;
            status.add_partial(overlap_record(&result));
            Ok(result)
        }))
        .await
    }

    /// Count the overlaps of each query against each named experiment,
    /// optionally filtered.
    pub async fn count_overlaps(
        &self,
        queries: &[OperationNode],
        experiment_names: &[String],
        filters: &[FilterPredicate],
        status: &RequestStatus,
    ) -> Result<Vec<EngineResult>, ServiceError> {
        let total = queries.len() * experiment_names.len() * 3;
        status.reset(total as u64);
        debug!(
            queries = queries.len(),
            experiments = experiment_names.len(),
            filters = filters.len(),
            "Starting overlap pipeline"
        );

        status.set_phase("Selecting experiments regions");
        let selected = self
            .select_experiments_batch(experiment_names, status)
            .await?;

        status.set_phase("Applying filters");
        let filtered = self.apply_filters(selected, filters, status).await?;

        status.set_phase("Intersecting regions");
        let overlaps = self.intersect_with(queries, &filtered, status).await?;

        status.set_phase("Counting overlaps");
        self.count_regions_batch(&overlaps, status).await
    }

    /// Count the overlaps of each query against a gene model's regions,
    /// once unmodified and once per region modifier.
    pub async fn count_gene_overlaps(
        &self,
        queries: &[OperationNode],
        gene_model: &str,
        modifiers: &[RegionModifier],
        status: &RequestStatus,
    ) -> Result<Vec<Vec<EngineResult>>, ServiceError> {
        let total = queries.len() * queries.len() * 3;
        status.reset(total as u64);

        status.set_phase("Selecting genes regions");
        let genes = self.service.select_genes(gene_model, status).await?;

        let mut runs = vec![None];
        runs.extend(modifiers.iter().cloned().map(Some));

        let batches = runs.into_iter().map(|modifier| {
            let genes = genes.clone();
            async move {
                let modified = match &modifier {
                    None => genes,
                    Some(RegionModifier::Flank {
                        start,
                        length,
                        use_strand,
                    }) => {
                        self.service
                            .flank(&genes, *start, *length, *use_strand, status)
                            .await?
                    }
                    Some(RegionModifier::Extend {
                        length,
                        direction,
                        use_strand,
                    }) => {
                        self.service
                            .extend(&genes, *length, direction, *use_strand, status)
                            .await?
                    }
                };
                let overlaps = self
                    .intersect_with(queries, std::slice::from_ref(&modified), status)
                    .await?;
                self.count_regions_batch(&overlaps, status).await
            }
        });

        try_join_all(batches).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::config::EngineConfig;
    use crate::gateway::Gateway;
    use crate::transport::{EngineTransport, MockEngine};

    async fn orchestrator() -> (Arc<MockEngine>, PipelineOrchestrator) {
        let engine = Arc::new(MockEngine::new());
        let transport: Arc<dyn EngineTransport> = engine.clone();
        let config = EngineConfig {
            poll_min_ms: 1,
            poll_max_ms: 2,
            ..EngineConfig::default()
        };
        let gateway = Gateway::connect(transport, &config).await.unwrap();
        let service = Arc::new(QueryService::new(Arc::new(gateway)));
        (engine, PipelineOrchestrator::new(service))
    }

    #[tokio::test]
    async fn no_filters_leaves_operands_untouched() {
        let (engine, pipeline) = orchestrator().await;
        let status = RequestStatus::new();

        let ops = pipeline
            .select_experiments_batch(&["E1".to_string()], &status)
            .await
            .unwrap();
        let filtered = pipeline.apply_filters(ops.clone(), &[], &status).await.unwrap();

        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].key(), ops[0].key());
        assert_eq!(engine.calls_for("regions_filter").await, 0);
    }

    #[tokio::test]
    async fn filters_chain_sequentially() {
        let (engine, pipeline) = orchestrator().await;
        let status = RequestStatus::new();

        let ops = pipeline
            .select_experiments_batch(&["E1".to_string(), "E2".to_string()], &status)
            .await
            .unwrap();
        let filters = vec![
            FilterPredicate::column("NAME", "==", "promoter", "string"),
            FilterPredicate::column("SCORE", ">", "5", "number"),
        ];
        let filtered = pipeline.apply_filters(ops, &filters, &status).await.unwrap();

        assert_eq!(filtered.len(), 2);
        // 2 operands x 2 predicates.
        assert_eq!(engine.calls_for("regions_filter").await, 4);
        for op in &filtered {
            assert!(matches!(op, OperationNode::Filter { .. }));
        }
    }

    #[tokio::test]
    async fn intersect_with_builds_the_cross_product() {
        let (engine, pipeline) = orchestrator().await;
        let status = RequestStatus::new();

        let queries = pipeline
            .select_experiments_batch(&["Q1".to_string(), "Q2".to_string()], &status)
            .await
            .unwrap();
        let experiments = pipeline
            .select_experiments_batch(
                &["E1".to_string(), "E2".to_string(), "E3".to_string()],
                &status,
            )
            .await
            .unwrap();

        let overlaps = pipeline
            .intersect_with(&queries, &experiments, &status)
            .await
            .unwrap();

        assert_eq!(overlaps.len(), 6);
        assert_eq!(engine.calls_for("intersection").await, 6);
    }

    #[tokio::test]
    async fn gene_overlaps_run_identity_plus_modifiers() {
        let (engine, pipeline) = orchestrator().await;
        engine.stage_result("count_regions", json!({"count": 1})).await;
        let status = RequestStatus::new();

        let queries = pipeline
            .select_experiments_batch(&["Q1".to_string()], &status)
            .await
            .unwrap();
        let modifiers = vec![RegionModifier::Flank {
            start: -2500,
            length: 2000,
            use_strand: true,
        }];

        let batches = pipeline
            .count_gene_overlaps(&queries, "gencode v19", &modifiers, &status)
            .await
            .unwrap();

        // One batch for the unmodified genes, one for the flank.
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(engine.calls_for("select_genes").await, 1);
        assert_eq!(engine.calls_for("flank").await, 1);
        assert_eq!(engine.calls_for("intersection").await, 2);
    }

    #[test]
    fn modifiers_decode_by_tag() {
        let flank: RegionModifier =
            serde_json::from_value(json!({"type": "flank", "start": -100, "length": 50}))
                .unwrap();
        assert!(matches!(flank, RegionModifier::Flank { start: -100, .. }));

        let extend: RegionModifier = serde_json::from_value(
            json!({"type": "extend", "length": 2000, "direction": "BOTH"}),
        )
        .unwrap();
        assert!(matches!(extend, RegionModifier::Extend { .. }));
    }
}
