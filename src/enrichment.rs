//! Enrichment pipelines.
//!
//! Each pipeline fans one enrichment command across its inputs and folds
//! the row sets into the shared tracker as they arrive, so pollers watch
//! the ranked table grow instead of waiting for the final join.

use std::sync::Arc;

use futures::future::try_join_all;
use serde_json::Value;
use tracing::debug;

use crate::operations::{EngineResult, OperationNode, QueryId};
use crate::service::{QueryService, ServiceError};
use crate::stats::EnrichmentRecord;
use crate::status::RequestStatus;

/// Fold one result's enrichment rows into the tracker. Error-flavored
/// results and rows that do not decode contribute nothing.
fn merge_rows(status: &RequestStatus, result: &EngineResult) {
    let Some(rows) = result.as_enrichment() else {
        return;
    };
    let records: Vec<EnrichmentRecord> = rows
        .iter()
        .filter_map(|row| serde_json::from_value(row.clone()).ok())
        .collect();
    if !records.is_empty() {
        status.merge_enrichment(records);
    }
}

pub struct EnrichmentOrchestrator {
    service: Arc<QueryService>,
}

impl EnrichmentOrchestrator {
    pub fn new(service: Arc<QueryService>) -> Self {
        Self { service }
    }

    /// GO-term enrichment of each query against a gene model.
    pub async fn enrich_go_terms(
        &self,
        queries: &[OperationNode],
        gene_model: &str,
        status: &RequestStatus,
    ) -> Result<Vec<EngineResult>, ServiceError> {
        let total = queries.len() * queries.len() * 3;
        status.reset(total as u64);
        status.set_phase("Enriching GO terms");

        try_join_all(queries.iter().map(|query| async move {
            let result = self
                .service
                .enrich_regions_go_terms(query, gene_model, status)
                .await?;
            merge_rows(status, &result);
            Ok(result)
        }))
        .await
    }

    /// Overlap enrichment of each query against a universe and a dataset
    /// table.
    pub async fn enrich_overlap(
        &self,
        queries: &[OperationNode],
        genome: &str,
        universe: &QueryId,
        datasets: &Value,
        status: &RequestStatus,
    ) -> Result<Vec<EngineResult>, ServiceError> {
        let total = queries.len() * queries.len() * 3;
        status.reset(total as u64);
        status.set_phase("Enriching overlaps");

        try_join_all(queries.iter().map(|query| {
            self.service
                .enrich_regions_overlap(query, universe, datasets, genome, status)
        }))
        .await
    }

    /// Fast enrichment of one query, fanned across the wider of the
    /// genome's epigenetic-mark and biosource vocabularies.
    pub async fn enrich_fast(
        &self,
        query: &OperationNode,
        genome: &str,
        status: &RequestStatus,
    ) -> Result<Vec<EngineResult>, ServiceError> {
        let (marks, biosources) = futures::try_join!(
            self.service
                .collection_experiments_count("epigenetic_marks", "peaks", genome, status),
            self.service
                .collection_experiments_count("biosources", "peaks", genome, status)
        )?;

        let (facet, terms) = if marks.len() > biosources.len() {
            ("epigenetic_mark", marks)
        } else {
            ("biosource", biosources)
        };
        debug!(facet, terms = terms.len(), "Fast enrichment fan-out");

        status.reset(terms.len() as u64 * 2);
        status.set_phase("Enriching regions");

        try_join_all(terms.iter().map(|term| {
            let mut filter = serde_json::Map::new();
            filter.insert(facet.to_string(), Value::String(term.name.clone()));
            filter.insert(
                "technique".to_string(),
                Value::String("chip-seq".to_string()),
            );
            let filter = Value::Object(filter);

            async move {
                let result = self
                    .service
                    .enrich_regions_fast(query, genome, &filter, status)
                    .await?;
                merge_rows(status, &result);
                Ok(result)
            }
        }))
        .await
    }
}
