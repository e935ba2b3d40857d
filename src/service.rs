//! Query service: one cache-aware method per remote command.
//!
//! Every method takes the [`RequestStatus`] of the pipeline invocation it
//! serves and bumps it as work completes, whether the answer came from a
//! cache or from the engine. Query-constructing commands memoize by
//! structural key; region-processing commands memoize the submitted
//! request and its eventual result separately, so a repeated composite
//! query costs no second engine round trip.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use serde_json::Value;
use tracing::{error, warn};

use crate::cache::{DataCache, MultiKeyDataCache};
use crate::gateway::{Gateway, GatewayError};
use crate::operations::{
    textify, DataParam, DecodeError, EngineRequest, EngineResult, FilterPredicate, FullMetadata,
    IdName, IdNameCount, MetadataSelection, OperationNode, QueryId,
};
use crate::status::RequestStatus;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("engine rejected {command}: {message}")]
    Engine { command: String, message: String },
}

fn engine_error(command: &str, payload: &Value) -> ServiceError {
    let message = textify(payload);
    error!(command, %message, "Engine rejected command");
    ServiceError::Engine {
        command: command.to_string(),
        message,
    }
}

fn parse_id_names(payload: &Value) -> Vec<IdName> {
    payload
        .as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let fields = row.as_array()?;
                    Some(IdName {
                        id: QueryId::new(fields.first()?.as_str()?),
                        name: fields.get(1)?.as_str().unwrap_or_default().to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn row_count(row: &[Value]) -> u64 {
    let Some(value) = row.get(2) else { return 0 };
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .unwrap_or(0)
}

/// Cache-aware facade over the remote command set.
pub struct QueryService {
    gateway: Arc<Gateway>,
    metadata: DataCache<QueryId, FullMetadata>,
    queries: DataCache<String, OperationNode>,
    intersections: MultiKeyDataCache<String, OperationNode>,
    requests: DataCache<String, EngineRequest>,
    results: DataCache<String, EngineResult>,
}

impl QueryService {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            metadata: DataCache::new(),
            queries: DataCache::new(),
            intersections: MultiKeyDataCache::new(),
            requests: DataCache::new(),
            results: DataCache::new(),
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Submit a query-constructing command; an engine error fails the
    /// branch.
    async fn submit_query(
        &self,
        node: OperationNode,
        values: &HashMap<String, String>,
    ) -> Result<OperationNode, ServiceError> {
        let command = node.command().to_string();
        let reply = self.gateway.call(&command, values).await?;
        if reply.is_error() {
            return Err(engine_error(&command, &reply.payload));
        }
        Ok(node.with_query_id(QueryId::new(textify(&reply.payload))))
    }

    /// Submit through the structural-key cache.
    async fn materialize(
        &self,
        node: OperationNode,
        values: HashMap<String, String>,
        status: &RequestStatus,
    ) -> Result<OperationNode, ServiceError> {
        let key = node.key();
        if let Some(cached) = self.queries.get(&key) {
            status.increment();
            return Ok(cached);
        }

        let materialized = self.submit_query(node, &values).await?;
        self.queries.put(key, materialized.clone());
        status.increment();
        Ok(materialized)
    }

    pub async fn select_experiment(
        &self,
        experiment: &str,
        status: &RequestStatus,
    ) -> Result<OperationNode, ServiceError> {
        let node = OperationNode::select(
            "select_experiments",
            DataParam::Named(experiment.to_string()),
        );
        let values = HashMap::from([("experiment_name".to_string(), experiment.to_string())]);
        self.materialize(node, values, status).await
    }

    pub async fn select_genes(
        &self,
        gene_model: &str,
        status: &RequestStatus,
    ) -> Result<OperationNode, ServiceError> {
        let node = OperationNode::select("select_genes", DataParam::Named(gene_model.to_string()));
        let values = HashMap::from([("gene_model".to_string(), gene_model.to_string())]);
        self.materialize(node, values, status).await
    }

    pub async fn select_annotations(
        &self,
        annotation: &str,
        genome: &str,
        status: &RequestStatus,
    ) -> Result<OperationNode, ServiceError> {
        let node = OperationNode::select(
            "select_annotations",
            DataParam::Args(serde_json::json!({
                "annotation_name": annotation,
                "genome": genome,
            })),
        );
        let values = HashMap::from([
            ("annotation_name".to_string(), annotation.to_string()),
            ("genome".to_string(), genome.to_string()),
        ]);
        self.materialize(node, values, status).await
    }

    pub async fn select_regions_from_metadata(
        &self,
        selection: &MetadataSelection,
        status: &RequestStatus,
    ) -> Result<OperationNode, ServiceError> {
        let node = OperationNode::select("select_regions", DataParam::Selection(selection.clone()));
        self.materialize(node, selection.as_params(), status).await
    }

    pub async fn tiling(
        &self,
        genome: &str,
        size: u64,
        chromosomes: Vec<String>,
        status: &RequestStatus,
    ) -> Result<OperationNode, ServiceError> {
        let values = HashMap::from([
            ("genome".to_string(), genome.to_string()),
            ("size".to_string(), size.to_string()),
            ("chromosomes".to_string(), chromosomes.join(",")),
        ]);
        let node = OperationNode::tiling(genome, size, chromosomes);
        self.materialize(node, values, status).await
    }

    /// Intersection memoizes by the (subject, filter) key pair, so the
    /// same overlap built from independently constructed equal trees is
    /// submitted once.
    pub async fn intersection(
        &self,
        subject: &OperationNode,
        filter: &OperationNode,
        status: &RequestStatus,
    ) -> Result<OperationNode, ServiceError> {
        let keys = vec![subject.key(), filter.key()];
        if let Some(cached) = self.intersections.get(&keys) {
            status.increment();
            return Ok(cached);
        }

        let values = HashMap::from([
            (
                "query_data_id".to_string(),
                subject.materialized_id()?.to_string(),
            ),
            (
                "query_filter_id".to_string(),
                filter.materialized_id()?.to_string(),
            ),
        ]);
        let node =
            OperationNode::intersection(Arc::new(subject.clone()), Arc::new(filter.clone()));
        let materialized = self.submit_query(node, &values).await?;
        self.intersections.put(keys, materialized.clone());
        status.increment();
        Ok(materialized)
    }

    /// Column and motif predicates route through their respective
    /// commands; both produce a `Filter` node over `source`.
    pub async fn filter_regions(
        &self,
        source: &OperationNode,
        predicate: &FilterPredicate,
        status: &RequestStatus,
    ) -> Result<OperationNode, ServiceError> {
        let mut values = predicate.as_params();
        values.insert("query_id".to_string(), source.materialized_id()?.to_string());
        let node = OperationNode::filter(Arc::new(source.clone()), predicate.clone());
        self.materialize(node, values, status).await
    }

    pub async fn aggregate(
        &self,
        data: &OperationNode,
        ranges: &OperationNode,
        field: &str,
        status: &RequestStatus,
    ) -> Result<OperationNode, ServiceError> {
        let values = HashMap::from([
            ("data_id".to_string(), data.materialized_id()?.to_string()),
            ("ranges_id".to_string(), ranges.materialized_id()?.to_string()),
            ("column".to_string(), field.to_string()),
        ]);
        let node = OperationNode::aggregate(
            Arc::new(data.clone()),
            Arc::new(ranges.clone()),
            field,
        );
        self.materialize(node, values, status).await
    }

    pub async fn flank(
        &self,
        source: &OperationNode,
        start: i64,
        length: i64,
        use_strand: bool,
        status: &RequestStatus,
    ) -> Result<OperationNode, ServiceError> {
        let values = HashMap::from([
            ("query_id".to_string(), source.materialized_id()?.to_string()),
            ("start".to_string(), start.to_string()),
            ("length".to_string(), length.to_string()),
            ("use_strand".to_string(), use_strand.to_string()),
        ]);
        let node = OperationNode::flank(Arc::new(source.clone()), start, length);
        self.materialize(node, values, status).await
    }

    pub async fn extend(
        &self,
        source: &OperationNode,
        length: u64,
        direction: &str,
        use_strand: bool,
        status: &RequestStatus,
    ) -> Result<OperationNode, ServiceError> {
        let values = HashMap::from([
            ("query_id".to_string(), source.materialized_id()?.to_string()),
            ("length".to_string(), length.to_string()),
            ("direction".to_string(), direction.to_string()),
            ("use_strand".to_string(), use_strand.to_string()),
        ]);
        let node = OperationNode::extend(Arc::new(source.clone()), length, direction);
        self.materialize(node, values, status).await
    }

    /// Submit a region-processing command and resolve its result.
    ///
    /// An engine rejection of the submission resolves the branch with an
    /// error-flavored result instead of failing it, so sibling branches
    /// joined with this one still complete.
    async fn execute(
        &self,
        operation: &OperationNode,
        command: &str,
        mut values: HashMap<String, String>,
        status: &RequestStatus,
    ) -> Result<EngineResult, ServiceError> {
        // The same operation can back several submissions that differ
        // only in extra parameters (column, filter, gene model), so the
        // request key covers those too.
        let mut extras: Vec<String> = values.iter().map(|(k, v)| format!("{k}={v}")).collect();
        extras.sort();
        let request_key = format!("{command}_{}_{}", operation.key(), extras.join(","));
        if let Some(cached) = self.requests.get(&request_key) {
            status.increment();
            return self.get_result(&cached, status).await;
        }

        values.insert(
            "query_id".to_string(),
            operation.materialized_id()?.to_string(),
        );
        let reply = self.gateway.call(command, &values).await?;
        status.increment();

        if reply.is_error() {
            warn!(command, key = %request_key, "Submission rejected, branch resolves with error result");
            let request = EngineRequest {
                operation: operation.clone(),
                request_id: String::new(),
                command: command.to_string(),
            };
            return Ok(EngineResult::failed(request, textify(&reply.payload)));
        }

        let request = EngineRequest {
            operation: operation.clone(),
            request_id: textify(&reply.payload),
            command: command.to_string(),
        };
        self.requests.put(request_key, request.clone());
        self.get_result(&request, status).await
    }

    /// Resolve a submitted request, polling the engine until it
    /// completes. Results memoize by request identifier.
    pub async fn get_result(
        &self,
        request: &EngineRequest,
        status: &RequestStatus,
    ) -> Result<EngineResult, ServiceError> {
        let key = request.key();
        if let Some(cached) = self.results.get(&key) {
            status.increment();
            return Ok(cached);
        }

        let payload = self.gateway.fetch_result(&request.request_id).await?;
        let result = EngineResult::completed(request.clone(), payload);
        self.results.put(key, result.clone());
        status.increment();
        Ok(result)
    }

    pub async fn count_regions(
        &self,
        operation: &OperationNode,
        status: &RequestStatus,
    ) -> Result<EngineResult, ServiceError> {
        self.execute(operation, "count_regions", HashMap::new(), status)
            .await
    }

    pub async fn distinct_column_values(
        &self,
        operation: &OperationNode,
        column: &str,
        status: &RequestStatus,
    ) -> Result<EngineResult, ServiceError> {
        let values = HashMap::from([("column".to_string(), column.to_string())]);
        self.execute(operation, "distinct_column_values", values, status)
            .await
    }

    pub async fn calculate_enrichment(
        &self,
        operation: &OperationNode,
        gene_model: &str,
        status: &RequestStatus,
    ) -> Result<EngineResult, ServiceError> {
        let values = HashMap::from([("gene_model".to_string(), gene_model.to_string())]);
        self.execute(operation, "calculate_enrichment", values, status)
            .await
    }

    pub async fn enrich_regions_go_terms(
        &self,
        operation: &OperationNode,
        gene_model: &str,
        status: &RequestStatus,
    ) -> Result<EngineResult, ServiceError> {
        let values = HashMap::from([("gene_model".to_string(), gene_model.to_string())]);
        self.execute(operation, "enrich_regions_go_terms", values, status)
            .await
    }

    pub async fn enrich_regions_overlap(
        &self,
        operation: &OperationNode,
        universe: &QueryId,
        datasets: &Value,
        genome: &str,
        status: &RequestStatus,
    ) -> Result<EngineResult, ServiceError> {
        let values = HashMap::from([
            ("universe_query_id".to_string(), universe.to_string()),
            ("datasets".to_string(), datasets.to_string()),
            ("genome".to_string(), genome.to_string()),
        ]);
        self.execute(operation, "enrich_regions_overlap", values, status)
            .await
    }

    pub async fn enrich_regions_fast(
        &self,
        operation: &OperationNode,
        genome: &str,
        filter: &Value,
        status: &RequestStatus,
    ) -> Result<EngineResult, ServiceError> {
        let values = HashMap::from([
            ("genome".to_string(), genome.to_string()),
            ("filter".to_string(), filter.to_string()),
        ]);
        self.execute(operation, "enrich_regions_fast", values, status)
            .await
    }

    async fn list(
        &self,
        command: &str,
        values: HashMap<String, String>,
        status: &RequestStatus,
    ) -> Result<Vec<IdName>, ServiceError> {
        let reply = self.gateway.call(command, &values).await?;
        status.increment();
        if reply.is_error() {
            return Err(engine_error(command, &reply.payload));
        }
        Ok(parse_id_names(&reply.payload))
    }

    pub async fn list_experiments(
        &self,
        selection: &MetadataSelection,
        status: &RequestStatus,
    ) -> Result<Vec<IdName>, ServiceError> {
        self.list("list_experiments", selection.as_params(), status)
            .await
    }

    pub async fn list_gene_models(
        &self,
        status: &RequestStatus,
    ) -> Result<Vec<IdName>, ServiceError> {
        let mut models = self.list("list_gene_models", HashMap::new(), status).await?;
        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    pub async fn list_projects(
        &self,
        status: &RequestStatus,
    ) -> Result<Vec<IdName>, ServiceError> {
        self.list("list_projects", HashMap::new(), status).await
    }

    pub async fn name_to_id(
        &self,
        name: &str,
        collection: &str,
        status: &RequestStatus,
    ) -> Result<Vec<IdName>, ServiceError> {
        let values = HashMap::from([
            ("name".to_string(), name.to_string()),
            ("collection".to_string(), collection.to_string()),
        ]);
        self.list("name_to_id", values, status).await
    }

    /// Experiment counts per term of a controlled vocabulary, used to
    /// pick the wider facet for fast enrichment.
    pub async fn collection_experiments_count(
        &self,
        controlled_vocabulary: &str,
        kind: &str,
        genome: &str,
        status: &RequestStatus,
    ) -> Result<Vec<IdNameCount>, ServiceError> {
        let values = HashMap::from([
            (
                "controlled_vocabulary".to_string(),
                controlled_vocabulary.to_string(),
            ),
            ("type".to_string(), kind.to_string()),
            ("genome".to_string(), genome.to_string()),
        ]);
        let reply = self.gateway.call("collection_experiments_count", &values).await?;
        status.increment();
        if reply.is_error() {
            return Err(engine_error("collection_experiments_count", &reply.payload));
        }

        Ok(reply
            .payload
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        let fields = row.as_array()?;
                        Some(IdNameCount {
                            id: QueryId::new(fields.first()?.as_str()?),
                            name: fields.get(1)?.as_str().unwrap_or_default().to_string(),
                            count: row_count(fields),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Metadata of a materialized query, memoized by identifier.
    pub async fn info(
        &self,
        id: &QueryId,
        status: &RequestStatus,
    ) -> Result<FullMetadata, ServiceError> {
        if let Some(cached) = self.metadata.get(id) {
            status.increment();
            return Ok(cached);
        }

        let values = HashMap::from([("id".to_string(), id.to_string())]);
        let reply = self.gateway.call("info", &values).await?;
        status.increment();
        if reply.is_error() {
            return Err(engine_error("info", &reply.payload));
        }

        // The engine answers `info` with a one-element record list.
        let record = reply.payload.get(0).unwrap_or(&reply.payload);
        let metadata = FullMetadata::from_value(record)?;
        self.metadata.put(id.clone(), metadata.clone());
        Ok(metadata)
    }

    pub async fn infos(
        &self,
        ids: &[QueryId],
        status: &RequestStatus,
    ) -> Result<Vec<FullMetadata>, ServiceError> {
        try_join_all(ids.iter().map(|id| self.info(id, status))).await
    }

    /// Reconstruct the operation tree behind a query identifier by
    /// recursively fetching metadata and dispatching on its type tag.
    /// Unknown tags fail the reconstruction.
    pub fn load_query<'a>(
        &'a self,
        query_id: &'a QueryId,
        status: &'a RequestStatus,
    ) -> BoxFuture<'a, Result<OperationNode, ServiceError>> {
        async move {
            let meta = self.info(query_id, status).await?;
            let id = meta.id.clone();

            match meta.type_tag.as_str() {
                "genes_select" | "find_motif" | "input_regions" => {
                    let data = match &meta.name {
                        Some(name) => DataParam::Named(name.clone()),
                        None => DataParam::Args(meta.args()),
                    };
                    Ok(OperationNode::select(&meta.type_tag, data).with_query_id(id))
                }

                // Annotation and experiment selections re-resolve the
                // stored name into the entity's identifier.
                "annotation_select" => {
                    let annotation = meta
                        .arg_str("annotation")
                        .ok_or(DecodeError::MissingArgument {
                            id: id.clone(),
                            field: "annotation",
                        })?
                        .to_string();
                    let resolved = self.name_to_id(&annotation, "annotations", status).await?;
                    let data = resolved
                        .into_iter()
                        .next()
                        .map(DataParam::Entity)
                        .unwrap_or(DataParam::Named(annotation));
                    Ok(OperationNode::select("select_annotations", data).with_query_id(id))
                }

                "experiment_select" => {
                    let experiment = meta
                        .arg_str("experiment_name")
                        .ok_or(DecodeError::MissingArgument {
                            id: id.clone(),
                            field: "experiment_name",
                        })?
                        .to_string();
                    let resolved = self.name_to_id(&experiment, "experiments", status).await?;
                    let data = resolved
                        .into_iter()
                        .next()
                        .map(DataParam::Entity)
                        .unwrap_or(DataParam::Named(experiment));
                    Ok(OperationNode::select("select_experiments", data).with_query_id(id))
                }

                "filter" | "filter_by_motif" => {
                    let predicate = if meta.type_tag == "filter" {
                        FilterPredicate::column(
                            meta.arg_str("field").unwrap_or_default(),
                            meta.arg_str("operation").unwrap_or_default(),
                            meta.arg_str("value").unwrap_or_default(),
                            meta.arg_str("type").unwrap_or_default(),
                        )
                    } else {
                        FilterPredicate::motif(meta.arg_str("motif").unwrap_or_default())
                    };
                    let source_id = meta.arg_id("query")?;
                    let source = self.load_query(&source_id, status).await?;
                    Ok(OperationNode::filter(Arc::new(source), predicate).with_query_id(id))
                }

                "tiling" => {
                    let genome = meta.arg_str("genome").unwrap_or_default().to_string();
                    let size = meta.arg_i64("size")? as u64;
                    let chromosomes = meta
                        .arg("chromosomes")
                        .and_then(Value::as_array)
                        .map(|items| {
                            items
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default();
                    Ok(OperationNode::tiling(&genome, size, chromosomes).with_query_id(id))
                }

                "intersect" | "overlap" => {
                    let subject_id = meta.arg_id("qid_1")?;
                    let filter_id = meta.arg_id("qid_2")?;
                    let (subject, filter) = futures::try_join!(
                        self.load_query(&subject_id, status),
                        self.load_query(&filter_id, status)
                    )?;
                    Ok(
                        OperationNode::intersection(Arc::new(subject), Arc::new(filter))
                            .with_query_id(id),
                    )
                }

                "aggregate" => {
                    let data_id = meta.arg_id("data_id")?;
                    let ranges_id = meta.arg_id("ranges_id")?;
                    let field = meta.arg_str("field").unwrap_or_default().to_string();
                    let (data, ranges) = futures::try_join!(
                        self.load_query(&data_id, status),
                        self.load_query(&ranges_id, status)
                    )?;
                    Ok(
                        OperationNode::aggregate(Arc::new(data), Arc::new(ranges), &field)
                            .with_query_id(id),
                    )
                }

                "flank" => {
                    let source_id = meta.arg_id("query_id")?;
                    let start = meta.arg_i64("start")?;
                    let length = meta.arg_i64("length")?;
                    let source = self.load_query(&source_id, status).await?;
                    Ok(OperationNode::flank(Arc::new(source), start, length).with_query_id(id))
                }

                "extend" => {
                    let source_id = meta.arg_id("query_id")?;
                    let length = meta.arg_i64("length")? as u64;
                    let direction = meta.arg_str("direction").unwrap_or_default().to_string();
                    let source = self.load_query(&source_id, status).await?;
                    Ok(OperationNode::extend(Arc::new(source), length, &direction)
                        .with_query_id(id))
                }

                tag => {
                    error!(%id, tag, "Unknown metadata type tag");
                    Err(DecodeError::UnknownTypeTag {
                        tag: tag.to_string(),
                        id: id.clone(),
                    }
                    .into())
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::config::EngineConfig;
    use crate::transport::{EngineTransport, MockEngine, RpcReply};

    async fn service() -> (Arc<MockEngine>, QueryService) {
        let engine = Arc::new(MockEngine::new());
        let transport: Arc<dyn EngineTransport> = engine.clone();
        let config = EngineConfig {
            poll_min_ms: 1,
            poll_max_ms: 2,
            ..EngineConfig::default()
        };
        let gateway = Gateway::connect(transport, &config).await.unwrap();
        (engine, QueryService::new(Arc::new(gateway)))
    }

    #[tokio::test]
    async fn repeated_select_is_submitted_once() {
        let (engine, service) = service().await;
        let status = RequestStatus::new();

        let first = service.select_experiment("E1", &status).await.unwrap();
        let second = service.select_experiment("E1", &status).await.unwrap();

        assert_eq!(first.query_id(), second.query_id());
        assert_eq!(engine.calls_for("select_experiments").await, 1);
        // Both calls counted as completed work.
        assert_eq!(status.processed(), 2);
    }

    #[tokio::test]
    async fn intersections_memoize_by_key_pair() {
        let (engine, service) = service().await;
        let status = RequestStatus::new();

        let subject = service.select_experiment("E1", &status).await.unwrap();
        let filter = service.select_experiment("E2", &status).await.unwrap();

        let a = service.intersection(&subject, &filter, &status).await.unwrap();
        let b = service.intersection(&subject, &filter, &status).await.unwrap();

        assert_eq!(a.query_id(), b.query_id());
        assert_eq!(engine.calls_for("intersection").await, 1);

        // Swapped operands are a different query.
        service.intersection(&filter, &subject, &status).await.unwrap();
        assert_eq!(engine.calls_for("intersection").await, 2);
    }

    #[tokio::test]
    async fn count_regions_polls_out_the_result() {
        let (engine, service) = service().await;
        engine.set_polls_until_ready(1).await;
        engine.stage_result("count_regions", json!({"count": 12})).await;
        let status = RequestStatus::new();

        let op = service.select_experiment("E1", &status).await.unwrap();
        let result = service.count_regions(&op, &status).await.unwrap();

        assert_eq!(result.as_count(), Some(12));
        assert!(!result.is_error());
        assert_eq!(engine.calls_for("count_regions").await, 1);

        // Second count reuses the cached request and result.
        let again = service.count_regions(&op, &status).await.unwrap();
        assert_eq!(again.as_count(), Some(12));
        assert_eq!(engine.calls_for("count_regions").await, 1);
        assert_eq!(engine.calls_for("get_request_data").await, 2);
    }

    #[tokio::test]
    async fn rejected_submission_resolves_with_error_result() {
        let (engine, service) = service().await;
        let status = RequestStatus::new();

        let op = service.select_experiment("E1", &status).await.unwrap();
        engine
            .push_reply("count_regions", RpcReply::error("invalid query".to_string()))
            .await;

        let result = service.count_regions(&op, &status).await.unwrap();
        assert!(result.is_error());
        assert_eq!(result.error(), Some("invalid query"));
    }

    #[tokio::test]
    async fn rejected_select_fails_the_branch() {
        let (engine, service) = service().await;
        let status = RequestStatus::new();

        engine
            .push_reply(
                "select_experiments",
                RpcReply::error("no such experiment".to_string()),
            )
            .await;

        let err = service.select_experiment("missing", &status).await.unwrap_err();
        assert!(matches!(err, ServiceError::Engine { .. }));
    }

    #[tokio::test]
    async fn info_memoizes_metadata() {
        let (engine, service) = service().await;
        let status = RequestStatus::new();

        engine
            .push_reply(
                "info",
                RpcReply::okay(json!([{
                    "_id": "q9",
                    "type": "tiling",
                    "name": "",
                    "args": {"genome": "hg19", "size": 1000}
                }])),
            )
            .await;

        let id = QueryId::new("q9");
        let first = service.info(&id, &status).await.unwrap();
        let second = service.info(&id, &status).await.unwrap();

        assert_eq!(first.type_tag, "tiling");
        assert_eq!(second.arg_i64("size").unwrap(), 1000);
        assert_eq!(engine.calls_for("info").await, 1);
    }

    #[tokio::test]
    async fn load_query_reconstructs_a_filter_chain() {
        let (engine, service) = service().await;
        let status = RequestStatus::new();

        engine
            .push_reply(
                "info",
                RpcReply::okay(json!([{
                    "_id": "q1",
                    "type": "filter",
                    "name": "",
                    "args": {
                        "field": "NAME",
                        "operation": "==",
                        "value": "promoter",
                        "type": "string",
                        "query": "q2"
                    }
                }])),
            )
            .await;
        engine
            .push_reply(
                "info",
                RpcReply::okay(json!([{
                    "_id": "q2",
                    "type": "genes_select",
                    "name": "gencode v19",
                    "args": {}
                }])),
            )
            .await;

        let node = service
            .load_query(&QueryId::new("q1"), &status)
            .await
            .unwrap();

        assert_eq!(node.query_id(), Some(&QueryId::new("q1")));
        match &node {
            OperationNode::Filter {
                source, predicate, ..
            } => {
                assert_eq!(source.query_id(), Some(&QueryId::new("q2")));
                assert_eq!(predicate.command(), "regions_filter");
                assert_eq!(source.data().name(), "gencode v19");
            }
            other => panic!("expected a filter node, got {other:?}"),
        }
        assert_eq!(engine.calls_for("info").await, 2);
    }

    #[tokio::test]
    async fn load_query_resolves_experiment_names() {
        let (engine, service) = service().await;
        let status = RequestStatus::new();

        engine
            .push_reply(
                "info",
                RpcReply::okay(json!([{
                    "_id": "q3",
                    "type": "experiment_select",
                    "name": "",
                    "args": {"experiment_name": "E1"}
                }])),
            )
            .await;
        engine
            .push_reply("name_to_id", RpcReply::okay(json!([["e100", "E1"]])))
            .await;

        let node = service
            .load_query(&QueryId::new("q3"), &status)
            .await
            .unwrap();

        match &node {
            OperationNode::Select { data, command, .. } => {
                assert_eq!(command, "select_experiments");
                assert_eq!(
                    data,
                    &DataParam::Entity(IdName {
                        id: QueryId::new("e100"),
                        name: "E1".to_string(),
                    })
                );
            }
            other => panic!("expected a select node, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn load_query_rejects_unknown_type_tags() {
        let (engine, service) = service().await;
        let status = RequestStatus::new();

        engine
            .push_reply(
                "info",
                RpcReply::okay(json!([{"_id": "q4", "type": "mystery", "args": {}}])),
            )
            .await;

        let err = service
            .load_query(&QueryId::new("q4"), &status)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Decode(DecodeError::UnknownTypeTag { .. })
        ));
    }

    #[tokio::test]
    async fn collection_counts_parse_mixed_count_shapes() {
        let (engine, service) = service().await;
        let status = RequestStatus::new();

        engine
            .push_reply(
                "collection_experiments_count",
                RpcReply::okay(json!([
                    ["em1", "H3K4me3", 120],
                    ["em2", "H3K27ac", "45"],
                ])),
            )
            .await;

        let counts = service
            .collection_experiments_count("epigenetic_marks", "peaks", "hg19", &status)
            .await
            .unwrap();

        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].count, 120);
        assert_eq!(counts[1].count, 45);
    }
}
