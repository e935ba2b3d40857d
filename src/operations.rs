//! Operation model: typed nodes of a composed region query.
//!
//! A composite query is a DAG of immutable nodes. Composite nodes hold
//! `Arc` references to their children, so shared sub-queries are shared
//! by reference and never copied. Every node exposes a structural key
//! derived from its shape and its children's keys; the key is what the
//! cache layer deduplicates on, so it must be identical for two
//! independently built trees describing the same logical query.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors produced while reconstructing nodes from engine metadata.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown metadata type tag '{tag}' for query {id}")]
    UnknownTypeTag { tag: String, id: QueryId },

    #[error("metadata for query {id} is missing argument '{field}'")]
    MissingArgument { id: QueryId, field: &'static str },

    #[error("malformed metadata record: {0}")]
    MalformedMetadata(String),

    #[error("operation '{key}' has not been materialized by the engine")]
    NotMaterialized { key: String },
}

/// Opaque query handle assigned by the remote engine.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(String);

impl QueryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueryId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifier plus display name, as listed by the engine's `list_*` calls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdName {
    pub id: QueryId,
    pub name: String,
}

/// `IdName` with the experiment cardinality reported by
/// `collection_experiments_count`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdNameCount {
    pub id: QueryId,
    pub name: String,
    pub count: u64,
}

/// Flat description of a previously materialized query, as returned by
/// the engine's `info` call. Argument values may themselves be query
/// identifiers of other metadata records.
#[derive(Clone, Debug)]
pub struct FullMetadata {
    pub id: QueryId,
    pub type_tag: String,
    pub name: Option<String>,
    pub values: serde_json::Map<String, Value>,
}

impl FullMetadata {
    /// Decode a metadata record from the raw `info` payload object.
    pub fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let object = value
            .as_object()
            .ok_or_else(|| DecodeError::MalformedMetadata(format!("not an object: {value}")))?;
        let id = object
            .get("_id")
            .or_else(|| object.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| DecodeError::MalformedMetadata("missing id".into()))?;
        let type_tag = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| DecodeError::MalformedMetadata(format!("missing type for {id}")))?;
        let name = object
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        Ok(Self {
            id: QueryId::new(id),
            type_tag: type_tag.to_string(),
            name,
            values: object.clone(),
        })
    }

    /// Look up an entry of the record's argument mapping.
    pub fn arg(&self, key: &str) -> Option<&Value> {
        self.values.get("args").and_then(|args| args.get(key))
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.arg(key).and_then(Value::as_str)
    }

    /// Argument that is itself a query identifier.
    pub fn arg_id(&self, key: &'static str) -> Result<QueryId, DecodeError> {
        self.arg(key)
            .and_then(Value::as_str)
            .map(QueryId::from)
            .ok_or(DecodeError::MissingArgument {
                id: self.id.clone(),
                field: key,
            })
    }

    /// Numeric argument; the engine serializes some numbers as strings.
    pub fn arg_i64(&self, key: &'static str) -> Result<i64, DecodeError> {
        let value = self.arg(key).ok_or(DecodeError::MissingArgument {
            id: self.id.clone(),
            field: key,
        })?;
        value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            .ok_or(DecodeError::MissingArgument {
                id: self.id.clone(),
                field: key,
            })
    }

    pub fn args(&self) -> Value {
        self.values.get("args").cloned().unwrap_or(Value::Null)
    }
}

/// Flatten a JSON value into the deterministic string used by structural
/// keys. Objects contribute their values in key order; null and booleans
/// contribute nothing, matching how metadata argument maps are keyed.
pub fn textify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items.iter().map(textify).collect(),
        Value::Object(map) => map.values().map(textify).collect(),
        Value::Null | Value::Bool(_) => String::new(),
    }
}

/// Dataset selection by metadata facets instead of by name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSelection {
    pub genome: Option<String>,
    pub data_type: Option<String>,
    pub epigenetic_mark: Option<String>,
    pub biosource: Option<String>,
    pub sample: Option<String>,
    pub technique: Option<String>,
    pub project: Option<String>,
}

impl MetadataSelection {
    fn fields(&self) -> [(&'static str, &Option<String>); 7] {
        [
            ("genome", &self.genome),
            ("type", &self.data_type),
            ("epigenetic_mark", &self.epigenetic_mark),
            ("biosource", &self.biosource),
            ("sample", &self.sample),
            ("technique", &self.technique),
            ("project", &self.project),
        ]
    }

    pub fn key(&self) -> String {
        self.fields()
            .iter()
            .filter_map(|(_, v)| v.as_deref())
            .collect()
    }

    /// Parameter mapping for the gateway's argument builder.
    pub fn as_params(&self) -> HashMap<String, String> {
        self.fields()
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), v.clone())))
            .collect()
    }
}

/// Leaf payload of a `Select` node: the entity the selection names.
#[derive(Clone, Debug, PartialEq)]
pub enum DataParam {
    /// Entity referenced by name only.
    Named(String),
    /// Entity with a resolved identifier.
    Entity(IdName),
    /// Several entities selected together.
    Names(Vec<String>),
    /// Free-form argument mapping recovered from metadata.
    Args(Value),
    /// Selection by metadata facets.
    Selection(MetadataSelection),
}

impl DataParam {
    pub fn key(&self) -> String {
        match self {
            DataParam::Named(name) => name.clone(),
            DataParam::Entity(id_name) => format!("{}_{}", id_name.id, id_name.name),
            DataParam::Names(names) => names.join(","),
            DataParam::Args(args) => textify(args),
            DataParam::Selection(selection) => selection.key(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            DataParam::Named(name) => name.clone(),
            DataParam::Entity(id_name) => id_name.name.clone(),
            DataParam::Names(names) => names.join(","),
            DataParam::Args(args) => textify(args),
            DataParam::Selection(selection) => {
                format!("Metadata parameters: {}", selection.key())
            }
        }
    }
}

/// Column predicate of a `Filter` node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterPredicate {
    Column {
        field: String,
        operation: String,
        value: String,
        #[serde(rename = "type")]
        kind: String,
    },
    Motif {
        motif: String,
    },
}

impl FilterPredicate {
    pub fn column(field: &str, operation: &str, value: &str, kind: &str) -> Self {
        FilterPredicate::Column {
            field: field.to_string(),
            operation: operation.to_string(),
            value: value.to_string(),
            kind: kind.to_string(),
        }
    }

    pub fn motif(motif: &str) -> Self {
        FilterPredicate::Motif {
            motif: motif.to_string(),
        }
    }

    pub fn key(&self) -> String {
        match self {
            FilterPredicate::Column {
                field,
                operation,
                value,
                kind,
            } => format!("{field}{operation}{value}{kind}"),
            FilterPredicate::Motif { motif } => format!("motif{motif}"),
        }
    }

    pub fn text(&self) -> String {
        match self {
            FilterPredicate::Column {
                field,
                operation,
                value,
                ..
            } => format!("{field} {operation} {value}"),
            FilterPredicate::Motif { motif } => format!("motif {motif}"),
        }
    }

    /// The remote procedure this predicate routes through.
    pub fn command(&self) -> &'static str {
        match self {
            FilterPredicate::Column { .. } => "regions_filter",
            FilterPredicate::Motif { .. } => "filter_by_motif",
        }
    }

    pub fn as_params(&self) -> HashMap<String, String> {
        match self {
            FilterPredicate::Column {
                field,
                operation,
                value,
                kind,
            } => HashMap::from([
                ("field".to_string(), field.clone()),
                ("operation".to_string(), operation.clone()),
                ("value".to_string(), value.clone()),
                ("type".to_string(), kind.clone()),
            ]),
            FilterPredicate::Motif { motif } => {
                HashMap::from([("motif".to_string(), motif.clone())])
            }
        }
    }
}

/// A node of a composed query.
///
/// Nodes are immutable; [`OperationNode::with_query_id`] returns a new
/// node sharing the same children by reference. The engine-assigned
/// query identifier is absent until the node has been submitted and
/// never participates in the structural key.
#[derive(Clone, Debug)]
pub enum OperationNode {
    Select {
        data: DataParam,
        command: String,
        query_id: Option<QueryId>,
    },
    Tiling {
        size: u64,
        genome: String,
        chromosomes: Vec<String>,
        query_id: Option<QueryId>,
    },
    Intersection {
        subject: Arc<OperationNode>,
        filter: Arc<OperationNode>,
        query_id: Option<QueryId>,
    },
    Filter {
        source: Arc<OperationNode>,
        predicate: FilterPredicate,
        query_id: Option<QueryId>,
    },
    Aggregate {
        data: Arc<OperationNode>,
        ranges: Arc<OperationNode>,
        field: String,
        query_id: Option<QueryId>,
    },
    Flank {
        source: Arc<OperationNode>,
        start: i64,
        length: i64,
        query_id: Option<QueryId>,
    },
    Extend {
        source: Arc<OperationNode>,
        length: u64,
        direction: String,
        query_id: Option<QueryId>,
    },
}

impl OperationNode {
    pub fn select(command: &str, data: DataParam) -> Self {
        OperationNode::Select {
            data,
            command: command.to_string(),
            query_id: None,
        }
    }

    pub fn tiling(genome: &str, size: u64, chromosomes: Vec<String>) -> Self {
        OperationNode::Tiling {
            size,
            genome: genome.to_string(),
            chromosomes,
            query_id: None,
        }
    }

    pub fn intersection(subject: Arc<OperationNode>, filter: Arc<OperationNode>) -> Self {
        OperationNode::Intersection {
            subject,
            filter,
            query_id: None,
        }
    }

    pub fn filter(source: Arc<OperationNode>, predicate: FilterPredicate) -> Self {
        OperationNode::Filter {
            source,
            predicate,
            query_id: None,
        }
    }

    pub fn aggregate(data: Arc<OperationNode>, ranges: Arc<OperationNode>, field: &str) -> Self {
        OperationNode::Aggregate {
            data,
            ranges,
            field: field.to_string(),
            query_id: None,
        }
    }

    pub fn flank(source: Arc<OperationNode>, start: i64, length: i64) -> Self {
        OperationNode::Flank {
            source,
            start,
            length,
            query_id: None,
        }
    }

    pub fn extend(source: Arc<OperationNode>, length: u64, direction: &str) -> Self {
        OperationNode::Extend {
            source,
            length,
            direction: direction.to_string(),
            query_id: None,
        }
    }

    /// The remote procedure that materializes this node.
    pub fn command(&self) -> &str {
        match self {
            OperationNode::Select { command, .. } => command,
            OperationNode::Tiling { .. } => "tiling",
            OperationNode::Intersection { .. } => "intersection",
            OperationNode::Filter { predicate, .. } => predicate.command(),
            OperationNode::Aggregate { .. } => "aggregate",
            OperationNode::Flank { .. } => "flank",
            OperationNode::Extend { .. } => "extend",
        }
    }

    /// Structural key: deterministic for identical shapes, different for
    /// any differing child or parameter.
    pub fn key(&self) -> String {
        match self {
            OperationNode::Select { data, command, .. } => {
                format!("{}_{}", command, data.key())
            }
            OperationNode::Tiling {
                size,
                genome,
                chromosomes,
                ..
            } => format!("tiling_{}_{}_{}", genome, size, chromosomes.join(",")),
            OperationNode::Intersection {
                subject, filter, ..
            } => format!("intersect_{}_{}", subject.key(), filter.key()),
            OperationNode::Filter {
                source, predicate, ..
            } => format!("filter_{}_{}", source.key(), predicate.key()),
            OperationNode::Aggregate {
                data,
                ranges,
                field,
                ..
            } => format!("aggregate_{}_{}_{}", data.key(), ranges.key(), field),
            OperationNode::Flank {
                source,
                start,
                length,
                ..
            } => format!("flank_{}_{}_{}", source.key(), start, length),
            OperationNode::Extend {
                source,
                length,
                direction,
                ..
            } => format!("extend_{}_{}_{}", source.key(), length, direction),
        }
    }

    /// Human-readable description, built recursively from children.
    pub fn text(&self) -> String {
        match self {
            OperationNode::Select { data, command, .. } => {
                format!("{} {}", command, data.name())
            }
            OperationNode::Tiling { size, .. } => format!("Tiling regions of {size}bp"),
            OperationNode::Intersection {
                subject, filter, ..
            } => format!("{} overlapping {}", subject.text(), filter.text()),
            OperationNode::Filter {
                source, predicate, ..
            } => format!("{} ({})", source.text(), predicate.text()),
            OperationNode::Aggregate {
                data,
                ranges,
                field,
                ..
            } => format!("{} aggregated by {} over {}", data.text(), field, ranges.text()),
            OperationNode::Flank {
                source,
                start,
                length,
                ..
            } => format!("{} flanked by {}:{}", source.text(), start, length),
            OperationNode::Extend {
                source,
                length,
                direction,
                ..
            } => format!("{} extended by {} {}", source.text(), length, direction),
        }
    }

    pub fn name(&self) -> String {
        self.text()
    }

    /// The node's own identifying sub-part. For composite nodes this is
    /// the subject side, not the filter side, so chained intersections
    /// compose left-associatively by subject.
    pub fn data(&self) -> DataParam {
        match self {
            OperationNode::Select { data, .. } => data.clone(),
            OperationNode::Tiling { size, query_id, .. } => DataParam::Entity(IdName {
                id: query_id.clone().unwrap_or_else(|| QueryId::new(self.key())),
                name: format!("Tiling regions of {size}bp"),
            }),
            OperationNode::Intersection { subject, .. } => subject.data(),
            OperationNode::Filter { source, .. } => source.data(),
            OperationNode::Aggregate { data, .. } => data.data(),
            OperationNode::Flank { source, .. } => source.data(),
            OperationNode::Extend { source, .. } => source.data(),
        }
    }

    /// Engine-assigned identifier, if the node has been submitted.
    pub fn query_id(&self) -> Option<&QueryId> {
        match self {
            OperationNode::Select { query_id, .. }
            | OperationNode::Tiling { query_id, .. }
            | OperationNode::Intersection { query_id, .. }
            | OperationNode::Filter { query_id, .. }
            | OperationNode::Aggregate { query_id, .. }
            | OperationNode::Flank { query_id, .. }
            | OperationNode::Extend { query_id, .. } => query_id.as_ref(),
        }
    }

    /// Identifier required for building remote parameters.
    pub fn materialized_id(&self) -> Result<&QueryId, DecodeError> {
        self.query_id().ok_or_else(|| DecodeError::NotMaterialized {
            key: self.key(),
        })
    }

    /// New node carrying the engine-assigned identifier; children are
    /// shared with `self` by reference.
    pub fn with_query_id(&self, query_id: QueryId) -> Self {
        let mut node = self.clone();
        match &mut node {
            OperationNode::Select { query_id: id, .. }
            | OperationNode::Tiling { query_id: id, .. }
            | OperationNode::Intersection { query_id: id, .. }
            | OperationNode::Filter { query_id: id, .. }
            | OperationNode::Aggregate { query_id: id, .. }
            | OperationNode::Flank { query_id: id, .. }
            | OperationNode::Extend { query_id: id, .. } => *id = Some(query_id),
        }
        node
    }

    /// Display name of the filter side, for overlap reporting.
    pub fn filter_name(&self) -> Option<String> {
        match self {
            OperationNode::Intersection { filter, .. } => Some(filter.data().name()),
            OperationNode::Filter { .. } => Some("filter_regions".to_string()),
            _ => None,
        }
    }

    /// Query identifier of the filter side, for overlap reporting.
    pub fn filter_query(&self) -> Option<QueryId> {
        match self {
            OperationNode::Intersection { filter, .. } => filter.query_id().cloned(),
            OperationNode::Filter { predicate, .. } => Some(QueryId::new(predicate.key())),
            _ => None,
        }
    }
}

/// A submitted operation bound to the engine's request handle.
#[derive(Clone, Debug)]
pub struct EngineRequest {
    pub operation: OperationNode,
    pub request_id: String,
    pub command: String,
}

impl EngineRequest {
    pub fn key(&self) -> String {
        self.request_id.clone()
    }
}

/// Payload of a completed request, or the engine's error marker.
#[derive(Clone, Debug)]
pub enum ResultValue {
    Data(Value),
    Error(String),
}

/// A request bound to its eventual payload.
#[derive(Clone, Debug)]
pub struct EngineResult {
    pub request: EngineRequest,
    pub value: ResultValue,
}

impl EngineResult {
    pub fn completed(request: EngineRequest, payload: Value) -> Self {
        Self {
            request,
            value: ResultValue::Data(payload),
        }
    }

    pub fn failed(request: EngineRequest, message: String) -> Self {
        Self {
            request,
            value: ResultValue::Error(message),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.value, ResultValue::Error(_))
    }

    pub fn error(&self) -> Option<&str> {
        match &self.value {
            ResultValue::Error(message) => Some(message),
            ResultValue::Data(_) => None,
        }
    }

    fn payload(&self) -> Option<&Value> {
        match &self.value {
            ResultValue::Data(payload) => Some(payload),
            ResultValue::Error(_) => None,
        }
    }

    pub fn as_count(&self) -> Option<u64> {
        self.payload()?.get("count")?.as_u64()
    }

    /// Distinct-value histogram from `distinct_column_values`.
    pub fn as_distinct(&self) -> Option<&serde_json::Map<String, Value>> {
        self.payload()?.get("distinct")?.as_object()
    }

    pub fn as_tuples(&self) -> Option<&Vec<Value>> {
        self.payload()?.as_array()
    }

    /// Row list of an enrichment result.
    pub fn as_enrichment(&self) -> Option<&Vec<Value>> {
        self.payload()?
            .get("enrichment")?
            .get("results")?
            .as_array()
    }

    pub fn data_name(&self) -> String {
        self.request.operation.data().name()
    }

    pub fn data_query(&self) -> Option<QueryId> {
        self.request.operation.query_id().cloned()
    }

    pub fn filter_name(&self) -> Option<String> {
        self.request.operation.filter_name()
    }

    pub fn filter_query(&self) -> Option<QueryId> {
        self.request.operation.filter_query()
    }
}
