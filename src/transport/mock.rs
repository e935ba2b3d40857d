//! Mock engine transport for testing.
//!
//! Serves the standard command schema table, materializes fresh query
//! identifiers for selection/composition commands, and turns
//! region-processing commands into requests that stay pending for a
//! configurable number of `get_request_data` polls before completing.
//! Every call is logged so tests can assert submission counts.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use super::{EngineTransport, RpcReply, TransportError};

/// Commands answered with a fresh query identifier.
const QUERY_COMMANDS: &[&str] = &[
    "select_experiments",
    "select_genes",
    "select_annotations",
    "select_regions",
    "intersection",
    "regions_filter",
    "filter_by_motif",
    "tiling",
    "aggregate",
    "flank",
    "extend",
];

/// Commands answered with a request identifier to be polled.
const SUBMIT_COMMANDS: &[&str] = &[
    "count_regions",
    "distinct_column_values",
    "calculate_enrichment",
    "enrich_regions_go_terms",
    "enrich_regions_overlap",
    "enrich_regions_fast",
];

/// Schema table served for the `commands` call: command name to
/// `[name, type, multiple]` parameter triples, every command carrying a
/// trailing credential.
fn standard_commands() -> Value {
    fn params(entries: &[(&str, &str, bool)]) -> Value {
        let mut list: Vec<Value> = entries
            .iter()
            .map(|(name, ptype, multiple)| json!([name, ptype, multiple]))
            .collect();
        list.push(json!(["user_key", "string", false]));
        json!({ "parameters": list })
    }

    json!({
        "select_experiments": params(&[("experiment_name", "string", true)]),
        "select_genes": params(&[("gene_model", "string", false)]),
        "select_annotations": params(&[("annotation_name", "string", true), ("genome", "string", false)]),
        "select_regions": params(&[
            ("genome", "string", false), ("type", "string", false),
            ("epigenetic_mark", "string", false), ("biosource", "string", false),
            ("sample", "string", false), ("technique", "string", false),
            ("project", "string", false),
        ]),
        "intersection": params(&[("query_data_id", "string", false), ("query_filter_id", "string", false)]),
        "regions_filter": params(&[
            ("query_id", "string", false), ("field", "string", false),
            ("operation", "string", false), ("value", "string", false),
            ("type", "string", false),
        ]),
        "filter_by_motif": params(&[("query_id", "string", false), ("motif", "string", false)]),
        "tiling": params(&[("genome", "string", false), ("size", "int", false), ("chromosomes", "string", true)]),
        "aggregate": params(&[("data_id", "string", false), ("ranges_id", "string", false), ("column", "string", false)]),
        "flank": params(&[
            ("query_id", "string", false), ("start", "int", false),
            ("length", "int", false), ("use_strand", "boolean", false),
        ]),
        "extend": params(&[
            ("query_id", "string", false), ("length", "int", false),
            ("direction", "string", false), ("use_strand", "boolean", false),
        ]),
        "count_regions": params(&[("query_id", "string", false)]),
        "distinct_column_values": params(&[("query_id", "string", false), ("column", "string", false)]),
        "calculate_enrichment": params(&[("query_id", "string", false), ("gene_model", "string", false)]),
        "enrich_regions_go_terms": params(&[("query_id", "string", false), ("gene_model", "string", false)]),
        "enrich_regions_overlap": params(&[
            ("query_id", "string", false), ("universe_query_id", "string", false),
            ("datasets", "struct", false), ("genome", "string", false),
        ]),
        "enrich_regions_fast": params(&[
            ("query_id", "string", false), ("genome", "string", false),
            ("filter", "struct", false),
        ]),
        "info": params(&[("id", "string", true)]),
        "name_to_id": params(&[("name", "string", false), ("collection", "string", false)]),
        "list_experiments": params(&[
            ("genome", "string", false), ("type", "string", false),
            ("epigenetic_mark", "string", false), ("biosource", "string", false),
            ("sample", "string", false), ("technique", "string", false),
            ("project", "string", false),
        ]),
        "list_gene_models": params(&[]),
        "list_projects": params(&[]),
        "collection_experiments_count": params(&[
            ("controlled_vocabulary", "string", false), ("type", "string", false),
            ("genome", "string", false),
        ]),
        "get_request_data": json!({ "parameters": [
            ["request_id", "string", false], ["user_key", "string", false],
        ]}),
    })
}

#[derive(Default)]
struct MockState {
    scripted: HashMap<String, VecDeque<RpcReply>>,
    submit_payloads: HashMap<String, Value>,
    pending: HashMap<String, u32>,
    results: HashMap<String, Value>,
    calls: Vec<(String, Vec<Value>)>,
    next_query: u32,
    next_request: u32,
    polls_until_ready: u32,
    failing: Option<String>,
}

/// Programmable in-memory engine.
#[derive(Default)]
pub struct MockEngine {
    state: RwLock<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an explicit reply for `method`, consumed before any default
    /// behavior. Useful for `info`, `name_to_id` and `list_*` payloads.
    pub async fn push_reply(&self, method: &str, reply: RpcReply) {
        self.state
            .write()
            .await
            .scripted
            .entry(method.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Payload delivered once requests created by `method` complete.
    pub async fn stage_result(&self, method: &str, payload: Value) {
        self.state
            .write()
            .await
            .submit_payloads
            .insert(method.to_string(), payload);
    }

    /// Number of pending polls each new request answers before
    /// completing (default 0: the first poll succeeds).
    pub async fn set_polls_until_ready(&self, polls: u32) {
        self.state.write().await.polls_until_ready = polls;
    }

    /// Make calls to `method` fail at the transport level.
    pub async fn set_failing(&self, method: Option<&str>) {
        self.state.write().await.failing = method.map(str::to_string);
    }

    /// Number of calls dispatched for `method`.
    pub async fn calls_for(&self, method: &str) -> usize {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter(|(name, _)| name == method)
            .count()
    }

    /// Positional parameters of the most recent call to `method`.
    pub async fn last_params(&self, method: &str) -> Option<Vec<Value>> {
        self.state
            .read()
            .await
            .calls
            .iter()
            .rev()
            .find(|(name, _)| name == method)
            .map(|(_, params)| params.clone())
    }

    pub async fn total_calls(&self) -> usize {
        self.state.read().await.calls.len()
    }
}

#[async_trait]
impl EngineTransport for MockEngine {
    async fn call(&self, method: &str, params: &[Value]) -> Result<RpcReply, TransportError> {
        let mut state = self.state.write().await;
        state.calls.push((method.to_string(), params.to_vec()));

        if state.failing.as_deref() == Some(method) {
            return Err(TransportError::MalformedReply(format!(
                "mock transport failure for {method}"
            )));
        }

        if let Some(queue) = state.scripted.get_mut(method) {
            if let Some(reply) = queue.pop_front() {
                return Ok(reply);
            }
        }

        if method == "commands" {
            return Ok(RpcReply::okay(standard_commands()));
        }

        if method == "get_request_data" {
            let request_id = params
                .first()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if let Some(remaining) = state.pending.get_mut(&request_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok(RpcReply::error(format!(
                        "Request {request_id} is not finished yet"
                    )));
                }
            }
            let payload = state.results.get(&request_id).cloned();
            return match payload {
                Some(payload) => Ok(RpcReply::okay(payload)),
                None => Ok(RpcReply::error(format!("unknown request {request_id}"))),
            };
        }

        if QUERY_COMMANDS.contains(&method) {
            state.next_query += 1;
            return Ok(RpcReply::okay(json!(format!("q{}", state.next_query))));
        }

        if SUBMIT_COMMANDS.contains(&method) {
            state.next_request += 1;
            let request_id = format!("r{}", state.next_request);
            let payload = state
                .submit_payloads
                .get(method)
                .cloned()
                .unwrap_or(Value::Null);
            let polls = state.polls_until_ready;
            state.pending.insert(request_id.clone(), polls);
            state.results.insert(request_id.clone(), payload);
            return Ok(RpcReply::okay(json!(request_id)));
        }

        if method.starts_with("list_") || method == "collection_experiments_count" {
            return Ok(RpcReply::okay(json!([])));
        }

        Ok(RpcReply::error(format!("unknown command {method}")))
    }
}
