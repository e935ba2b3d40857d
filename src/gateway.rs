//! Remote call gateway: schema-driven argument building, dispatch, and
//! the submit+poll primitive for asynchronous commands.
//!
//! The engine declares each command's positional parameters in a schema
//! table fetched once at startup. Supplied values arrive as raw strings
//! and are coerced to their declared types before dispatch. Asynchronous
//! commands answer with a request identifier whose result is fetched by
//! polling `get_request_data` on a jittered interval; concurrent callers
//! awaiting the same request share a single poll loop and each receive
//! the completed value exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::operations::textify;
use crate::transport::{EngineTransport, RpcReply, TransportError};

/// Errors raised by the gateway. Engine-level `"error"` replies are not
/// errors here; they are logged and handed back inside the reply.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("unknown parameter type '{ptype}' for {command}.{name}")]
    UnknownParamType {
        command: String,
        name: String,
        ptype: String,
    },

    #[error("malformed '{name}' argument for {command}: {value}")]
    MalformedArgument {
        command: String,
        name: String,
        value: String,
    },

    #[error("engine rejected the command schema fetch: {0}")]
    SchemaFetch(String),

    #[error("malformed command schema: {0}")]
    MalformedSchema(String),

    #[error("transport failure while polling request {request}: {message}")]
    Poll { request: String, message: String },

    #[error("polling cancelled for request {0}")]
    Cancelled(String),
}

/// One declared parameter of a remote command.
#[derive(Clone, Debug)]
pub struct ParamSpec {
    pub name: String,
    pub ptype: String,
    pub multiple: bool,
}

/// Positional parameter schema of one remote command.
#[derive(Clone, Debug)]
pub struct CommandSchema {
    pub name: String,
    pub params: Vec<ParamSpec>,
}

impl CommandSchema {
    /// Parse the full command table from the `commands` reply payload.
    pub fn parse_table(payload: &Value) -> Result<HashMap<String, CommandSchema>, GatewayError> {
        let table = payload
            .as_object()
            .ok_or_else(|| GatewayError::MalformedSchema("table is not an object".into()))?;

        let mut commands = HashMap::with_capacity(table.len());
        for (name, entry) in table {
            let raw_params = entry
                .get("parameters")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    GatewayError::MalformedSchema(format!("command '{name}' has no parameters"))
                })?;
            let mut params = Vec::with_capacity(raw_params.len());
            for triple in raw_params {
                let fields = triple.as_array().filter(|f| f.len() >= 3).ok_or_else(|| {
                    GatewayError::MalformedSchema(format!(
                        "command '{name}' has a malformed parameter triple: {triple}"
                    ))
                })?;
                params.push(ParamSpec {
                    name: fields[0].as_str().unwrap_or_default().to_string(),
                    ptype: fields[1].as_str().unwrap_or_default().to_string(),
                    multiple: fields[2].as_bool().unwrap_or(false),
                });
            }
            commands.insert(
                name.clone(),
                CommandSchema {
                    name: name.clone(),
                    params,
                },
            );
        }
        Ok(commands)
    }

    /// Build the ordered positional argument list from named raw values,
    /// coercing each to its declared type. A missing `user_key` becomes
    /// the default credential; other missing parameters become null.
    pub fn build_args(
        &self,
        values: &HashMap<String, String>,
        default_key: &str,
    ) -> Result<Vec<Value>, GatewayError> {
        let mut args = Vec::with_capacity(self.params.len());
        for spec in &self.params {
            let Some(raw) = values.get(&spec.name) else {
                if spec.name == "user_key" {
                    args.push(Value::String(default_key.to_string()));
                } else {
                    args.push(Value::Null);
                }
                continue;
            };

            let coerced = match spec.ptype.as_str() {
                "string" => Value::String(raw.clone()),
                "int" => raw
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| GatewayError::MalformedArgument {
                        command: self.name.clone(),
                        name: spec.name.clone(),
                        value: raw.clone(),
                    })?,
                "double" => raw
                    .parse::<f64>()
                    .map(Value::from)
                    .map_err(|_| GatewayError::MalformedArgument {
                        command: self.name.clone(),
                        name: spec.name.clone(),
                        value: raw.clone(),
                    })?,
                "struct" => {
                    serde_json::from_str(raw).map_err(|_| GatewayError::MalformedArgument {
                        command: self.name.clone(),
                        name: spec.name.clone(),
                        value: raw.clone(),
                    })?
                }
                "boolean" => Value::Bool(raw == "true"),
                other => {
                    return Err(GatewayError::UnknownParamType {
                        command: self.name.clone(),
                        name: spec.name.clone(),
                        ptype: other.to_string(),
                    })
                }
            };
            args.push(coerced);
        }
        Ok(args)
    }
}

/// Outcome of one shared poll loop; must be cheap to clone for every
/// awaiter of the request.
#[derive(Clone, Debug)]
enum PollFailure {
    Transport(String),
    Cancelled,
}

type SharedPoll = Shared<BoxFuture<'static, Result<Value, PollFailure>>>;

/// Backoff for the one-time schema fetch at startup.
fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Gateway to the remote engine.
pub struct Gateway {
    transport: Arc<dyn EngineTransport>,
    commands: HashMap<String, CommandSchema>,
    user_key: String,
    poll_min_ms: u64,
    poll_max_ms: u64,
    in_flight: Mutex<HashMap<String, SharedPoll>>,
    cancelled: Arc<AtomicBool>,
}

impl Gateway {
    /// Fetch the command schema table (with backoff while the engine
    /// comes up) and build a connected gateway.
    pub async fn connect(
        transport: Arc<dyn EngineTransport>,
        config: &EngineConfig,
    ) -> Result<Self, GatewayError> {
        let reply = (|| async { transport.call("commands", &[]).await })
            .retry(connection_backoff())
            .notify(|err: &TransportError, dur: Duration| {
                warn!(error = %err, delay = ?dur, "Schema fetch failed, retrying");
            })
            .await?;

        if reply.is_error() {
            return Err(GatewayError::SchemaFetch(textify(&reply.payload)));
        }
        let commands = CommandSchema::parse_table(&reply.payload)?;
        info!(commands = commands.len(), "Engine command schema loaded");

        Ok(Self {
            transport,
            commands,
            user_key: config.user_key.clone(),
            poll_min_ms: config.poll_min_ms,
            poll_max_ms: config.poll_max_ms.max(config.poll_min_ms),
            in_flight: Mutex::new(HashMap::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn command(&self, name: &str) -> Option<&CommandSchema> {
        self.commands.get(name)
    }

    /// Synchronous calling mode: dispatch and return the raw reply.
    ///
    /// An engine-level `"error"` status is logged and still handed back,
    /// because callers need the error content for user-facing reporting.
    pub async fn call(
        &self,
        command: &str,
        values: &HashMap<String, String>,
    ) -> Result<RpcReply, GatewayError> {
        let schema = self
            .commands
            .get(command)
            .ok_or_else(|| GatewayError::UnknownCommand(command.to_string()))?;
        let args = schema.build_args(values, &self.user_key).map_err(|e| {
            error!(command, error = %e, "Argument build failed");
            e
        })?;

        debug!(command, args = args.len(), "Dispatching engine call");
        let reply = self.transport.call(command, &args).await?;
        if reply.is_error() {
            error!(command, ?values, payload = %reply.payload, "Engine returned error");
        }
        Ok(reply)
    }

    /// Poll phase of the submit+poll primitive: resolve a submitted
    /// request's result, polling until the engine completes it.
    ///
    /// At most one poll loop exists per outstanding request; concurrent
    /// awaiters share it and each receive the completed value.
    pub async fn fetch_result(&self, request_id: &str) -> Result<Value, GatewayError> {
        let shared = {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(request_id) {
                Some(existing) => existing.clone(),
                None => {
                    let poll = self.poll_loop(request_id.to_string());
                    in_flight.insert(request_id.to_string(), poll.clone());
                    poll
                }
            }
        };

        let outcome = shared.await;
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(request_id);

        outcome.map_err(|failure| match failure {
            PollFailure::Transport(message) => GatewayError::Poll {
                request: request_id.to_string(),
                message,
            },
            PollFailure::Cancelled => GatewayError::Cancelled(request_id.to_string()),
        })
    }

    /// Stop every outstanding poll loop at its next tick.
    pub fn cancel_polls(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    fn poll_loop(&self, request_id: String) -> SharedPoll {
        let transport = Arc::clone(&self.transport);
        let user_key = self.user_key.clone();
        let cancelled = Arc::clone(&self.cancelled);
        let (min_ms, max_ms) = (self.poll_min_ms, self.poll_max_ms);

        async move {
            let params = [json!(request_id.clone()), json!(user_key)];
            loop {
                if cancelled.load(Ordering::Relaxed) {
                    return Err(PollFailure::Cancelled);
                }

                match transport.call("get_request_data", &params).await {
                    Ok(reply) if !reply.is_error() => return Ok(reply.payload),
                    // A non-okay status means the request is still being
                    // computed; keep polling.
                    Ok(reply) => {
                        debug!(request = %request_id, payload = %reply.payload, "Request pending");
                    }
                    Err(e) => return Err(PollFailure::Transport(e.to_string())),
                }

                // Randomized interval avoids synchronized load spikes
                // when many pipeline branches poll concurrently.
                let wait = { rand::rng().random_range(min_ms..=max_ms) };
                tokio::time::sleep(Duration::from_millis(wait)).await;
            }
        }
        .boxed()
        .shared()
    }
}
