//! NDJSON control-plane service for the Ensemble runtime.
//!
//! This module exposes a small dispatcher that translates newline-delimited
//! JSON commands into calls on the [`Runtime`] facade. It backs the
//! `ensembled` daemon and is intentionally conservative: commands on one
//! connection are processed sequentially, and unsupported operations return
//! structured errors.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info};

use super::Runtime;
use super::actor::ActorOptions;
use super::cluster::ResourceVector;
use super::error::{ActorError, RuntimeError};
use super::ident::{ActorId, ObjectId, PlacementGroupId};
use super::placement::{PlacementGroupOptions, PlacementStrategy};
use super::task::{CallOptions, TaskArg};
use crate::PROTOCOL_VERSION;

/// Errors surfaced to control-plane clients
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request line was not valid JSON
    #[error("parse error: {0}")]
    Parse(String),

    /// The command name is not part of the protocol
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The command's params were malformed
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Commands were issued before completing the handshake
    #[error("handshake has not completed")]
    HandshakeRequired,

    /// The runtime rejected the operation
    #[error("{0}")]
    Runtime(#[from] RuntimeError),
}

impl ServiceError {
    /// Stable machine-readable classifier for this error
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Parse(_) => "parse_error",
            ServiceError::UnknownCommand(_) => "unknown_command",
            ServiceError::InvalidParams(_) => "invalid_params",
            ServiceError::HandshakeRequired => "handshake_required",
            ServiceError::Runtime(err) => match err {
                RuntimeError::Object(_) => "object_error",
                RuntimeError::RefCount(_) => "refcount_error",
                RuntimeError::Task(_) => "task_error",
                RuntimeError::Actor(_) => "actor_error",
                RuntimeError::Placement(_) => "placement_error",
                RuntimeError::Storage(_) => "storage_error",
                RuntimeError::Config(_) => "config_error",
                RuntimeError::Shutdown => "shutdown",
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct RequestEnvelope {
    #[serde(default)]
    id: Value,
    command: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct ResponseEnvelope {
    id: Value,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl ResponseEnvelope {
    fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn from_error(id: Value, err: ServiceError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

/// Wire form of a task argument
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WireArg {
    /// Inlined payload bytes
    Value(Vec<u8>),
    /// By-reference handle
    ObjectRef(String),
}

impl From<WireArg> for TaskArg {
    fn from(arg: WireArg) -> Self {
        match arg {
            WireArg::Value(payload) => TaskArg::Value(payload),
            WireArg::ObjectRef(id) => TaskArg::ObjectRef(ObjectId::new(id)),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireCallOptions {
    #[serde(default)]
    resources: ResourceVector,
    #[serde(default)]
    placement_group: Option<String>,
    #[serde(default)]
    max_retries: u32,
    #[serde(default)]
    name: Option<String>,
}

impl From<WireCallOptions> for CallOptions {
    fn from(options: WireCallOptions) -> Self {
        CallOptions {
            resources: options.resources,
            placement_group: options.placement_group.map(PlacementGroupId::new),
            max_retries: options.max_retries,
            name: options.name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireActorOptions {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    global: bool,
    #[serde(default)]
    max_restarts: u32,
    #[serde(default = "default_concurrency")]
    max_concurrency: u32,
    #[serde(default)]
    placement_group: Option<String>,
    #[serde(default)]
    resources: ResourceVector,
}

fn default_concurrency() -> u32 {
    1
}

impl Default for WireActorOptions {
    fn default() -> Self {
        Self {
            name: None,
            global: false,
            max_restarts: 0,
            max_concurrency: 1,
            placement_group: None,
            resources: ResourceVector::new(),
        }
    }
}

impl From<WireActorOptions> for ActorOptions {
    fn from(options: WireActorOptions) -> Self {
        ActorOptions {
            name: options.name,
            global: options.global,
            max_restarts: options.max_restarts,
            max_concurrency: options.max_concurrency,
            placement_group: options.placement_group.map(PlacementGroupId::new),
            resources: options.resources,
        }
    }
}

/// Service entry point: dispatches control-plane commands onto a runtime.
#[derive(Clone)]
pub struct Service {
    runtime: Arc<Runtime>,
}

impl Service {
    /// Create a new service wrapper around the provided runtime.
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    /// Accept connections forever, one session task per connection.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = ?listener.local_addr().ok(), "control plane listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "control plane connection");
            let service = self.clone();
            tokio::spawn(async move {
                let (read_half, write_half) = stream.into_split();
                let reader = BufReader::new(read_half);
                if let Err(err) = service.handle(reader, write_half).await {
                    debug!(%peer, error = %err, "connection closed");
                }
            });
        }
    }

    /// Process a single connection by consuming requests line by line.
    pub async fn handle<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut session = Session {
            runtime: self.runtime.clone(),
            handshake_completed: false,
        };
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<RequestEnvelope>(&line) {
                Ok(request) => session.handle_request(request).await,
                Err(err) => {
                    ResponseEnvelope::from_error(Value::Null, ServiceError::Parse(err.to_string()))
                }
            };
            let mut payload = serde_json::to_vec(&response)?;
            payload.push(b'\n');
            writer.write_all(&payload).await?;
            writer.flush().await?;
        }
        Ok(())
    }
}

struct Session {
    runtime: Arc<Runtime>,
    handshake_completed: bool,
}

impl Session {
    async fn handle_request(&mut self, request: RequestEnvelope) -> ResponseEnvelope {
        match self.dispatch(&request.command, &request.params).await {
            Ok(value) => ResponseEnvelope::success(request.id, value),
            Err(err) => ResponseEnvelope::from_error(request.id, err),
        }
    }

    fn params<T: serde::de::DeserializeOwned>(params: &Value) -> Result<T, ServiceError> {
        serde_json::from_value(params.clone())
            .map_err(|err| ServiceError::InvalidParams(err.to_string()))
    }

    async fn dispatch(&mut self, command: &str, params: &Value) -> Result<Value, ServiceError> {
        if command == "handshake" {
            self.handshake_completed = true;
            return Ok(json!({
                "server_version": crate::VERSION,
                "protocol_version": PROTOCOL_VERSION,
            }));
        }
        if !self.handshake_completed {
            return Err(ServiceError::HandshakeRequired);
        }

        match command {
            "status" => {
                let status = self.runtime.status();
                Ok(serde_json::to_value(status)
                    .map_err(|err| ServiceError::InvalidParams(err.to_string()))?)
            }

            "put" => {
                #[derive(Deserialize)]
                struct Params {
                    payload: Vec<u8>,
                }
                let p: Params = Self::params(params)?;
                let id = self.runtime.put(p.payload)?;
                Ok(json!({ "id": id }))
            }

            "get" => {
                #[derive(Deserialize)]
                struct Params {
                    id: String,
                }
                let p: Params = Self::params(params)?;
                let payload = self.runtime.get(&ObjectId::new(p.id)).await?;
                Ok(json!({ "payload": payload }))
            }

            "get_many" => {
                #[derive(Deserialize)]
                struct Params {
                    ids: Vec<String>,
                }
                let p: Params = Self::params(params)?;
                let ids: Vec<ObjectId> = p.ids.into_iter().map(ObjectId::new).collect();
                let results: Vec<Value> = self
                    .runtime
                    .get_many(&ids)
                    .await
                    .into_iter()
                    .map(|result| match result {
                        Ok(payload) => json!({ "payload": payload }),
                        Err(err) => json!({ "error": err.to_string() }),
                    })
                    .collect();
                Ok(json!({ "results": results }))
            }

            "wait" => {
                #[derive(Deserialize)]
                struct Params {
                    ids: Vec<String>,
                    num_objects: usize,
                    timeout_ms: u64,
                }
                let p: Params = Self::params(params)?;
                let ids: Vec<ObjectId> = p.ids.into_iter().map(ObjectId::new).collect();
                let ready = self.runtime.wait(&ids, p.num_objects, p.timeout_ms).await?;
                Ok(json!({ "ready": ready }))
            }

            "add_local_reference" | "remove_local_reference" => {
                #[derive(Deserialize)]
                struct Params {
                    id: String,
                }
                let p: Params = Self::params(params)?;
                let id = ObjectId::new(p.id);
                if command == "add_local_reference" {
                    self.runtime.add_local_reference(&id)?;
                } else {
                    self.runtime.remove_local_reference(&id)?;
                }
                Ok(json!({}))
            }

            "call" => {
                #[derive(Deserialize)]
                struct Params {
                    function: String,
                    #[serde(default)]
                    args: Vec<WireArg>,
                    #[serde(default)]
                    options: WireCallOptions,
                }
                let p: Params = Self::params(params)?;
                let function = self.runtime.task_function(&p.function)?;
                let args = p.args.into_iter().map(TaskArg::from).collect();
                let result = self.runtime.call(&function, args, p.options.into())?;
                Ok(json!({ "result": result }))
            }

            "call_actor" => {
                #[derive(Deserialize)]
                struct Params {
                    function: String,
                    actor: String,
                    #[serde(default)]
                    args: Vec<WireArg>,
                    #[serde(default)]
                    options: WireCallOptions,
                }
                let p: Params = Self::params(params)?;
                let function = self.runtime.actor_method(&p.function)?;
                let args = p.args.into_iter().map(TaskArg::from).collect();
                let result = self.runtime.call_actor(
                    &function,
                    &ActorId::new(p.actor),
                    args,
                    p.options.into(),
                )?;
                Ok(json!({ "result": result }))
            }

            "create_actor" => {
                #[derive(Deserialize)]
                struct Params {
                    function: String,
                    #[serde(default)]
                    args: Vec<WireArg>,
                    #[serde(default)]
                    options: WireActorOptions,
                }
                let p: Params = Self::params(params)?;
                let function = self.runtime.actor_constructor(&p.function)?;
                let args = p.args.into_iter().map(TaskArg::from).collect();
                let actor = self.runtime.create_actor(&function, args, p.options.into())?;
                Ok(json!({ "actor": actor }))
            }

            "get_actor_id" => {
                #[derive(Deserialize)]
                struct Params {
                    #[serde(default)]
                    global: bool,
                    name: String,
                }
                let p: Params = Self::params(params)?;
                let actor = self.runtime.get_actor_id(p.global, &p.name)?;
                Ok(json!({ "actor": actor }))
            }

            "kill_actor" => {
                #[derive(Deserialize)]
                struct Params {
                    id: String,
                    #[serde(default)]
                    no_restart: bool,
                }
                let p: Params = Self::params(params)?;
                self.runtime
                    .kill_actor(&ActorId::new(p.id), p.no_restart)?;
                Ok(json!({}))
            }

            "actor_state" => {
                #[derive(Deserialize)]
                struct Params {
                    id: String,
                }
                let p: Params = Self::params(params)?;
                let state = self.runtime.actor_state(&ActorId::new(p.id))?;
                Ok(json!({ "state": state }))
            }

            "exit_actor" => {
                // Self-exit is only meaningful from inside an actor's own
                // execution context, which the control plane is not.
                Err(ServiceError::Runtime(
                    ActorError::InvalidContext(
                        "exit_actor must be called from actor code".to_string(),
                    )
                    .into(),
                ))
            }

            "create_placement_group" => {
                #[derive(Deserialize)]
                struct Params {
                    bundles: Vec<ResourceVector>,
                    strategy: PlacementStrategy,
                    #[serde(default)]
                    name: Option<String>,
                }
                let p: Params = Self::params(params)?;
                let id = self.runtime.create_placement_group(PlacementGroupOptions {
                    bundles: p.bundles,
                    strategy: p.strategy,
                    name: p.name,
                })?;
                Ok(json!({ "id": id }))
            }

            "wait_placement_group_ready" => {
                #[derive(Deserialize)]
                struct Params {
                    id: String,
                    timeout_seconds: u64,
                }
                let p: Params = Self::params(params)?;
                let ready = self
                    .runtime
                    .wait_placement_group_ready(&PlacementGroupId::new(p.id), p.timeout_seconds)
                    .await?;
                Ok(json!({ "ready": ready }))
            }

            "remove_placement_group" => {
                #[derive(Deserialize)]
                struct Params {
                    id: String,
                }
                let p: Params = Self::params(params)?;
                self.runtime
                    .remove_placement_group(&PlacementGroupId::new(p.id))?;
                Ok(json!({}))
            }

            "placement_group_state" => {
                #[derive(Deserialize)]
                struct Params {
                    id: String,
                }
                let p: Params = Self::params(params)?;
                let state = self
                    .runtime
                    .placement_group_state(&PlacementGroupId::new(p.id))?;
                Ok(json!({ "state": state }))
            }

            other => Err(ServiceError::UnknownCommand(other.to_string())),
        }
    }
}
