//! Control-plane client for the Ensemble NDJSON service.
//!
//! This module provides a small, synchronous client that speaks the same
//! newline-delimited JSON protocol as the `ensembled` daemon. It is
//! intended for frontends (CLIs, tests, other processes) that need to drive
//! a runtime remotely.
//!
//! Connection failures (refused connections, resets, read timeouts) are
//! surfaced as [`ClientError::Io`] and must be treated exactly like a
//! remote-process failure: the remote runtime is gone or unreachable, and
//! the caller's retry/failure policy applies. The client never waits past
//! its configured timeout.

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;

use super::RuntimeStatus;
use super::actor::ActorState;
use super::placement::PlacementGroupState;
use crate::PROTOCOL_VERSION;

/// Errors produced by the [`ServiceClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// I/O error while communicating with the runtime; treat as
    /// remote-process failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialisation error for envelopes.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The runtime reported a structured protocol error.
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    /// Commands were issued before completing the handshake.
    #[error("handshake has not completed")]
    HandshakeNotCompleted,

    /// The service returned an unexpected or malformed payload.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// Structured protocol error surfaced by the service.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct ProtocolError {
    /// Stable machine-readable classifier
    pub code: String,
    /// Human-readable detail
    pub message: String,
}

/// Convenience result alias for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Synchronous NDJSON client for a remote runtime.
pub struct ServiceClient {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    next_id: u64,
    handshake_completed: bool,
}

impl ServiceClient {
    /// Connect to a runtime's control plane over TCP.
    ///
    /// The timeout bounds every subsequent request; a request that exceeds
    /// it fails with [`ClientError::Io`] rather than hanging.
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> ClientResult<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream);
        Ok(Self {
            reader,
            writer,
            next_id: 0,
            handshake_completed: false,
        })
    }

    /// Perform the protocol handshake. Must precede every other command.
    pub fn handshake(&mut self) -> ClientResult<()> {
        let result = self.roundtrip_raw("handshake", json!({}))?;
        let protocol = result
            .get("protocol_version")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::MalformedResponse("missing protocol_version".into()))?;
        if protocol != PROTOCOL_VERSION {
            return Err(ClientError::MalformedResponse(format!(
                "protocol version mismatch: client {PROTOCOL_VERSION}, server {protocol}"
            )));
        }
        self.handshake_completed = true;
        Ok(())
    }

    /// Fetch the runtime's status summary.
    pub fn status(&mut self) -> ClientResult<RuntimeStatus> {
        self.roundtrip("status", json!({}))
    }

    /// Store a payload, returning its handle.
    pub fn put(&mut self, payload: &[u8]) -> ClientResult<String> {
        let result = self.roundtrip_checked("put", json!({ "payload": payload }))?;
        extract_str(&result, "id")
    }

    /// Retrieve a payload, blocking until it materializes or the
    /// connection timeout elapses.
    pub fn get(&mut self, id: &str) -> ClientResult<Vec<u8>> {
        let result = self.roundtrip_checked("get", json!({ "id": id }))?;
        let payload = result
            .get("payload")
            .ok_or_else(|| ClientError::MalformedResponse("missing payload".into()))?;
        Ok(serde_json::from_value(payload.clone())?)
    }

    /// Report which handles materialize within the timeout.
    pub fn wait(
        &mut self,
        ids: &[&str],
        num_objects: usize,
        timeout_ms: u64,
    ) -> ClientResult<Vec<bool>> {
        let result = self.roundtrip_checked(
            "wait",
            json!({ "ids": ids, "num_objects": num_objects, "timeout_ms": timeout_ms }),
        )?;
        let ready = result
            .get("ready")
            .ok_or_else(|| ClientError::MalformedResponse("missing ready".into()))?;
        Ok(serde_json::from_value(ready.clone())?)
    }

    /// Submit a task call with inlined byte arguments.
    pub fn call(&mut self, function: &str, args: &[&[u8]]) -> ClientResult<String> {
        let args: Vec<Value> = args.iter().map(|a| json!({ "value": a })).collect();
        let result =
            self.roundtrip_checked("call", json!({ "function": function, "args": args }))?;
        extract_str(&result, "result")
    }

    /// Submit an actor method call with inlined byte arguments.
    pub fn call_actor(&mut self, function: &str, actor: &str, args: &[&[u8]]) -> ClientResult<String> {
        let args: Vec<Value> = args.iter().map(|a| json!({ "value": a })).collect();
        let result = self.roundtrip_checked(
            "call_actor",
            json!({ "function": function, "actor": actor, "args": args }),
        )?;
        extract_str(&result, "result")
    }

    /// Create an actor from a registered constructor.
    pub fn create_actor(
        &mut self,
        function: &str,
        args: &[&[u8]],
        options: Value,
    ) -> ClientResult<String> {
        let args: Vec<Value> = args.iter().map(|a| json!({ "value": a })).collect();
        let result = self.roundtrip_checked(
            "create_actor",
            json!({ "function": function, "args": args, "options": options }),
        )?;
        extract_str(&result, "actor")
    }

    /// Look up a named actor.
    pub fn get_actor_id(&mut self, global: bool, name: &str) -> ClientResult<String> {
        let result =
            self.roundtrip_checked("get_actor_id", json!({ "global": global, "name": name }))?;
        extract_str(&result, "actor")
    }

    /// Terminate an actor.
    pub fn kill_actor(&mut self, id: &str, no_restart: bool) -> ClientResult<()> {
        self.roundtrip_checked("kill_actor", json!({ "id": id, "no_restart": no_restart }))?;
        Ok(())
    }

    /// Current liveness state of an actor.
    pub fn actor_state(&mut self, id: &str) -> ClientResult<ActorState> {
        let result = self.roundtrip_checked("actor_state", json!({ "id": id }))?;
        let state = result
            .get("state")
            .ok_or_else(|| ClientError::MalformedResponse("missing state".into()))?;
        Ok(serde_json::from_value(state.clone())?)
    }

    /// Create a placement group from bundles and a strategy name.
    pub fn create_placement_group(&mut self, options: Value) -> ClientResult<String> {
        let result = self.roundtrip_checked("create_placement_group", options)?;
        extract_str(&result, "id")
    }

    /// Block until the group is ready or the timeout elapses.
    pub fn wait_placement_group_ready(
        &mut self,
        id: &str,
        timeout_seconds: u64,
    ) -> ClientResult<bool> {
        let result = self.roundtrip_checked(
            "wait_placement_group_ready",
            json!({ "id": id, "timeout_seconds": timeout_seconds }),
        )?;
        result
            .get("ready")
            .and_then(Value::as_bool)
            .ok_or_else(|| ClientError::MalformedResponse("missing ready".into()))
    }

    /// Release a placement group's reservations.
    pub fn remove_placement_group(&mut self, id: &str) -> ClientResult<()> {
        self.roundtrip_checked("remove_placement_group", json!({ "id": id }))?;
        Ok(())
    }

    /// Current lifecycle state of a placement group.
    pub fn placement_group_state(&mut self, id: &str) -> ClientResult<PlacementGroupState> {
        let result = self.roundtrip_checked("placement_group_state", json!({ "id": id }))?;
        let state = result
            .get("state")
            .ok_or_else(|| ClientError::MalformedResponse("missing state".into()))?;
        Ok(serde_json::from_value(state.clone())?)
    }

    fn roundtrip<T: DeserializeOwned>(&mut self, command: &str, params: Value) -> ClientResult<T> {
        let result = self.roundtrip_checked(command, params)?;
        Ok(serde_json::from_value(result)?)
    }

    fn roundtrip_checked(&mut self, command: &str, params: Value) -> ClientResult<Value> {
        if !self.handshake_completed {
            return Err(ClientError::HandshakeNotCompleted);
        }
        self.roundtrip_raw(command, params)
    }

    fn roundtrip_raw(&mut self, command: &str, params: Value) -> ClientResult<Value> {
        self.next_id += 1;
        let request = json!({
            "id": self.next_id,
            "command": command,
            "params": params,
        });
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        self.writer.flush()?;

        let mut response_line = String::new();
        let read = self.reader.read_line(&mut response_line)?;
        if read == 0 {
            return Err(ClientError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "runtime closed the connection",
            )));
        }

        let response: Value = serde_json::from_str(&response_line)?;
        let ok = response
            .get("ok")
            .and_then(Value::as_bool)
            .ok_or_else(|| ClientError::MalformedResponse("missing ok flag".into()))?;
        if ok {
            Ok(response.get("result").cloned().unwrap_or(Value::Null))
        } else {
            let code = response
                .pointer("/error/code")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let message = response
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            Err(ClientError::Protocol(ProtocolError { code, message }))
        }
    }
}

fn extract_str(result: &Value, key: &str) -> ClientResult<String> {
    result
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ClientError::MalformedResponse(format!("missing {key}")))
}
