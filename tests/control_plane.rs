//! Integration tests for the NDJSON control plane
//!
//! Drives the service dispatcher directly over an in-memory duplex pipe,
//! and round-trips through the synchronous client over TCP.

use ensemble::runtime::client::ServiceClient;
use ensemble::runtime::registry::FunctionCatalog;
use ensemble::runtime::service::Service;
use ensemble::runtime::{Runtime, RuntimeConfig};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn register_functions() {
    FunctionCatalog::global().register_task("shout", |args| {
        let mut out = args.first().cloned().unwrap_or_default();
        out.extend_from_slice(b"!");
        Ok(out)
    });
}

fn service() -> Service {
    register_functions();
    let runtime = Runtime::new(RuntimeConfig {
        spill_enabled: false,
        ..RuntimeConfig::default()
    })
    .unwrap();
    Service::new(Arc::new(runtime))
}

struct Pipe {
    writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    reader: BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
}

impl Pipe {
    fn open(service: Service) -> Self {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_side);
        tokio::spawn(async move {
            let _ = service
                .handle(BufReader::new(server_read), server_write)
                .await;
        });
        let (client_read, client_write) = tokio::io::split(client_side);
        Self {
            writer: client_write,
            reader: BufReader::new(client_read),
        }
    }

    async fn request(&mut self, body: Value) -> Value {
        let mut line = body.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
        let mut response = String::new();
        self.reader.read_line(&mut response).await.unwrap();
        serde_json::from_str(&response).unwrap()
    }
}

#[tokio::test]
async fn test_handshake_is_required() {
    let mut pipe = Pipe::open(service());
    let response = pipe
        .request(json!({ "id": 1, "command": "status" }))
        .await;
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["code"], "handshake_required");

    let response = pipe
        .request(json!({ "id": 2, "command": "handshake" }))
        .await;
    assert_eq!(response["ok"], true);
    assert_eq!(
        response["result"]["protocol_version"],
        ensemble::PROTOCOL_VERSION
    );
}

#[tokio::test]
async fn test_put_get_over_the_wire() {
    let mut pipe = Pipe::open(service());
    pipe.request(json!({ "id": 1, "command": "handshake" })).await;

    let response = pipe
        .request(json!({ "id": 2, "command": "put", "params": { "payload": [1, 2, 3] } }))
        .await;
    assert_eq!(response["ok"], true);
    let id = response["result"]["id"].as_str().unwrap().to_string();

    let response = pipe
        .request(json!({ "id": 3, "command": "get", "params": { "id": id } }))
        .await;
    assert_eq!(response["result"]["payload"], json!([1, 2, 3]));
}

#[tokio::test]
async fn test_call_over_the_wire() {
    let mut pipe = Pipe::open(service());
    pipe.request(json!({ "id": 1, "command": "handshake" })).await;

    let response = pipe
        .request(json!({
            "id": 2,
            "command": "call",
            "params": {
                "function": "shout",
                "args": [{ "value": [104, 105] }],
            },
        }))
        .await;
    assert_eq!(response["ok"], true);
    let result = response["result"]["result"].as_str().unwrap().to_string();

    let response = pipe
        .request(json!({ "id": 3, "command": "get", "params": { "id": result } }))
        .await;
    // "hi!"
    assert_eq!(response["result"]["payload"], json!([104, 105, 33]));
}

#[tokio::test]
async fn test_unknown_command_is_rejected() {
    let mut pipe = Pipe::open(service());
    pipe.request(json!({ "id": 1, "command": "handshake" })).await;

    let response = pipe
        .request(json!({ "id": 2, "command": "frobnicate" }))
        .await;
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["code"], "unknown_command");
}

#[tokio::test]
async fn test_errors_carry_stable_codes() {
    let mut pipe = Pipe::open(service());
    pipe.request(json!({ "id": 1, "command": "handshake" })).await;

    let response = pipe
        .request(json!({
            "id": 2,
            "command": "call",
            "params": { "function": "never_registered" },
        }))
        .await;
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["code"], "task_error");
}

#[tokio::test]
async fn test_sync_client_round_trip_over_tcp() {
    let service = service();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = service.serve(listener).await;
    });

    let outcome = tokio::task::spawn_blocking(move || {
        let mut client = ServiceClient::connect(addr, Duration::from_secs(5)).unwrap();
        client.handshake().unwrap();

        let id = client.put(b"round trip").unwrap();
        assert_eq!(client.get(&id).unwrap(), b"round trip");

        let result = client.call("shout", &[b"hey".as_slice()]).unwrap();
        assert_eq!(client.get(&result).unwrap(), b"hey!");

        let status = client.status().unwrap();
        assert!(status.store.objects >= 2);
    })
    .await;
    outcome.unwrap();
}
