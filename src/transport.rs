//! Line-delimited JSON transport.
//!
//! One TCP connection carries newline-separated JSON frames in both
//! directions. Outbound frames are `{"id", "method", "args"}`; the
//! remote answers `{"id", "result"}` or `{"id", "error"}` and pushes
//! unsolicited `{"event", "data"}` frames. A reader task owns the read
//! half and routes responses to per-call channels and pushes to the
//! registered inbound queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::rpc::{
    filters_to_wire, EntityEvent, EntityOperation, EntitySubscriber, FilterEntry, FilterParams,
    RpcClient, RpcError, ShellEvent, TaskId, TransportMessage,
};

const DEFAULT_PORT: u16 = 5915;

type Pending = Arc<DashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>;
type EventSlot = Arc<std::sync::RwLock<Option<mpsc::UnboundedSender<TransportMessage>>>>;

pub struct TcpRpcClient {
    writer: Mutex<Option<OwnedWriteHalf>>,
    pending: Pending,
    events: EventSlot,
    seq: AtomicU64,
    token: std::sync::RwLock<Option<String>>,
}

impl Default for TcpRpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpRpcClient {
    pub fn new() -> Self {
        Self {
            writer: Mutex::new(None),
            pending: Arc::new(DashMap::new()),
            events: Arc::new(std::sync::RwLock::new(None)),
            seq: AtomicU64::new(1),
            token: std::sync::RwLock::new(None),
        }
    }

    async fn send_frame(&self, frame: Value) -> Result<(), RpcError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| RpcError::transport("not connected"))?;
        let mut line = frame.to_string();
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| RpcError::transport(e.to_string()))
    }

    fn store_token(&self, result: &Value) {
        if let Some(token) = result.get("token").and_then(Value::as_str) {
            *self
                .token
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(token.to_string());
        }
    }
}

fn push_inbound(events: &EventSlot, message: TransportMessage) {
    let slot = events
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(sender) = &*slot {
        let _ = sender.send(message);
    }
}

/// Turns a pushed frame into the message the shell consumes. Entity
/// change notifications and forced logouts have dedicated shapes;
/// everything else stays a plain event.
fn translate_event(name: &str, data: Value) -> TransportMessage {
    if name == "server.logged_out" {
        return TransportMessage::LoggedOut;
    }
    if name == "entity.changed" {
        let collection = data
            .get("collection")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let operation = match data.get("operation").and_then(Value::as_str) {
            Some("delete") => EntityOperation::Delete,
            _ => EntityOperation::Update,
        };
        let key = data.get("key").cloned().unwrap_or(Value::Null);
        let entity = data.get("entity").cloned();
        return TransportMessage::Entity(EntityEvent {
            collection,
            operation,
            key,
            entity,
        });
    }
    TransportMessage::Event(ShellEvent {
        name: name.to_string(),
        data,
    })
}

async fn reader_loop(read_half: OwnedReadHalf, pending: Pending, events: EventSlot) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("transport read failed: {}", e);
                break;
            }
        };
        let frame: Value = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("dropping malformed frame: {}", e);
                continue;
            }
        };
        if let Some(id) = frame.get("id").and_then(Value::as_u64) {
            if let Some((_, sender)) = pending.remove(&id) {
                let outcome = match frame.get("error") {
                    Some(error) => {
                        let message = error
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("remote call failed")
                            .to_string();
                        let code = error.get("code").and_then(Value::as_i64);
                        if error.get("auth").and_then(Value::as_bool) == Some(true) {
                            Err(RpcError {
                                kind: crate::rpc::RpcErrorKind::Auth,
                                code,
                                message,
                            })
                        } else {
                            Err(RpcError {
                                kind: crate::rpc::RpcErrorKind::Remote,
                                code,
                                message,
                            })
                        }
                    }
                    None => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
                };
                let _ = sender.send(outcome);
            }
            continue;
        }
        if let Some(name) = frame.get("event").and_then(Value::as_str) {
            let data = frame.get("data").cloned().unwrap_or(Value::Null);
            push_inbound(&events, translate_event(name, data));
        }
    }

    // Fail every in-flight call, then tell the shell.
    let ids = pending.iter().map(|e| *e.key()).collect::<Vec<_>>();
    for id in ids {
        if let Some((_, sender)) = pending.remove(&id) {
            let _ = sender.send(Err(RpcError::transport("connection closed")));
        }
    }
    push_inbound(&events, TransportMessage::ConnectionLost);
}

#[async_trait]
impl RpcClient for TcpRpcClient {
    async fn connect(&self, hostname: &str) -> Result<(), RpcError> {
        let stream = TcpStream::connect((hostname, DEFAULT_PORT))
            .await
            .map_err(|e| RpcError::transport(e.to_string()))?;
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        tokio::spawn(reader_loop(
            read_half,
            self.pending.clone(),
            self.events.clone(),
        ));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RpcError> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.writer.try_lock().map(|w| w.is_some()).unwrap_or(true)
    }

    async fn call(&self, method: &str, args: Value) -> Result<Value, RpcError> {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(id, sender);
        if let Err(e) = self
            .send_frame(json!({"id": id, "method": method, "args": args}))
            .await
        {
            self.pending.remove(&id);
            return Err(e);
        }
        receiver
            .await
            .map_err(|_| RpcError::transport("connection closed"))?
    }

    async fn call_task_sync(&self, task: &str, args: Value) -> Result<Value, RpcError> {
        self.call("task.submit_sync", json!([task, args])).await
    }

    async fn submit_task(&self, task: &str, args: Value) -> Result<TaskId, RpcError> {
        let result = self.call("task.submit", json!([task, args])).await?;
        result
            .as_i64()
            .ok_or_else(|| RpcError::remote("task.submit returned no task id"))
    }

    async fn abort_task(&self, id: TaskId) -> Result<(), RpcError> {
        self.call("task.abort", json!([id])).await?;
        Ok(())
    }

    async fn subscribe_events(&self, masks: &[String]) -> Result<(), RpcError> {
        self.call("event.subscribe", json!(masks)).await?;
        Ok(())
    }

    fn register_events(&self, sender: mpsc::UnboundedSender<TransportMessage>) {
        *self
            .events
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sender);
    }

    async fn login_user(&self, username: &str, password: &str) -> Result<(), RpcError> {
        let result = self.call("auth.login", json!([username, password])).await?;
        self.store_token(&result);
        Ok(())
    }

    async fn login_token(&self, token: &str) -> Result<(), RpcError> {
        let result = self.call("auth.token", json!([token])).await?;
        self.store_token(&result);
        Ok(())
    }

    fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Entity-subscriber access through plain RPC calls; the server keeps
/// the replica, we just query it.
pub struct RpcEntitySubscriber {
    client: Arc<dyn RpcClient>,
}

impl RpcEntitySubscriber {
    pub fn new(client: Arc<dyn RpcClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EntitySubscriber for RpcEntitySubscriber {
    async fn query(
        &self,
        collection: &str,
        filter: &[FilterEntry],
        params: &FilterParams,
    ) -> Result<Vec<Value>, RpcError> {
        let result = self
            .client
            .call(
                "entity-subscriber.query",
                json!([collection, filters_to_wire(filter), params.to_wire()]),
            )
            .await?;
        match result {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            single => Ok(vec![single]),
        }
    }

    async fn get_one(
        &self,
        collection: &str,
        filter: &[FilterEntry],
    ) -> Result<Option<Value>, RpcError> {
        Ok(self
            .query(collection, filter, &FilterParams::single())
            .await?
            .into_iter()
            .next())
    }

    async fn wait_ready(&self, collection: &str) -> Result<(), RpcError> {
        self.client
            .call("entity-subscriber.wait_ready", json!([collection]))
            .await?;
        Ok(())
    }

    fn register_observers(
        &self,
        _collection: &str,
        _sender: mpsc::UnboundedSender<TransportMessage>,
    ) {
        // Entity change frames already arrive on the client's single
        // inbound queue; there is nothing extra to wire per collection.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_translate_entity_event() {
        let message = translate_event(
            "entity.changed",
            json!({"collection": "users", "operation": "delete", "key": "bob"}),
        );
        assert_eq!(
            message,
            TransportMessage::Entity(EntityEvent {
                collection: "users".to_string(),
                operation: EntityOperation::Delete,
                key: json!("bob"),
                entity: None,
            })
        );
    }

    #[test]
    fn test_translate_logout_and_plain_events() {
        assert_eq!(
            translate_event("server.logged_out", Value::Null),
            TransportMessage::LoggedOut
        );
        assert_eq!(
            translate_event("volume.changed", json!({"name": "tank"})),
            TransportMessage::Event(ShellEvent {
                name: "volume.changed".to_string(),
                data: json!({"name": "tank"}),
            })
        );
    }

    #[tokio::test]
    async fn test_call_round_trip_over_socket() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            let frame: Value = serde_json::from_slice(&buf[..n]).unwrap();
            assert_eq!(frame["method"], json!("management.ping"));
            let reply = json!({"id": frame["id"], "result": "pong"});
            socket
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();
        });

        let client = TcpRpcClient::new();
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        *client.writer.lock().await = Some(write_half);
        tokio::spawn(reader_loop(
            read_half,
            client.pending.clone(),
            client.events.clone(),
        ));

        let result = client.call("management.ping", json!([])).await.unwrap();
        assert_eq!(result, json!("pong"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_calls_fail_on_disconnect() {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            drop(socket);
        });

        let client = TcpRpcClient::new();
        client.register_events(inbound_tx);
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        *client.writer.lock().await = Some(write_half);
        tokio::spawn(reader_loop(
            read_half,
            client.pending.clone(),
            client.events.clone(),
        ));

        let err = client.call("management.ping", json!([])).await.unwrap_err();
        assert_eq!(err.kind, crate::rpc::RpcErrorKind::Transport);
        server.await.unwrap();
        assert_eq!(
            inbound_rx.recv().await,
            Some(TransportMessage::ConnectionLost)
        );
    }
}
