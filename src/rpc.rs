//! Transport boundary collaborators.
//!
//! [`RpcClient`] is the sole transport seam: synchronous calls, task
//! submission, event subscription and authentication. Wire framing is
//! the client's problem, not ours. Inbound traffic (events, entity
//! change notifications, connection loss) is delivered as
//! [`TransportMessage`]s into an mpsc channel handed over through
//! `register_events`; the transport never mutates shell state directly.

use async_trait::async_trait;
use mockall::automock;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;

pub type TaskId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum RpcErrorKind {
    /// Socket-level failure; triggers the reconnect loop.
    Transport,
    /// The remote dispatcher rejected or failed the call.
    Remote,
    /// Authentication failure; forces session termination.
    Auth,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind} error: {message}")]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub code: Option<i64>,
    pub message: String,
}

impl RpcError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: RpcErrorKind::Transport,
            code: None,
            message: message.into(),
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self {
            kind: RpcErrorKind::Remote,
            code: None,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self {
            kind: RpcErrorKind::Auth,
            code: None,
            message: message.into(),
        }
    }
}

/// One wire-level query predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterEntry {
    Cond(String, FilterOp, Value),
    /// Negated group, produced by the `exclude` pipe command.
    Nor(Vec<FilterEntry>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
pub enum FilterOp {
    #[strum(serialize = "=")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = "~")]
    Match,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = ">=")]
    Ge,
    #[strum(serialize = "<=")]
    Le,
}

impl FilterOp {
    /// Grammar operators compile to wire operators; `==` and `~=` have
    /// shorter wire spellings. Mutation operators do not compile.
    pub fn from_operator(op: crate::tokenizer::Operator) -> Option<Self> {
        use crate::tokenizer::Operator;
        match op {
            Operator::Eq => Some(FilterOp::Eq),
            Operator::Ne => Some(FilterOp::Ne),
            Operator::Match => Some(FilterOp::Match),
            Operator::Gt => Some(FilterOp::Gt),
            Operator::Lt => Some(FilterOp::Lt),
            Operator::Ge => Some(FilterOp::Ge),
            Operator::Le => Some(FilterOp::Le),
            Operator::Assign | Operator::Inc | Operator::Dec => None,
        }
    }
}

impl FilterEntry {
    pub fn to_wire(&self) -> Value {
        match self {
            FilterEntry::Cond(field, op, value) => {
                json!([field, op.to_string(), value])
            }
            FilterEntry::Nor(entries) => {
                json!(["nor", entries.iter().map(|e| e.to_wire()).collect::<Vec<_>>()])
            }
        }
    }
}

/// Query options accumulated from compiled pipe stages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterParams {
    pub sort: Vec<String>,
    pub limit: Option<u64>,
    pub single: bool,
}

impl FilterParams {
    pub fn single() -> Self {
        Self {
            single: true,
            ..Default::default()
        }
    }

    pub fn to_wire(&self) -> Value {
        let mut obj = serde_json::Map::new();
        if !self.sort.is_empty() {
            obj.insert("sort".to_string(), json!(self.sort));
        }
        if let Some(limit) = self.limit {
            obj.insert("limit".to_string(), json!(limit));
        }
        if self.single {
            obj.insert("single".to_string(), json!(true));
        }
        Value::Object(obj)
    }
}

pub fn filters_to_wire(filter: &[FilterEntry]) -> Value {
    Value::Array(filter.iter().map(|f| f.to_wire()).collect())
}

/// A remote event as published by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct ShellEvent {
    pub name: String,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOperation {
    Update,
    Delete,
}

/// Change notification from the entity-subscriber replica.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityEvent {
    pub collection: String,
    pub operation: EntityOperation,
    pub key: Value,
    pub entity: Option<Value>,
}

/// Everything the transport can push at us.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    Event(ShellEvent),
    Entity(EntityEvent),
    ConnectionLost,
    LoggedOut,
}

#[automock]
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn connect(&self, hostname: &str) -> Result<(), RpcError>;
    async fn disconnect(&self) -> Result<(), RpcError>;
    fn is_open(&self) -> bool;

    /// Synchronous RPC call.
    async fn call(&self, method: &str, args: Value) -> Result<Value, RpcError>;
    /// Submits a task and waits for its terminal state in one call.
    async fn call_task_sync(&self, task: &str, args: Value) -> Result<Value, RpcError>;
    /// Submits a task, returning its id immediately.
    async fn submit_task(&self, task: &str, args: Value) -> Result<TaskId, RpcError>;
    /// Fire-and-forget remote abort signal.
    async fn abort_task(&self, id: TaskId) -> Result<(), RpcError>;

    async fn subscribe_events(&self, masks: &[String]) -> Result<(), RpcError>;
    /// Hands the transport the single inbound message queue.
    fn register_events(&self, sender: mpsc::UnboundedSender<TransportMessage>);

    async fn login_user(&self, username: &str, password: &str) -> Result<(), RpcError>;
    async fn login_token(&self, token: &str) -> Result<(), RpcError>;
    fn token(&self) -> Option<String>;
}

/// Continuously-updated local replica of remote collections.
#[automock]
#[async_trait]
pub trait EntitySubscriber: Send + Sync {
    async fn query(
        &self,
        collection: &str,
        filter: &[FilterEntry],
        params: &FilterParams,
    ) -> Result<Vec<Value>, RpcError>;
    async fn get_one(&self, collection: &str, filter: &[FilterEntry])
        -> Result<Option<Value>, RpcError>;
    async fn wait_ready(&self, collection: &str) -> Result<(), RpcError>;
    /// Update/delete notifications arrive as [`TransportMessage::Entity`]
    /// on the registered queue.
    fn register_observers(&self, collection: &str, sender: mpsc::UnboundedSender<TransportMessage>);
}
