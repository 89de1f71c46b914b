//! Task submission and completion tracking.
//!
//! Remote mutations run as tasks. The runtime keeps a completion
//! callback per submitted task, fed by `task.updated` events flowing
//! through the single inbound queue. Callbacks have no expiry: after a
//! reconnect [`TaskRuntime::resync`] re-checks every pending task, so a
//! callback fires at most once and is never dropped by a connection
//! blip.
//!
//! Blocking waits divert the update stream to a private channel guarded
//! by a single-holder lock; a second blocking submission while one is
//! in flight fails fast instead of interleaving progress output.

use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::output::ProgressReporter;
use crate::rpc::{RpcClient, RpcError, TaskId};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum TaskState {
    Created,
    Waiting,
    Executing,
    Rollback,
    Finished,
    Failed,
    Aborted,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Aborted | TaskState::Cancelled
        )
    }
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task #{id} failed: {message}")]
    Failed { id: TaskId, message: String },
    #[error("task #{id} was {state}")]
    NotCompleted { id: TaskId, state: TaskState },
    #[error("another task is already being waited on")]
    DivertBusy,
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// One parsed `task.updated` or `task.progress` event.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub id: TaskId,
    pub state: Option<TaskState>,
    pub percentage: Option<f64>,
    pub message: Option<String>,
}

impl TaskUpdate {
    pub fn parse(data: &Value) -> Option<Self> {
        let id = data.get("id")?.as_i64()?;
        let state = data
            .get("state")
            .and_then(Value::as_str)
            .and_then(|s| TaskState::from_str(s).ok());
        Some(Self {
            id,
            state,
            percentage: data.get("percentage").and_then(Value::as_f64),
            message: data.get("message").and_then(Value::as_str).map(str::to_string),
        })
    }
}

type Callback = Box<dyn FnOnce(TaskId, TaskState) + Send + Sync>;

pub struct TaskRuntime {
    client: Arc<dyn RpcClient>,
    callbacks: DashMap<TaskId, Callback>,
    divert: Mutex<()>,
    diverted: std::sync::RwLock<Option<mpsc::UnboundedSender<TaskUpdate>>>,
}

impl TaskRuntime {
    pub fn new(client: Arc<dyn RpcClient>) -> Self {
        Self {
            client,
            callbacks: DashMap::new(),
            divert: Mutex::new(()),
            diverted: std::sync::RwLock::new(None),
        }
    }

    /// Feeds one task event through the runtime. Must be called from
    /// the single queue consumer; callback registration racing this is
    /// not supported.
    pub fn handle_event(&self, data: &Value) {
        let update = match TaskUpdate::parse(data) {
            Some(update) => update,
            None => {
                tracing::debug!("ignoring malformed task event: {}", data);
                return;
            }
        };
        if let Some(sender) = &*read_diverted(&self.diverted) {
            // The blocking waiter filters by id and sees every update.
            let _ = sender.send(update.clone());
        }
        if let Some(state) = update.state {
            if state.is_terminal() {
                if let Some((id, callback)) = self.callbacks.remove(&update.id) {
                    callback(id, state);
                }
            }
        }
    }

    /// Submits a task and registers a completion callback fired exactly
    /// once when the task reaches a terminal state.
    pub async fn submit(
        &self,
        name: &str,
        args: Value,
        on_done: impl FnOnce(TaskId, TaskState) + Send + Sync + 'static,
    ) -> Result<TaskId, TaskError> {
        let id = self.client.submit_task(name, args).await?;
        self.callbacks.insert(id, Box::new(on_done));
        tracing::debug!(task = name, id, "task submitted");
        Ok(id)
    }

    /// Submits a task and waits for its terminal state, streaming
    /// progress to the reporter. Fails fast when another wait holds the
    /// diversion lock.
    pub async fn submit_and_wait(
        &self,
        name: &str,
        args: Value,
        progress: &mut dyn ProgressReporter,
    ) -> Result<TaskId, TaskError> {
        let _guard = self.divert.try_lock().map_err(|_| TaskError::DivertBusy)?;
        let (sender, mut receiver) = mpsc::unbounded_channel();
        *write_diverted(&self.diverted) = Some(sender);
        let _restore = DivertReset { slot: &self.diverted };

        let id = self.client.submit_task(name, args).await?;
        tracing::debug!(task = name, id, "waiting for task");

        while let Some(update) = receiver.recv().await {
            if update.id != id {
                continue;
            }
            progress.update(update.percentage, update.message.as_deref());
            if let Some(state) = update.state {
                if state.is_terminal() {
                    progress.finish();
                    return match state {
                        TaskState::Finished => Ok(id),
                        TaskState::Failed => Err(TaskError::Failed {
                            id,
                            message: self.fetch_error(id).await,
                        }),
                        other => Err(TaskError::NotCompleted { id, state: other }),
                    };
                }
            }
        }
        progress.finish();
        Err(TaskError::Rpc(RpcError::transport(
            "connection lost while waiting for task",
        )))
    }

    /// Error text of a failed task, from its remote status record.
    async fn fetch_error(&self, id: TaskId) -> String {
        match self.client.call("task.status", json!([id])).await {
            Ok(status) => status
                .get("error")
                .and_then(|e| e.get("message"))
                .or_else(|| status.get("error"))
                .map(crate::output::value_to_string)
                .unwrap_or_else(|| "no error details".to_string()),
            Err(e) => format!("status unavailable: {}", e),
        }
    }

    pub async fn abort(&self, id: TaskId) -> Result<(), TaskError> {
        self.client.abort_task(id).await?;
        Ok(())
    }

    pub fn pending_ids(&self) -> Vec<TaskId> {
        self.callbacks.iter().map(|entry| *entry.key()).collect()
    }

    /// After a reconnect, re-checks every task still holding a
    /// callback; tasks that finished while the connection was down fire
    /// their callbacks now.
    pub async fn resync(&self) {
        for id in self.pending_ids() {
            let status = match self.client.call("task.status", json!([id])).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(id, "cannot resync task: {}", e);
                    continue;
                }
            };
            let state = status
                .get("state")
                .and_then(Value::as_str)
                .and_then(|s| TaskState::from_str(s).ok());
            if let Some(state) = state {
                if state.is_terminal() {
                    if let Some((id, callback)) = self.callbacks.remove(&id) {
                        callback(id, state);
                    }
                }
            }
        }
    }
}

fn read_diverted<'a>(
    slot: &'a std::sync::RwLock<Option<mpsc::UnboundedSender<TaskUpdate>>>,
) -> std::sync::RwLockReadGuard<'a, Option<mpsc::UnboundedSender<TaskUpdate>>> {
    slot.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_diverted<'a>(
    slot: &'a std::sync::RwLock<Option<mpsc::UnboundedSender<TaskUpdate>>>,
) -> std::sync::RwLockWriteGuard<'a, Option<mpsc::UnboundedSender<TaskUpdate>>> {
    slot.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct DivertReset<'a> {
    slot: &'a std::sync::RwLock<Option<mpsc::UnboundedSender<TaskUpdate>>>,
}

impl Drop for DivertReset<'_> {
    fn drop(&mut self) {
        *write_diverted(self.slot) = None;
    }
}
