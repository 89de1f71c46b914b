//! Shared session context.
//!
//! One [`Context`] value is cloned into everything that needs the
//! transport, the session variables or the task runtime. It carries no
//! navigation state; the path stack stays with the evaluator.

use std::sync::{Arc, Mutex};

use crate::config::VariableStore;
use crate::output::{ProgressReporter, SilentProgress};
use crate::rpc::{EntitySubscriber, RpcClient};
use crate::task::TaskRuntime;
use tokio::sync::mpsc;

type ProgressFactory = Arc<dyn Fn() -> Box<dyn ProgressReporter> + Send + Sync>;

/// Lines kept for the `history` builtin.
const HISTORY_LIMIT: usize = 1000;

/// Lines queued for printing between prompt cycles, so background
/// completions never corrupt the line being edited.
pub type DeferredSender = mpsc::UnboundedSender<String>;

#[derive(Clone)]
pub struct Context {
    pub client: Arc<dyn RpcClient>,
    pub subscriber: Arc<dyn EntitySubscriber>,
    pub variables: Arc<VariableStore>,
    pub tasks: Arc<TaskRuntime>,
    pub hostname: String,
    deferred: DeferredSender,
    progress: ProgressFactory,
    history: Arc<Mutex<Vec<String>>>,
}

impl Context {
    pub fn new(
        client: Arc<dyn RpcClient>,
        subscriber: Arc<dyn EntitySubscriber>,
        hostname: &str,
        deferred: DeferredSender,
    ) -> Self {
        Self {
            tasks: Arc::new(TaskRuntime::new(client.clone())),
            client,
            subscriber,
            variables: Arc::new(VariableStore::new()),
            hostname: hostname.to_string(),
            deferred,
            progress: Arc::new(|| Box::new(SilentProgress)),
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Records one typed line for the `history` builtin, keeping the
    /// most recent entries.
    pub fn record_history(&self, line: &str) {
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        history.push(line.to_string());
        if history.len() > HISTORY_LIMIT {
            let overflow = history.len() - HISTORY_LIMIT;
            history.drain(..overflow);
        }
    }

    pub fn history(&self) -> Vec<String> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Installs the reporter the embedding program wants for blocking
    /// task waits.
    pub fn set_progress_factory(
        &mut self,
        factory: impl Fn() -> Box<dyn ProgressReporter> + Send + Sync + 'static,
    ) {
        self.progress = Arc::new(factory);
    }

    pub fn progress(&self) -> Box<dyn ProgressReporter> {
        (self.progress)()
    }

    /// Queues a line for the next prompt cycle.
    pub fn defer_print(&self, line: impl Into<String>) {
        let _ = self.deferred.send(line.into());
    }

    pub fn deferred_sender(&self) -> DeferredSender {
        self.deferred.clone()
    }
}
