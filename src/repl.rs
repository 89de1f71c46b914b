//! Interactive loop plumbing.
//!
//! [`MainLoop`] glues the evaluator to the transport: it drains the
//! single inbound message queue between prompt cycles, routes task
//! events into the runtime, reacts to entity deletions by pruning the
//! path, and supervises reconnection after a connection loss. Terminal
//! handling itself stays in the embedding program; the loop only deals
//! in lines.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use crate::command::CommandError;
use crate::context::Context;
use crate::eval::Evaluator;
use crate::namespace::Node;
use crate::output::{Output, Renderer};
use crate::rpc::{EntityOperation, RpcErrorKind, TransportMessage};

/// Seconds between reconnection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Keepalive ping period.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    Exit(i32),
    LoggedOut,
    AuthFailed,
}

pub struct MainLoop {
    context: Context,
    evaluator: Evaluator,
    renderer: Arc<dyn Renderer>,
    inbound: mpsc::UnboundedReceiver<TransportMessage>,
    deferred: mpsc::UnboundedReceiver<String>,
    connected: bool,
    stop: Option<Stop>,
}

impl MainLoop {
    pub fn new(
        context: Context,
        root: Arc<Node>,
        renderer: Arc<dyn Renderer>,
        inbound: mpsc::UnboundedReceiver<TransportMessage>,
        deferred: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            evaluator: Evaluator::new(context.clone(), root),
            context,
            renderer,
            inbound,
            deferred,
            connected: true,
            stop: None,
        }
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// Prompt string from the `prompt` session variable template.
    pub fn prompt(&self) -> String {
        self.context
            .variables
            .get_string("prompt")
            .replace("{host}", &self.context.hostname)
            .replace("{path}", &self.evaluator.prompt_path())
    }

    /// Handles one typed line. Returns `Some` when the session should
    /// end.
    pub async fn process(&mut self, line: &str) -> Option<Stop> {
        self.drain();
        if let Some(stop) = self.stop {
            return Some(stop);
        }
        if !self.connected {
            if let Some(stop) = self.reconnect().await {
                return Some(stop);
            }
        }

        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        self.context.record_history(line);
        // `?` is not part of the grammar; it is prompt shorthand.
        let rewritten;
        let line = if line == "?" {
            "help"
        } else if let Some(rest) = line.strip_prefix("? ") {
            rewritten = format!("help {}", rest);
            &rewritten
        } else {
            line
        };

        match self.evaluator.eval_line(line).await {
            Ok(Output::None) => {}
            Ok(output) => self.renderer.render(&output),
            Err(CommandError::Exit(code)) => return Some(Stop::Exit(code)),
            Err(err) => self.report(&err),
        }
        self.drain();
        self.stop
    }

    fn report(&self, err: &CommandError) {
        let text = match err {
            CommandError::Syntax(e) => format!("Syntax error: {}", e),
            CommandError::Usage(m) => m.clone(),
            CommandError::Namespace(e) => format!("Error: {}", e),
            CommandError::Value(e) => format!("Error: {}", e),
            CommandError::Config(e) => format!("Error: {}", e),
            CommandError::Rpc(e) => match e.kind {
                RpcErrorKind::Transport => format!("Connection error: {}", e.message),
                RpcErrorKind::Auth => format!("Authentication error: {}", e.message),
                RpcErrorKind::Remote => format!("Remote error: {}", e.message),
            },
            CommandError::Task(e) => format!("Error: {}", e),
            CommandError::Exit(_) => return,
        };
        self.renderer.message(&text);
        if self.context.variables.get_bool("debug") {
            self.renderer.message(&format!("debug: {:?}", err));
        }
    }

    /// Empties the inbound and deferred queues. Called between prompt
    /// cycles so background traffic never interleaves with rendering.
    pub fn drain(&mut self) {
        while let Ok(message) = self.inbound.try_recv() {
            self.handle_message(message);
        }
        while let Ok(line) = self.deferred.try_recv() {
            self.renderer.message(&line);
        }
    }

    fn handle_message(&mut self, message: TransportMessage) {
        match message {
            TransportMessage::Event(event) => {
                if event.name.starts_with("task.") {
                    self.context.tasks.handle_event(&event.data);
                    return;
                }
                if self.context.variables.get_bool("show_events") {
                    self.renderer
                        .message(&format!("Event: {} {}", event.name, event.data));
                }
            }
            TransportMessage::Entity(event) => match event.operation {
                EntityOperation::Update => {
                    if let Some(doc) = &event.entity {
                        self.evaluator
                            .refresh_entity(&event.collection, &event.key, doc);
                    }
                }
                EntityOperation::Delete => {
                    if self.evaluator.prune_deleted(&event.collection, &event.key) {
                        self.renderer.message(&format!(
                            "The {} entry you were in was deleted; moved back to its collection",
                            event.collection
                        ));
                    }
                }
            },
            TransportMessage::ConnectionLost => {
                self.connected = false;
                self.renderer
                    .message("Connection to the appliance was lost; will reconnect");
            }
            TransportMessage::LoggedOut => {
                self.renderer.message("Logged out by the server");
                self.stop = Some(Stop::LoggedOut);
            }
        }
    }

    /// Reconnection loop: fixed delay, reconnect, re-authenticate,
    /// resubscribe, resync pending tasks. A rejected re-authentication
    /// ends the session.
    async fn reconnect(&mut self) -> Option<Stop> {
        loop {
            tokio::time::sleep(RECONNECT_DELAY).await;
            tracing::info!(host = %self.context.hostname, "reconnecting");
            if let Err(e) = self.context.client.connect(&self.context.hostname).await {
                tracing::warn!("reconnect failed: {}", e);
                continue;
            }

            let login = match self.context.client.token() {
                Some(token) => self.context.client.login_token(&token).await,
                None if is_local(&self.context.hostname) => {
                    let user = std::env::var("USER").unwrap_or_else(|_| "root".to_string());
                    self.context.client.login_user(&user, "").await
                }
                None => {
                    self.renderer
                        .message("Session cannot be re-authenticated; please log in again");
                    return Some(Stop::AuthFailed);
                }
            };
            if let Err(e) = login {
                if e.kind == RpcErrorKind::Auth {
                    self.renderer
                        .message("Re-authentication was rejected; ending session");
                    return Some(Stop::AuthFailed);
                }
                tracing::warn!("login after reconnect failed: {}", e);
                continue;
            }

            if let Err(e) = self
                .context
                .client
                .subscribe_events(&[
                    "task.*".to_string(),
                    "entity-subscriber.*".to_string(),
                    "server.*".to_string(),
                ])
                .await
            {
                tracing::warn!("resubscribe failed: {}", e);
                continue;
            }
            self.context.tasks.resync().await;
            self.connected = true;
            self.renderer.message("Connection restored");
            return None;
        }
    }
}

fn is_local(hostname: &str) -> bool {
    matches!(hostname, "localhost" | "127.0.0.1" | "::1")
}

/// Periodic transport liveness probe; run this beside the prompt loop.
pub async fn keepalive(context: Context) {
    let mut interval = tokio::time::interval(KEEPALIVE_PERIOD);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if !context.client.is_open() {
            continue;
        }
        if let Err(e) = context.client.call("management.ping", json!([])).await {
            tracing::debug!("keepalive ping failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{EntityEvent, MockEntitySubscriber, MockRpcClient, ShellEvent};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRenderer {
        messages: Mutex<Vec<String>>,
        outputs: Mutex<Vec<Output>>,
    }

    impl Renderer for RecordingRenderer {
        fn render(&self, output: &Output) {
            self.outputs.lock().unwrap().push(output.clone());
        }
        fn message(&self, text: &str) {
            self.messages.lock().unwrap().push(text.to_string());
        }
    }

    struct Fixture {
        main: MainLoop,
        renderer: Arc<RecordingRenderer>,
        inbound: mpsc::UnboundedSender<TransportMessage>,
    }

    fn fixture() -> Fixture {
        let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let ctx = Context::new(
            Arc::new(MockRpcClient::new()),
            Arc::new(MockEntitySubscriber::new()),
            "appliance",
            deferred_tx,
        );
        let root = Node::group("", "root");
        root.attach(Node::group("system", "System settings"));
        let renderer = Arc::new(RecordingRenderer::default());
        Fixture {
            main: MainLoop::new(ctx, root, renderer.clone(), inbound_rx, deferred_rx),
            renderer,
            inbound: inbound_tx,
        }
    }

    #[tokio::test]
    async fn test_prompt_template() {
        let mut f = fixture();
        assert_eq!(f.main.prompt(), "appliance:/>");
        f.main.process("system").await;
        assert_eq!(f.main.prompt(), "appliance:/system>");
    }

    #[tokio::test]
    async fn test_question_mark_is_help() {
        let mut f = fixture();
        assert_eq!(f.main.process("?").await, None);
        let outputs = f.renderer.outputs.lock().unwrap();
        assert!(matches!(outputs.first(), Some(Output::Sequence(_))));
    }

    #[tokio::test]
    async fn test_typed_lines_reach_history() {
        let mut f = fixture();
        f.main.process("echo hi").await;
        f.main.process("history").await;
        let outputs = f.renderer.outputs.lock().unwrap();
        let Some(Output::Table(table)) = outputs.last() else {
            panic!("expected the history table");
        };
        assert_eq!(table.rows[0]["command"], json!("echo hi"));
        assert_eq!(table.rows[1]["command"], json!("history"));
    }

    #[tokio::test]
    async fn test_exit_stops_the_loop() {
        let mut f = fixture();
        assert_eq!(f.main.process("exit").await, Some(Stop::Exit(0)));
    }

    #[tokio::test]
    async fn test_syntax_error_is_reported_not_fatal() {
        let mut f = fixture();
        assert_eq!(f.main.process("echo {").await, None);
        let messages = f.renderer.messages.lock().unwrap();
        assert!(messages[0].starts_with("Syntax error:"));
    }

    #[tokio::test]
    async fn test_task_events_route_to_runtime() {
        let mut f = fixture();
        f.inbound
            .send(TransportMessage::Event(ShellEvent {
                name: "task.updated".to_string(),
                data: json!({"id": 5, "state": "FINISHED"}),
            }))
            .unwrap();
        f.main.process("").await;
        // Not rendered as an event line even with show_events on.
        assert!(f.renderer.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_other_events_respect_show_events() {
        let mut f = fixture();
        f.inbound
            .send(TransportMessage::Event(ShellEvent {
                name: "volume.changed".to_string(),
                data: json!({"name": "tank"}),
            }))
            .unwrap();
        f.main.process("").await;
        let first = f.renderer.messages.lock().unwrap().remove(0);
        assert!(first.starts_with("Event: volume.changed"));

        f.main.process("setenv show_events=no").await;
        f.inbound
            .send(TransportMessage::Event(ShellEvent {
                name: "volume.changed".to_string(),
                data: json!({"name": "tank"}),
            }))
            .unwrap();
        f.main.process("").await;
        assert!(f.renderer.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_entity_delete_prunes_and_reports() {
        let mut f = fixture();
        // Nothing on the path matches, so nothing is reported.
        f.inbound
            .send(TransportMessage::Entity(EntityEvent {
                collection: "users".to_string(),
                operation: EntityOperation::Delete,
                key: json!("bob"),
                entity: None,
            }))
            .unwrap();
        f.main.process("").await;
        assert!(f.renderer.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_logged_out_ends_session() {
        let mut f = fixture();
        f.inbound.send(TransportMessage::LoggedOut).unwrap();
        assert_eq!(f.main.process("echo hi").await, Some(Stop::LoggedOut));
    }
}
