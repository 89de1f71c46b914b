//! End-to-end shell behavior through the evaluator and main loop,
//! against mocked transport collaborators.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use remshell::command::CommandError;
use remshell::namespace::{
    apply_filter, EntityConfig, Loader, NestedLoader, NestedNamespace, NestedSaver, Node,
    PropertyMapping, TaskSaver,
};
use remshell::output::{Output, Renderer, ValueType};
use remshell::repl::MainLoop;
use remshell::rpc::{
    FilterEntry, FilterParams, MockEntitySubscriber, MockRpcClient, RpcError, ShellEvent,
    TransportMessage,
};
use remshell::{Context, Evaluator};

struct FixedLoader(Vec<Value>);

#[async_trait]
impl Loader for FixedLoader {
    async fn query(
        &self,
        filter: &[FilterEntry],
        params: &FilterParams,
        _parent: Option<&Value>,
    ) -> Result<Vec<Value>, RpcError> {
        Ok(apply_filter(self.0.clone(), filter, params))
    }
}

#[derive(Default)]
struct RecordingRenderer {
    messages: Mutex<Vec<String>>,
    outputs: Mutex<Vec<Output>>,
}

impl RecordingRenderer {
    fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    fn outputs(&self) -> Vec<Output> {
        self.outputs.lock().unwrap().clone()
    }
}

impl Renderer for RecordingRenderer {
    fn render(&self, output: &Output) {
        self.outputs.lock().unwrap().push(output.clone());
    }

    fn message(&self, text: &str) {
        self.messages.lock().unwrap().push(text.to_string());
    }
}

fn volume_rows() -> Vec<Value> {
    vec![
        json!({"name": "disk1", "compression": "off"}),
        json!({"name": "disk2", "compression": "lz4"}),
    ]
}

fn build_tree(client: Arc<dyn remshell::rpc::RpcClient>) -> Arc<Node> {
    let root = Node::group("", "root");

    root.attach(Node::collection(
        "volume",
        "Storage volumes",
        Arc::new(EntityConfig {
            key_field: "name".to_string(),
            properties: vec![
                PropertyMapping::new("name", "Volume name", "name", ValueType::String).read_only(),
                PropertyMapping::new("compression", "Compression", "compression", ValueType::String)
                    .with_enum(&["off", "lz4", "gzip"]),
            ],
            loader: Arc::new(FixedLoader(volume_rows())),
            saver: Arc::new(TaskSaver::new(
                Some("volume.create"),
                Some("volume.update"),
                Some("volume.destroy"),
            )),
            allows_create: true,
            allows_delete: true,
            required_props: vec!["name".to_string()],
            nested: Vec::new(),
        }),
    ));

    root.attach(Node::collection(
        "interface",
        "Network interfaces",
        Arc::new(EntityConfig {
            key_field: "name".to_string(),
            properties: vec![
                PropertyMapping::new("name", "Interface", "name", ValueType::String).read_only(),
                PropertyMapping::new("mtu", "MTU", "mtu", ValueType::Number),
            ],
            loader: Arc::new(FixedLoader(vec![
                json!({"name": "em0", "mtu": 1500, "aliases": [{"address": "10.0.0.1"}]}),
            ])),
            saver: Arc::new(TaskSaver::new(None, Some("network.interface.update"), None)),
            allows_create: false,
            allows_delete: false,
            required_props: Vec::new(),
            nested: vec![NestedNamespace {
                name: "aliases".to_string(),
                descr: "Interface addresses".to_string(),
                config: Arc::new(EntityConfig {
                    key_field: "address".to_string(),
                    properties: vec![
                        PropertyMapping::new("address", "Address", "address", ValueType::String),
                        PropertyMapping::new("netmask", "Netmask", "netmask", ValueType::Number),
                    ],
                    loader: Arc::new(NestedLoader::new("aliases")),
                    saver: Arc::new(NestedSaver::new("aliases")),
                    allows_create: true,
                    allows_delete: true,
                    required_props: vec!["address".to_string()],
                    nested: Vec::new(),
                }),
            }],
        }),
    ));

    let system = Node::group("system", "System settings");
    system.attach(Node::config_scope(
        "general",
        "General settings",
        Arc::new(EntityConfig {
            key_field: "hostname".to_string(),
            properties: vec![
                PropertyMapping::new("hostname", "Hostname", "hostname", ValueType::String),
                PropertyMapping::new("timezone", "Timezone", "timezone", ValueType::String),
            ],
            loader: Arc::new(remshell::namespace::RpcLoader::new(
                client,
                "system.general.query",
            )),
            saver: Arc::new(TaskSaver::new(None, Some("system.general.update"), None)),
            allows_create: false,
            allows_delete: false,
            required_props: Vec::new(),
            nested: Vec::new(),
        }),
    ));
    root.attach(system);

    root
}

struct Shell {
    main: MainLoop,
    renderer: Arc<RecordingRenderer>,
    inbound: mpsc::UnboundedSender<TransportMessage>,
    context: Context,
}

fn shell(client: MockRpcClient) -> Shell {
    let client: Arc<dyn remshell::rpc::RpcClient> = Arc::new(client);
    let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let context = Context::new(
        client.clone(),
        Arc::new(MockEntitySubscriber::new()),
        "appliance",
        deferred_tx,
    );
    let root = build_tree(client);
    let renderer = Arc::new(RecordingRenderer::default());
    Shell {
        main: MainLoop::new(
            context.clone(),
            root,
            renderer.clone(),
            inbound_rx,
            deferred_rx,
        ),
        renderer,
        inbound: inbound_tx,
        context,
    }
}

fn evaluator(client: MockRpcClient) -> Evaluator {
    let client: Arc<dyn remshell::rpc::RpcClient> = Arc::new(client);
    let (sender, _receiver) = mpsc::unbounded_channel();
    let ctx = Context::new(
        client.clone(),
        Arc::new(MockEntitySubscriber::new()),
        "appliance",
        sender,
    );
    Evaluator::new(ctx, build_tree(client))
}

#[tokio::test]
async fn test_set_submits_diff_and_reports_completion_later() {
    let mut client = MockRpcClient::new();
    client
        .expect_submit_task()
        .withf(|name, args| {
            name == "volume.update" && args == &json!(["disk1", {"compression": "gzip"}])
        })
        .returning(|_, _| Ok(42));
    let mut shell = shell(client);

    shell.main.process("volume disk1").await;
    assert_eq!(shell.main.prompt(), "appliance:/volume/disk1>");

    shell.main.process("set compression=gzip").await;
    assert_eq!(
        shell.renderer.outputs(),
        vec![Output::Message("Task #42 submitted".to_string())]
    );
    // The save committed, so navigating away is allowed right away.
    shell.main.process("..").await;
    assert_eq!(shell.main.prompt(), "appliance:/volume>");

    shell
        .inbound
        .send(TransportMessage::Event(ShellEvent {
            name: "task.updated".to_string(),
            data: json!({"id": 42, "state": "FINISHED"}),
        }))
        .unwrap();
    shell.main.process("").await;
    assert_eq!(shell.renderer.messages(), vec!["Task #42 finished"]);
}

#[tokio::test]
async fn test_blocking_task_failure_is_reported() {
    let mut client = MockRpcClient::new();
    client.expect_submit_task().returning(|_, _| Ok(9));
    client
        .expect_call()
        .withf(|method, args| method == "task.status" && args == &json!([9]))
        .returning(|_, _| Ok(json!({"error": {"message": "device busy"}})));
    let mut shell = shell(client);

    shell.main.process("setenv tasks_blocking=yes").await;
    shell.main.process("volume disk1").await;

    let tasks = shell.context.tasks.clone();
    let feeder = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tasks.handle_event(&json!({"id": 9, "state": "FAILED"}));
    });

    shell.main.process("set compression=gzip").await;
    feeder.await.unwrap();
    assert_eq!(
        shell.renderer.messages(),
        vec!["Error: task #9 failed: device busy"]
    );
}

#[tokio::test]
async fn test_unsaved_changes_block_navigation_until_discarded() {
    let mut eval = evaluator(MockRpcClient::new());
    eval.eval_line("volume disk1").await.unwrap();
    eval.current()
        .with_entity_mut(|e| e.working_mut()["compression"] = json!("gzip"));
    assert_eq!(eval.prompt_path(), "/volume/disk1 [modified]");

    let err = eval.eval_line("..").await.unwrap_err();
    assert!(matches!(err, CommandError::Usage(m) if m.contains("unsaved changes")));
    assert_eq!(eval.prompt_path(), "/volume/disk1 [modified]");

    let out = eval.eval_line("discard").await.unwrap();
    assert_eq!(out, Output::Message("Pending changes discarded".to_string()));
    eval.eval_line("..").await.unwrap();
    assert_eq!(eval.prompt_path(), "/volume");
}

#[tokio::test]
async fn test_nested_alias_create_saves_the_owning_interface() {
    let mut client = MockRpcClient::new();
    client
        .expect_submit_task()
        .withf(|name, args| {
            name == "network.interface.update"
                && args
                    == &json!([
                        "em0",
                        {"aliases": [
                            {"address": "10.0.0.1"},
                            {"address": "10.0.0.2", "netmask": 24},
                        ]}
                    ])
        })
        .returning(|_, _| Ok(7));
    let mut eval = evaluator(client);

    eval.eval_line("interface em0 aliases").await.unwrap();
    let out = eval
        .eval_line("create address=10.0.0.2 netmask=24")
        .await
        .unwrap();
    assert_eq!(out, Output::Message("Task #7 submitted".to_string()));
}

#[tokio::test]
async fn test_nested_alias_delete_rewrites_the_array() {
    let mut client = MockRpcClient::new();
    client
        .expect_submit_task()
        .withf(|name, args| {
            name == "network.interface.update" && args == &json!(["em0", {"aliases": []}])
        })
        .returning(|_, _| Ok(8));
    let mut eval = evaluator(client);

    eval.eval_line("interface em0 aliases").await.unwrap();
    let out = eval.eval_line("delete 10.0.0.1").await.unwrap();
    assert_eq!(out, Output::Message("Task #8 submitted".to_string()));
}

#[tokio::test]
async fn test_config_scope_loads_on_entry() {
    let mut client = MockRpcClient::new();
    client
        .expect_call()
        .withf(|method, _| method == "system.general.query")
        .returning(|_, _| Ok(json!([{"hostname": "nas", "timezone": "UTC"}])));
    let mut eval = evaluator(client);

    eval.eval_line("system general").await.unwrap();
    let out = eval.eval_line("get hostname").await.unwrap();
    assert_eq!(out, Output::Scalar(json!("nas")));
}

#[tokio::test]
async fn test_match_filter_uses_regex() {
    let mut eval = evaluator(MockRpcClient::new());
    eval.eval_line("volume").await.unwrap();
    let out = eval
        .eval_line("show | search name ~= \"disk1$\" | limit 1")
        .await
        .unwrap();
    let Output::Table(table) = out else {
        panic!("expected a table");
    };
    assert_eq!(table.rows, vec![json!({"name": "disk1", "compression": "off"})]);
}

#[tokio::test]
async fn test_exclude_pipe_drops_matching_rows() {
    let mut eval = evaluator(MockRpcClient::new());
    let out = eval
        .eval_line("volume show | exclude name == disk1")
        .await
        .unwrap();
    let Output::Table(table) = out else {
        panic!("expected a table");
    };
    assert_eq!(table.rows, vec![json!({"name": "disk2", "compression": "lz4"})]);
}

#[tokio::test]
async fn test_enum_violation_reported_without_submit() {
    let mut shell = shell(MockRpcClient::new());
    shell.main.process("volume disk1").await;
    shell.main.process("set compression=zstd").await;
    let messages = shell.renderer.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("not a valid value"));
    assert!(messages[0].contains("off, lz4, gzip"));
}
