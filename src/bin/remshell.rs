//! Interactive shell binary.
//!
//! Owns the terminal: prompt printing, line reading, ascii/json
//! rendering and progress display. Everything else lives in the
//! library.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use remshell::config::VariableStore;
use remshell::output::{value_to_string, Item, Output, ProgressReporter, Renderer, Table, ValueType};
use remshell::namespace::{
    EntityConfig, NestedLoader, NestedNamespace, NestedSaver, Node, PropertyMapping, RpcLoader,
    SubscriberLoader, TaskSaver,
};
use remshell::repl::{keepalive, MainLoop, Stop};
use remshell::rpc::RpcClient;
use remshell::transport::{RpcEntitySubscriber, TcpRpcClient};
use remshell::Context;

#[derive(Parser, Debug)]
#[command(name = "remshell", about = "Interactive appliance administration shell")]
struct Cli {
    /// Appliance to connect to.
    #[arg(default_value = "127.0.0.1")]
    hostname: String,

    /// Login username.
    #[arg(short, long)]
    user: Option<String>,

    /// Login password.
    #[arg(short, long, default_value = "")]
    password: String,

    /// Evaluate one command line and exit.
    #[arg(short = 'e', long = "command")]
    command: Option<String>,

    /// Session variable file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

struct AsciiRenderer {
    variables: Arc<VariableStore>,
}

impl AsciiRenderer {
    fn format_cell(&self, value: &Value, vt: ValueType) -> String {
        match (vt, value) {
            (_, Value::Null) => "none".to_string(),
            (ValueType::Boolean, Value::Bool(b)) => if *b { "yes" } else { "no" }.to_string(),
            (ValueType::Set | ValueType::Array, Value::Array(items)) => items
                .iter()
                .map(value_to_string)
                .collect::<Vec<_>>()
                .join(", "),
            _ => value_to_string(value),
        }
    }

    fn print_table(&self, table: &Table) {
        let mut widths = table
            .columns
            .iter()
            .map(|c| c.label.len())
            .collect::<Vec<_>>();
        let rows = table
            .rows
            .iter()
            .map(|row| {
                table
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(i, col)| {
                        let cell = self.format_cell(
                            row.get(&col.accessor).unwrap_or(&Value::Null),
                            col.vt,
                        );
                        widths[i] = widths[i].max(cell.len());
                        cell
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let header = table
            .columns
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{:<width$}", col.label, width = widths[i]))
            .collect::<Vec<_>>()
            .join("  ");
        println!("{}", header);
        println!("{}", "-".repeat(header.len()));
        for row in rows {
            let line = row
                .iter()
                .enumerate()
                .map(|(i, cell)| format!("{:<width$}", cell, width = widths[i]))
                .collect::<Vec<_>>()
                .join("  ");
            println!("{}", line.trim_end());
        }
    }

    fn print_object(&self, items: &[Item]) {
        let width = items.iter().map(|i| i.descr.len()).max().unwrap_or(0);
        for item in items {
            println!(
                "{:<width$}  {}",
                item.descr,
                self.format_cell(&item.value, item.vt),
                width = width
            );
        }
    }

    fn to_json(output: &Output) -> Value {
        match output {
            Output::Object(items) => Value::Object(
                items
                    .iter()
                    .map(|i| (i.name.clone(), i.value.clone()))
                    .collect(),
            ),
            Output::Table(table) => json!(table.rows),
            Output::Sequence(outputs) => json!(outputs.iter().map(Self::to_json).collect::<Vec<_>>()),
            Output::Message(text) => json!(text),
            Output::Scalar(value) => value.clone(),
            Output::None => Value::Null,
        }
    }
}

impl Renderer for AsciiRenderer {
    fn render(&self, output: &Output) {
        if self.variables.get_string("output_format") == "json" {
            match serde_json::to_string_pretty(&Self::to_json(output)) {
                Ok(text) => println!("{}", text),
                Err(e) => println!("render error: {}", e),
            }
            return;
        }
        match output {
            Output::Object(items) => self.print_object(items),
            Output::Table(table) => self.print_table(table),
            Output::Sequence(outputs) => {
                for (i, inner) in outputs.iter().enumerate() {
                    if i > 0 {
                        println!();
                    }
                    self.render(inner);
                }
            }
            Output::Message(text) => println!("{}", text),
            Output::Scalar(value) => println!("{}", value_to_string(value)),
            Output::None => {}
        }
    }

    fn message(&self, text: &str) {
        println!("{}", text);
    }
}

/// Prints task progress on one redrawn terminal line.
#[derive(Default)]
struct LineProgress {
    last_len: usize,
}

impl ProgressReporter for LineProgress {
    fn update(&mut self, percentage: Option<f64>, message: Option<&str>) {
        let mut line = String::new();
        if let Some(pct) = percentage {
            line.push_str(&format!("{:>3.0}% ", pct));
        }
        if let Some(msg) = message {
            line.push_str(msg);
        }
        let padding = self.last_len.saturating_sub(line.len());
        print!("\r{}{}", line, " ".repeat(padding));
        self.last_len = line.len();
        let _ = std::io::stdout().flush();
    }

    fn finish(&mut self) {
        if self.last_len > 0 {
            print!("\r{}\r", " ".repeat(self.last_len));
            let _ = std::io::stdout().flush();
        }
    }
}

fn user_properties() -> Vec<PropertyMapping> {
    vec![
        PropertyMapping::new("username", "Username", "username", ValueType::String),
        PropertyMapping::new("uid", "User ID", "uid", ValueType::Number).read_only(),
        PropertyMapping::new("fullname", "Full name", "full_name", ValueType::String),
        PropertyMapping::new("group", "Primary group", "group", ValueType::String),
        PropertyMapping::new("groups", "Auxiliary groups", "groups", ValueType::Set),
        PropertyMapping::new("shell", "Login shell", "shell", ValueType::String),
        PropertyMapping::new("home", "Home directory", "home", ValueType::String),
        PropertyMapping::new("locked", "Locked", "locked", ValueType::Boolean),
        PropertyMapping::new("password", "Password", "password", ValueType::String).hidden(),
    ]
}

fn group_properties() -> Vec<PropertyMapping> {
    vec![
        PropertyMapping::new("name", "Group name", "name", ValueType::String),
        PropertyMapping::new("gid", "Group ID", "gid", ValueType::Number).read_only(),
        PropertyMapping::new("builtin", "Builtin", "builtin", ValueType::Boolean).read_only(),
    ]
}

fn volume_properties() -> Vec<PropertyMapping> {
    vec![
        PropertyMapping::new("name", "Volume name", "id", ValueType::String),
        PropertyMapping::new("size", "Size", "properties.size", ValueType::Size).read_only(),
        PropertyMapping::new(
            "compression",
            "Compression",
            "properties.compression",
            ValueType::String,
        )
        .with_enum(&["off", "on", "lz4", "gzip", "zle"]),
        PropertyMapping::new("dedup", "Deduplication", "properties.dedup", ValueType::Boolean),
        PropertyMapping::new("status", "Status", "status", ValueType::String).read_only(),
    ]
}

fn interface_properties() -> Vec<PropertyMapping> {
    vec![
        PropertyMapping::new("name", "Interface", "id", ValueType::String),
        PropertyMapping::new("dhcp", "DHCP", "dhcp", ValueType::Boolean),
        PropertyMapping::new("enabled", "Enabled", "enabled", ValueType::Boolean),
        PropertyMapping::new("mtu", "MTU", "mtu", ValueType::Number),
        PropertyMapping::new("link_address", "Link address", "status.link_address", ValueType::String)
            .read_only(),
    ]
}

fn alias_properties() -> Vec<PropertyMapping> {
    vec![
        PropertyMapping::new("address", "Address", "address", ValueType::String),
        // v4 aliases only
        PropertyMapping::new("netmask", "Netmask", "netmask", ValueType::Number)
            .with_condition(|doc| doc["type"] != serde_json::json!("INET6")),
        PropertyMapping::new("type", "Type", "type", ValueType::String)
            .with_enum(&["INET", "INET6"]),
    ]
}

fn system_properties() -> Vec<PropertyMapping> {
    vec![
        PropertyMapping::new("hostname", "Hostname", "hostname", ValueType::String),
        PropertyMapping::new("description", "Description", "description", ValueType::String),
        PropertyMapping::new("timezone", "Timezone", "timezone", ValueType::String),
        PropertyMapping::new("console_keymap", "Console keymap", "console_keymap", ValueType::String),
    ]
}

/// Static scope tree served by the shell.
fn build_tree(context: &Context) -> Arc<Node> {
    let root = Node::group("", "Administrative shell root");

    let account = Node::group("account", "User and group accounts");
    account.attach(Node::collection(
        "user",
        "System users",
        Arc::new(EntityConfig {
            key_field: "username".to_string(),
            properties: user_properties(),
            loader: Arc::new(SubscriberLoader::new(context.subscriber.clone(), "user")),
            saver: Arc::new(TaskSaver::new(
                Some("user.create"),
                Some("user.update"),
                Some("user.delete"),
            )),
            allows_create: true,
            allows_delete: true,
            required_props: vec!["username".to_string()],
            nested: Vec::new(),
        }),
    ));
    account.attach(Node::collection(
        "group",
        "System groups",
        Arc::new(EntityConfig {
            key_field: "name".to_string(),
            properties: group_properties(),
            loader: Arc::new(SubscriberLoader::new(context.subscriber.clone(), "group")),
            saver: Arc::new(TaskSaver::new(
                Some("group.create"),
                None,
                Some("group.delete"),
            )),
            allows_create: true,
            allows_delete: true,
            required_props: vec!["name".to_string()],
            nested: Vec::new(),
        }),
    ));
    root.attach(account);

    root.attach(Node::collection(
        "volume",
        "Storage volumes",
        Arc::new(EntityConfig {
            key_field: "name".to_string(),
            properties: volume_properties(),
            loader: Arc::new(RpcLoader::new(context.client.clone(), "volume.query")),
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

    let network = Node::group("network", "Network configuration");
    network.attach(Node::collection(
        "interface",
        "Network interfaces",
        Arc::new(EntityConfig {
            key_field: "name".to_string(),
            properties: interface_properties(),
            loader: Arc::new(SubscriberLoader::new(
                context.subscriber.clone(),
                "network.interface",
            )),
            saver: Arc::new(TaskSaver::new(None, Some("network.interface.update"), None)),
            allows_create: false,
            allows_delete: false,
            required_props: Vec::new(),
            nested: vec![NestedNamespace {
                name: "aliases".to_string(),
                descr: "Interface addresses".to_string(),
                config: Arc::new(EntityConfig {
                    key_field: "address".to_string(),
                    properties: alias_properties(),
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
    root.attach(network);

    let system = Node::group("system", "System settings");
    system.attach(Node::config_scope(
        "general",
        "General system settings",
        Arc::new(EntityConfig {
            key_field: "hostname".to_string(),
            properties: system_properties(),
            loader: Arc::new(RpcLoader::new(
                context.client.clone(),
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

fn config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = &cli.config {
        return Some(path.clone());
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".remshellrc"))
}

async fn login(client: &dyn RpcClient, cli: &Cli) -> remshell::Result<()> {
    match &cli.user {
        Some(user) => client.login_user(user, &cli.password).await?,
        None => {
            let user = std::env::var("USER").unwrap_or_else(|_| "root".to_string());
            client.login_user(&user, &cli.password).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> remshell::Result<()> {
    let client: Arc<dyn RpcClient> = Arc::new(TcpRpcClient::new());
    client.connect(&cli.hostname).await?;
    login(client.as_ref(), &cli).await?;
    client
        .subscribe_events(&[
            "task.*".to_string(),
            "entity-subscriber.*".to_string(),
            "server.*".to_string(),
        ])
        .await?;

    let subscriber = Arc::new(RpcEntitySubscriber::new(client.clone()));
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
    client.register_events(inbound_tx);

    let mut context = Context::new(client, subscriber, &cli.hostname, deferred_tx);
    if let Some(path) = config_path(&cli) {
        context.variables.load(&path);
    }
    if cli.command.is_none() {
        context.set_progress_factory(|| Box::<LineProgress>::default());
    }

    let root = build_tree(&context);
    let renderer = Arc::new(AsciiRenderer {
        variables: context.variables.clone(),
    });
    let mut main_loop = MainLoop::new(
        context.clone(),
        root,
        renderer,
        inbound_rx,
        deferred_rx,
    );

    if let Some(line) = &cli.command {
        if let Some(Stop::Exit(code)) = main_loop.process(line).await {
            std::process::exit(code);
        }
        return Ok(());
    }

    tokio::spawn(keepalive(context));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} ", main_loop.prompt());
        std::io::stdout().flush()?;
        let line = match lines.next_line().await? {
            Some(line) => line,
            None => break,
        };
        match main_loop.process(&line).await {
            Some(Stop::Exit(code)) => std::process::exit(code),
            Some(Stop::LoggedOut) | Some(Stop::AuthFailed) => break,
            None => {}
        }
    }
    Ok(())
}
