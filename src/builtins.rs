//! Builtin and pipe commands.
//!
//! Builtins are available in every scope and shadow namespace names on
//! lookup. Pipe commands only ever appear on the right side of `|`;
//! the filtering ones compile into the source query when the source
//! supports it and fall back to local row processing otherwise.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lazy_static::lazy_static;
use serde_json::{json, Value};

use crate::command::{Arguments, Command, CommandEnv, CommandError};
use crate::namespace::apply_filter;
use crate::output::{value_to_string, Column, Output, Table, ValueType};
use crate::rpc::{FilterEntry, FilterOp, FilterParams};
use crate::tokenizer::Operator;

lazy_static! {
    static ref BUILTINS: HashMap<&'static str, Arc<dyn Command>> = {
        let mut map: HashMap<&'static str, Arc<dyn Command>> = HashMap::new();
        map.insert("help", Arc::new(HelpCommand));
        map.insert("exit", Arc::new(ExitCommand));
        map.insert("setenv", Arc::new(SetenvCommand));
        map.insert("printenv", Arc::new(PrintenvCommand));
        map.insert("saveenv", Arc::new(SaveenvCommand));
        map.insert("echo", Arc::new(EchoCommand));
        map.insert("login", Arc::new(LoginCommand));
        map.insert("eval", Arc::new(EvalCommand));
        map.insert("history", Arc::new(HistoryCommand));
        map.insert("abort", Arc::new(AbortCommand));
        map
    };
    static ref PIPES: HashMap<&'static str, Arc<dyn Command>> = {
        let mut map: HashMap<&'static str, Arc<dyn Command>> = HashMap::new();
        map.insert("search", Arc::new(SearchPipeCommand));
        map.insert("exclude", Arc::new(ExcludePipeCommand));
        map.insert("sort", Arc::new(SortPipeCommand));
        map.insert("limit", Arc::new(LimitPipeCommand));
        map.insert("select", Arc::new(SelectPipeCommand));
        map
    };
}

pub fn builtin(name: &str) -> Option<Arc<dyn Command>> {
    BUILTINS.get(name).cloned()
}

pub fn pipe_command(name: &str) -> Option<Arc<dyn Command>> {
    PIPES.get(name).cloned()
}

pub fn builtin_names() -> Vec<&'static str> {
    let mut names = BUILTINS.keys().copied().collect::<Vec<_>>();
    names.sort();
    names
}

struct HelpCommand;

#[async_trait]
impl Command for HelpCommand {
    fn description(&self) -> String {
        "Lists what can be run in the current scope".to_string()
    }

    async fn run(
        &self,
        env: &mut CommandEnv<'_>,
        args: &Arguments,
    ) -> Result<Output, CommandError> {
        let node = env.current();
        if let Some(topic) = args.positional_str(0) {
            if let Some(command) = node.commands().get(&topic).cloned().or_else(|| builtin(&topic))
            {
                return Ok(Output::Message(format!("{}: {}", topic, command.description())));
            }
            return Err(CommandError::Usage(format!("no help for '{}'", topic)));
        }

        let name_columns = || {
            vec![
                Column {
                    label: "Name".to_string(),
                    accessor: "name".to_string(),
                    vt: ValueType::String,
                },
                Column {
                    label: "Description".to_string(),
                    accessor: "description".to_string(),
                    vt: ValueType::String,
                },
            ]
        };

        let mut commands = node
            .commands()
            .into_iter()
            .map(|(name, cmd)| json!({"name": name, "description": cmd.description()}))
            .collect::<Vec<_>>();
        for name in builtin_names() {
            if let Some(cmd) = builtin(name) {
                commands.push(json!({"name": name, "description": cmd.description()}));
            }
        }
        commands.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

        let mut namespaces = node
            .group_children()
            .into_iter()
            .map(|c| json!({"name": c.name, "description": c.description}))
            .collect::<Vec<_>>();
        // Item scopes list their nested collections; group children are
        // already covered above.
        if matches!(&node.kind, crate::namespace::NodeKind::Item { .. }) {
            namespaces.extend(
                node.static_child_names()
                    .into_iter()
                    .map(|n| json!({"name": n, "description": ""})),
            );
        }

        Ok(Output::Sequence(vec![
            Output::Message("Commands:".to_string()),
            Output::Table(Table {
                columns: name_columns(),
                rows: commands,
            }),
            Output::Message("Namespaces:".to_string()),
            Output::Table(Table {
                columns: name_columns(),
                rows: namespaces,
            }),
        ]))
    }
}

struct ExitCommand;

#[async_trait]
impl Command for ExitCommand {
    fn description(&self) -> String {
        "Leaves the shell".to_string()
    }

    async fn run(
        &self,
        _env: &mut CommandEnv<'_>,
        _args: &Arguments,
    ) -> Result<Output, CommandError> {
        Err(CommandError::Exit(0))
    }
}

struct SetenvCommand;

#[async_trait]
impl Command for SetenvCommand {
    fn description(&self) -> String {
        "Sets session variables".to_string()
    }

    async fn run(
        &self,
        env: &mut CommandEnv<'_>,
        args: &Arguments,
    ) -> Result<Output, CommandError> {
        if args.kwargs.is_empty() {
            return Err(CommandError::Usage(
                "usage: setenv <variable>=<value> ...".to_string(),
            ));
        }
        for (name, value) in &args.kwargs {
            env.context.variables.set(name, value)?;
        }
        Ok(Output::None)
    }
}

struct PrintenvCommand;

#[async_trait]
impl Command for PrintenvCommand {
    fn description(&self) -> String {
        "Prints session variables".to_string()
    }

    async fn run(
        &self,
        env: &mut CommandEnv<'_>,
        args: &Arguments,
    ) -> Result<Output, CommandError> {
        if let Some(name) = args.positional_str(0) {
            let value = env
                .context
                .variables
                .get(&name)
                .ok_or_else(|| CommandError::Usage(format!("no variable '{}'", name)))?;
            return Ok(Output::Scalar(value));
        }
        let rows = env
            .context
            .variables
            .all_printable()
            .into_iter()
            .map(|(name, value)| json!({"name": name, "value": value}))
            .collect();
        Ok(Output::Table(Table {
            columns: vec![
                Column {
                    label: "Variable".to_string(),
                    accessor: "name".to_string(),
                    vt: ValueType::String,
                },
                Column {
                    label: "Value".to_string(),
                    accessor: "value".to_string(),
                    vt: ValueType::String,
                },
            ],
            rows,
        }))
    }
}

struct SaveenvCommand;

#[async_trait]
impl Command for SaveenvCommand {
    fn description(&self) -> String {
        "Saves session variables to a file".to_string()
    }

    async fn run(
        &self,
        env: &mut CommandEnv<'_>,
        args: &Arguments,
    ) -> Result<Output, CommandError> {
        let path = args.positional_str(0);
        env.context
            .variables
            .save(path.as_deref().map(std::path::Path::new))?;
        Ok(Output::Message(match path {
            Some(p) => format!("Configuration saved to {}", p),
            None => "Configuration saved".to_string(),
        }))
    }
}

struct EchoCommand;

#[async_trait]
impl Command for EchoCommand {
    fn description(&self) -> String {
        "Prints its arguments".to_string()
    }

    async fn run(
        &self,
        _env: &mut CommandEnv<'_>,
        args: &Arguments,
    ) -> Result<Output, CommandError> {
        let line = args
            .positional
            .iter()
            .map(value_to_string)
            .collect::<Vec<_>>()
            .join(" ");
        Ok(Output::Message(line))
    }
}

struct LoginCommand;

#[async_trait]
impl Command for LoginCommand {
    fn description(&self) -> String {
        "Authenticates this session".to_string()
    }

    async fn run(
        &self,
        env: &mut CommandEnv<'_>,
        args: &Arguments,
    ) -> Result<Output, CommandError> {
        let username = args
            .positional_str(0)
            .ok_or_else(|| CommandError::Usage("usage: login <username> <password>".to_string()))?;
        let password = args.positional_str(1).unwrap_or_default();
        env.context.client.login_user(&username, &password).await?;
        Ok(Output::Message(format!("Logged in as {}", username)))
    }
}

/// Listing and description entry for `eval`; the evaluator intercepts
/// the name itself, since re-evaluating a line needs the evaluator.
struct EvalCommand;

#[async_trait]
impl Command for EvalCommand {
    fn description(&self) -> String {
        "Evaluates its arguments as command lines".to_string()
    }

    async fn run(
        &self,
        _env: &mut CommandEnv<'_>,
        _args: &Arguments,
    ) -> Result<Output, CommandError> {
        Err(CommandError::Usage("usage: eval <line> ...".to_string()))
    }
}

struct HistoryCommand;

#[async_trait]
impl Command for HistoryCommand {
    fn description(&self) -> String {
        "Lists previously typed lines".to_string()
    }

    async fn run(
        &self,
        env: &mut CommandEnv<'_>,
        _args: &Arguments,
    ) -> Result<Output, CommandError> {
        let rows = env
            .context
            .history()
            .into_iter()
            .enumerate()
            .map(|(i, line)| json!({"number": i + 1, "command": line}))
            .collect();
        Ok(Output::Table(Table {
            columns: vec![
                Column {
                    label: "#".to_string(),
                    accessor: "number".to_string(),
                    vt: ValueType::Number,
                },
                Column {
                    label: "Command".to_string(),
                    accessor: "command".to_string(),
                    vt: ValueType::String,
                },
            ],
            rows,
        }))
    }
}

struct AbortCommand;

#[async_trait]
impl Command for AbortCommand {
    fn description(&self) -> String {
        "Aborts a running task by id".to_string()
    }

    async fn run(
        &self,
        env: &mut CommandEnv<'_>,
        args: &Arguments,
    ) -> Result<Output, CommandError> {
        let id = args
            .positional
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| CommandError::Usage("usage: abort <task id>".to_string()))?;
        env.context.tasks.abort(id).await?;
        Ok(Output::Message(format!("Abort of task #{} requested", id)))
    }
}

/// Shared by the filtering pipes: compile this stage's arguments in
/// isolation, for the local fallback path.
fn stage_query(
    command: &dyn Command,
    args: &Arguments,
) -> Result<(Vec<FilterEntry>, FilterParams), CommandError> {
    let mut filter = Vec::new();
    let mut params = FilterParams::default();
    command.serialize_filter(args, &mut filter, &mut params)?;
    Ok((filter, params))
}

fn pipe_rows(input: &Output) -> Result<(Vec<Column>, Vec<Value>), CommandError> {
    match input {
        Output::Table(table) => Ok((table.columns.clone(), table.rows.clone())),
        _ => Err(CommandError::Usage(
            "previous command did not produce rows".to_string(),
        )),
    }
}

fn condition(
    left: &str,
    op: Operator,
    right: &Value,
) -> Result<FilterEntry, CommandError> {
    let op = FilterOp::from_operator(op).ok_or_else(|| {
        CommandError::Usage(format!("operator '{}' cannot be used in a filter", op))
    })?;
    Ok(FilterEntry::Cond(left.to_string(), op, right.clone()))
}

struct SearchPipeCommand;

#[async_trait]
impl Command for SearchPipeCommand {
    fn description(&self) -> String {
        "Keeps rows matching every condition".to_string()
    }

    fn serializes_filter(&self) -> bool {
        true
    }

    fn serialize_filter(
        &self,
        args: &Arguments,
        filter: &mut Vec<FilterEntry>,
        _params: &mut FilterParams,
    ) -> Result<(), CommandError> {
        if !args.positional.is_empty() {
            return Err(CommandError::Usage(
                "usage: search <property> <op> <value> ...".to_string(),
            ));
        }
        for (left, value) in &args.kwargs {
            filter.push(FilterEntry::Cond(left.clone(), FilterOp::Eq, value.clone()));
        }
        for (left, op, value) in &args.opargs {
            filter.push(condition(left, *op, value)?);
        }
        Ok(())
    }

    async fn run(
        &self,
        _env: &mut CommandEnv<'_>,
        _args: &Arguments,
    ) -> Result<Output, CommandError> {
        Err(CommandError::Usage(
            "search can only be used after a pipe".to_string(),
        ))
    }

    async fn run_pipe(
        &self,
        _env: &mut CommandEnv<'_>,
        args: &Arguments,
        input: Output,
    ) -> Result<Output, CommandError> {
        let (filter, params) = stage_query(self, args)?;
        let (columns, rows) = pipe_rows(&input)?;
        Ok(Output::Table(Table {
            columns,
            rows: apply_filter(rows, &filter, &params),
        }))
    }
}

struct ExcludePipeCommand;

#[async_trait]
impl Command for ExcludePipeCommand {
    fn description(&self) -> String {
        "Drops rows matching any condition".to_string()
    }

    fn serializes_filter(&self) -> bool {
        true
    }

    fn serialize_filter(
        &self,
        args: &Arguments,
        filter: &mut Vec<FilterEntry>,
        _params: &mut FilterParams,
    ) -> Result<(), CommandError> {
        let mut group = Vec::new();
        for (left, value) in &args.kwargs {
            group.push(FilterEntry::Cond(left.clone(), FilterOp::Eq, value.clone()));
        }
        for (left, op, value) in &args.opargs {
            group.push(condition(left, *op, value)?);
        }
        if group.is_empty() {
            return Err(CommandError::Usage(
                "usage: exclude <property> <op> <value> ...".to_string(),
            ));
        }
        filter.push(FilterEntry::Nor(group));
        Ok(())
    }

    async fn run(
        &self,
        _env: &mut CommandEnv<'_>,
        _args: &Arguments,
    ) -> Result<Output, CommandError> {
        Err(CommandError::Usage(
            "exclude can only be used after a pipe".to_string(),
        ))
    }

    async fn run_pipe(
        &self,
        _env: &mut CommandEnv<'_>,
        args: &Arguments,
        input: Output,
    ) -> Result<Output, CommandError> {
        let (filter, params) = stage_query(self, args)?;
        let (columns, rows) = pipe_rows(&input)?;
        Ok(Output::Table(Table {
            columns,
            rows: apply_filter(rows, &filter, &params),
        }))
    }
}

struct SortPipeCommand;

#[async_trait]
impl Command for SortPipeCommand {
    fn description(&self) -> String {
        "Orders rows by one or more properties".to_string()
    }

    fn serializes_filter(&self) -> bool {
        true
    }

    fn serialize_filter(
        &self,
        args: &Arguments,
        _filter: &mut Vec<FilterEntry>,
        params: &mut FilterParams,
    ) -> Result<(), CommandError> {
        if args.positional.is_empty() {
            return Err(CommandError::Usage("usage: sort <property> ...".to_string()));
        }
        for value in &args.positional {
            params.sort.push(value_to_string(value));
        }
        Ok(())
    }

    async fn run(
        &self,
        _env: &mut CommandEnv<'_>,
        _args: &Arguments,
    ) -> Result<Output, CommandError> {
        Err(CommandError::Usage(
            "sort can only be used after a pipe".to_string(),
        ))
    }

    async fn run_pipe(
        &self,
        _env: &mut CommandEnv<'_>,
        args: &Arguments,
        input: Output,
    ) -> Result<Output, CommandError> {
        let (filter, params) = stage_query(self, args)?;
        let (columns, rows) = pipe_rows(&input)?;
        Ok(Output::Table(Table {
            columns,
            rows: apply_filter(rows, &filter, &params),
        }))
    }
}

struct LimitPipeCommand;

#[async_trait]
impl Command for LimitPipeCommand {
    fn description(&self) -> String {
        "Caps the number of rows".to_string()
    }

    fn serializes_filter(&self) -> bool {
        true
    }

    fn serialize_filter(
        &self,
        args: &Arguments,
        _filter: &mut Vec<FilterEntry>,
        params: &mut FilterParams,
    ) -> Result<(), CommandError> {
        let count = args
            .positional
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| CommandError::Usage("usage: limit <count>".to_string()))?;
        params.limit = Some(count);
        Ok(())
    }

    async fn run(
        &self,
        _env: &mut CommandEnv<'_>,
        _args: &Arguments,
    ) -> Result<Output, CommandError> {
        Err(CommandError::Usage(
            "limit can only be used after a pipe".to_string(),
        ))
    }

    async fn run_pipe(
        &self,
        _env: &mut CommandEnv<'_>,
        args: &Arguments,
        input: Output,
    ) -> Result<Output, CommandError> {
        let (filter, params) = stage_query(self, args)?;
        let (columns, rows) = pipe_rows(&input)?;
        Ok(Output::Table(Table {
            columns,
            rows: apply_filter(rows, &filter, &params),
        }))
    }
}

struct SelectPipeCommand;

#[async_trait]
impl Command for SelectPipeCommand {
    fn description(&self) -> String {
        "Projects one property out of each row".to_string()
    }

    async fn run(
        &self,
        _env: &mut CommandEnv<'_>,
        _args: &Arguments,
    ) -> Result<Output, CommandError> {
        Err(CommandError::Usage(
            "select can only be used after a pipe".to_string(),
        ))
    }

    async fn run_pipe(
        &self,
        _env: &mut CommandEnv<'_>,
        args: &Arguments,
        input: Output,
    ) -> Result<Output, CommandError> {
        let field = args
            .positional_str(0)
            .ok_or_else(|| CommandError::Usage("usage: select <property>".to_string()))?;
        match input {
            Output::Table(table) => Ok(Output::Sequence(
                table
                    .rows
                    .iter()
                    .map(|row| Output::Scalar(row.get(&field).cloned().unwrap_or(Value::Null)))
                    .collect(),
            )),
            Output::Object(items) => items
                .iter()
                .find(|item| item.name == field)
                .map(|item| Output::Scalar(item.value.clone()))
                .ok_or_else(|| CommandError::Usage(format!("no property '{}'", field))),
            _ => Err(CommandError::Usage(
                "previous command did not produce rows".to_string(),
            )),
        }
    }
}
