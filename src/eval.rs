//! Line evaluation.
//!
//! The evaluator owns the path stack and turns parsed node lists into
//! command invocations. Scope resolution walks symbols left to right:
//! builtins shadow scope commands, scope commands shadow child
//! namespaces. Navigation is atomic; the path only moves when the whole
//! line resolves.
//!
//! Pipelines compile into a single remote query when the source command
//! supports filtering and every stage can serialize itself; otherwise
//! the source runs first and stages post-process its rows left to
//! right.

use std::sync::Arc;

use async_recursion::async_recursion;
use dashmap::DashMap;
use serde_json::{json, Value};

use crate::ast::Ast;
use crate::builtins::{builtin, builtin_names, pipe_command};
use crate::command::{Arguments, Command, CommandEnv, CommandError};
use crate::context::Context;
use crate::namespace::Node;
use crate::output::Output;
use crate::parser::{parse, SyntaxError};
use crate::rpc::FilterParams;
use crate::tokenizer::Operator;

pub struct Evaluator {
    context: Context,
    root: Arc<Node>,
    path: Vec<Arc<Node>>,
    /// Path before the last move; `-` swaps back to it.
    prev_path: Vec<Arc<Node>>,
    completion_cache: DashMap<String, Vec<String>>,
}

/// Splits a statement into the source segment and the pipe stages in
/// execution order.
fn flatten_pipes(nodes: Vec<Ast>) -> (Vec<Ast>, Vec<Vec<Ast>>) {
    let mut stages = Vec::new();
    let mut current = nodes;
    while current.len() == 1 && matches!(current[0], Ast::PipeExpr { .. }) {
        match current.pop() {
            Some(Ast::PipeExpr { left, right }) => {
                stages.push(right);
                current = left;
            }
            _ => break,
        }
    }
    stages.reverse();
    (current, stages)
}

fn common_prefix_len(a: &[Arc<Node>], b: &[Arc<Node>]) -> usize {
    a.iter()
        .zip(b.iter())
        .take_while(|(x, y)| Arc::ptr_eq(x, y))
        .count()
}

fn same_path(a: &[Arc<Node>], b: &[Arc<Node>]) -> bool {
    a.len() == b.len() && common_prefix_len(a, b) == a.len()
}

/// What source-segment resolution produced.
enum Resolution {
    Navigation,
    Command {
        command: Arc<dyn Command>,
        scope: Arc<Node>,
        args: Arguments,
    },
    /// `eval` re-enters the evaluator with its argument lines.
    Eval(Arguments),
}

impl Evaluator {
    pub fn new(context: Context, root: Arc<Node>) -> Self {
        Self {
            context,
            path: vec![root.clone()],
            prev_path: vec![root.clone()],
            root,
            completion_cache: DashMap::new(),
        }
    }

    pub fn current(&self) -> Arc<Node> {
        match self.path.last() {
            Some(node) => node.clone(),
            None => self.root.clone(),
        }
    }

    pub fn path(&self) -> &[Arc<Node>] {
        &self.path
    }

    /// Path rendered for the prompt, with pending-change markers.
    pub fn prompt_path(&self) -> String {
        if self.path.len() <= 1 {
            return "/".to_string();
        }
        let mut out = String::new();
        for node in self.path.iter().skip(1) {
            out.push('/');
            out.push_str(&node.display_name());
        }
        out
    }

    /// Evaluates one input line against the current path.
    #[tracing::instrument(level = "debug", skip(self, line))]
    pub async fn eval_line(&mut self, line: &str) -> Result<Output, CommandError> {
        self.completion_cache.clear();
        let nodes = parse(line)?;
        if nodes.is_empty() {
            return Ok(Output::None);
        }
        self.eval_nodes(nodes).await
    }

    #[async_recursion]
    async fn eval_nodes(&mut self, nodes: Vec<Ast>) -> Result<Output, CommandError> {
        let (source, stages) = flatten_pipes(nodes);
        let mut working = self.path.clone();

        match self.resolve(&mut working, &source).await? {
            Resolution::Navigation => {
                if !stages.is_empty() {
                    return Err(SyntaxError::NoCommand.into());
                }
                let keep = common_prefix_len(&self.path, &working);
                for dropped in &self.path[keep..] {
                    if !dropped.on_leave() {
                        return Err(CommandError::Usage(format!(
                            "'{}' has unsaved changes; save them with 'set' or drop them with 'discard'",
                            dropped.name
                        )));
                    }
                }
                for entered in &working[keep..] {
                    entered.on_enter().await?;
                }
                self.commit_path(working);
                Ok(Output::None)
            }
            Resolution::Eval(args) => {
                if !stages.is_empty() {
                    return Err(SyntaxError::NoCommand.into());
                }
                if args.positional.is_empty() {
                    return Err(CommandError::Usage(
                        "usage: eval <line> ...".to_string(),
                    ));
                }
                let mut outputs = Vec::new();
                for value in &args.positional {
                    let line = crate::output::value_to_string(value);
                    let nodes = parse(&line)?;
                    if nodes.is_empty() {
                        continue;
                    }
                    outputs.push(self.eval_nodes(nodes).await?);
                }
                Ok(if outputs.len() == 1 {
                    outputs.remove(0)
                } else if outputs.is_empty() {
                    Output::None
                } else {
                    Output::Sequence(outputs)
                })
            }
            Resolution::Command {
                command,
                scope,
                args,
            } => {
                let mut stage_cmds = Vec::new();
                for stage in &stages {
                    let name = match stage.first() {
                        Some(Ast::Symbol(name)) => name.clone(),
                        Some(Ast::CommandExpansion(_)) => {
                            return Err(SyntaxError::ExpansionAsCommand.into())
                        }
                        _ => return Err(SyntaxError::NoCommand.into()),
                    };
                    let stage_command = pipe_command(&name)
                        .ok_or(SyntaxError::PipeNotFound(name))?;
                    let stage_args = self.convert_args(&mut working, &stage[1..]).await?;
                    stage_cmds.push((stage_command, stage_args));
                }

                let ctx = self.context.clone();
                let before_run = working.clone();
                let mut env = CommandEnv {
                    context: &ctx,
                    path: &mut working,
                    node: scope,
                };

                let out = if stage_cmds.is_empty() {
                    command.run(&mut env, &args).await?
                } else if command.is_filtering()
                    && stage_cmds.iter().all(|(c, _)| c.serializes_filter())
                {
                    let mut filter = Vec::new();
                    let mut params = FilterParams::default();
                    for (stage_command, stage_args) in &stage_cmds {
                        stage_command.serialize_filter(stage_args, &mut filter, &mut params)?;
                    }
                    command.run_with_filter(&mut env, &args, filter, params).await?
                } else {
                    let mut out = command.run(&mut env, &args).await?;
                    for (stage_command, stage_args) in &stage_cmds {
                        out = stage_command.run_pipe(&mut env, stage_args, out).await?;
                    }
                    out
                };
                // Navigational commands may move the stack through the
                // environment; keep that on success. The prefix used
                // only to reach the command stays temporary.
                if !same_path(&before_run, &working) {
                    self.commit_path(working);
                }
                Ok(out)
            }
        }
    }

    /// Installs a resolved path stack, remembering the old one for `-`.
    fn commit_path(&mut self, working: Vec<Arc<Node>>) {
        if !same_path(&self.path, &working) {
            self.prev_path = std::mem::replace(&mut self.path, working);
        }
    }

    /// Walks the source segment: navigation symbols move the working
    /// path, the first command symbol ends the walk and claims the rest
    /// of the segment as arguments.
    async fn resolve(
        &mut self,
        working: &mut Vec<Arc<Node>>,
        exprs: &[Ast],
    ) -> Result<Resolution, CommandError> {
        for (i, expr) in exprs.iter().enumerate() {
            match expr {
                Ast::Symbol(name) if name == "/" => {
                    for node in &working[1..] {
                        if !node.on_leave() {
                            return Err(CommandError::Usage(format!(
                                "'{}' has unsaved changes; save them with 'set' or drop them with 'discard'",
                                node.name
                            )));
                        }
                    }
                    working.truncate(1);
                }
                Ast::Symbol(name) if name == ".." => {
                    if working.len() > 1 {
                        let top = working[working.len() - 1].clone();
                        if !top.on_leave() {
                            return Err(CommandError::Usage(format!(
                                "'{}' has unsaved changes; save them with 'set' or drop them with 'discard'",
                                top.name
                            )));
                        }
                        working.pop();
                    }
                }
                Ast::Symbol(name) if name == "-" => {
                    let target = self.prev_path.clone();
                    let keep = common_prefix_len(working, &target);
                    for node in &working[keep..] {
                        if !node.on_leave() {
                            return Err(CommandError::Usage(format!(
                                "'{}' has unsaved changes; save them with 'set' or drop them with 'discard'",
                                node.name
                            )));
                        }
                    }
                    *working = target;
                }
                Ast::Symbol(name) if name == "eval" => {
                    let args = self.convert_args(working, &exprs[i + 1..]).await?;
                    return Ok(Resolution::Eval(args));
                }
                Ast::Symbol(name) => {
                    let node = match working.last() {
                        Some(node) => node.clone(),
                        None => self.root.clone(),
                    };
                    if let Some(command) = builtin(name) {
                        let args = self.convert_args(working, &exprs[i + 1..]).await?;
                        return Ok(Resolution::Command {
                            command,
                            scope: node,
                            args,
                        });
                    }
                    if let Some(command) = node.commands().get(name.as_str()).cloned() {
                        let args = self.convert_args(working, &exprs[i + 1..]).await?;
                        return Ok(Resolution::Command {
                            command,
                            scope: node,
                            args,
                        });
                    }
                    match node.child(name).await? {
                        Some(child) => working.push(child),
                        None => return Err(SyntaxError::NotFound(name.clone()).into()),
                    }
                }
                Ast::CommandExpansion(_) => {
                    return Err(SyntaxError::ExpansionAsCommand.into())
                }
                _ => return Err(SyntaxError::NoCommand.into()),
            }
        }
        Ok(Resolution::Navigation)
    }

    /// Sorts the remaining expressions of a segment into positional
    /// arguments, `=` keywords and operator arguments, substituting
    /// command expansions with their scalar results.
    async fn convert_args(
        &mut self,
        working: &mut Vec<Arc<Node>>,
        exprs: &[Ast],
    ) -> Result<Arguments, CommandError> {
        let mut args = Arguments::default();
        for expr in exprs {
            match expr {
                Ast::Symbol(name) => args.positional.push(Value::String(name.clone())),
                Ast::Literal(value) => args.positional.push(value.clone()),
                Ast::Set(values) => args.positional.push(json!(values)),
                Ast::CommandExpansion(inner) => {
                    let value = self.eval_expansion(inner.clone()).await?;
                    args.positional.push(value);
                }
                Ast::BinaryExpr { left, op, right } => {
                    let value = match right.as_ref() {
                        Ast::Symbol(name) => Value::String(name.clone()),
                        Ast::Literal(value) => value.clone(),
                        Ast::Set(values) => json!(values),
                        Ast::CommandExpansion(inner) => {
                            self.eval_expansion(inner.clone()).await?
                        }
                        _ => return Err(SyntaxError::NoCommand.into()),
                    };
                    match op {
                        Operator::Assign => args.kwargs.push((left.clone(), value)),
                        other => args.opargs.push((left.clone(), *other, value)),
                    }
                }
                Ast::PipeExpr { .. } => return Err(SyntaxError::NoCommand.into()),
            }
        }
        Ok(args)
    }

    /// Runs an embedded `{ ... }` line and returns its scalar result.
    async fn eval_expansion(&mut self, inner: Vec<Ast>) -> Result<Value, CommandError> {
        let out = self.eval_nodes(inner).await?;
        out.as_scalar_string()
            .map(Value::String)
            .ok_or_else(|| SyntaxError::ExpansionNotScalar.into())
    }

    /// Completion candidates for a partial line, scoped to the current
    /// path. Results are cached until the next evaluated line.
    pub async fn complete(&self, line: &str) -> Vec<String> {
        let ends_with_space = line.ends_with(' ') || line.is_empty();
        let mut words = line.split_whitespace().collect::<Vec<_>>();
        let partial = if ends_with_space {
            String::new()
        } else {
            words.pop().unwrap_or("").to_string()
        };

        let mut node = self.current();
        let mut command: Option<Arc<dyn Command>> = None;
        for word in &words {
            if let Some(found) = builtin(word).or_else(|| node.commands().get(*word).cloned()) {
                command = Some(found);
                break;
            }
            match node.child(word).await {
                Ok(Some(child)) => node = child,
                _ => return Vec::new(),
            }
        }

        let cache_key = format!("{:p}|{}", Arc::as_ptr(&node), words.join(" "));
        let candidates = match self.completion_cache.get(&cache_key) {
            Some(hit) => hit.clone(),
            None => {
                let mut candidates = match command {
                    Some(command) => {
                        let ctx = self.context.clone();
                        let mut scratch = self.path.clone();
                        let env = CommandEnv {
                            context: &ctx,
                            path: &mut scratch,
                            node: node.clone(),
                        };
                        command.complete(&env).await
                    }
                    None => {
                        let mut candidates = builtin_names()
                            .into_iter()
                            .map(str::to_string)
                            .collect::<Vec<_>>();
                        candidates.extend(node.commands().keys().cloned());
                        candidates.extend(node.static_child_names());
                        candidates.extend(node.child_keys().await.unwrap_or_default());
                        candidates
                    }
                };
                candidates.sort();
                candidates.dedup();
                self.completion_cache.insert(cache_key, candidates.clone());
                candidates
            }
        };

        candidates
            .into_iter()
            .filter(|c| c.starts_with(&partial))
            .collect()
    }

    /// Reacts to a remote deletion: when the deleted entity is on the
    /// path, the path pops back to its collection. Returns true when
    /// the path moved.
    pub fn prune_deleted(&mut self, collection: &str, key: &Value) -> bool {
        let hit = self.path.iter().position(|node| {
            node.collection_name().as_deref() == Some(collection)
                && node.item_key().as_ref() == Some(key)
        });
        match hit {
            Some(index) => {
                self.path.truncate(index);
                if self.path.is_empty() {
                    self.path.push(self.root.clone());
                }
                self.completion_cache.clear();
                true
            }
            None => false,
        }
    }

    /// Reacts to a remote update: an unmodified entity on the path is
    /// reloaded in place so `show` reflects the latest document. An
    /// update that changed the primary key re-keys the path node.
    pub fn refresh_entity(&mut self, collection: &str, key: &Value, doc: &Value) {
        let mut rekeyed = false;
        for slot in self.path.iter_mut() {
            if slot.collection_name().as_deref() != Some(collection)
                || slot.item_key().as_ref() != Some(key)
                || slot.modified()
            {
                continue;
            }
            slot.with_entity_mut(|e| e.reload(doc.clone()));
            let new_name = slot
                .entity_config()
                .and_then(|c| doc.get(&c.key_field))
                .map(crate::output::value_to_string);
            if let Some(new_name) = new_name {
                if new_name != slot.name {
                    if let Some(renamed) = slot.rekey(&new_name) {
                        *slot = renamed;
                        rekeyed = true;
                    }
                }
            }
        }
        if rekeyed {
            self.completion_cache.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::{
        EntityConfig, Loader, PropertyMapping, SubscriberLoader, TaskSaver,
    };
    use crate::output::ValueType;
    use crate::rpc::{
        EntitySubscriber, FilterEntry, MockEntitySubscriber, MockRpcClient, RpcError,
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct CountingLoader {
        rows: Vec<Value>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Loader for CountingLoader {
        async fn query(
            &self,
            filter: &[FilterEntry],
            params: &FilterParams,
            _parent: Option<&Value>,
        ) -> Result<Vec<Value>, RpcError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(crate::namespace::apply_filter(
                self.rows.clone(),
                filter,
                params,
            ))
        }
    }

    fn user_rows() -> Vec<Value> {
        vec![
            json!({"username": "root", "uid": 0}),
            json!({"username": "alice", "uid": 1001}),
            json!({"username": "bob", "uid": 1002}),
        ]
    }

    fn build_tree(calls: Arc<AtomicUsize>) -> Arc<Node> {
        let root = Node::group("", "root");
        let account = Node::group("account", "Accounts");
        let users = Node::collection(
            "user",
            "Users",
            Arc::new(EntityConfig {
                key_field: "username".to_string(),
                properties: vec![
                    PropertyMapping::new("username", "Username", "username", ValueType::String)
                        .read_only(),
                    PropertyMapping::new("uid", "UID", "uid", ValueType::Number).read_only(),
                ],
                loader: Arc::new(CountingLoader {
                    rows: user_rows(),
                    calls,
                }),
                saver: Arc::new(TaskSaver::new(None, Some("user.update"), None)),
                allows_create: false,
                allows_delete: false,
                required_props: Vec::new(),
                nested: Vec::new(),
            }),
        );
        let network = Node::group("network", "Networking");
        root.attach(account.clone());
        root.attach(network);
        account.attach(users);
        root
    }

    fn evaluator() -> (Evaluator, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let root = build_tree(calls.clone());
        let (sender, _receiver) = mpsc::unbounded_channel();
        let ctx = Context::new(
            Arc::new(MockRpcClient::new()),
            Arc::new(MockEntitySubscriber::new()),
            "appliance",
            sender,
        );
        (Evaluator::new(ctx, root), calls)
    }

    #[tokio::test]
    async fn test_navigation_and_prompt_path() {
        let (mut eval, _) = evaluator();
        eval.eval_line("account user").await.unwrap();
        assert_eq!(eval.prompt_path(), "/account/user");
        eval.eval_line("..").await.unwrap();
        assert_eq!(eval.prompt_path(), "/account");
        eval.eval_line("/").await.unwrap();
        assert_eq!(eval.prompt_path(), "/");
    }

    #[tokio::test]
    async fn test_failed_navigation_leaves_path_untouched() {
        let (mut eval, _) = evaluator();
        eval.eval_line("account").await.unwrap();
        let err = eval.eval_line("user bogus show").await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::Syntax(SyntaxError::NotFound(name)) if name == "bogus"
        ));
        assert_eq!(eval.prompt_path(), "/account");
    }

    #[tokio::test]
    async fn test_command_does_not_move_the_path() {
        let (mut eval, _) = evaluator();
        let out = eval.eval_line("account user show").await.unwrap();
        assert!(matches!(out, Output::Table(_)));
        assert_eq!(eval.prompt_path(), "/");
    }

    #[tokio::test]
    async fn test_filtering_pipeline_issues_single_query() {
        let (mut eval, calls) = evaluator();
        eval.eval_line("account user").await.unwrap();
        calls.store(0, Ordering::SeqCst);

        let out = eval
            .eval_line("show | search uid > 1000 | sort username | limit 1")
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let Output::Table(table) = out else {
            panic!("expected a table");
        };
        assert_eq!(table.rows, vec![json!({"username": "alice", "uid": 1001})]);
    }

    #[tokio::test]
    async fn test_mixed_pipeline_falls_back_to_post_processing() {
        let (mut eval, _) = evaluator();
        eval.eval_line("account user").await.unwrap();
        let out = eval
            .eval_line("show | search uid > 1000 | select username")
            .await
            .unwrap();
        assert_eq!(
            out,
            Output::Sequence(vec![
                Output::Scalar(json!("alice")),
                Output::Scalar(json!("bob")),
            ])
        );
    }

    #[tokio::test]
    async fn test_unknown_pipe_command() {
        let (mut eval, _) = evaluator();
        eval.eval_line("account user").await.unwrap();
        let err = eval.eval_line("show | frobnicate").await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::Syntax(SyntaxError::PipeNotFound(name)) if name == "frobnicate"
        ));
    }

    #[tokio::test]
    async fn test_expansion_substitutes_scalar() {
        let (mut eval, _) = evaluator();
        let out = eval.eval_line("echo before { echo inner } after").await.unwrap();
        assert_eq!(out, Output::Message("before inner after".to_string()));
    }

    #[tokio::test]
    async fn test_expansion_cannot_name_a_command() {
        let (mut eval, _) = evaluator();
        let err = eval.eval_line("{ echo show } account").await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::Syntax(SyntaxError::ExpansionAsCommand)
        ));
    }

    #[tokio::test]
    async fn test_completion_prefix_on_namespaces() {
        let (eval, _) = evaluator();
        let candidates = eval.complete("netw").await;
        assert_eq!(candidates, vec!["network"]);
    }

    #[tokio::test]
    async fn test_completion_includes_collection_keys() {
        let (mut eval, _) = evaluator();
        eval.eval_line("account user").await.unwrap();
        let candidates = eval.complete("ali").await;
        assert_eq!(candidates, vec!["alice"]);
    }

    #[tokio::test]
    async fn test_dash_swaps_with_previous_path() {
        let (mut eval, _) = evaluator();
        eval.eval_line("account user").await.unwrap();
        eval.eval_line("/").await.unwrap();
        assert_eq!(eval.prompt_path(), "/");

        eval.eval_line("-").await.unwrap();
        assert_eq!(eval.prompt_path(), "/account/user");
        eval.eval_line("-").await.unwrap();
        assert_eq!(eval.prompt_path(), "/");
    }

    #[tokio::test]
    async fn test_dash_after_first_move_returns_to_root() {
        let (mut eval, _) = evaluator();
        eval.eval_line("account").await.unwrap();
        eval.eval_line("-").await.unwrap();
        assert_eq!(eval.prompt_path(), "/");
    }

    struct EnterChildCommand;

    #[async_trait]
    impl Command for EnterChildCommand {
        fn description(&self) -> String {
            "Moves into a named child scope".to_string()
        }

        async fn run(
            &self,
            env: &mut CommandEnv<'_>,
            args: &Arguments,
        ) -> Result<Output, CommandError> {
            let name = args
                .positional_str(0)
                .ok_or_else(|| CommandError::Usage("usage: enter <name>".to_string()))?;
            let child = env
                .current()
                .child(&name)
                .await?
                .ok_or_else(|| CommandError::Usage(format!("no child '{}'", name)))?;
            env.path.push(child);
            Ok(Output::None)
        }
    }

    #[tokio::test]
    async fn test_command_path_mutation_survives_success() {
        let (mut eval, _) = evaluator();
        eval.current().register_command("enter", Arc::new(EnterChildCommand));

        eval.eval_line("enter account").await.unwrap();
        assert_eq!(eval.prompt_path(), "/account");

        // A failing command keeps the path where it was.
        eval.eval_line("/").await.unwrap();
        eval.eval_line("enter bogus").await.unwrap_err();
        assert_eq!(eval.prompt_path(), "/");
    }

    #[tokio::test]
    async fn test_eval_reenters_the_evaluator() {
        let (mut eval, _) = evaluator();
        let out = eval.eval_line("eval \"echo hi\"").await.unwrap();
        assert_eq!(out, Output::Message("hi".to_string()));

        let out = eval.eval_line("eval \"account user show\"").await.unwrap();
        assert!(matches!(out, Output::Table(_)));

        eval.eval_line("eval \"account user\"").await.unwrap();
        assert_eq!(eval.prompt_path(), "/account/user");

        let err = eval.eval_line("eval").await.unwrap_err();
        assert!(matches!(err, CommandError::Usage(_)));
    }

    #[tokio::test]
    async fn test_refresh_rekeys_renamed_entity() {
        let subscriber: Arc<dyn EntitySubscriber> = {
            let mut mock = MockEntitySubscriber::new();
            mock.expect_get_one()
                .returning(|_, _| Ok(Some(json!({"username": "bob", "uid": 1002}))));
            Arc::new(mock)
        };
        let root = Node::group("", "root");
        let users = Node::collection(
            "user",
            "Users",
            Arc::new(EntityConfig {
                key_field: "username".to_string(),
                properties: vec![PropertyMapping::new(
                    "username",
                    "Username",
                    "username",
                    ValueType::String,
                )],
                loader: Arc::new(SubscriberLoader::new(subscriber.clone(), "users")),
                saver: Arc::new(TaskSaver::new(None, Some("user.update"), None)),
                allows_create: false,
                allows_delete: false,
                required_props: Vec::new(),
                nested: Vec::new(),
            }),
        );
        root.attach(users);
        let (sender, _receiver) = mpsc::unbounded_channel();
        let ctx = Context::new(
            Arc::new(MockRpcClient::new()),
            subscriber,
            "appliance",
            sender,
        );
        let mut eval = Evaluator::new(ctx, root);

        eval.eval_line("user bob").await.unwrap();
        assert_eq!(eval.prompt_path(), "/user/bob");

        eval.refresh_entity(
            "users",
            &json!("bob"),
            &json!({"username": "robert", "uid": 1002}),
        );
        assert_eq!(eval.prompt_path(), "/user/robert");
        assert_eq!(eval.current().item_key(), Some(json!("robert")));
    }

    #[tokio::test]
    async fn test_prune_deleted_pops_path() {
        let subscriber: Arc<dyn EntitySubscriber> = {
            let mut mock = MockEntitySubscriber::new();
            mock.expect_get_one()
                .returning(|_, _| Ok(Some(json!({"id": "bob", "username": "bob"}))));
            Arc::new(mock)
        };
        let root = Node::group("", "root");
        let users = Node::collection(
            "user",
            "Users",
            Arc::new(EntityConfig {
                key_field: "id".to_string(),
                properties: vec![PropertyMapping::new(
                    "username",
                    "Username",
                    "username",
                    ValueType::String,
                )],
                loader: Arc::new(SubscriberLoader::new(subscriber.clone(), "users")),
                saver: Arc::new(TaskSaver::new(None, None, None)),
                allows_create: false,
                allows_delete: false,
                required_props: Vec::new(),
                nested: Vec::new(),
            }),
        );
        root.attach(users);
        let (sender, _receiver) = mpsc::unbounded_channel();
        let ctx = Context::new(
            Arc::new(MockRpcClient::new()),
            subscriber,
            "appliance",
            sender,
        );
        let mut eval = Evaluator::new(ctx, root);

        eval.eval_line("user bob").await.unwrap();
        assert_eq!(eval.prompt_path(), "/user/bob");

        assert!(!eval.prune_deleted("users", &json!("carol")));
        assert!(eval.prune_deleted("users", &json!("bob")));
        assert_eq!(eval.prompt_path(), "/user");
    }
}
