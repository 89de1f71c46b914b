//! Commands derived from entity scopes.
//!
//! Collection, item and config nodes do not define commands one by
//! one; `show`, `get`, `set`, `create`, `delete` and `discard` are
//! generated from the node's [`EntityConfig`]. Persistence goes
//! through the node's saver and the task runtime, honoring the
//! `tasks_blocking` session variable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::node::{EntityConfig, Node, NodeKind};
use super::saver::SaveAction;
use super::NamespaceError;
use crate::command::{Arguments, Command, CommandEnv, CommandError};
use crate::output::{Column, Item, Output, Table};
use crate::rpc::{FilterEntry, FilterParams};
use crate::tokenizer::Operator;

impl Node {
    /// Commands available in this scope, derived plus registered ones.
    pub fn commands(&self) -> HashMap<String, Arc<dyn Command>> {
        let mut map: HashMap<String, Arc<dyn Command>> = HashMap::new();
        match &self.kind {
            NodeKind::Group { .. } => {
                map.insert("show".to_string(), Arc::new(ShowEntityCommand));
            }
            NodeKind::Collection { config } => {
                map.insert("show".to_string(), Arc::new(ShowEntityCommand));
                if config.allows_create {
                    map.insert("create".to_string(), Arc::new(CreateEntityCommand));
                }
                if config.allows_delete {
                    map.insert("delete".to_string(), Arc::new(DeleteEntityCommand));
                }
            }
            NodeKind::Item { .. } | NodeKind::Config { .. } => {
                map.insert("show".to_string(), Arc::new(ShowEntityCommand));
                map.insert("get".to_string(), Arc::new(GetEntityCommand));
                map.insert("set".to_string(), Arc::new(SetEntityCommand));
                map.insert("discard".to_string(), Arc::new(DiscardCommand));
            }
        }
        map.extend(self.extra_commands());
        map
    }
}

/// Runs a save task, blocking on it when `tasks_blocking` is set.
async fn run_task(
    env: &CommandEnv<'_>,
    name: String,
    args: Value,
) -> Result<Output, CommandError> {
    let ctx = env.context;
    if ctx.variables.get_bool("tasks_blocking") {
        let mut progress = ctx.progress();
        let id = ctx.tasks.submit_and_wait(&name, args, &mut *progress).await?;
        Ok(Output::Message(format!("Task #{} finished", id)))
    } else {
        let deferred = ctx.deferred_sender();
        let id = ctx
            .tasks
            .submit(&name, args, move |id, state| {
                let line = format!("Task #{} {}", id, state.to_string().to_lowercase());
                let _ = deferred.send(line);
            })
            .await?;
        Ok(Output::Message(format!("Task #{} submitted", id)))
    }
}

/// Save task for a node holding entity state. The working copy is
/// committed once the change is accepted; a background task that later
/// fails restores the pre-save document so the entity never keeps
/// values the server rejected.
async fn run_entity_task(
    env: &CommandEnv<'_>,
    name: String,
    args: Value,
    node: Arc<Node>,
) -> Result<Output, CommandError> {
    let ctx = env.context;
    if ctx.variables.get_bool("tasks_blocking") {
        let mut progress = ctx.progress();
        let id = ctx.tasks.submit_and_wait(&name, args, &mut *progress).await?;
        node.with_entity_mut(|e| e.commit());
        Ok(Output::Message(format!("Task #{} finished", id)))
    } else {
        let before = node.with_entity(|e| e.pristine().clone());
        let deferred = ctx.deferred_sender();
        let callback_node = node.clone();
        let id = ctx
            .tasks
            .submit(&name, args, move |id, state| {
                let line = if state == crate::task::TaskState::Finished {
                    format!("Task #{} finished", id)
                } else {
                    if let Some(before) = before {
                        callback_node.with_entity_mut(|e| e.reload(before));
                    }
                    format!(
                        "Task #{} {}; the rejected changes were dropped",
                        id,
                        state.to_string().to_lowercase()
                    )
                };
                let _ = deferred.send(line);
            })
            .await?;
        node.with_entity_mut(|e| e.commit());
        Ok(Output::Message(format!("Task #{} submitted", id)))
    }
}

enum NestedOp {
    Put(Value, Value),
    Insert(Value),
    Remove(Value),
}

fn nearest_entity_node(node: &Arc<Node>) -> Option<Arc<Node>> {
    let mut current = node.parent();
    while let Some(candidate) = current {
        if candidate.with_entity(|_| ()).is_some() {
            return Some(candidate);
        }
        current = candidate.parent();
    }
    None
}

/// Applies a nested-collection change to the owning item's array field
/// and saves the owner. Nested collections do not nest further.
async fn nested_save(
    env: &CommandEnv<'_>,
    node: &Arc<Node>,
    field: &str,
    key_field: &str,
    op: NestedOp,
) -> Result<Output, CommandError> {
    let owner = nearest_entity_node(node).ok_or_else(|| {
        CommandError::Usage("nested collection has no enclosing entity".to_string())
    })?;
    owner.with_entity_mut(|entity| {
        let doc = entity.working_mut();
        if !doc.get(field).map(Value::is_array).unwrap_or(false) {
            if let Some(obj) = doc.as_object_mut() {
                obj.insert(field.to_string(), json!([]));
            }
        }
        let rows = match doc.get_mut(field).and_then(Value::as_array_mut) {
            Some(rows) => rows,
            None => return,
        };
        match &op {
            NestedOp::Put(key, item) => {
                match rows.iter_mut().find(|r| r.get(key_field) == Some(key)) {
                    Some(slot) => *slot = item.clone(),
                    None => rows.push(item.clone()),
                }
            }
            NestedOp::Insert(item) => rows.push(item.clone()),
            NestedOp::Remove(key) => rows.retain(|r| r.get(key_field) != Some(key)),
        }
    });

    let config = owner
        .entity_config()
        .cloned()
        .ok_or_else(|| CommandError::Usage("enclosing scope has no entity".to_string()))?;
    let key = owner.item_key().unwrap_or(Value::Null);
    let diff = owner.with_entity(|e| e.diff()).unwrap_or(Value::Null);
    match config.saver.update(&key, &diff)? {
        SaveAction::Task { name, args } => run_entity_task(env, name, args, owner).await,
        SaveAction::Parent { .. } => Err(CommandError::Usage(
            "nested collections cannot be nested further".to_string(),
        )),
    }
}

fn object_view(node: &Node, config: &EntityConfig) -> Output {
    let doc = node
        .with_entity(|e| e.working().clone())
        .unwrap_or(Value::Null);
    Output::Object(
        config
            .properties
            .iter()
            .filter(|p| p.is_applicable(&doc))
            .map(|p| Item {
                descr: p.descr.clone(),
                name: p.name.clone(),
                value: p.do_get(&doc),
                vt: p.vt,
            })
            .collect(),
    )
}

fn table_view(config: &EntityConfig, rows: Vec<Value>) -> Output {
    let listed = config
        .properties
        .iter()
        .filter(|p| p.list)
        .collect::<Vec<_>>();
    let columns = listed
        .iter()
        .map(|p| Column {
            label: p.descr.clone(),
            accessor: p.name.clone(),
            vt: p.vt,
        })
        .collect();
    let rows = rows
        .iter()
        .map(|doc| {
            let mut row = serde_json::Map::new();
            for p in &listed {
                row.insert(p.name.clone(), p.do_get(doc));
            }
            Value::Object(row)
        })
        .collect();
    Output::Table(Table { columns, rows })
}

pub struct ShowEntityCommand;

#[async_trait]
impl Command for ShowEntityCommand {
    fn description(&self) -> String {
        "Lists items or displays the current entity".to_string()
    }

    fn is_filtering(&self) -> bool {
        true
    }

    async fn run(
        &self,
        env: &mut CommandEnv<'_>,
        args: &Arguments,
    ) -> Result<Output, CommandError> {
        self.run_with_filter(env, args, Vec::new(), FilterParams::default())
            .await
    }

    async fn run_with_filter(
        &self,
        env: &mut CommandEnv<'_>,
        args: &Arguments,
        filter: Vec<FilterEntry>,
        params: FilterParams,
    ) -> Result<Output, CommandError> {
        if !args.is_empty() {
            return Err(CommandError::Usage("show takes no arguments".to_string()));
        }
        let node = env.node.clone();
        match &node.kind {
            NodeKind::Group { .. } => {
                let columns = vec![
                    Column {
                        label: "Name".to_string(),
                        accessor: "name".to_string(),
                        vt: crate::output::ValueType::String,
                    },
                    Column {
                        label: "Description".to_string(),
                        accessor: "description".to_string(),
                        vt: crate::output::ValueType::String,
                    },
                ];
                let rows = node
                    .group_children()
                    .into_iter()
                    .map(|c| json!({"name": c.name, "description": c.description}))
                    .collect();
                Ok(Output::Table(Table { columns, rows }))
            }
            NodeKind::Collection { config } => {
                let rows = node.query(&filter, &params).await?;
                Ok(table_view(config, rows))
            }
            NodeKind::Item { config, .. } | NodeKind::Config { config, .. } => {
                if !filter.is_empty() || params != FilterParams::default() {
                    return Err(CommandError::Usage(
                        "this scope cannot be filtered".to_string(),
                    ));
                }
                Ok(object_view(&node, config))
            }
        }
    }
}

pub struct GetEntityCommand;

#[async_trait]
impl Command for GetEntityCommand {
    fn description(&self) -> String {
        "Prints the value of one property".to_string()
    }

    async fn run(
        &self,
        env: &mut CommandEnv<'_>,
        args: &Arguments,
    ) -> Result<Output, CommandError> {
        let name = args
            .positional_str(0)
            .ok_or_else(|| CommandError::Usage("usage: get <property>".to_string()))?;
        let config = env
            .node
            .entity_config()
            .cloned()
            .ok_or_else(|| CommandError::Usage("no entity in this scope".to_string()))?;
        let prop = config.property(&name)?;
        let doc = env
            .node
            .with_entity(|e| e.working().clone())
            .unwrap_or(Value::Null);
        Ok(Output::Scalar(prop.do_get(&doc)))
    }

    async fn complete(&self, env: &CommandEnv<'_>) -> Vec<String> {
        env.node
            .entity_config()
            .map(|c| c.properties.iter().map(|p| p.name.clone()).collect())
            .unwrap_or_default()
    }
}

pub struct SetEntityCommand;

#[async_trait]
impl Command for SetEntityCommand {
    fn description(&self) -> String {
        "Changes property values and saves the entity".to_string()
    }

    async fn run(
        &self,
        env: &mut CommandEnv<'_>,
        args: &Arguments,
    ) -> Result<Output, CommandError> {
        if args.kwargs.is_empty() && args.opargs.is_empty() {
            return Err(CommandError::Usage(
                "usage: set <property>=<value> ...".to_string(),
            ));
        }
        let node = env.node.clone();
        let config = node
            .entity_config()
            .cloned()
            .ok_or_else(|| CommandError::Usage("no entity in this scope".to_string()))?;

        node.with_entity_mut(|entity| -> Result<(), CommandError> {
            for (name, value) in &args.kwargs {
                let prop = config.property(name)?;
                if !prop.usersetable {
                    return Err(NamespaceError::PropertyNotSettable(name.clone()).into());
                }
                prop.do_set(entity.working_mut(), value)?;
            }
            for (name, op, value) in &args.opargs {
                let prop = config.property(name)?;
                if !prop.usersetable {
                    return Err(NamespaceError::PropertyNotSettable(name.clone()).into());
                }
                match op {
                    Operator::Inc => prop.do_append(entity.working_mut(), value)?,
                    Operator::Dec => prop.do_remove(entity.working_mut(), value)?,
                    other => {
                        return Err(CommandError::Usage(format!(
                            "operator '{}' cannot be used with set",
                            other
                        )))
                    }
                }
            }
            Ok(())
        })
        .ok_or_else(|| CommandError::Usage("no entity in this scope".to_string()))??;

        let diff = node.with_entity(|e| e.diff()).unwrap_or(json!({}));
        if diff.as_object().map(|o| o.is_empty()).unwrap_or(true) {
            return Ok(Output::Message("No changes to save".to_string()));
        }
        let key = node.item_key().unwrap_or(Value::Null);
        match config.saver.update(&key, &diff)? {
            SaveAction::Task { name, args } => {
                run_entity_task(env, name, args, node.clone()).await
            }
            SaveAction::Parent { field } => {
                let doc = node
                    .with_entity(|e| e.working().clone())
                    .unwrap_or(Value::Null);
                let out = nested_save(
                    env,
                    &node,
                    &field,
                    &config.key_field,
                    NestedOp::Put(key, doc),
                )
                .await?;
                node.with_entity_mut(|e| e.commit());
                Ok(out)
            }
        }
    }

    async fn complete(&self, env: &CommandEnv<'_>) -> Vec<String> {
        let doc = env
            .node
            .with_entity(|e| e.working().clone())
            .unwrap_or(Value::Null);
        env.node
            .entity_config()
            .map(|c| {
                c.properties
                    .iter()
                    .filter(|p| p.usersetable && p.is_applicable(&doc))
                    .map(|p| format!("{}=", p.name))
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub struct CreateEntityCommand;

#[async_trait]
impl Command for CreateEntityCommand {
    fn description(&self) -> String {
        "Creates a new item in this collection".to_string()
    }

    async fn run(
        &self,
        env: &mut CommandEnv<'_>,
        args: &Arguments,
    ) -> Result<Output, CommandError> {
        let node = env.node.clone();
        let config = node
            .entity_config()
            .cloned()
            .ok_or_else(|| CommandError::Usage("no collection in this scope".to_string()))?;

        let mut doc = json!({});
        if let Some(key) = args.positional_str(0) {
            // The key bypasses property flags; it names the new item.
            doc[config.key_field.as_str()] = json!(key);
        }
        for (name, value) in &args.kwargs {
            let prop = config.property(name)?;
            if !prop.createsetable {
                return Err(NamespaceError::PropertyNotCreatable(name.clone()).into());
            }
            prop.do_set(&mut doc, value)?;
        }
        for required in &config.required_props {
            let prop = config.property(required)?;
            if prop.do_get(&doc).is_null() {
                return Err(NamespaceError::RequiredProperty(required.clone()).into());
            }
        }

        match config.saver.create(&doc)? {
            SaveAction::Task { name, args } => run_task(env, name, args).await,
            SaveAction::Parent { field } => {
                nested_save(env, &node, &field, &config.key_field, NestedOp::Insert(doc)).await
            }
        }
    }

    async fn complete(&self, env: &CommandEnv<'_>) -> Vec<String> {
        env.node
            .entity_config()
            .map(|c| {
                c.properties
                    .iter()
                    .filter(|p| p.createsetable)
                    .map(|p| format!("{}=", p.name))
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub struct DeleteEntityCommand;

#[async_trait]
impl Command for DeleteEntityCommand {
    fn description(&self) -> String {
        "Deletes an item from this collection".to_string()
    }

    async fn run(
        &self,
        env: &mut CommandEnv<'_>,
        args: &Arguments,
    ) -> Result<Output, CommandError> {
        let name = args
            .positional_str(0)
            .ok_or_else(|| CommandError::Usage("usage: delete <name>".to_string()))?;
        let node = env.node.clone();
        let config = node
            .entity_config()
            .cloned()
            .ok_or_else(|| CommandError::Usage("no collection in this scope".to_string()))?;
        let key = json!(name);

        match config.saver.delete(&key)? {
            SaveAction::Task { name, args } => run_task(env, name, args).await,
            SaveAction::Parent { field } => {
                nested_save(env, &node, &field, &config.key_field, NestedOp::Remove(key)).await
            }
        }
    }

    async fn complete(&self, env: &CommandEnv<'_>) -> Vec<String> {
        env.node.child_keys().await.unwrap_or_default()
    }
}

pub struct DiscardCommand;

#[async_trait]
impl Command for DiscardCommand {
    fn description(&self) -> String {
        "Drops unsaved property changes".to_string()
    }

    async fn run(
        &self,
        env: &mut CommandEnv<'_>,
        _args: &Arguments,
    ) -> Result<Output, CommandError> {
        env.node
            .with_entity_mut(|e| e.rollback())
            .ok_or_else(|| CommandError::Usage("no entity in this scope".to_string()))?;
        Ok(Output::Message("Pending changes discarded".to_string()))
    }
}
