//! Scope tree nodes.
//!
//! The tree has a closed set of node shapes: static groups, entity
//! collections, single-entity items and singleton config scopes. Parent
//! links are weak; the path stack and the static tree are the only
//! strong owners, so an item node dropped from the path releases its
//! entity state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use serde_json::Value;

use super::entity::Entity;
use super::loader::Loader;
use super::saver::Saver;
use super::{NamespaceError, PropertyMapping};
use crate::command::Command;
use crate::rpc::{FilterEntry, FilterParams, RpcError};

/// A collection nested under an item, loading from one of the parent
/// entity's fields.
pub struct NestedNamespace {
    pub name: String,
    pub descr: String,
    pub config: Arc<EntityConfig>,
}

/// Everything shared between a collection and the items it generates.
pub struct EntityConfig {
    /// Property holding the user-visible key.
    pub key_field: String,
    pub properties: Vec<PropertyMapping>,
    pub loader: Arc<dyn Loader>,
    pub saver: Arc<dyn Saver>,
    pub allows_create: bool,
    pub allows_delete: bool,
    pub required_props: Vec<String>,
    pub nested: Vec<NestedNamespace>,
}

impl EntityConfig {
    pub fn property(&self, name: &str) -> Result<&PropertyMapping, NamespaceError> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| NamespaceError::PropertyNotFound(name.to_string()))
    }
}

pub enum NodeKind {
    Group {
        children: RwLock<HashMap<String, Arc<Node>>>,
    },
    Collection {
        config: Arc<EntityConfig>,
    },
    Item {
        config: Arc<EntityConfig>,
        entity: RwLock<Entity>,
    },
    /// Singleton entity scope; loads on entry, saves by update only.
    Config {
        config: Arc<EntityConfig>,
        entity: RwLock<Entity>,
    },
}

pub struct Node {
    pub name: String,
    pub description: String,
    pub kind: NodeKind,
    parent: RwLock<Weak<Node>>,
    extra_commands: RwLock<HashMap<String, Arc<dyn Command>>>,
}

fn lock_read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Node {
    fn new(name: &str, description: &str, kind: NodeKind) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            description: description.to_string(),
            kind,
            parent: RwLock::new(Weak::new()),
            extra_commands: RwLock::new(HashMap::new()),
        })
    }

    pub fn group(name: &str, description: &str) -> Arc<Self> {
        Self::new(
            name,
            description,
            NodeKind::Group {
                children: RwLock::new(HashMap::new()),
            },
        )
    }

    pub fn collection(name: &str, description: &str, config: Arc<EntityConfig>) -> Arc<Self> {
        Self::new(name, description, NodeKind::Collection { config })
    }

    pub fn config_scope(name: &str, description: &str, config: Arc<EntityConfig>) -> Arc<Self> {
        Self::new(
            name,
            description,
            NodeKind::Config {
                config,
                entity: RwLock::new(Entity::new(Value::Null)),
            },
        )
    }

    fn item(name: &str, config: Arc<EntityConfig>, doc: Value) -> Arc<Self> {
        Self::new(
            name,
            "",
            NodeKind::Item {
                config,
                entity: RwLock::new(Entity::new(doc)),
            },
        )
    }

    /// Inserts a child into a group and wires its parent link. A no-op
    /// on non-group nodes.
    pub fn attach(self: &Arc<Self>, child: Arc<Node>) {
        *lock_write(&child.parent) = Arc::downgrade(self);
        if let NodeKind::Group { children } = &self.kind {
            lock_write(children).insert(child.name.clone(), child);
        }
    }

    pub fn register_command(&self, name: &str, command: Arc<dyn Command>) {
        lock_write(&self.extra_commands).insert(name.to_string(), command);
    }

    pub fn extra_commands(&self) -> HashMap<String, Arc<dyn Command>> {
        lock_read(&self.extra_commands).clone()
    }

    pub fn parent(&self) -> Option<Arc<Node>> {
        lock_read(&self.parent).upgrade()
    }

    pub fn entity_config(&self) -> Option<&Arc<EntityConfig>> {
        match &self.kind {
            NodeKind::Collection { config }
            | NodeKind::Item { config, .. }
            | NodeKind::Config { config, .. } => Some(config),
            NodeKind::Group { .. } => None,
        }
    }

    /// Name as shown in the prompt path; items carry a pending-changes
    /// marker.
    pub fn display_name(&self) -> String {
        if self.modified() {
            format!("{} [modified]", self.name)
        } else {
            self.name.clone()
        }
    }

    pub fn modified(&self) -> bool {
        match &self.kind {
            NodeKind::Item { entity, .. } | NodeKind::Config { entity, .. } => {
                lock_read(entity).modified()
            }
            _ => false,
        }
    }

    pub fn with_entity<R>(&self, f: impl FnOnce(&Entity) -> R) -> Option<R> {
        match &self.kind {
            NodeKind::Item { entity, .. } | NodeKind::Config { entity, .. } => {
                Some(f(&lock_read(entity)))
            }
            _ => None,
        }
    }

    pub fn with_entity_mut<R>(&self, f: impl FnOnce(&mut Entity) -> R) -> Option<R> {
        match &self.kind {
            NodeKind::Item { entity, .. } | NodeKind::Config { entity, .. } => {
                Some(f(&mut lock_write(entity)))
            }
            _ => None,
        }
    }

    /// Working document of the nearest enclosing item, used as the
    /// parent document for nested collections.
    pub fn parent_entity_doc(&self) -> Option<Value> {
        let mut current = self.parent();
        while let Some(node) = current {
            if let Some(doc) = node.with_entity(|e| e.working().clone()) {
                return Some(doc);
            }
            current = node.parent();
        }
        None
    }

    /// The key identifying this item inside its collection.
    pub fn item_key(&self) -> Option<Value> {
        let config = self.entity_config()?;
        match &self.kind {
            NodeKind::Item { entity, .. } => Some(
                lock_read(entity)
                    .working()
                    .get(&config.key_field)
                    .cloned()
                    .unwrap_or(Value::Null),
            ),
            _ => None,
        }
    }

    /// Subscriber collection feeding this node, when there is one.
    pub fn collection_name(&self) -> Option<String> {
        self.entity_config()
            .and_then(|c| c.loader.collection())
            .map(str::to_string)
    }

    /// Runs the node's loader with the proper parent document.
    pub async fn query(
        &self,
        filter: &[FilterEntry],
        params: &FilterParams,
    ) -> Result<Vec<Value>, RpcError> {
        let config = match self.entity_config() {
            Some(config) => config,
            None => return Ok(Vec::new()),
        };
        let parent = self.parent_entity_doc();
        config.loader.query(filter, params, parent.as_ref()).await
    }

    /// Resolves a child scope by name. Group children come from the
    /// static tree; collection children are item nodes generated from a
    /// freshly loaded entity; item children are its nested collections.
    pub async fn child(self: &Arc<Self>, name: &str) -> Result<Option<Arc<Node>>, RpcError> {
        match &self.kind {
            NodeKind::Group { children } => Ok(lock_read(children).get(name).cloned()),
            NodeKind::Collection { config } => {
                let parent = self.parent_entity_doc();
                let mut doc = config
                    .loader
                    .get_one(
                        &config.key_field,
                        &Value::String(name.to_string()),
                        parent.as_ref(),
                    )
                    .await?;
                if doc.is_none() {
                    if let Ok(numeric) = name.parse::<i64>() {
                        doc = config
                            .loader
                            .get_one(&config.key_field, &Value::from(numeric), parent.as_ref())
                            .await?;
                    }
                }
                Ok(doc.map(|doc| {
                    let item = Node::item(name, config.clone(), doc);
                    *lock_write(&item.parent) = Arc::downgrade(self);
                    item
                }))
            }
            NodeKind::Item { config, .. } => Ok(config
                .nested
                .iter()
                .find(|n| n.name == name)
                .map(|nested| {
                    let node =
                        Node::collection(&nested.name, &nested.descr, nested.config.clone());
                    *lock_write(&node.parent) = Arc::downgrade(self);
                    node
                })),
            NodeKind::Config { .. } => Ok(None),
        }
    }

    /// Item node carrying the same entity state under a new key name,
    /// for entity updates that changed the primary key. `None` for
    /// non-item nodes.
    pub fn rekey(self: &Arc<Self>, name: &str) -> Option<Arc<Node>> {
        match &self.kind {
            NodeKind::Item { config, entity } => {
                let node = Self::new(
                    name,
                    &self.description,
                    NodeKind::Item {
                        config: config.clone(),
                        entity: RwLock::new(lock_read(entity).clone()),
                    },
                );
                *lock_write(&node.parent) = lock_read(&self.parent).clone();
                *lock_write(&node.extra_commands) = self.extra_commands();
                Some(node)
            }
            _ => None,
        }
    }

    /// Statically known children, sorted by name.
    pub fn group_children(&self) -> Vec<Arc<Node>> {
        match &self.kind {
            NodeKind::Group { children } => {
                let mut out = lock_read(children).values().cloned().collect::<Vec<_>>();
                out.sort_by(|a, b| a.name.cmp(&b.name));
                out
            }
            _ => Vec::new(),
        }
    }

    /// Child names available without loading, for completion and help.
    pub fn static_child_names(&self) -> Vec<String> {
        match &self.kind {
            NodeKind::Group { children } => {
                let mut names = lock_read(children).keys().cloned().collect::<Vec<_>>();
                names.sort();
                names
            }
            NodeKind::Item { config, .. } => {
                config.nested.iter().map(|n| n.name.clone()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Item keys of a collection, for completion.
    pub async fn child_keys(&self) -> Result<Vec<String>, RpcError> {
        let config = match &self.kind {
            NodeKind::Collection { config } => config,
            _ => return Ok(Vec::new()),
        };
        let rows = self.query(&[], &FilterParams::default()).await?;
        Ok(rows
            .iter()
            .filter_map(|doc| doc.get(&config.key_field))
            .map(crate::output::value_to_string)
            .collect())
    }

    /// Called when the node becomes the top of the path. Config scopes
    /// load their singleton entity here.
    pub async fn on_enter(&self) -> Result<(), RpcError> {
        if let NodeKind::Config { config, entity } = &self.kind {
            let doc = config
                .loader
                .query(&[], &FilterParams::single(), None)
                .await?
                .into_iter()
                .next()
                .unwrap_or(Value::Null);
            lock_write(entity).reload(doc);
        }
        Ok(())
    }

    /// Whether leaving this scope is allowed right now. Pending entity
    /// changes block navigation until saved or discarded.
    pub fn on_leave(&self) -> bool {
        !self.modified()
    }
}
