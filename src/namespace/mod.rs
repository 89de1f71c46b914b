//! The navigable object tree.
//!
//! Nodes form a tree of scopes the user walks with path syntax.
//! Collection nodes generate item nodes lazily from loaded entities;
//! item and config nodes hold working-copy entity state. Loading and
//! saving strategies are injected, so the same node machinery serves
//! RPC-backed, subscriber-backed and nested collections.

mod commands;
mod entity;
mod loader;
mod node;
mod property;
mod saver;

pub use commands::{
    CreateEntityCommand, DeleteEntityCommand, DiscardCommand, GetEntityCommand,
    SetEntityCommand, ShowEntityCommand,
};
pub use entity::Entity;
pub use loader::{apply_filter, Loader, NestedLoader, RpcLoader, SubscriberLoader};
pub use node::{EntityConfig, NestedNamespace, Node, NodeKind};
pub use property::{Getter, PropertyMapping, Setter};
pub use saver::{NestedSaver, SaveAction, Saver, TaskSaver};

use thiserror::Error;

use crate::output::ValueError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NamespaceError {
    #[error("property '{0}' not found")]
    PropertyNotFound(String),
    #[error("property '{0}' is read-only")]
    ReadOnlyProperty(String),
    #[error("property '{0}' cannot be set by the user")]
    PropertyNotSettable(String),
    #[error("property '{0}' does not apply to this entity")]
    PropertyNotApplicable(String),
    #[error("property '{0}' cannot be set at create time")]
    PropertyNotCreatable(String),
    #[error("property '{0}' is required")]
    RequiredProperty(String),
    #[error("'{value}' is not a valid value for '{property}', choose from: {choices}")]
    NotAChoice {
        property: String,
        value: String,
        choices: String,
    },
    #[error("'{value}' does not match the format required for '{property}'")]
    PatternMismatch { property: String, value: String },
    #[error("property '{0}' does not hold a set or an array")]
    NotASet(String),
    #[error("'{value}' is not an element of '{property}'")]
    NotAnElement { property: String, value: String },
    #[error("'{0}' not found")]
    ItemNotFound(String),
    #[error("operation '{0}' is not supported here")]
    OperationNotSupported(String),
    #[error(transparent)]
    Value(#[from] ValueError),
}
