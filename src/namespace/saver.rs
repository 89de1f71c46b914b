//! Entity saving strategies.
//!
//! Savers do not talk to the transport themselves; they translate an
//! entity operation into a [`SaveAction`] the command layer carries out.
//! That keeps blocking-versus-background submission policy in one
//! place.

use serde_json::{json, Value};

use super::NamespaceError;

/// What the command layer must do to persist a change.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveAction {
    /// Submit a remote task with these arguments.
    Task { name: String, args: Value },
    /// The change lives inside this array field of the parent entity;
    /// write it back there and save the parent.
    Parent { field: String },
}

pub trait Saver: Send + Sync {
    fn create(&self, doc: &Value) -> Result<SaveAction, NamespaceError>;
    fn update(&self, key: &Value, diff: &Value) -> Result<SaveAction, NamespaceError>;
    fn delete(&self, key: &Value) -> Result<SaveAction, NamespaceError>;
}

/// Persists through create/update/delete tasks. Any of the three task
/// names may be absent, making that operation unsupported.
#[derive(Default)]
pub struct TaskSaver {
    create_task: Option<String>,
    update_task: Option<String>,
    delete_task: Option<String>,
}

impl TaskSaver {
    pub fn new(
        create_task: Option<&str>,
        update_task: Option<&str>,
        delete_task: Option<&str>,
    ) -> Self {
        Self {
            create_task: create_task.map(str::to_string),
            update_task: update_task.map(str::to_string),
            delete_task: delete_task.map(str::to_string),
        }
    }
}

impl Saver for TaskSaver {
    fn create(&self, doc: &Value) -> Result<SaveAction, NamespaceError> {
        let name = self
            .create_task
            .as_ref()
            .ok_or_else(|| NamespaceError::OperationNotSupported("create".to_string()))?;
        Ok(SaveAction::Task {
            name: name.clone(),
            args: json!([doc]),
        })
    }

    fn update(&self, key: &Value, diff: &Value) -> Result<SaveAction, NamespaceError> {
        let name = self
            .update_task
            .as_ref()
            .ok_or_else(|| NamespaceError::OperationNotSupported("set".to_string()))?;
        // Singleton config scopes have no key.
        let args = if key.is_null() {
            json!([diff])
        } else {
            json!([key, diff])
        };
        Ok(SaveAction::Task {
            name: name.clone(),
            args,
        })
    }

    fn delete(&self, key: &Value) -> Result<SaveAction, NamespaceError> {
        let name = self
            .delete_task
            .as_ref()
            .ok_or_else(|| NamespaceError::OperationNotSupported("delete".to_string()))?;
        Ok(SaveAction::Task {
            name: name.clone(),
            args: json!([key]),
        })
    }
}

/// Persists by mutating an array field of the parent entity and saving
/// the parent.
pub struct NestedSaver {
    field: String,
}

impl NestedSaver {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
        }
    }

    fn parent(&self) -> Result<SaveAction, NamespaceError> {
        Ok(SaveAction::Parent {
            field: self.field.clone(),
        })
    }
}

impl Saver for NestedSaver {
    fn create(&self, _doc: &Value) -> Result<SaveAction, NamespaceError> {
        self.parent()
    }

    fn update(&self, _key: &Value, _diff: &Value) -> Result<SaveAction, NamespaceError> {
        self.parent()
    }

    fn delete(&self, _key: &Value) -> Result<SaveAction, NamespaceError> {
        self.parent()
    }
}
