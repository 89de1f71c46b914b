//! Working-copy entity state.
//!
//! An [`Entity`] keeps two documents: the pristine copy as last loaded
//! and the working copy that `set`/append/remove mutate. Saving
//! serializes only the difference between the two.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    working: Value,
    orig: Value,
}

impl Entity {
    pub fn new(doc: Value) -> Self {
        Self {
            orig: doc.clone(),
            working: doc,
        }
    }

    pub fn working(&self) -> &Value {
        &self.working
    }

    pub fn working_mut(&mut self) -> &mut Value {
        &mut self.working
    }

    /// The document as last loaded or committed.
    pub fn pristine(&self) -> &Value {
        &self.orig
    }

    pub fn modified(&self) -> bool {
        self.working != self.orig
    }

    /// Top-level fields whose working value differs from the pristine
    /// copy, including fields absent from the original document.
    pub fn diff(&self) -> Value {
        let mut out = Map::new();
        if let Some(working) = self.working.as_object() {
            for (field, value) in working {
                if self.orig.get(field) != Some(value) {
                    out.insert(field.clone(), value.clone());
                }
            }
        }
        Value::Object(out)
    }

    /// Discards pending changes.
    pub fn rollback(&mut self) {
        self.working = self.orig.clone();
    }

    /// Marks the current working copy as saved.
    pub fn commit(&mut self) {
        self.orig = self.working.clone();
    }

    /// Replaces both copies with a freshly loaded document.
    pub fn reload(&mut self, doc: Value) {
        self.orig = doc.clone();
        self.working = doc;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_diff_only_changed_fields() {
        let mut entity = Entity::new(json!({"name": "disk1", "compression": "off", "size": 100}));
        entity.working_mut()["compression"] = json!("lz4");
        assert!(entity.modified());
        assert_eq!(entity.diff(), json!({"compression": "lz4"}));
    }

    #[test]
    fn test_diff_includes_new_fields() {
        let mut entity = Entity::new(json!({"name": "disk1"}));
        entity.working_mut()["comment"] = json!("scratch");
        assert_eq!(entity.diff(), json!({"comment": "scratch"}));
    }

    #[test]
    fn test_unchanged_entity_has_empty_diff() {
        let entity = Entity::new(json!({"name": "disk1", "size": 100}));
        assert!(!entity.modified());
        assert_eq!(entity.diff(), json!({}));
    }

    #[test]
    fn test_rollback_and_commit() {
        let mut entity = Entity::new(json!({"mtu": 1500}));
        entity.working_mut()["mtu"] = json!(9000);
        entity.rollback();
        assert_eq!(entity.working(), &json!({"mtu": 1500}));

        entity.working_mut()["mtu"] = json!(9000);
        entity.commit();
        assert!(!entity.modified());
        assert_eq!(entity.diff(), json!({}));
    }
}
