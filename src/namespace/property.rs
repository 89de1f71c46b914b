//! Property mappings.
//!
//! A [`PropertyMapping`] bridges one user-visible property name to a
//! location inside the entity document, carrying the value type,
//! validation rules and mutability flags. Access goes through an
//! accessor pair so a property can be backed by a dotted field path or
//! by arbitrary closures.

use std::sync::Arc;

use serde_json::Value;

use crate::output::{read_value, value_to_string, ValueType};

use super::NamespaceError;

type GetFn = dyn Fn(&Value) -> Value + Send + Sync;
type SetFn = dyn Fn(&mut Value, Value) + Send + Sync;
type CondFn = dyn Fn(&Value) -> bool + Send + Sync;

#[derive(Clone)]
pub enum Getter {
    /// Dotted path into the entity document.
    Field(String),
    Func(Arc<GetFn>),
}

#[derive(Clone)]
pub enum Setter {
    Field(String),
    Func(Arc<SetFn>),
}

fn field_get(doc: &Value, path: &str) -> Value {
    let mut current = doc;
    for part in path.split('.') {
        match current.get(part) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn field_set(doc: &mut Value, path: &str, value: Value) {
    let mut current = doc;
    let parts = path.split('.').collect::<Vec<_>>();
    for part in &parts[..parts.len() - 1] {
        if !current.get(*part).map(Value::is_object).unwrap_or(false) {
            if let Some(obj) = current.as_object_mut() {
                obj.insert(part.to_string(), Value::Object(Default::default()));
            }
        }
        current = match current.get_mut(*part) {
            Some(next) => next,
            None => return,
        };
    }
    if let Some(obj) = current.as_object_mut() {
        obj.insert(parts[parts.len() - 1].to_string(), value);
    }
}

#[derive(Clone)]
pub struct PropertyMapping {
    pub name: String,
    pub descr: String,
    pub get: Getter,
    pub set: Option<Setter>,
    pub vt: ValueType,
    /// Listed as a column by collection-level `show`.
    pub list: bool,
    pub enum_values: Option<Vec<String>>,
    pub regex: Option<regex::Regex>,
    pub usersetable: bool,
    pub createsetable: bool,
    /// Entity-state gate; a property whose predicate fails reads as
    /// null and rejects writes.
    pub condition: Option<Arc<CondFn>>,
}

impl PropertyMapping {
    pub fn new(name: &str, descr: &str, field: &str, vt: ValueType) -> Self {
        Self {
            name: name.to_string(),
            descr: descr.to_string(),
            get: Getter::Field(field.to_string()),
            set: Some(Setter::Field(field.to_string())),
            vt,
            list: true,
            enum_values: None,
            regex: None,
            usersetable: true,
            createsetable: true,
            condition: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.set = None;
        self.usersetable = false;
        self.createsetable = false;
        self
    }

    pub fn create_only(mut self) -> Self {
        self.usersetable = false;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.list = false;
        self
    }

    pub fn with_enum(mut self, values: &[&str]) -> Self {
        self.enum_values = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn with_regex(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.regex = Some(regex::Regex::new(pattern)?);
        Ok(self)
    }

    pub fn with_getter(mut self, f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        self.get = Getter::Func(Arc::new(f));
        self
    }

    pub fn with_condition(mut self, f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Arc::new(f));
        self
    }

    /// Whether the property applies to this entity state.
    pub fn is_applicable(&self, doc: &Value) -> bool {
        match &self.condition {
            Some(cond) => cond(doc),
            None => true,
        }
    }

    pub fn do_get(&self, doc: &Value) -> Value {
        if !self.is_applicable(doc) {
            return Value::Null;
        }
        match &self.get {
            Getter::Field(path) => field_get(doc, path),
            Getter::Func(f) => f(doc),
        }
    }

    fn validate(&self, value: &Value) -> Result<(), NamespaceError> {
        if let Some(choices) = &self.enum_values {
            let text = value_to_string(value);
            if !choices.iter().any(|c| c == &text) {
                return Err(NamespaceError::NotAChoice {
                    property: self.name.clone(),
                    value: text,
                    choices: choices.join(", "),
                });
            }
        }
        if let Some(regex) = &self.regex {
            let text = value_to_string(value);
            if !regex.is_match(&text) {
                return Err(NamespaceError::PatternMismatch {
                    property: self.name.clone(),
                    value: text,
                });
            }
        }
        Ok(())
    }

    /// Coerces, validates and writes a value into the document.
    pub fn do_set(&self, doc: &mut Value, raw: &Value) -> Result<(), NamespaceError> {
        if !self.is_applicable(doc) {
            return Err(NamespaceError::PropertyNotApplicable(self.name.clone()));
        }
        let setter = self
            .set
            .as_ref()
            .ok_or_else(|| NamespaceError::ReadOnlyProperty(self.name.clone()))?;
        let value = read_value(raw, self.vt)?;
        self.validate(&value)?;
        match setter {
            Setter::Field(path) => field_set(doc, path, value),
            Setter::Func(f) => f(doc, value),
        }
        Ok(())
    }

    /// Adds elements to a set- or array-typed property. Set semantics
    /// skip elements already present; arrays keep duplicates.
    pub fn do_append(&self, doc: &mut Value, raw: &Value) -> Result<(), NamespaceError> {
        if !matches!(self.vt, ValueType::Set | ValueType::Array) {
            return Err(NamespaceError::NotASet(self.name.clone()));
        }
        if !self.is_applicable(doc) {
            return Err(NamespaceError::PropertyNotApplicable(self.name.clone()));
        }
        let additions = match read_value(raw, self.vt)? {
            Value::Array(items) => items,
            other => vec![other],
        };
        let mut current = match self.do_get(doc) {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        for item in additions {
            if self.vt == ValueType::Set && current.contains(&item) {
                continue;
            }
            current.push(item);
        }
        self.store(doc, Value::Array(current))
    }

    /// Removes elements from a set- or array-typed property. Removing
    /// an element that is not present is an error.
    pub fn do_remove(&self, doc: &mut Value, raw: &Value) -> Result<(), NamespaceError> {
        if !matches!(self.vt, ValueType::Set | ValueType::Array) {
            return Err(NamespaceError::NotASet(self.name.clone()));
        }
        if !self.is_applicable(doc) {
            return Err(NamespaceError::PropertyNotApplicable(self.name.clone()));
        }
        let removals = match read_value(raw, self.vt)? {
            Value::Array(items) => items,
            other => vec![other],
        };
        let mut current = match self.do_get(doc) {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        for item in removals {
            match current.iter().position(|v| v == &item) {
                Some(idx) => {
                    current.remove(idx);
                }
                None => {
                    return Err(NamespaceError::NotAnElement {
                        property: self.name.clone(),
                        value: value_to_string(&item),
                    })
                }
            }
        }
        self.store(doc, Value::Array(current))
    }

    fn store(&self, doc: &mut Value, value: Value) -> Result<(), NamespaceError> {
        let setter = self
            .set
            .as_ref()
            .ok_or_else(|| NamespaceError::ReadOnlyProperty(self.name.clone()))?;
        match setter {
            Setter::Field(path) => field_set(doc, path, value),
            Setter::Func(f) => f(doc, value),
        }
        Ok(())
    }
}

impl std::fmt::Debug for PropertyMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyMapping")
            .field("name", &self.name)
            .field("vt", &self.vt)
            .field("usersetable", &self.usersetable)
            .finish()
    }
}
