//! Session variable store.
//!
//! Holds the typed, optionally choice-constrained variables that steer
//! shell behavior (`output_format`, `tasks_blocking`, `prompt`, ...).
//! Persists as a JSON document; a missing file silently falls back to
//! defaults, a malformed one is reported and ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::output::{read_value, ValueError, ValueType};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error("cannot write config file: {0}")]
    Save(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub default: Value,
    #[serde(rename = "type")]
    pub vt: ValueType,
    #[serde(default)]
    pub choices: Option<Vec<String>>,
    pub value: Value,
}

impl Variable {
    fn new(default: Value, vt: ValueType, choices: Option<Vec<String>>) -> Self {
        Self {
            value: default.clone(),
            default,
            vt,
            choices,
        }
    }

    fn set(&mut self, raw: &Value) -> Result<(), ValueError> {
        let coerced = read_value(raw, self.vt)?;
        if let Some(choices) = &self.choices {
            let as_text = crate::output::value_to_string(&coerced);
            if !choices.iter().any(|c| c == &as_text) {
                return Err(ValueError::NotAChoice(as_text));
            }
        }
        self.value = coerced;
        Ok(())
    }
}

fn default_variables() -> HashMap<String, Variable> {
    let mut vars = HashMap::new();
    vars.insert(
        "output_format".to_string(),
        Variable::new(
            json!("ascii"),
            ValueType::String,
            Some(vec![
                "ascii".to_string(),
                "json".to_string(),
                "table".to_string(),
            ]),
        ),
    );
    vars.insert(
        "datetime_format".to_string(),
        Variable::new(json!("natural"), ValueType::String, None),
    );
    vars.insert(
        "language".to_string(),
        Variable::new(
            json!(std::env::var("LANG").unwrap_or_else(|_| "C".to_string())),
            ValueType::String,
            None,
        ),
    );
    vars.insert(
        "prompt".to_string(),
        Variable::new(json!("{host}:{path}>"), ValueType::String, None),
    );
    vars.insert(
        "timeout".to_string(),
        Variable::new(json!(10), ValueType::Number, None),
    );
    vars.insert(
        "tasks_blocking".to_string(),
        Variable::new(json!(false), ValueType::Boolean, None),
    );
    vars.insert(
        "show_events".to_string(),
        Variable::new(json!(true), ValueType::Boolean, None),
    );
    vars.insert(
        "debug".to_string(),
        Variable::new(json!(false), ValueType::Boolean, None),
    );
    vars
}

pub struct VariableStore {
    variables: RwLock<HashMap<String, Variable>>,
    save_path: RwLock<Option<PathBuf>>,
}

impl Default for VariableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableStore {
    pub fn new() -> Self {
        Self {
            variables: RwLock::new(default_variables()),
            save_path: RwLock::new(None),
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.variables
            .read()
            .ok()?
            .get(name)
            .map(|v| v.value.clone())
    }

    pub fn get_bool(&self, name: &str) -> bool {
        matches!(self.get(name), Some(Value::Bool(true)))
    }

    pub fn get_string(&self, name: &str) -> String {
        self.get(name)
            .map(|v| crate::output::value_to_string(&v))
            .unwrap_or_default()
    }

    /// Sets a variable, creating an untyped (string) one when the name
    /// is new. Values are coerced and checked against the choice set.
    pub fn set(&self, name: &str, raw: &Value) -> Result<(), ConfigError> {
        let mut vars = self
            .variables
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let var = vars
            .entry(name.to_string())
            .or_insert_with(|| Variable::new(json!(""), ValueType::String, None));
        var.set(raw)?;
        Ok(())
    }

    pub fn all_printable(&self) -> Vec<(String, String)> {
        let vars = self
            .variables
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut out = vars
            .iter()
            .map(|(name, var)| (name.clone(), crate::output::value_to_string(&var.value)))
            .collect::<Vec<_>>();
        out.sort();
        out
    }

    /// Loads variables from a JSON file. A missing file keeps defaults;
    /// a malformed one is reported and otherwise ignored.
    pub fn load(&self, path: &Path) {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => return,
        };
        let saved: HashMap<String, Variable> = match serde_json::from_str(&content) {
            Ok(saved) => saved,
            Err(e) => {
                tracing::warn!("config file {} has improper format: {}", path.display(), e);
                return;
            }
        };
        {
            let mut vars = self
                .variables
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for (name, var) in saved {
                vars.insert(name, var);
            }
        }
        *self
            .save_path
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(path.to_path_buf());
    }

    pub fn save(&self, path: Option<&Path>) -> Result<(), ConfigError> {
        let target = match path {
            Some(p) => p.to_path_buf(),
            None => match self
                .save_path
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()
            {
                Some(p) => p,
                None => return Err(ConfigError::Save("no config file path known".to_string())),
            },
        };
        let vars = self
            .variables
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let serialized = serde_json::to_string_pretty(&*vars)
            .map_err(|e| ConfigError::Save(e.to_string()))?;
        std::fs::write(&target, serialized).map_err(|e| ConfigError::Save(e.to_string()))?;
        Ok(())
    }
}
