//! Command trait and invocation plumbing.
//!
//! Everything runnable at the prompt implements [`Command`]: builtins,
//! derived entity commands and pipe stages. Arguments arrive already
//! sorted into positional values, `key=value` pairs and comparison
//! expressions, mirroring the grammar.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::ConfigError;
use crate::context::Context;
use crate::namespace::{NamespaceError, Node};
use crate::output::{Output, ValueError};
use crate::parser::SyntaxError;
use crate::rpc::{FilterEntry, FilterParams, RpcError};
use crate::task::TaskError;
use crate::tokenizer::Operator;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Namespace(#[from] NamespaceError),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Task(#[from] TaskError),
    /// Not a failure; unwinds the loop with an exit code.
    #[error("exit")]
    Exit(i32),
}

/// Evaluated arguments of one command invocation.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Arguments {
    pub positional: Vec<Value>,
    /// `key=value` pairs, in the order typed.
    pub kwargs: Vec<(String, Value)>,
    /// `key <op> value` for every operator other than plain assignment.
    pub opargs: Vec<(String, Operator, Value)>,
}

impl Arguments {
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    pub fn positional_str(&self, index: usize) -> Option<String> {
        self.positional
            .get(index)
            .map(crate::output::value_to_string)
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.kwargs.is_empty() && self.opargs.is_empty()
    }
}

/// Mutable evaluation surface handed to a running command: the session
/// context, the live path stack and the scope node the command was
/// resolved on.
pub struct CommandEnv<'a> {
    pub context: &'a Context,
    pub path: &'a mut Vec<Arc<Node>>,
    pub node: Arc<Node>,
}

impl CommandEnv<'_> {
    pub fn current(&self) -> Arc<Node> {
        match self.path.last() {
            Some(node) => node.clone(),
            None => self.node.clone(),
        }
    }
}

#[async_trait]
pub trait Command: Send + Sync {
    fn description(&self) -> String;

    async fn run(
        &self,
        env: &mut CommandEnv<'_>,
        args: &Arguments,
    ) -> Result<Output, CommandError>;

    /// Candidate completions for an argument position.
    async fn complete(&self, _env: &CommandEnv<'_>) -> Vec<String> {
        Vec::new()
    }

    /// Source commands that can push a compiled filter down to their
    /// loader return true and implement `run_with_filter`.
    fn is_filtering(&self) -> bool {
        false
    }

    async fn run_with_filter(
        &self,
        _env: &mut CommandEnv<'_>,
        _args: &Arguments,
        _filter: Vec<FilterEntry>,
        _params: FilterParams,
    ) -> Result<Output, CommandError> {
        Err(CommandError::Usage(
            "command does not support filtering".to_string(),
        ))
    }

    /// Pipe stages that compile into the source query return true and
    /// implement `serialize_filter`.
    fn serializes_filter(&self) -> bool {
        false
    }

    fn serialize_filter(
        &self,
        _args: &Arguments,
        _filter: &mut Vec<FilterEntry>,
        _params: &mut FilterParams,
    ) -> Result<(), CommandError> {
        Err(CommandError::Usage(
            "command cannot be part of a filter".to_string(),
        ))
    }

    /// Post-processing pipe stage; receives the previous stage's
    /// output.
    async fn run_pipe(
        &self,
        _env: &mut CommandEnv<'_>,
        _args: &Arguments,
        _input: Output,
    ) -> Result<Output, CommandError> {
        Err(CommandError::Usage(
            "command cannot be used in a pipe".to_string(),
        ))
    }
}
