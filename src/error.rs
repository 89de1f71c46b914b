//! Crate-level error type.
//!
//! Module errors stay specific; this aggregate exists for the binary
//! and embedding programs that want a single fallible surface.

use thiserror::Error;

use crate::command::CommandError;
use crate::config::ConfigError;
use crate::namespace::NamespaceError;
use crate::output::ValueError;
use crate::parser::SyntaxError;
use crate::rpc::RpcError;
use crate::task::TaskError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Namespace(#[from] NamespaceError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
