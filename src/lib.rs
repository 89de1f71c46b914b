//! Interactive administrative shell for remote appliances.
//!
//! The crate parses a small shell grammar, resolves words against a
//! navigable tree of entity scopes, and turns mutations into remote
//! tasks tracked by an event-driven runtime. The terminal, the wire
//! protocol framing and the rendering style are collaborators supplied
//! by the embedding program.
//!
//! The pieces compose in one direction:
//!
//! ```text
//! tokenizer -> parser -> evaluator -> commands -> rpc/tasks
//!                            |
//!                       namespace tree
//! ```
//!
//! [`repl::MainLoop`] wires everything together for an interactive
//! session; the layers below it are usable on their own, e.g. for
//! scripted one-shot evaluation.

pub mod ast;
pub mod builtins;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod eval;
pub mod namespace;
pub mod output;
pub mod parser;
pub mod repl;
pub mod rpc;
pub mod task;
pub mod tokenizer;
pub mod transport;

pub use command::{Arguments, Command, CommandEnv, CommandError};
pub use context::Context;
pub use error::{Error, Result};
pub use eval::Evaluator;
pub use namespace::{EntityConfig, Node, PropertyMapping};
pub use output::{Output, Renderer};
pub use repl::MainLoop;
