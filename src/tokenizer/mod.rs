//! Lexer for the shell grammar.
//!
//! Splits a raw input line into [`TokenSpan`]s. Tokenization is
//! all-or-nothing: any unrecognized text aborts the whole line with a
//! [`TokenizeError`] naming the offending fragment and column.

pub mod comment;
pub mod literal;
pub mod symbol;
pub mod token;
pub mod whitespace;

pub use literal::Literal;
pub use symbol::Operator;
pub use token::{tokenize, Token, TokenSpan, TokenizeError};
