//! Operators, delimiters and bare atoms.
//!
//! Operators are matched longest-first so that `=+` is never read as
//! `=` followed by an atom starting with `+`. Atoms deliberately admit
//! `/`, `-`, `.` and `#` beyond the first character, which is how the
//! navigational words `..`, `-` and `/` and path-like names lex as
//! plain atoms.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    combinator::{map, recognize, value},
    error::context,
    sequence::pair,
};
use strum_macros::{AsRefStr, Display, EnumString};

use super::token::{ParserResult, Token};

/// Binary operators of the `key<op>value` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, AsRefStr)]
pub enum Operator {
    /// Keyword assignment (`=`)
    #[strum(serialize = "=")]
    Assign,
    /// Equality test (`==`)
    #[strum(serialize = "==")]
    Eq,
    /// Inequality test (`!=`)
    #[strum(serialize = "!=")]
    Ne,
    /// Regex match (`~=`)
    #[strum(serialize = "~=")]
    Match,
    /// Greater than (`>`)
    #[strum(serialize = ">")]
    Gt,
    /// Less than (`<`)
    #[strum(serialize = "<")]
    Lt,
    /// Greater or equal (`>=`)
    #[strum(serialize = ">=")]
    Ge,
    /// Less or equal (`<=`)
    #[strum(serialize = "<=")]
    Le,
    /// Append to a set/array property (`=+`)
    #[strum(serialize = "=+")]
    Inc,
    /// Remove from a set/array property (`=-`)
    #[strum(serialize = "=-")]
    Dec,
}

impl Operator {
    /// True for the operators that carry keyword/oparg semantics rather
    /// than comparison semantics.
    pub fn is_mutation(&self) -> bool {
        matches!(self, Operator::Assign | Operator::Inc | Operator::Dec)
    }
}

#[tracing::instrument(level = "trace", skip(input))]
pub fn parse_operator(input: &str) -> ParserResult<Token> {
    context(
        "operator",
        map(
            alt((
                // Two-character operators first (longest match)
                value(Operator::Inc, tag("=+")),
                value(Operator::Dec, tag("=-")),
                value(Operator::Eq, tag("==")),
                value(Operator::Ne, tag("!=")),
                value(Operator::Match, tag("~=")),
                value(Operator::Ge, tag(">=")),
                value(Operator::Le, tag("<=")),
                value(Operator::Assign, tag("=")),
                value(Operator::Gt, tag(">")),
                value(Operator::Lt, tag("<")),
            )),
            Token::Operator,
        ),
    )(input)
}

#[tracing::instrument(level = "trace", skip(input))]
pub fn parse_delimiter(input: &str) -> ParserResult<Token> {
    context(
        "delimiter",
        alt((
            value(Token::Pipe, tag("|")),
            value(Token::Comma, tag(",")),
            value(Token::ExpansionOpen, tag("{")),
            value(Token::ExpansionClose, tag("}")),
            value(Token::Atom("..".to_string()), tag("..")),
        )),
    )(input)
}

fn is_atom_start(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '/' | '-')
}

fn is_atom_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '#' | '@')
}

#[tracing::instrument(level = "trace", skip(input))]
pub fn parse_atom(input: &str) -> ParserResult<Token> {
    let (input, atom) = context(
        "atom",
        recognize(pair(
            take_while1(is_atom_start),
            take_while(is_atom_continue),
        )),
    )(input)?;

    Ok((input, Token::Atom(atom.to_string())))
}
