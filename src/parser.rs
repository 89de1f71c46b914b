//! Token stream to AST.
//!
//! `parse` is all-or-nothing: a malformed line yields a [`SyntaxError`]
//! and no partial tree. Whitespace and comment tokens are dropped
//! before structural parsing.

use thiserror::Error;

use crate::ast::Ast;
use crate::tokenizer::{tokenize, Literal, Token, TokenSpan, TokenizeError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyntaxError {
    #[error(transparent)]
    Lex(#[from] TokenizeError),
    #[error("unexpected token '{token}' at column {column}")]
    UnexpectedToken { token: String, column: usize },
    #[error("unbalanced command expansion at column {column}")]
    UnbalancedExpansion { column: usize },
    #[error("unexpected end of line")]
    UnexpectedEnd,
    // Raised during evaluation; same taxonomy as parse failures.
    #[error("command or namespace '{0}' not found")]
    NotFound(String),
    #[error("command expansion cannot replace a command or namespace name")]
    ExpansionAsCommand,
    #[error("command expansion requires a command returning a single value")]
    ExpansionNotScalar,
    #[error("no command specified")]
    NoCommand,
    #[error("pipe command '{0}' not found")]
    PipeNotFound(String),
}

fn token_text(token: &Token) -> String {
    match token {
        Token::Atom(a) => a.clone(),
        Token::Literal(Literal::String(s)) => format!("\"{}\"", s),
        Token::Literal(Literal::Integer(n)) => n.to_string(),
        Token::Literal(Literal::Boolean(b)) => b.to_string(),
        Token::Operator(op) => op.to_string(),
        Token::Pipe => "|".to_string(),
        Token::Comma => ",".to_string(),
        Token::ExpansionOpen => "{".to_string(),
        Token::ExpansionClose => "}".to_string(),
        Token::Whitespace(_) => " ".to_string(),
        Token::Comment(c) => format!("#{}", c),
    }
}

struct Parser {
    tokens: Vec<TokenSpan>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&TokenSpan> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<TokenSpan> {
        let span = self.tokens.get(self.pos).cloned();
        if span.is_some() {
            self.pos += 1;
        }
        span
    }

    fn unexpected(&self, span: &TokenSpan) -> SyntaxError {
        SyntaxError::UnexpectedToken {
            token: token_text(&span.token),
            column: span.column,
        }
    }

    /// One pipe-level segment: expressions up to a `|`, `}` or the end.
    fn parse_segment(&mut self) -> Result<Vec<Ast>, SyntaxError> {
        let mut exprs = Vec::new();
        while let Some(span) = self.peek() {
            match span.token {
                Token::Pipe | Token::ExpansionClose => break,
                _ => exprs.push(self.parse_term()?),
            }
        }
        Ok(exprs)
    }

    /// Pipe chain at the current nesting level. `a | b | c` folds into
    /// a single PipeExpr whose left side nests the earlier pipes, as in
    /// the statement grammar.
    fn parse_statement(&mut self) -> Result<Vec<Ast>, SyntaxError> {
        let mut result = self.parse_segment()?;
        while matches!(self.peek().map(|s| &s.token), Some(Token::Pipe)) {
            let pipe = self.next().ok_or(SyntaxError::UnexpectedEnd)?;
            let right = self.parse_segment()?;
            if right.is_empty() {
                return Err(self.unexpected(&pipe));
            }
            result = vec![Ast::PipeExpr {
                left: result,
                right,
            }];
        }
        Ok(result)
    }

    fn parse_term(&mut self) -> Result<Ast, SyntaxError> {
        let span = self.next().ok_or(SyntaxError::UnexpectedEnd)?;
        match span.token.clone() {
            Token::Atom(name) => {
                if let Some(next) = self.peek() {
                    match next.token.clone() {
                        Token::Operator(op) => {
                            self.next();
                            let right = self.parse_value()?;
                            return Ok(Ast::BinaryExpr {
                                left: name,
                                op,
                                right: Box::new(right),
                            });
                        }
                        Token::Comma => return self.parse_set(name),
                        _ => {}
                    }
                }
                Ok(atom_node(name))
            }
            Token::Literal(lit) => Ok(Ast::Literal(lit.to_json())),
            Token::ExpansionOpen => {
                let inner = self.parse_statement()?;
                match self.next() {
                    Some(TokenSpan {
                        token: Token::ExpansionClose,
                        ..
                    }) => Ok(Ast::CommandExpansion(inner)),
                    _ => Err(SyntaxError::UnbalancedExpansion { column: span.column }),
                }
            }
            _ => Err(self.unexpected(&span)),
        }
    }

    /// Right side of a binary expression: literal, symbol, set, or a
    /// command expansion substituted at evaluation time.
    fn parse_value(&mut self) -> Result<Ast, SyntaxError> {
        let span = self.next().ok_or(SyntaxError::UnexpectedEnd)?;
        match span.token.clone() {
            Token::Atom(name) => {
                if matches!(self.peek().map(|s| &s.token), Some(Token::Comma)) {
                    return self.parse_set(name);
                }
                Ok(atom_node(name))
            }
            Token::Literal(lit) => Ok(Ast::Literal(lit.to_json())),
            Token::ExpansionOpen => {
                let inner = self.parse_statement()?;
                match self.next() {
                    Some(TokenSpan {
                        token: Token::ExpansionClose,
                        ..
                    }) => Ok(Ast::CommandExpansion(inner)),
                    _ => Err(SyntaxError::UnbalancedExpansion { column: span.column }),
                }
            }
            _ => Err(self.unexpected(&span)),
        }
    }

    fn parse_set(&mut self, first: String) -> Result<Ast, SyntaxError> {
        let mut values = vec![first];
        while matches!(self.peek().map(|s| &s.token), Some(Token::Comma)) {
            self.next();
            let span = self.next().ok_or(SyntaxError::UnexpectedEnd)?;
            match span.token.clone() {
                Token::Atom(name) => values.push(name),
                Token::Literal(Literal::String(s)) => values.push(s),
                Token::Literal(Literal::Integer(n)) => values.push(n.to_string()),
                Token::Literal(Literal::Boolean(b)) => values.push(b.to_string()),
                _ => return Err(self.unexpected(&span)),
            }
        }
        Ok(Ast::Set(values))
    }
}

/// The reserved word `none` is a null literal, not a symbol.
fn atom_node(name: String) -> Ast {
    if name == "none" {
        Ast::Literal(serde_json::Value::Null)
    } else {
        Ast::Symbol(name)
    }
}

/// Parses one input line into an ordered node list.
#[tracing::instrument(level = "debug", skip(line))]
pub fn parse(line: &str) -> Result<Vec<Ast>, SyntaxError> {
    let tokens = tokenize(line)?
        .into_iter()
        .filter(|s| !matches!(s.token, Token::Whitespace(_) | Token::Comment(_)))
        .collect::<Vec<_>>();

    let mut parser = Parser { tokens, pos: 0 };
    let nodes = parser.parse_statement()?;

    // A trailing `}` with no opener survives parse_statement; reject it.
    if let Some(span) = parser.peek() {
        return Err(parser.unexpected(span));
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::render;
    use crate::tokenizer::Operator;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_symbols_and_keywords() {
        let nodes = parse("volume disk1 set compression=lz4").unwrap();
        assert_eq!(
            nodes,
            vec![
                Ast::symbol("volume"),
                Ast::symbol("disk1"),
                Ast::symbol("set"),
                Ast::BinaryExpr {
                    left: "compression".to_string(),
                    op: Operator::Assign,
                    right: Box::new(Ast::symbol("lz4")),
                },
            ]
        );
    }

    #[test]
    fn test_pipe_nesting() {
        let nodes = parse("user show | search uid > 1000 | sort username").unwrap();
        assert_eq!(nodes.len(), 1);
        let Ast::PipeExpr { left, right } = &nodes[0] else {
            panic!("expected top-level pipe");
        };
        assert_eq!(right[0], Ast::symbol("sort"));
        let Ast::PipeExpr { left, right } = &left[0] else {
            panic!("expected nested pipe");
        };
        assert_eq!(left[0], Ast::symbol("user"));
        assert_eq!(right[0], Ast::symbol("search"));
        assert_eq!(
            right[1],
            Ast::BinaryExpr {
                left: "uid".to_string(),
                op: Operator::Gt,
                right: Box::new(Ast::Literal(json!(1000))),
            }
        );
    }

    #[test]
    fn test_expansion_in_binary_right() {
        let nodes = parse("set size={ volume show }").unwrap();
        assert_eq!(
            nodes[1],
            Ast::BinaryExpr {
                left: "size".to_string(),
                op: Operator::Assign,
                right: Box::new(Ast::CommandExpansion(vec![
                    Ast::symbol("volume"),
                    Ast::symbol("show"),
                ])),
            }
        );
    }

    #[test]
    fn test_set_literal() {
        let nodes = parse("set groups=wheel,operator,staff").unwrap();
        assert_eq!(
            nodes[1],
            Ast::BinaryExpr {
                left: "groups".to_string(),
                op: Operator::Assign,
                right: Box::new(Ast::Set(vec![
                    "wheel".to_string(),
                    "operator".to_string(),
                    "staff".to_string(),
                ])),
            }
        );
    }

    #[test]
    fn test_none_is_null_literal() {
        let nodes = parse("set mtu=none").unwrap();
        assert_eq!(
            nodes[1],
            Ast::BinaryExpr {
                left: "mtu".to_string(),
                op: Operator::Assign,
                right: Box::new(Ast::Literal(json!(null))),
            }
        );
    }

    #[test]
    fn test_unbalanced_expansion() {
        assert!(matches!(
            parse("echo { show").unwrap_err(),
            SyntaxError::UnbalancedExpansion { .. }
        ));
        assert!(matches!(
            parse("echo show }").unwrap_err(),
            SyntaxError::UnexpectedToken { .. }
        ));
    }

    #[test]
    fn test_dangling_operator() {
        assert!(matches!(
            parse("set compression=").unwrap_err(),
            SyntaxError::UnexpectedEnd
        ));
        assert!(matches!(
            parse("= foo").unwrap_err(),
            SyntaxError::UnexpectedToken { .. }
        ));
    }

    #[test]
    fn test_empty_pipe_segment() {
        assert!(parse("show |").is_err());
    }

    #[test]
    fn test_round_trip_whitespace_insensitive() {
        let cases = [
            "volume disk1 set compression=lz4",
            "user show | search uid>1000 | sort username",
            "set groups=wheel,operator",
            "echo { show } done",
            "set label=\"with \\\"quotes\\\"\"",
            "set mtu=none limit=0xff",
        ];
        for case in cases {
            let first = parse(case).unwrap();
            let rendered = render(&first);
            let second = parse(&rendered).unwrap();
            assert_eq!(first, second, "round trip failed for '{}'", case);
        }
    }
}
