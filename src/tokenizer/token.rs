use nom::{branch::alt, error::VerboseError, IResult};
use thiserror::Error;

use super::{
    comment::parse_comment,
    literal::{parse_literal, Literal},
    symbol::{parse_atom, parse_delimiter, parse_operator, Operator},
    whitespace::parse_whitespace,
};

pub type ParserResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Bare word: command names, namespace names, keys, `..`, `-`, `/`.
    Atom(String),
    Literal(Literal),
    Operator(Operator),
    Pipe,
    Comma,
    ExpansionOpen,
    ExpansionClose,
    Whitespace(String),
    Comment(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenSpan {
    pub token: Token,
    pub start: usize,
    pub end: usize,
    pub column: usize,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TokenizeError {
    #[error("unrecognized input '{found}' at column {column}")]
    Unrecognized { found: String, column: usize },
}

/// Tokenizes one input line. Columns are 1-based.
#[tracing::instrument(level = "debug", skip(input))]
pub fn tokenize(input: &str) -> Result<Vec<TokenSpan>, TokenizeError> {
    let mut tokens = Vec::new();
    let mut remaining = input;
    let mut position = 0;

    while !remaining.is_empty() {
        let result = alt((
            parse_whitespace,
            parse_comment,
            parse_literal,
            parse_operator,
            parse_delimiter,
            parse_atom,
        ))(remaining);

        match result {
            Ok((rest, token)) => {
                let consumed = remaining.len() - rest.len();
                tokens.push(TokenSpan {
                    token,
                    start: position,
                    end: position + consumed,
                    column: position + 1,
                });
                position += consumed;
                remaining = rest;
            }
            Err(_) => {
                let found = remaining.chars().take(20).collect::<String>();
                let error = TokenizeError::Unrecognized {
                    found,
                    column: position + 1,
                };
                tracing::debug!("{}", error);
                return Err(error);
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Token> {
        tokenize(input)
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .filter(|t| !matches!(t, Token::Whitespace(_)))
            .collect()
    }

    #[test]
    fn test_simple_navigation_line() {
        let tokens = kinds("volume disk1 show");
        assert_eq!(
            tokens,
            vec![
                Token::Atom("volume".to_string()),
                Token::Atom("disk1".to_string()),
                Token::Atom("show".to_string()),
            ]
        );
    }

    #[test]
    fn test_assignment_operators() {
        let tokens = kinds("compression=lz4 uid>1000 tags=+backup");
        assert_eq!(
            tokens,
            vec![
                Token::Atom("compression".to_string()),
                Token::Operator(Operator::Assign),
                Token::Atom("lz4".to_string()),
                Token::Atom("uid".to_string()),
                Token::Operator(Operator::Gt),
                Token::Literal(Literal::Integer(1000)),
                Token::Atom("tags".to_string()),
                Token::Operator(Operator::Inc),
                Token::Atom("backup".to_string()),
            ]
        );
    }

    #[test]
    fn test_pipe_and_expansion() {
        let tokens = kinds("show | search uid >= { echo 10 }");
        assert!(tokens.contains(&Token::Pipe));
        assert!(tokens.contains(&Token::ExpansionOpen));
        assert!(tokens.contains(&Token::ExpansionClose));
        assert!(tokens.contains(&Token::Operator(Operator::Ge)));
    }

    #[test]
    fn test_navigational_atoms() {
        assert_eq!(kinds(".."), vec![Token::Atom("..".to_string())]);
        assert_eq!(kinds("-"), vec![Token::Atom("-".to_string())]);
        assert_eq!(kinds("/"), vec![Token::Atom("/".to_string())]);
    }

    #[test]
    fn test_comment_runs_to_end_of_line() {
        let tokens = kinds("show # trailing words = ignored");
        assert_eq!(
            tokens,
            vec![
                Token::Atom("show".to_string()),
                Token::Comment("trailing words = ignored".to_string()),
            ]
        );
    }

    #[test]
    fn test_unrecognized_input() {
        let err = tokenize("show \u{1f980}").unwrap_err();
        match err {
            TokenizeError::Unrecognized { column, .. } => assert_eq!(column, 6),
        }
    }

    #[test]
    fn test_spans_track_columns() {
        let spans = tokenize("a  bc").unwrap();
        assert_eq!(spans[0].column, 1);
        assert_eq!(spans[2].column, 4);
        assert_eq!(spans[2].end, 5);
    }
}
