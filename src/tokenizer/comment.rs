use nom::{
    bytes::complete::{tag, take_while},
    error::context,
    sequence::preceded,
};

use super::token::{ParserResult, Token};

/// `#` runs to the end of the line. Only matches at a token boundary;
/// a `#` inside an atom (e.g. `vol#1`) belongs to the atom.
#[tracing::instrument(level = "trace", skip(input))]
pub fn parse_comment(input: &str) -> ParserResult<Token> {
    let (input, body) = context("comment", preceded(tag("#"), take_while(|c| c != '\n')))(input)?;
    Ok((input, Token::Comment(body.trim().to_string())))
}
