use nom::{character::complete::multispace1, error::context};

use super::token::{ParserResult, Token};

#[tracing::instrument(level = "trace", skip(input))]
pub fn parse_whitespace(input: &str) -> ParserResult<Token> {
    let (input, ws) = context("whitespace", multispace1)(input)?;
    Ok((input, Token::Whitespace(ws.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace() {
        let (rest, token) = parse_whitespace("  \tnext").unwrap();
        assert_eq!(token, Token::Whitespace("  \t".to_string()));
        assert_eq!(rest, "next");
    }
}
