use nom::{
    branch::alt,
    bytes::complete::{is_not, tag},
    character::complete::char,
    combinator::{map, value},
    error::context,
    multi::many0,
    sequence::delimited,
};

use super::token::{ParserResult, Token};

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Integer(i64),
    Boolean(bool),
}

impl Literal {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Literal::String(s) => serde_json::Value::String(s.clone()),
            Literal::Integer(n) => serde_json::Value::from(*n),
            Literal::Boolean(b) => serde_json::Value::Bool(*b),
        }
    }
}

fn parse_escape(input: &str) -> ParserResult<String> {
    alt((
        value("\"".to_string(), tag("\\\"")),
        value("\\".to_string(), tag("\\\\")),
        value("\n".to_string(), tag("\\n")),
        value("\t".to_string(), tag("\\t")),
    ))(input)
}

fn parse_string_chunk(input: &str) -> ParserResult<String> {
    alt((parse_escape, map(is_not("\\\""), |s: &str| s.to_string())))(input)
}

#[tracing::instrument(level = "trace", skip(input))]
fn parse_string_literal(input: &str) -> ParserResult<Literal> {
    context(
        "string literal",
        map(
            delimited(char('"'), many0(parse_string_chunk), char('"')),
            |chunks| Literal::String(chunks.concat()),
        ),
    )(input)
}

fn is_word_boundary(input: &str) -> bool {
    match input.chars().next() {
        None => true,
        Some(c) => !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/' | '#' | '@')),
    }
}

fn take_digits<'a>(
    input: &'a str,
    pred: fn(char) -> bool,
) -> Result<(&'a str, &'a str), nom::Err<nom::error::VerboseError<&'a str>>> {
    let end = input.find(|c: char| !pred(c)).unwrap_or(input.len());
    if end == 0 {
        return Err(nom::Err::Error(nom::error::VerboseError { errors: vec![] }));
    }
    Ok((&input[end..], &input[..end]))
}

fn radix_error(input: &str) -> nom::Err<nom::error::VerboseError<&str>> {
    let _ = input;
    nom::Err::Error(nom::error::VerboseError { errors: vec![] })
}

/// Decimal, `0x`, `0o` and `0b` forms. The number must end at a word
/// boundary so that names like `disk1` or `0xfs` stay atoms.
#[tracing::instrument(level = "trace", skip(input))]
fn parse_integer_literal(input: &str) -> ParserResult<Literal> {
    let (rest, radix, digits) = if let Ok((rest, _)) = tag::<_, _, nom::error::VerboseError<&str>>(
        "0x",
    )(input)
    {
        let (rest, digits) = take_digits(rest, |c| c.is_ascii_hexdigit())?;
        (rest, 16, digits)
    } else if let Ok((rest, _)) = tag::<_, _, nom::error::VerboseError<&str>>("0o")(input) {
        let (rest, digits) = take_digits(rest, |c| ('0'..='7').contains(&c))?;
        (rest, 8, digits)
    } else if let Ok((rest, _)) = tag::<_, _, nom::error::VerboseError<&str>>("0b")(input) {
        let (rest, digits) = take_digits(rest, |c| c == '0' || c == '1')?;
        (rest, 2, digits)
    } else {
        let (rest, digits) = take_digits(input, |c| c.is_ascii_digit())?;
        (rest, 10, digits)
    };

    if !is_word_boundary(rest) {
        return Err(radix_error(input));
    }

    let parsed = i64::from_str_radix(digits, radix).map_err(|_| radix_error(input))?;
    Ok((rest, Literal::Integer(parsed)))
}

#[tracing::instrument(level = "trace", skip(input))]
fn parse_boolean_literal(input: &str) -> ParserResult<Literal> {
    let (rest, flag) = alt((value(true, tag("true")), value(false, tag("false"))))(input)?;
    if !is_word_boundary(rest) {
        return Err(radix_error(input));
    }
    Ok((rest, Literal::Boolean(flag)))
}

#[tracing::instrument(level = "trace", skip(input))]
pub fn parse_literal(input: &str) -> ParserResult<Token> {
    context(
        "literal",
        map(
            alt((
                parse_string_literal,
                parse_integer_literal,
                parse_boolean_literal,
            )),
            Token::Literal,
        ),
    )(input)
}
