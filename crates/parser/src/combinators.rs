//! Nom parser combinators for plugin `.env` files.
//!
//! Each call parses a single physical line:
//! - blank lines and `# comments`
//! - `KEY=value`, optionally prefixed by `export `
//! - `"double quoted"` values with backslash escapes
//! - `'single quoted'` values taken literally
//! - unquoted values, where ` #` starts a trailing comment

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{escaped_transform, tag, take_while, take_while1},
    character::complete::{char, none_of, one_of, space0, space1},
    combinator::{map, not, opt, recognize, value},
    sequence::{delimited, pair},
};

use crate::lexer::Span;

// ============================================================================
// Utility combinators
// ============================================================================

/// Parses horizontal whitespace.
fn hspace(input: Span) -> IResult<Span, Span> {
    space0(input)
}

/// Parses a comment (# until end of line).
fn comment(input: Span) -> IResult<Span, Span> {
    recognize(pair(char('#'), take_while(|c| c != '\n'))).parse(input)
}

/// Parses the optional `export ` prefix.
fn export_prefix(input: Span) -> IResult<Span, ()> {
    value((), pair(tag("export"), space1)).parse(input)
}

// ============================================================================
// Keys and values
// ============================================================================

/// Parses a variable name: [A-Za-z_][A-Za-z0-9_]*
pub fn key(input: Span) -> IResult<Span, String> {
    map(
        recognize(pair(
            take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
            take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        )),
        |s: Span| s.fragment().to_string(),
    )
    .parse(input)
}

/// Parses a double-quoted value: "..."
fn double_quoted(input: Span) -> IResult<Span, String> {
    delimited(
        char('"'),
        map(
            opt(escaped_transform(
                none_of("\\\""),
                '\\',
                alt((
                    value('\\', char('\\')),
                    value('"', char('"')),
                    value('$', char('$')),
                    value('\n', char('n')),
                    value('\r', char('r')),
                    value('\t', char('t')),
                )),
            )),
            |s| s.unwrap_or_default(),
        ),
        char('"'),
    )
    .parse(input)
}

/// Parses a single-quoted value: '...'
fn single_quoted(input: Span) -> IResult<Span, String> {
    map(
        delimited(char('\''), take_while(|c| c != '\''), char('\'')),
        |s: Span| s.fragment().to_string(),
    )
    .parse(input)
}

/// Parses an unquoted value up to the end of line or a ` #` comment.
fn unquoted(input: Span) -> IResult<Span, String> {
    let (input, _) = not(one_of("\"'")).parse(input)?;
    let (input, raw) = take_while(|c| c != '\n' && c != '\r').parse(input)?;
    Ok((input, strip_inline_comment(raw.fragment()).to_string()))
}

fn strip_inline_comment(raw: &str) -> &str {
    let mut previous_blank = false;
    for (idx, c) in raw.char_indices() {
        if c == '#' && previous_blank {
            return raw[..idx].trim_end();
        }
        previous_blank = c == ' ' || c == '\t';
    }
    raw.trim_end()
}

// ============================================================================
// Lines
// ============================================================================

/// Parses KEY=value with optional `export` prefix and trailing comment.
pub fn assignment(input: Span) -> IResult<Span, (String, String)> {
    let (input, _) = hspace(input)?;
    let (input, _) = opt(export_prefix).parse(input)?;
    let (input, key) = key(input)?;
    let (input, _) = hspace(input)?;
    let (input, _) = char('=')(input)?;
    let (input, _) = hspace(input)?;
    let (input, value) = alt((double_quoted, single_quoted, unquoted)).parse(input)?;
    let (input, _) = hspace(input)?;
    let (input, _) = opt(comment).parse(input)?;
    Ok((input, (key, value)))
}

/// Parses one line: an assignment, or nothing but whitespace and comments.
pub fn env_line(input: Span) -> IResult<Span, Option<(String, String)>> {
    alt((
        map(assignment, Some),
        value(None, pair(hspace, opt(comment))),
    ))
    .parse(input)
}
