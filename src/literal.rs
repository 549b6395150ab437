//! Bracketed string-list literals stored inside sink fields (`['4.4', '3.3.1']`).

use std::iter::Peekable;
use std::str::CharIndices;

/// Failure while reading a list literal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LiteralError {
    /// A specific token was required at `position`.
    #[error("expected {expected} at byte {position}")]
    Expected {
        /// What the parser was looking for.
        expected: &'static str,
        /// Byte offset into the input.
        position: usize,
    },
    /// Input ended inside a string or before the closing bracket.
    #[error("unterminated list literal")]
    Unterminated,
    /// Non-whitespace content followed the closing bracket.
    #[error("trailing content at byte {0}")]
    Trailing(usize),
}

/// Renders strings as a single-line list literal.
pub fn format_list<S: AsRef<str>>(items: &[S]) -> String {
    let mut out = String::from("[");
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        push_quoted(&mut out, item.as_ref());
    }
    out.push(']');
    out
}

fn push_quoted(out: &mut String, value: &str) {
    let quote = if value.contains('\'') && !value.contains('"') {
        '"'
    } else {
        '\''
    };
    out.push(quote);
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
}

/// Parses a list literal of quoted strings back into its ordered items.
pub fn parse_list(input: &str) -> Result<Vec<String>, LiteralError> {
    let mut chars = input.char_indices().peekable();
    skip_ws(&mut chars);
    match chars.next() {
        Some((_, '[')) => {}
        Some((pos, _)) => {
            return Err(LiteralError::Expected {
                expected: "'['",
                position: pos,
            })
        }
        None => return Err(LiteralError::Unterminated),
    }

    let mut items = Vec::new();
    loop {
        skip_ws(&mut chars);
        match chars.next() {
            Some((_, ']')) => break,
            Some((_, quote @ ('\'' | '"'))) => {
                items.push(read_string(&mut chars, quote)?);
                skip_ws(&mut chars);
                match chars.next() {
                    Some((_, ',')) => continue,
                    Some((_, ']')) => break,
                    Some((pos, _)) => {
                        return Err(LiteralError::Expected {
                            expected: "',' or ']'",
                            position: pos,
                        })
                    }
                    None => return Err(LiteralError::Unterminated),
                }
            }
            Some((pos, _)) => {
                return Err(LiteralError::Expected {
                    expected: "quoted string",
                    position: pos,
                })
            }
            None => return Err(LiteralError::Unterminated),
        }
    }

    skip_ws(&mut chars);
    if let Some((pos, _)) = chars.next() {
        return Err(LiteralError::Trailing(pos));
    }
    Ok(items)
}

fn skip_ws(chars: &mut Peekable<CharIndices<'_>>) {
    while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
}

fn read_string(
    chars: &mut Peekable<CharIndices<'_>>,
    quote: char,
) -> Result<String, LiteralError> {
    let mut value = String::new();
    loop {
        match chars.next() {
            Some((_, c)) if c == quote => return Ok(value),
            Some((_, '\\')) => match chars.next() {
                Some((_, 'n')) => value.push('\n'),
                Some((_, 't')) => value.push('\t'),
                Some((_, 'r')) => value.push('\r'),
                Some((_, other)) => value.push(other),
                None => return Err(LiteralError::Unterminated),
            },
            Some((_, c)) => value.push(c),
            None => return Err(LiteralError::Unterminated),
        }
    }
}
