//! Tokenizer for the query language.
//!
//! Numbers, durations and strings are kept as raw text; the parser decides
//! how to interpret them. Keywords are not distinguished here because most of
//! them are contextual (`and` is an operator, `by` only means something after
//! an aggregation).

use super::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Identifier or keyword, including metric names with `:`.
    Ident(String),
    /// Numeric literal (decimal, hex, `inf`, `nan`), raw text.
    Number(String),
    /// Duration literal such as `5m` or `1h30m`, raw text.
    Duration(String),
    /// String literal, raw text including the surrounding quotes.
    Str(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    At,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    EqlEql,
    Neq,
    EqlRegex,
    NeqRegex,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl Token {
    /// Human-readable description used in parse errors.
    pub fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("identifier {:?}", s),
            Token::Number(s) => format!("number {:?}", s),
            Token::Duration(s) => format!("duration {:?}", s),
            Token::Str(_) => "string literal".to_string(),
            other => format!("{:?}", other),
        }
    }
}

const DURATION_UNITS: [&str; 7] = ["ms", "s", "m", "h", "d", "w", "y"];

pub fn lex(input: &str) -> Result<Vec<(Token, usize)>, ParseError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            '(' => push(&mut tokens, Token::LParen, &mut i),
            ')' => push(&mut tokens, Token::RParen, &mut i),
            '{' => push(&mut tokens, Token::LBrace, &mut i),
            '}' => push(&mut tokens, Token::RBrace, &mut i),
            '[' => push(&mut tokens, Token::LBracket, &mut i),
            ']' => push(&mut tokens, Token::RBracket, &mut i),
            ',' => push(&mut tokens, Token::Comma, &mut i),
            '@' => push(&mut tokens, Token::At, &mut i),
            '+' => push(&mut tokens, Token::Add, &mut i),
            '-' => push(&mut tokens, Token::Sub, &mut i),
            '*' => push(&mut tokens, Token::Mul, &mut i),
            '/' => push(&mut tokens, Token::Div, &mut i),
            '%' => push(&mut tokens, Token::Mod, &mut i),
            '^' => push(&mut tokens, Token::Pow, &mut i),
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((Token::EqlEql, i));
                    i += 2;
                } else if bytes.get(i + 1) == Some(&b'~') {
                    tokens.push((Token::EqlRegex, i));
                    i += 2;
                } else {
                    tokens.push((Token::Eq, i));
                    i += 1;
                }
            }
            '!' => match bytes.get(i + 1) {
                Some(&b'=') => {
                    tokens.push((Token::Neq, i));
                    i += 2;
                }
                Some(&b'~') => {
                    tokens.push((Token::NeqRegex, i));
                    i += 2;
                }
                _ => {
                    return Err(ParseError::at(i, "unexpected character '!'"));
                }
            },
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((Token::Lte, i));
                    i += 2;
                } else {
                    tokens.push((Token::Lt, i));
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((Token::Gte, i));
                    i += 2;
                } else {
                    tokens.push((Token::Gt, i));
                    i += 1;
                }
            }
            ':' => push(&mut tokens, Token::Colon, &mut i),
            '"' | '\'' => {
                let (raw, next) = lex_string(input, i, c)?;
                tokens.push((Token::Str(raw), i));
                i = next;
            }
            '`' => {
                let rest = &input[i + 1..];
                match rest.find('`') {
                    Some(end) => {
                        let raw = input[i..i + 1 + end + 1].to_string();
                        tokens.push((Token::Str(raw), i));
                        i += end + 2;
                    }
                    None => return Err(ParseError::at(i, "unterminated raw string")),
                }
            }
            _ if c.is_ascii_digit() || (c == '.' && next_is_digit(bytes, i + 1)) => {
                let (token, next) = lex_number_or_duration(input, i)?;
                tokens.push((token, i));
                i = next;
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let b = bytes[i] as char;
                    if b.is_ascii_alphanumeric() || b == '_' || b == ':' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let word = &input[start..i];
                if word.eq_ignore_ascii_case("inf") || word.eq_ignore_ascii_case("nan") {
                    tokens.push((Token::Number(word.to_string()), start));
                } else {
                    tokens.push((Token::Ident(word.to_string()), start));
                }
            }
            _ => {
                return Err(ParseError::at(i, format!("unexpected character {:?}", c)));
            }
        }
    }

    Ok(tokens)
}

fn push(tokens: &mut Vec<(Token, usize)>, token: Token, i: &mut usize) {
    tokens.push((token, *i));
    *i += 1;
}

fn next_is_digit(bytes: &[u8], i: usize) -> bool {
    bytes.get(i).is_some_and(|b| b.is_ascii_digit())
}

/// Lex a quoted string, returning the raw text (quotes included) and the
/// index just past the closing quote.
fn lex_string(input: &str, start: usize, quote: char) -> Result<(String, usize), ParseError> {
    let bytes = input.as_bytes();
    let mut i = start + 1;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '\\' {
            i += 2;
            continue;
        }
        if c == quote {
            return Ok((input[start..=i].to_string(), i + 1));
        }
        i += 1;
    }
    Err(ParseError::at(start, "unterminated string literal"))
}

/// Lex a numeric literal or a duration. Durations are one or more
/// `<digits><unit>` groups; anything else falls back to a number.
fn lex_number_or_duration(input: &str, start: usize) -> Result<(Token, usize), ParseError> {
    if let Some((raw, next)) = try_duration(input, start) {
        return Ok((Token::Duration(raw), next));
    }

    let bytes = input.as_bytes();
    let mut i = start;

    if input[i..].starts_with("0x") || input[i..].starts_with("0X") {
        i += 2;
        let hex_start = i;
        while i < bytes.len() && (bytes[i] as char).is_ascii_hexdigit() {
            i += 1;
        }
        if i == hex_start {
            return Err(ParseError::at(start, "malformed hexadecimal number"));
        }
        return Ok((Token::Number(input[start..i].to_string()), i));
    }

    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if bytes.get(i) == Some(&b'.') {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if matches!(bytes.get(i), Some(b'e') | Some(b'E')) {
        let mut j = i + 1;
        if matches!(bytes.get(j), Some(b'+') | Some(b'-')) {
            j += 1;
        }
        if bytes.get(j).is_some_and(|b| b.is_ascii_digit()) {
            i = j;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
        }
    }

    Ok((Token::Number(input[start..i].to_string()), i))
}

/// Try to lex a duration (`5m`, `1h30m`, `90s`, ...) at `start`. Returns the
/// raw text and the index past it, or `None` if this is not a duration.
fn try_duration(input: &str, start: usize) -> Option<(String, usize)> {
    let bytes = input.as_bytes();
    let mut i = start;
    let mut groups = 0;

    loop {
        let digits_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == digits_start {
            break;
        }
        let mut matched = false;
        for unit in DURATION_UNITS {
            if input[i..].starts_with(unit) {
                // "m" must not swallow the first letter of "ms".
                let after = i + unit.len();
                if unit == "m" && input[after..].starts_with('s') {
                    continue;
                }
                i = after;
                matched = true;
                break;
            }
        }
        if !matched {
            return None;
        }
        groups += 1;
    }

    if groups == 0 {
        return None;
    }
    // A trailing alphanumeric character means this was not a duration after
    // all (e.g. the identifier-like "5min").
    if bytes
        .get(i)
        .is_some_and(|b| (*b as char).is_ascii_alphanumeric() || *b == b'_')
    {
        return None;
    }
    Some((input[start..i].to_string(), i))
}
