//! Structured-header dictionary parsing.
//!
//! The update protocol carries both the code-signing signature
//! (`expo-signature`) and the manifest filters (`expo-manifest-filters`)
//! as dictionaries of the form `key="string", other=token, flag=?1, n=42`.
//! Only the item subset used by the protocol is supported: strings,
//! tokens, integers and booleans. Parameters and inner lists are rejected.

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// A single dictionary member value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    /// Quoted string.
    String(String),
    /// Bare token.
    Token(String),
    /// Integer.
    Integer(i64),
    /// Boolean (`?1` / `?0`, or a key with no value).
    Boolean(bool),
}

impl HeaderValue {
    /// String content for string and token items.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Token(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) | Self::Token(s) => f.write_str(s),
            Self::Integer(n) => write!(f, "{n}"),
            Self::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// Error produced for malformed header input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed structured header: {0}")]
pub struct HeaderParseError(pub String);

/// Parse a structured-header dictionary.
///
/// Later duplicates of a key overwrite earlier ones.
///
/// # Errors
///
/// Returns an error describing the first malformed member.
pub fn parse_dictionary(input: &str) -> Result<BTreeMap<String, HeaderValue>, HeaderParseError> {
    let mut parser = Parser {
        chars: input.trim().chars().collect(),
        pos: 0,
    };
    let mut out = BTreeMap::new();

    if parser.at_end() {
        return Ok(out);
    }

    loop {
        let key = parser.key()?;
        let value = if parser.eat('=') {
            parser.item()?
        } else {
            HeaderValue::Boolean(true)
        };
        out.insert(key, value);

        parser.skip_ows();
        if parser.at_end() {
            break;
        }
        if !parser.eat(',') {
            return Err(parser.error("expected ','"));
        }
        parser.skip_ows();
        if parser.at_end() {
            return Err(parser.error("trailing ','"));
        }
    }

    Ok(out)
}

/// Serialize a dictionary of string members.
#[must_use]
pub fn serialize_string_dictionary<'a, I>(members: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    members
        .into_iter()
        .map(|(k, v)| {
            let escaped = v.replace('\\', "\\\\").replace('"', "\\\"");
            format!("{k}=\"{escaped}\"")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ows(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t')) {
            self.pos += 1;
        }
    }

    fn error(&self, what: &str) -> HeaderParseError {
        HeaderParseError(format!("{what} at offset {}", self.pos))
    }

    fn key(&mut self) -> Result<String, HeaderParseError> {
        match self.peek() {
            Some(c) if c.is_ascii_lowercase() || c == '*' => {}
            _ => return Err(self.error("expected key")),
        }
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.' | '*') {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn item(&mut self) -> Result<HeaderValue, HeaderParseError> {
        match self.peek() {
            Some('"') => self.string(),
            Some('?') => self.boolean(),
            Some(c) if c == '-' || c.is_ascii_digit() => self.integer(),
            Some(c) if c.is_ascii_alphabetic() || c == '*' => Ok(self.token()),
            _ => Err(self.error("expected item")),
        }
    }

    fn string(&mut self) -> Result<HeaderValue, HeaderParseError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some('"') => {
                    self.pos += 1;
                    return Ok(HeaderValue::String(out));
                }
                Some('\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(c @ ('"' | '\\')) => {
                            out.push(c);
                            self.pos += 1;
                        }
                        _ => return Err(self.error("invalid escape")),
                    }
                }
                Some(c) if (' '..='~').contains(&c) => {
                    out.push(c);
                    self.pos += 1;
                }
                Some(_) => return Err(self.error("invalid character in string")),
            }
        }
    }

    fn boolean(&mut self) -> Result<HeaderValue, HeaderParseError> {
        self.pos += 1;
        match self.peek() {
            Some('1') => {
                self.pos += 1;
                Ok(HeaderValue::Boolean(true))
            }
            Some('0') => {
                self.pos += 1;
                Ok(HeaderValue::Boolean(false))
            }
            _ => Err(self.error("invalid boolean")),
        }
    }

    fn integer(&mut self) -> Result<HeaderValue, HeaderParseError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<i64>()
            .map(HeaderValue::Integer)
            .map_err(|_| self.error("invalid integer"))
    }

    fn token(&mut self) -> HeaderValue {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~:/".contains(c) {
                self.pos += 1;
            } else {
                break;
            }
        }
        HeaderValue::Token(self.chars[start..self.pos].iter().collect())
    }
}
