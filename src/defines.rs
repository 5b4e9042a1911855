//! Typed key/value defines and the literal language they travel in.
//!
//! Defines arrive from `-D KEY=VALUE` flags and from a mapping piped to
//! stdin, and leave again when a parent build serializes its exports for a
//! sub-build. Values are written and read back in one small literal grammar:
//! quoted strings, integers, floats, case-insensitive `true`/`false`/`null`
//! (`none` is accepted as a synonym on input), lists `[..]`, tuples `(..)`,
//! sets `{a, b}` (`set()` when empty) and mappings `{k: v}`. Anything else
//! is rejected; there is no expression evaluation of any kind.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// A define value. Structural equality holds across a render→parse round
/// trip, which is what sub-build export propagation relies on.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Interpret this value as a truth flag, the way `-D FLAG` (bare, no
    /// value) and `-D FLAG=true` are meant to be read.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Str(s) => !s.is_empty(),
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::List(v) | Value::Tuple(v) | Value::Set(v) => !v.is_empty(),
            Value::Map(m) => !m.is_empty(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(value: Vec<V>) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write_quoted(f, s),
            Value::Int(i) => write!(f, "{i}"),
            // {:?} keeps the trailing ".0" so floats stay floats on re-parse
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Null => f.write_str("null"),
            Value::List(items) => write_seq(f, items, "[", "]", false),
            Value::Tuple(items) => write_seq(f, items, "(", ")", items.len() == 1),
            Value::Set(items) => {
                if items.is_empty() {
                    f.write_str("set()")
                } else {
                    write_seq(f, items, "{", "}", false)
                }
            }
            Value::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("'")?;
    for c in s.chars() {
        match c {
            '\\' => f.write_str("\\\\")?,
            '\'' => f.write_str("\\'")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            '\t' => f.write_str("\\t")?,
            _ => write!(f, "{c}")?,
        }
    }
    f.write_str("'")
}

fn write_seq(
    f: &mut fmt::Formatter<'_>,
    items: &[Value],
    open: &str,
    close: &str,
    trailing_comma: bool,
) -> fmt::Result {
    f.write_str(open)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    if trailing_comma {
        f.write_str(",")?;
    }
    f.write_str(close)
}

#[derive(Debug, Error)]
#[error("invalid literal at byte {at}: {message}")]
pub struct LiteralError {
    pub at: usize,
    pub message: String,
}

/// Parse a complete literal. Trailing input other than whitespace is an
/// error.
pub fn parse_literal(text: &str) -> Result<Value, LiteralError> {
    let mut p = Parser {
        bytes: text.as_bytes(),
        pos: 0,
    };
    p.skip_ws();
    let value = p.value()?;
    p.skip_ws();
    if p.pos != p.bytes.len() {
        return Err(p.error("trailing characters after literal"));
    }
    Ok(value)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> LiteralError {
        LiteralError {
            at: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn value(&mut self) -> Result<Value, LiteralError> {
        match self.peek() {
            Some(b'\'') | Some(b'"') => self.string(),
            Some(b'[') => self.sequence(b'[', b']').map(Value::List),
            Some(b'(') => self.sequence(b'(', b')').map(Value::Tuple),
            Some(b'{') => self.braced(),
            Some(b'-') | Some(b'+') | Some(b'0'..=b'9') | Some(b'.') => self.number(),
            Some(c) if c.is_ascii_alphabetic() => self.keyword(),
            Some(_) => Err(self.error("unexpected character")),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn string(&mut self) -> Result<Value, LiteralError> {
        let quote = self.bump().unwrap();
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(b) if b == quote => break,
                Some(b'\\') => match self.bump() {
                    Some(b'\\') => out.push('\\'),
                    Some(b'\'') => out.push('\''),
                    Some(b'"') => out.push('"'),
                    Some(b'n') => out.push('\n'),
                    Some(b'r') => out.push('\r'),
                    Some(b't') => out.push('\t'),
                    Some(b'0') => out.push('\0'),
                    _ => return Err(self.error("unknown escape sequence")),
                },
                Some(b) if b < 0x80 => out.push(b as char),
                Some(b) => {
                    // re-assemble a multi-byte UTF-8 scalar
                    let start = self.pos - 1;
                    let len = utf8_len(b).ok_or_else(|| self.error("invalid UTF-8"))?;
                    let end = start + len;
                    if end > self.bytes.len() {
                        return Err(self.error("invalid UTF-8"));
                    }
                    let chunk = std::str::from_utf8(&self.bytes[start..end])
                        .map_err(|_| self.error("invalid UTF-8"))?;
                    out.push_str(chunk);
                    self.pos = end;
                }
            }
        }
        Ok(Value::Str(out))
    }

    fn number(&mut self) -> Result<Value, LiteralError> {
        let start = self.pos;
        if matches!(self.peek(), Some(b'-' | b'+')) {
            self.pos += 1;
        }
        let mut is_float = false;
        while let Some(b) = self.peek() {
            match b {
                b'0'..=b'9' => self.pos += 1,
                b'.' | b'e' | b'E' => {
                    is_float = true;
                    self.pos += 1;
                    if matches!(self.peek(), Some(b'-' | b'+')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap();
        if is_float {
            text.parse::<f64>()
                .map(Value::Float)
                .map_err(|_| self.error(format!("invalid float \"{text}\"")))
        } else {
            text.parse::<i64>()
                .map(Value::Int)
                .map_err(|_| self.error(format!("invalid integer \"{text}\"")))
        }
    }

    fn keyword(&mut self) -> Result<Value, LiteralError> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'_') {
            self.pos += 1;
        }
        let word = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap();
        match word.to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            "null" | "none" => Ok(Value::Null),
            "set" => {
                // the one non-bracket form: an explicit empty set
                self.skip_ws();
                if self.bump() == Some(b'(') {
                    self.skip_ws();
                    if self.bump() == Some(b')') {
                        return Ok(Value::Set(Vec::new()));
                    }
                }
                Err(self.error("only an empty set() call form is recognized"))
            }
            _ => Err(self.error(format!("unknown keyword \"{word}\""))),
        }
    }

    fn sequence(&mut self, open: u8, close: u8) -> Result<Vec<Value>, LiteralError> {
        debug_assert_eq!(self.peek(), Some(open));
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok(items);
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                }
                Some(c) if c == close => {}
                _ => return Err(self.error("expected \",\" or closing bracket")),
            }
        }
    }

    fn braced(&mut self) -> Result<Value, LiteralError> {
        debug_assert_eq!(self.peek(), Some(b'{'));
        self.pos += 1;
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(Value::Map(Vec::new()));
        }

        let first = self.value()?;
        self.skip_ws();
        match self.peek() {
            // `{k: v, ...}` mapping
            Some(b':') => {
                self.pos += 1;
                self.skip_ws();
                let mut entries = vec![(first, self.value()?)];
                loop {
                    self.skip_ws();
                    match self.bump() {
                        Some(b'}') => return Ok(Value::Map(entries)),
                        Some(b',') => {
                            self.skip_ws();
                            if self.peek() == Some(b'}') {
                                self.pos += 1;
                                return Ok(Value::Map(entries));
                            }
                            let key = self.value()?;
                            self.skip_ws();
                            if self.bump() != Some(b':') {
                                return Err(self.error("expected \":\" in mapping entry"));
                            }
                            self.skip_ws();
                            let value = self.value()?;
                            entries.push((key, value));
                        }
                        _ => return Err(self.error("expected \",\" or \"}\" in mapping")),
                    }
                }
            }
            // `{a, b, ...}` set
            _ => {
                let mut items = vec![first];
                loop {
                    self.skip_ws();
                    match self.bump() {
                        Some(b'}') => return Ok(Value::Set(items)),
                        Some(b',') => {
                            self.skip_ws();
                            if self.peek() == Some(b'}') {
                                self.pos += 1;
                                return Ok(Value::Set(items));
                            }
                            items.push(self.value()?);
                        }
                        _ => return Err(self.error("expected \",\" or \"}\" in set")),
                    }
                }
            }
        }
    }
}

fn utf8_len(first: u8) -> Option<usize> {
    match first {
        0xC0..=0xDF => Some(2),
        0xE0..=0xEF => Some(3),
        0xF0..=0xF7 => Some(4),
        _ => None,
    }
}

/// The process-wide define map. Built once during initialization, read-only
/// for the rest of the run.
#[derive(Debug, Clone, Default)]
pub struct Defines {
    map: HashMap<String, Value>,
}

impl Defines {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.map.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.map.insert(name.into(), value);
    }

    /// Merge a parsed `{k: v}` literal mapping, as read from stdin. Map
    /// keys must be strings.
    pub(crate) fn merge_literal_map(&mut self, value: Value) -> Result<(), LiteralError> {
        let Value::Map(entries) = value else {
            return Err(LiteralError {
                at: 0,
                message: "defines read from stdin must be a mapping".into(),
            });
        };
        for (key, value) in entries {
            let Value::Str(key) = key else {
                return Err(LiteralError {
                    at: 0,
                    message: "define names must be strings".into(),
                });
            };
            self.map.insert(key, value);
        }
        Ok(())
    }
}

/// Split one `-D` argument into its name and value. A missing `=` means
/// boolean true; a value that is not a recognizable literal is taken as a
/// bare string.
pub(crate) fn parse_define_flag(arg: &str) -> (String, Value) {
    match arg.split_once('=') {
        None => (arg.trim().to_owned(), Value::Bool(true)),
        Some((name, raw)) => {
            let value = parse_literal(raw).unwrap_or_else(|_| Value::Str(raw.to_owned()));
            (name.trim().to_owned(), value)
        }
    }
}
