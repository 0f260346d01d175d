//! Reader for the JavaScript object literals embedded in catalogue pages.
//!
//! Accepts the subset those pages use: objects with bare, single- or
//! double-quoted keys, arrays, strings in either quote style, numbers,
//! `true`, `false`, `null` and `undefined` (read as null), with optional
//! trailing commas.

use serde_json::{Map, Number, Value as JsonValue};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at offset {offset}")]
pub struct LiteralError {
    pub offset: usize,
    pub message: String,
}

pub fn parse(input: &str) -> Result<JsonValue, LiteralError> {
    let mut reader = Reader {
        chars: input.char_indices().collect(),
        pos: 0,
    };
    let value = reader.value()?;
    reader.skip_ws();
    if reader.pos < reader.chars.len() {
        return Err(reader.error("trailing characters"));
    }
    Ok(value)
}

struct Reader {
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl Reader {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|(_, c)| *c)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn offset(&self) -> usize {
        self.chars.get(self.pos).map(|(i, _)| *i).unwrap_or_else(|| {
            self.chars.last().map(|(i, c)| i + c.len_utf8()).unwrap_or(0)
        })
    }

    fn error(&self, message: &str) -> LiteralError {
        LiteralError {
            offset: self.offset(),
            message: message.to_string(),
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, want: char) -> Result<(), LiteralError> {
        self.skip_ws();
        match self.bump() {
            Some(c) if c == want => Ok(()),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error(&format!("expected `{want}`")))
            }
        }
    }

    fn value(&mut self) -> Result<JsonValue, LiteralError> {
        self.skip_ws();
        match self.peek() {
            Some('{') => self.object(),
            Some('[') => self.array(),
            Some(q @ ('"' | '\'')) => self.string(q).map(JsonValue::String),
            Some(c) if c == '-' || c == '+' || c == '.' || c.is_ascii_digit() => self.number(),
            Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {
                let word = self.identifier();
                match word.as_str() {
                    "true" => Ok(JsonValue::Bool(true)),
                    "false" => Ok(JsonValue::Bool(false)),
                    "null" | "undefined" => Ok(JsonValue::Null),
                    _ => Err(self.error(&format!("unsupported identifier `{word}`"))),
                }
            }
            Some(_) => Err(self.error("unexpected character")),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn object(&mut self) -> Result<JsonValue, LiteralError> {
        self.expect('{')?;
        let mut map = Map::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some('}') => {
                    self.pos += 1;
                    return Ok(JsonValue::Object(map));
                }
                Some(q @ ('"' | '\'')) => {
                    let key = self.string(q)?;
                    self.expect(':')?;
                    map.insert(key, self.value()?);
                }
                Some(c) if c.is_alphanumeric() || c == '_' || c == '$' => {
                    let key = self.identifier();
                    self.expect(':')?;
                    map.insert(key, self.value()?);
                }
                _ => return Err(self.error("expected a key or `}`")),
            }
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(JsonValue::Object(map)),
                _ => {
                    self.pos = self.pos.saturating_sub(1);
                    return Err(self.error("expected `,` or `}`"));
                }
            }
        }
    }

    fn array(&mut self) -> Result<JsonValue, LiteralError> {
        self.expect('[')?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(']') {
                self.pos += 1;
                return Ok(JsonValue::Array(items));
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some(']') => return Ok(JsonValue::Array(items)),
                _ => {
                    self.pos = self.pos.saturating_sub(1);
                    return Err(self.error("expected `,` or `]`"));
                }
            }
        }
    }

    fn identifier(&mut self) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '$' {
                out.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        out
    }

    fn string(&mut self, quote: char) -> Result<String, LiteralError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error("unterminated string"));
            };
            if c == quote {
                return Ok(out);
            }
            if c != '\\' {
                out.push(c);
                continue;
            }
            let Some(escaped) = self.bump() else {
                return Err(self.error("unterminated escape"));
            };
            match escaped {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                'b' => out.push('\u{8}'),
                'f' => out.push('\u{c}'),
                '0' => out.push('\0'),
                'u' => out.push(self.unicode_escape()?),
                '\n' => {}
                other => out.push(other),
            }
        }
    }

    fn unicode_escape(&mut self) -> Result<char, LiteralError> {
        let mut code = 0u32;
        for _ in 0..4 {
            let digit = self
                .bump()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| self.error("invalid \\u escape"))?;
            code = code * 16 + digit;
        }
        if (0xD800..0xDC00).contains(&code) {
            let save = self.pos;
            if self.bump() == Some('\\') && self.bump() == Some('u') {
                let mut low = 0u32;
                let mut ok = true;
                for _ in 0..4 {
                    match self.bump().and_then(|c| c.to_digit(16)) {
                        Some(d) => low = low * 16 + d,
                        None => ok = false,
                    }
                }
                if ok && (0xDC00..0xE000).contains(&low) {
                    let combined = 0x10000 + ((code - 0xD800) << 10) + (low - 0xDC00);
                    return Ok(char::from_u32(combined).unwrap_or('\u{FFFD}'));
                }
            }
            self.pos = save;
            return Ok('\u{FFFD}');
        }
        Ok(char::from_u32(code).unwrap_or('\u{FFFD}'))
    }

    fn number(&mut self) -> Result<JsonValue, LiteralError> {
        let start = self.pos;
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E') {
                text.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        let trimmed = text.trim_start_matches('+');
        if let Ok(int) = trimmed.parse::<i64>() {
            return Ok(JsonValue::Number(int.into()));
        }
        trimmed
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(JsonValue::Number)
            .ok_or_else(|| {
                self.pos = start;
                self.error(&format!("invalid number `{text}`"))
            })
    }
}
