//! Parser for variable declarations of the form `type = value`.
//!
//! ```text
//! decl  := type ( "=" value )?
//! type  := simple | "[]" type | "map[" simple "]" type
//! value := number | string | "[" value ( "," value )* "]"
//! ```

use crate::error::{WeaverError, WeaverResult};
use crate::types::VariableType;

/// A parsed variable declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Variable {
    /// The declared type.
    pub ty: VariableType,
    /// The normalized initial value. Empty means the default value.
    pub value: String,
}

/// Parse a variable declaration.
///
/// Numbers are normalized to their shortest form and zero becomes the empty
/// (default) value. A top-level string loses its quotes; strings nested in
/// arrays keep them.
pub fn parse_variable(input: &str) -> WeaverResult<Variable> {
    let (ty, value) = match input.split_once('=') {
        Some((ty, value)) => (ty, Some(value)),
        None => (input, None),
    };
    let ty: String = ty.chars().filter(|c| !c.is_whitespace()).collect();
    let ty = VariableType::parse(&ty).map_err(|e| error(input, e.to_string()))?;
    let value = match value {
        Some(value) => {
            let mut parser = ValueParser {
                input,
                src: value.trim().as_bytes(),
                pos: 0,
            };
            let parsed = parser.value(true)?;
            parser.skip_spaces();
            if parser.pos != parser.src.len() {
                return Err(error(input, "unexpected trailing characters"));
            }
            parsed
        }
        None => String::new(),
    };
    Ok(Variable { ty, value })
}

fn error(input: &str, msg: impl Into<String>) -> WeaverError {
    WeaverError::Variable {
        input: input.to_string(),
        msg: msg.into(),
    }
}

struct ValueParser<'a> {
    input: &'a str,
    src: &'a [u8],
    pos: usize,
}

impl ValueParser<'_> {
    fn skip_spaces(&mut self) {
        while self.src.get(self.pos).is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn value(&mut self, top: bool) -> WeaverResult<String> {
        self.skip_spaces();
        match self.src.get(self.pos) {
            Some(b'"') => self.string(top),
            Some(b'[') => self.array(),
            Some(c) if c.is_ascii_digit() || matches!(c, b'-' | b'.') => self.number(),
            Some(c) => Err(error(self.input, format!("unexpected character `{}`", char::from(*c)))),
            None => Err(error(self.input, "missing value")),
        }
    }

    fn string(&mut self, top: bool) -> WeaverResult<String> {
        let start = self.pos;
        self.pos += 1;
        while let Some(c) = self.src.get(self.pos) {
            self.pos += 1;
            match c {
                b'\\' => self.pos += 1,
                b'"' => {
                    let raw = String::from_utf8_lossy(&self.src[start..self.pos]);
                    return Ok(if top {
                        raw[1..raw.len() - 1].to_string()
                    } else {
                        raw.into_owned()
                    });
                }
                _ => {}
            }
        }
        Err(error(self.input, "unterminated string"))
    }

    fn number(&mut self) -> WeaverResult<String> {
        let start = self.pos;
        while self
            .src
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_digit() || matches!(c, b'-' | b'.'))
        {
            self.pos += 1;
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]);
        let n: f64 = text
            .parse()
            .map_err(|_| error(self.input, format!("invalid number `{text}`")))?;
        if n == 0.0 {
            return Ok(String::new());
        }
        Ok(n.to_string())
    }

    fn array(&mut self) -> WeaverResult<String> {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_spaces();
            if self.src.get(self.pos) == Some(&b']') && items.is_empty() {
                self.pos += 1;
                break;
            }
            items.push(self.value(false)?);
            self.skip_spaces();
            match self.src.get(self.pos) {
                Some(b',') => self.pos += 1,
                Some(b']') => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(error(self.input, "expected `,` or `]`")),
            }
        }
        Ok(format!("[{}]", items.join(",")))
    }
}
