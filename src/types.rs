//! Host-observable value types.
//!
//! WebAssembly itself only knows the four numeric types. Evaluations and
//! zone variables can also carry strings, arrays and maps, which live on the
//! host side of the bridge and are referred to by an integer type code.

use crate::error::{WeaverError, WeaverResult};
use std::fmt;

/// Labels of the simple and composite type classes, in type-code order.
///
/// Codes are 1-based positions in this table; a label that is not listed has
/// code 0.
const TYPE_LABELS: &[&str] = &[
    "identifier",
    "i32",
    "f32",
    "f64",
    "string",
    "map_i32",
    "map_f32",
    "map_f64",
    "map_string",
    "array",
    "i64",
    "map_i64",
    "map_identifier",
];

/// Code of a type label, or 0 if the label is unknown.
pub fn type_code(label: &str) -> u32 {
    TYPE_LABELS
        .iter()
        .position(|l| *l == label)
        .map_or(0, |p| p as u32 + 1)
}

/// Is `ty` one of the WebAssembly numeric types?
pub fn is_primitive(ty: &str) -> bool {
    matches!(ty, "i32" | "i64" | "f32" | "f64")
}

/// Number of bits needed to represent `n`.
fn bit_len(n: u32) -> u32 {
    u32::BITS - n.leading_zeros()
}

/// A type that can be used as a map key or as a leaf value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SimpleType {
    I32,
    I64,
    F32,
    F64,
    String,
    /// A string that never leaves the module, passed as an opaque handle.
    Identifier,
}

impl SimpleType {
    fn from_name(name: &str) -> Option<SimpleType> {
        Some(match name {
            "i32" => SimpleType::I32,
            "i64" => SimpleType::I64,
            "f32" => SimpleType::F32,
            "f64" => SimpleType::F64,
            "string" => SimpleType::String,
            "identifier" => SimpleType::Identifier,
            _ => return None,
        })
    }

    /// The textual name of the type.
    pub fn name(self) -> &'static str {
        match self {
            SimpleType::I32 => "i32",
            SimpleType::I64 => "i64",
            SimpleType::F32 => "f32",
            SimpleType::F64 => "f64",
            SimpleType::String => "string",
            SimpleType::Identifier => "identifier",
        }
    }
}

/// The type of a runtime variable.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum VariableType {
    Simple(SimpleType),
    /// `[]T`
    Array(Box<VariableType>),
    /// `map[K]V`
    Map(SimpleType, Box<VariableType>),
}

impl VariableType {
    /// Parse a type such as `i32`, `[]string` or `map[i32][]f64`.
    pub fn parse(s: &str) -> WeaverResult<VariableType> {
        let invalid = || WeaverError::InvalidType(s.to_string());
        if let Some(simple) = SimpleType::from_name(s) {
            return Ok(VariableType::Simple(simple));
        }
        if let Some(elem) = s.strip_prefix("[]") {
            let elem = VariableType::parse(elem).map_err(|_| invalid())?;
            return Ok(VariableType::Array(Box::new(elem)));
        }
        if let Some(rest) = s.strip_prefix("map[") {
            let (key, value) = rest.split_once(']').ok_or_else(invalid)?;
            let key = SimpleType::from_name(key).ok_or_else(invalid)?;
            let value = VariableType::parse(value).map_err(|_| invalid())?;
            return Ok(VariableType::Map(key, Box::new(value)));
        }
        Err(invalid())
    }

    /// Is this a WebAssembly numeric type?
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            VariableType::Simple(SimpleType::I32 | SimpleType::I64 | SimpleType::F32 | SimpleType::F64)
        )
    }

    /// The label of the type class, used to look up its own code.
    pub fn label(&self) -> String {
        match self {
            VariableType::Simple(s) => s.name().to_string(),
            VariableType::Array(_) => "array".to_string(),
            VariableType::Map(key, _) => format!("map_{}", key.name()),
        }
    }

    /// The integer type code understood by the host bridge.
    ///
    /// A composite code is its own class code shifted left past the code of
    /// its element type, OR-ed with the element code. The shift is a multiple
    /// of the width of the simple-code table so that codes decompose
    /// unambiguously.
    pub fn code(&self) -> u32 {
        let own = type_code(&self.label());
        let sub = match self {
            VariableType::Simple(_) => return own,
            VariableType::Array(elem) => elem.code(),
            VariableType::Map(_, value) => value.code(),
        };
        let unit = bit_len(TYPE_LABELS.len() as u32);
        let mut shift = bit_len(sub);
        if shift % unit != 0 {
            shift += unit - shift % unit;
        }
        let shift = shift.max(unit);
        (own << shift) | sub
    }

    /// The type code as seen from a function's scope: a string that is not
    /// exported stays an opaque identifier.
    pub fn code_on_fn(&self, exported: bool) -> u32 {
        match self {
            VariableType::Simple(SimpleType::String) if !exported => type_code("identifier"),
            _ => self.code(),
        }
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VariableType::Simple(s) => f.write_str(s.name()),
            VariableType::Array(elem) => write!(f, "[]{elem}"),
            VariableType::Map(key, value) => write!(f, "map[{}]{value}", key.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn code(s: &str) -> u32 {
        VariableType::parse(s).unwrap().code()
    }

    #[test]
    fn simple_codes() {
        assert_eq!(code("identifier"), 1);
        assert_eq!(code("i32"), 2);
        assert_eq!(code("string"), 5);
        assert_eq!(code("i64"), 11);
    }

    #[test]
    fn composite_codes() {
        assert_eq!(code("[]i32"), (10 << 4) | 2);
        assert_eq!(code("map[string]i32"), (9 << 4) | 2);
        let inner = (10 << 4) | 3;
        assert_eq!(code("[][]f32"), (10 << 8) | inner);
        assert_ne!(code("[]f32"), code("map[i32]f32"));
    }

    #[test]
    fn parse_and_display() {
        for s in ["i32", "[]string", "map[i32][]f64", "map[identifier]string"] {
            assert_eq!(VariableType::parse(s).unwrap().to_string(), s);
        }
        assert!(VariableType::parse("i8").is_err());
        assert!(VariableType::parse("map[[]i32]i32").is_err());
        assert!(VariableType::parse("[]").is_err());
        assert!(VariableType::parse("map[i32").is_err());
    }

    #[test]
    fn primitives() {
        assert!(VariableType::parse("f64").unwrap().is_primitive());
        assert!(!VariableType::parse("string").unwrap().is_primitive());
        assert!(!VariableType::parse("[]i32").unwrap().is_primitive());
        assert!(is_primitive("i64"));
        assert!(!is_primitive("identifier"));
    }

    #[test]
    fn scoped_string_code() {
        let s = VariableType::parse("string").unwrap();
        assert_eq!(s.code_on_fn(false), 1);
        assert_eq!(s.code_on_fn(true), 5);
        assert_eq!(s.label(), "string");
        assert_eq!(VariableType::parse("map[f32]i32").unwrap().label(), "map_f32");
    }
}
