//! Values produced by keyword expressions and their coercions.

use crate::error::{WeaverError, WeaverResult};
use crate::template::SearchResult;
use indexmap::IndexMap;
use std::fmt;

pub(crate) const TRUE: &str = "true";
pub(crate) const FALSE: &str = "false";

/// A structured keyword value: join-point data, lambda arguments, arrays.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Object {
    #[default]
    Null,
    Primitive(String),
    Array(Vec<Object>),
    /// Fields keyed by their capitalized name.
    Map(IndexMap<String, Object>),
}

impl Object {
    /// Convert any serializable value, e.g. join-point data, into an object.
    pub fn from_serialize<T: serde::Serialize>(value: &T) -> WeaverResult<Object> {
        Ok(serde_json::to_value(value)?.into())
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self, Object::Primitive(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Object::Null => 0,
            Object::Primitive(s) => s.len(),
            Object::Array(a) => a.len(),
            Object::Map(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Field values or array elements, in order.
    pub fn elements(&self) -> Vec<Object> {
        match self {
            Object::Null => Vec::new(),
            Object::Primitive(_) => vec![self.clone()],
            Object::Array(a) => a.clone(),
            Object::Map(m) => m.values().cloned().collect(),
        }
    }

    /// [`Object::elements`] as text.
    pub fn string_slice(&self) -> Vec<String> {
        self.elements().iter().map(Object::to_string).collect()
    }

    /// Field names with a lower-case first letter, as written in scripts.
    pub fn keys(&self) -> Vec<String> {
        match self {
            Object::Map(m) => m.keys().map(|k| lower_first(k)).collect(),
            _ => Vec::new(),
        }
    }

    /// The field `name`, or `Null` if the object does not have it.
    pub fn prop(&self, name: &str) -> WeaverResult<Object> {
        match self {
            Object::Map(m) => Ok(m.get(name).cloned().unwrap_or_default()),
            _ => Err(WeaverError::keyword(
                format!(".{name}"),
                format!("accessing a property of a non-object value `{self}`"),
            )),
        }
    }

    /// Merge `other` into this object: maps take the other's fields, arrays
    /// are concatenated and `Null` becomes a copy of `other`.
    pub fn join(&mut self, other: &Object) {
        match (self, other) {
            (Object::Map(a), Object::Map(b)) => {
                a.extend(b.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            (Object::Array(a), Object::Array(b)) => a.extend(b.iter().cloned()),
            (this @ Object::Null, other) => *this = other.clone(),
            _ => {}
        }
    }

    /// Element `i`; `Null` past the end of an array.
    pub fn index(&self, i: usize) -> WeaverResult<Object> {
        match self {
            Object::Array(a) => Ok(a.get(i).cloned().unwrap_or_default()),
            Object::Primitive(s) => s
                .chars()
                .nth(i)
                .map(|c| Object::Primitive(c.to_string()))
                .ok_or_else(|| index_error(i, s.chars().count())),
            _ => Err(WeaverError::keyword(
                format!("[{i}]"),
                format!("accessing an index of a non-array value `{self}`"),
            )),
        }
    }
}

pub(crate) fn index_error(index: usize, len: usize) -> WeaverError {
    WeaverError::keyword(
        format!("[{index}]"),
        format!("index out of range (length {len})"),
    )
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::Null => Ok(()),
            Object::Primitive(s) => f.write_str(s),
            Object::Array(a) => {
                write!(f, "[")?;
                for (i, o) in a.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{o}")?;
                }
                write!(f, "]")
            }
            Object::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{k}:{v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<serde_json::Value> for Object {
    fn from(value: serde_json::Value) -> Object {
        use serde_json::Value as Json;
        match value {
            Json::Null => Object::Null,
            Json::Bool(b) => Object::Primitive(b.to_string()),
            Json::Number(n) => Object::Primitive(n.to_string()),
            Json::String(s) => Object::Primitive(s),
            Json::Array(a) => Object::Array(a.into_iter().map(Object::from).collect()),
            Json::Object(m) => Object::Map(m.into_iter().map(|(k, v)| (k, v.into())).collect()),
        }
    }
}

impl From<&str> for Object {
    fn from(s: &str) -> Object {
        Object::Primitive(s.to_string())
    }
}

/// The value of a keyword expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    String(String),
    StringSlice(Vec<String>),
    Object(Object),
    /// A template search result, narrowed by outbound operations.
    Search(SearchResult),
}

impl Value {
    /// The name reported by the `type()` method.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::StringSlice(_) => "string_slice",
            Value::Search(_) => "template_search",
            Value::Object(_) => "object",
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::StringSlice(v) => v.concat(),
            Value::Object(o) => o.to_string(),
            Value::Search(s) => s.value(),
        }
    }

    pub fn to_slice(&self) -> Vec<String> {
        match self {
            Value::StringSlice(v) => v.clone(),
            Value::Object(o) if !o.is_primitive() => o.string_slice(),
            v => vec![v.to_text()],
        }
    }

    pub fn to_object(&self) -> Object {
        match self {
            Value::Object(o) => o.clone(),
            Value::StringSlice(v) => Object::Array(v.iter().map(|s| s.as_str().into()).collect()),
            v => Object::Primitive(v.to_text()),
        }
    }

    pub fn to_number(&self) -> WeaverResult<f64> {
        let text = match self {
            Value::StringSlice(v) => {
                return Err(WeaverError::keyword(
                    format!("{v:?}"),
                    "a string slice is not a number",
                ));
            }
            v => v.to_text(),
        };
        text.trim()
            .parse()
            .map_err(|_| WeaverError::keyword(text.clone(), "must be a number"))
    }

    pub fn to_bool(&self) -> bool {
        match self {
            Value::StringSlice(v) => !v.is_empty(),
            Value::Object(o) if !o.is_primitive() => !o.is_empty(),
            v => text_to_bool(&v.to_text()),
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::String(s.to_string())
    }
}

impl From<Object> for Value {
    fn from(o: Object) -> Value {
        Value::Object(o)
    }
}

impl From<SearchResult> for Value {
    fn from(s: SearchResult) -> Value {
        Value::Search(s)
    }
}

pub(crate) fn text_to_bool(s: &str) -> bool {
    !s.is_empty() && s != FALSE
}

pub(crate) fn bool_to_text(b: bool) -> String {
    let text = if b { TRUE } else { FALSE };
    text.to_string()
}

/// Upper-case the first letter: `.params` reads the `Params` field.
pub(crate) fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub(crate) fn lower_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Named keyword values visible to an expression.
#[derive(Clone, Debug, Default)]
pub struct Scope {
    values: IndexMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name`, replacing any previous binding.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Scope {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Scope {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
