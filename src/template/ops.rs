//! Template variable operations.
//!
//! Inbound operations constrain what a variable may bind and are checked
//! against every match. Outbound operations reshape a search result before
//! it is handed to advice code.

use super::search::{ReplaceArg, SearchValue};
use crate::error::{WeaverError, WeaverResult};
use indexmap::IndexSet;
use std::fmt;
use std::sync::Arc;

/// Which of the included templates must be present.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IncludeKind {
    /// `includes(t)`
    Includes,
    /// `includes_one(t, ...)`
    IncludesOne,
    /// `includes_all(t, ...)`
    IncludesAll,
}

impl IncludeKind {
    pub(crate) fn from_name(name: &str) -> Option<IncludeKind> {
        Some(match name {
            super::INCLUDES_OP => IncludeKind::Includes,
            super::INCLUDES_ONE_OP => IncludeKind::IncludesOne,
            super::INCLUDES_ALL_OP => IncludeKind::IncludesAll,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            IncludeKind::Includes => super::INCLUDES_OP,
            IncludeKind::IncludesOne => super::INCLUDES_ONE_OP,
            IncludeKind::IncludesAll => super::INCLUDES_ALL_OP,
        }
    }
}

/// A constraint on the value bound to a template variable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundOp {
    Include {
        kind: IncludeKind,
        variable: String,
        keys: Vec<String>,
    },
    Not(Box<InboundOp>),
}

impl InboundOp {
    /// Does the match `s` satisfy this constraint?
    pub fn validate(&self, s: &SearchValue) -> bool {
        match self {
            InboundOp::Include {
                kind: IncludeKind::IncludesAll,
                variable,
                keys,
            } => keys.iter().all(|k| includes_variable(s, variable, k)),
            InboundOp::Include { variable, keys, .. } => {
                keys.iter().any(|k| includes_variable(s, variable, k))
            }
            InboundOp::Not(op) => !op.validate(s),
        }
    }
}

impl fmt::Display for InboundOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InboundOp::Include { kind, variable, keys } => {
                write!(f, "{variable}:{}({})", kind.name(), keys.join(", "))
            }
            InboundOp::Not(op) => write!(f, "not({op})"),
        }
    }
}

/// Does the binding of `variable` in `s` hold a match of `template`?
fn includes_variable(s: &SearchValue, variable: &str, template: &str) -> bool {
    for value in s.iterations.iter().flat_map(|it| &it.values) {
        if value.template == template {
            return true;
        }
        if value.key == variable {
            return includes_variable(value, variable, template);
        }
    }
    false
}

/// The result of searching a template, with the variables that may be
/// selected from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchResult {
    template: String,
    values: Vec<SearchValue>,
    known: Arc<IndexSet<String>>,
}

impl SearchResult {
    pub(crate) fn new(template: impl Into<String>, values: Vec<SearchValue>, known: Arc<IndexSet<String>>) -> Self {
        SearchResult {
            template: template.into(),
            values,
            known,
        }
    }

    /// The template that produced this result.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// One value per match.
    pub fn values(&self) -> &[SearchValue] {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Is `variable` defined by the template or one it includes?
    pub fn is_known(&self, variable: &str) -> bool {
        self.known.contains(variable)
    }

    fn check_known(&self, op: &str, variable: &str) -> WeaverResult<()> {
        if self.is_known(variable) {
            return Ok(());
        }
        Err(WeaverError::template(
            &self.template,
            format!("invalid selector in `{op}`: `{variable}` is not a known variable"),
        ))
    }

    fn with_values(&self, values: Vec<SearchValue>) -> SearchResult {
        SearchResult {
            template: self.template.clone(),
            values,
            known: self.known.clone(),
        }
    }

    /// Narrow every match to the value bound to `variable`.
    pub fn select(&self, variable: &str) -> WeaverResult<SearchResult> {
        self.check_known("select", variable)?;
        let values = self
            .values
            .iter()
            .filter_map(|s| s.get(variable).cloned())
            .collect();
        Ok(self.with_values(values))
    }

    /// Drop `variable` and its text from every match.
    pub fn remove(&self, variable: &str) -> WeaverResult<SearchResult> {
        self.check_known("remove", variable)?;
        let values = self
            .values
            .iter()
            .filter_map(|s| s.clone().remove(variable))
            .collect();
        Ok(self.with_values(values))
    }

    /// Replace text in every match.
    pub fn replace(&self, old: &ReplaceArg, new: &ReplaceArg) -> WeaverResult<SearchResult> {
        for arg in [old, new] {
            if let ReplaceArg::Variable(v) = arg {
                self.check_known("replace", v)?;
            }
        }
        let values = self
            .values
            .iter()
            .map(|s| s.clone().replace(old, new))
            .collect();
        Ok(self.with_values(values))
    }

    /// The text of the first match, or the empty string.
    pub fn value(&self) -> String {
        self.values
            .first()
            .and_then(SearchValue::found)
            .unwrap_or_default()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::search::SearchIteration;

    fn value(key: &str, template: &str, found: &str, values: Vec<SearchValue>) -> SearchValue {
        SearchValue::new(
            key,
            template,
            vec![SearchIteration {
                found: found.into(),
                values,
            }],
        )
    }

    fn sample() -> SearchValue {
        let inner = value("x", "tee", "(local.tee $l (i32.const 1))", vec![]);
        let x = value("x", "outer", "(local.tee $l (i32.const 1))", vec![inner]);
        value("outer", "outer", "(drop (local.tee $l (i32.const 1)))", vec![x])
    }

    fn include(kind: IncludeKind, keys: &[&str]) -> InboundOp {
        InboundOp::Include {
            kind,
            variable: "x".into(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn include_validation() {
        let s = sample();
        assert!(include(IncludeKind::Includes, &["tee"]).validate(&s));
        assert!(!include(IncludeKind::Includes, &["load"]).validate(&s));
        assert!(include(IncludeKind::IncludesOne, &["load", "tee"]).validate(&s));
        assert!(!include(IncludeKind::IncludesAll, &["load", "tee"]).validate(&s));
        assert!(InboundOp::Not(Box::new(include(IncludeKind::Includes, &["load"]))).validate(&s));
        assert_eq!(
            include(IncludeKind::IncludesOne, &["a", "b"]).to_string(),
            "x:includes_one(a, b)"
        );
    }

    #[test]
    fn outbound_operations() {
        let known: IndexSet<String> = ["outer", "x"].iter().map(|s| s.to_string()).collect();
        let result = SearchResult::new("outer", vec![sample()], Arc::new(known));
        assert_eq!(result.value(), "(drop (local.tee $l (i32.const 1)))");
        assert_eq!(result.select("x").unwrap().value(), "(local.tee $l (i32.const 1))");
        assert!(result.select("y").is_err());
        assert_eq!(result.remove("x").unwrap().value(), "(drop)");
        let replaced = result
            .replace(&ReplaceArg::Text("$l".into()), &ReplaceArg::Text("$m".into()))
            .unwrap();
        assert_eq!(replaced.value(), "(drop (local.tee $m (i32.const 1)))");
    }
}
