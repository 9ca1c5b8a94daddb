//! Template search results.
//!
//! A search result is a tree: every [`SearchValue`] is a variable binding
//! (or a whole template match at the root) and every [`SearchIteration`]
//! holds the text that was found plus the bindings found inside it.
//!
//! Edits on the tree keep `found` strings consistent. A child's position in
//! its parent's `found` text is recovered by scanning left to right for the
//! child's own `found` text, starting after the previous child.

use crate::code::clear_string;

/// The value of a variable in a template search result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchValue {
    /// Variable name, or template key for a root match.
    pub key: String,
    /// The template in which the variable was bound.
    pub template: String,
    pub iterations: Vec<SearchIteration>,
}

/// One occurrence of a search value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchIteration {
    pub found: String,
    pub values: Vec<SearchValue>,
}

/// An argument of [`SearchValue::replace`]: literal text or a reference to
/// a variable whose found text is used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplaceArg {
    Text(String),
    Variable(String),
}

impl SearchValue {
    pub fn new(key: impl Into<String>, template: impl Into<String>, iterations: Vec<SearchIteration>) -> Self {
        SearchValue {
            key: key.into(),
            template: template.into(),
            iterations,
        }
    }

    /// Text of the first iteration, if any.
    pub fn found(&self) -> Option<&str> {
        self.iterations.first().map(|it| it.found.as_str())
    }

    /// Find the value bound to `key`, searching depth first.
    pub fn get(&self, key: &str) -> Option<&SearchValue> {
        if self.key == key {
            return Some(self);
        }
        self.iterations
            .iter()
            .flat_map(|it| &it.values)
            .find_map(|v| v.get(key))
    }

    /// Remove the first binding of `key` and excise its text.
    ///
    /// Returns `None` if the value itself is the one being removed.
    pub fn remove(mut self, key: &str) -> Option<SearchValue> {
        if self.key == key {
            return None;
        }
        self.remove_inner(key);
        Some(self)
    }

    fn remove_inner(&mut self, key: &str) -> bool {
        for it in &mut self.iterations {
            let mut cursor = 0;
            for i in 0..it.values.len() {
                let Some(span) = locate(&it.found, cursor, &it.values[i]) else {
                    continue;
                };
                cursor = span.1;
                if it.values[i].key == key {
                    it.values.remove(i);
                    it.found = clear_string(&format!("{}{}", &it.found[..span.0], &it.found[span.1..]));
                    return true;
                }
                if it.values[i].remove_inner(key) {
                    let child = it.values[i].found().unwrap_or_default().to_string();
                    it.found = clear_string(&format!("{}{child}{}", &it.found[..span.0], &it.found[span.1..]));
                    return true;
                }
            }
        }
        false
    }

    /// Replace text in the value.
    ///
    /// With a variable as `old`, the text bound to that variable is replaced
    /// wholesale. With literal text as `old`, every occurrence is replaced in
    /// the leaves of the tree. A variable `new` stands for its found text; if
    /// it is not bound the value is returned unchanged.
    pub fn replace(mut self, old: &ReplaceArg, new: &ReplaceArg) -> SearchValue {
        let value = match new {
            ReplaceArg::Text(text) => text.clone(),
            ReplaceArg::Variable(var) => match self.get(var).and_then(SearchValue::found) {
                Some(found) => found.to_string(),
                None => return self,
            },
        };
        match old {
            ReplaceArg::Variable(key) => self.replace_by_reference(key, &value),
            ReplaceArg::Text(text) => self.replace_by_text(text, &value),
        };
        self
    }

    fn replace_by_reference(&mut self, key: &str, value: &str) -> bool {
        if self.iterations.is_empty() {
            return false;
        }
        if self.key == key {
            self.iterations[0].found = value.to_string();
            self.iterations[0].values.clear();
            return true;
        }
        self.replace_children(|child| child.replace_by_reference(key, value))
    }

    fn replace_by_text(&mut self, old: &str, new: &str) -> bool {
        let Some(it) = self.iterations.first_mut() else {
            return false;
        };
        if it.values.is_empty() {
            let replaced = it.found.replace(old, new);
            let changed = replaced != it.found;
            it.found = replaced;
            return changed;
        }
        self.replace_children(|child| child.replace_by_text(old, new))
    }

    /// Apply `f` to each child of the first iteration and splice the child's
    /// new text into the parent's.
    fn replace_children(&mut self, mut f: impl FnMut(&mut SearchValue) -> bool) -> bool {
        let it = &mut self.iterations[0];
        let mut changed = false;
        let mut cursor = 0;
        for child in &mut it.values {
            let Some((start, end)) = locate(&it.found, cursor, child) else {
                continue;
            };
            cursor = end;
            if f(child) {
                let text = child.found().unwrap_or_default();
                it.found = format!("{}{text}{}", &it.found[..start], &it.found[end..]);
                cursor = start + text.len();
                changed = true;
            }
        }
        changed
    }
}

/// Byte span of `child`'s text in `found`, searching from `cursor`.
fn locate(found: &str, cursor: usize, child: &SearchValue) -> Option<(usize, usize)> {
    let text = child.found()?;
    let start = cursor + found.get(cursor..)?.find(text)?;
    Some((start, start + text.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(key: &str, found: &str) -> SearchValue {
        SearchValue::new(
            key,
            "t",
            vec![SearchIteration {
                found: found.into(),
                values: vec![],
            }],
        )
    }

    fn sample() -> SearchValue {
        SearchValue::new(
            "t",
            "t",
            vec![SearchIteration {
                found: "(i32.add (local.get $a) (i32.const 1))".into(),
                values: vec![leaf("x", "(local.get $a)"), leaf("y", "(i32.const 1)")],
            }],
        )
    }

    #[test]
    fn get() {
        let s = sample();
        assert_eq!(s.get("y").and_then(SearchValue::found), Some("(i32.const 1)"));
        assert_eq!(s.get("t").map(|v| v.key.as_str()), Some("t"));
        assert!(s.get("z").is_none());
    }

    #[test]
    fn remove() {
        let s = sample().remove("x").unwrap();
        assert_eq!(s.found(), Some("(i32.add (i32.const 1))"));
        assert_eq!(s.iterations[0].values.len(), 1);
        assert!(sample().remove("t").is_none());
        assert_eq!(sample().remove("z"), Some(sample()));
    }

    #[test]
    fn replace() {
        let s = sample().replace(&ReplaceArg::Variable("x".into()), &ReplaceArg::Variable("y".into()));
        assert_eq!(s.found(), Some("(i32.add (i32.const 1) (i32.const 1))"));
        assert_eq!(s.get("x").and_then(SearchValue::found), Some("(i32.const 1)"));

        let s = sample().replace(&ReplaceArg::Text("$a".into()), &ReplaceArg::Text("$b".into()));
        assert_eq!(s.found(), Some("(i32.add (local.get $b) (i32.const 1))"));

        let s = sample().replace(&ReplaceArg::Variable("x".into()), &ReplaceArg::Variable("nope".into()));
        assert_eq!(s, sample());
    }
}
