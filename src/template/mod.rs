//! Structural templates over WAT text.
//!
//! A template is WAT text with `%name%` variables. Variables can require
//! their value to match other templates:
//!
//! ```text
//! store:  (i32.store %addr:includes(load):defines(ptr)% %value%)
//! load:   (i32.load %ptr%)
//! ```
//!
//! Searching `store` finds every `i32.store` whose address is an
//! `i32.load`. Templates are registered in a [`Templates`] set, which builds
//! and caches the [`TemplateContext`] of each template on first use.

use crate::code::clear_string;
use crate::error::{WeaverError, WeaverResult};
use indexmap::{IndexMap, IndexSet};
use regex::{Captures, Regex};
use std::sync::{Arc, LazyLock};

mod matcher;
mod ops;
mod parser;
mod search;

pub use self::matcher::{Binding, ExternalMatcher, Match, PatternMatcher, StructuralMatcher};
pub use self::ops::{InboundOp, IncludeKind, SearchResult};
pub use self::search::{ReplaceArg, SearchIteration, SearchValue};

pub(crate) const DEFINES_OP: &str = "defines";
pub(crate) const INCLUDES_OP: &str = "includes";
pub(crate) const INCLUDES_ONE_OP: &str = "includes_one";
pub(crate) const INCLUDES_ALL_OP: &str = "includes_all";
pub(crate) const NOT_OP: &str = "not_";

static VARIABLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"%[^%]+%").unwrap());
static UNKNOWN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\\?\?").unwrap());

/// An operation attached to a template variable, as written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VariableOperation {
    pub name: String,
    pub args: Vec<String>,
}

/// A parsed template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Template {
    pub key: String,
    pub value: String,
    /// Operations of each variable, in source order.
    pub variables: IndexMap<String, Vec<VariableOperation>>,
}

impl Template {
    /// The template text in the hole syntax of the pattern matchers.
    ///
    /// Variables become `:[name]`, a `?` becomes the anonymous hole `:[_]`
    /// and `\?` is a literal question mark.
    pub fn pattern(&self) -> String {
        let s = VARIABLE.replace_all(&self.value, |c: &Captures| {
            let v = &c[0];
            let end = v.find(':').unwrap_or(v.len() - 1);
            format!(":[{}]", &v[1..end])
        });
        let s = UNKNOWN.replace_all(&s, |c: &Captures| if c[0].len() == 1 { ":[_]" } else { "?" });
        clear_string(&s)
    }
}

/// The resolved form of a template: its inbound operations and the
/// templates its variables include.
#[derive(Clone, Debug)]
pub struct TemplateContext {
    key: String,
    /// Variable -> included template -> must match (`false` under `not_`).
    children: IndexMap<String, IndexMap<String, bool>>,
    operations: IndexMap<String, Vec<InboundOp>>,
    known: Arc<IndexSet<String>>,
}

impl TemplateContext {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Variables of the template plus the names declared with `defines`.
    pub fn known_variables(&self) -> &IndexSet<String> {
        &self.known
    }

    /// Whether `template` must (`Some(true)`) or must not (`Some(false)`)
    /// match the value of `variable`.
    pub fn included(&self, variable: &str, template: &str) -> Option<bool> {
        self.children.get(variable)?.get(template).copied()
    }

    pub fn operations(&self) -> impl Iterator<Item = (&str, &InboundOp)> {
        self.operations
            .iter()
            .flat_map(|(v, ops)| ops.iter().map(move |op| (v.as_str(), op)))
    }
}

/// A set of named templates.
#[derive(Clone, Debug, Default)]
pub struct Templates {
    templates: IndexMap<String, Template>,
    contexts: IndexMap<String, TemplateContext>,
}

/// Why a template search produced nothing.
enum Miss {
    /// Nothing matched.
    NotFound,
    /// The match contradicts the include state of the template.
    NotMatch,
    Failed(WeaverError),
}

impl From<WeaverError> for Miss {
    fn from(e: WeaverError) -> Self {
        Miss::Failed(e)
    }
}

impl Templates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and register a template, replacing any template with the same
    /// key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let template = Template::parse(key, value);
        self.contexts.clear();
        self.templates.insert(template.key.clone(), template);
    }

    pub fn get(&self, key: &str) -> Option<&Template> {
        self.templates.get(key)
    }

    /// The context of `key`, built on first use.
    pub fn context(&mut self, key: &str) -> WeaverResult<&TemplateContext> {
        self.build(key, &mut Vec::new())?;
        Ok(&self.contexts[key])
    }

    fn build(&mut self, key: &str, stack: &mut Vec<String>) -> WeaverResult<()> {
        if self.contexts.contains_key(key) {
            return Ok(());
        }
        if stack.iter().any(|k| k == key) {
            return Err(WeaverError::template(key, "template includes itself"));
        }
        let template = self
            .templates
            .get(key)
            .cloned()
            .ok_or_else(|| WeaverError::template(key, "template not found"))?;
        stack.push(key.to_string());

        let mut ctx = TemplateContext {
            key: key.to_string(),
            children: IndexMap::new(),
            operations: IndexMap::new(),
            known: Arc::default(),
        };
        let mut known = IndexSet::new();
        for (variable, ops) in &template.variables {
            let mut definitions: Vec<String> = Vec::new();
            let mut i = ops.len();
            while i > 0 {
                i -= 1;
                let negated = i > 0 && ops[i - 1].name == NOT_OP;
                let op = &ops[i];
                if op.name == DEFINES_OP {
                    if negated {
                        return Err(WeaverError::template(key, "`defines` cannot be negated"));
                    }
                    if i == 0 || IncludeKind::from_name(&ops[i - 1].name).is_none() {
                        return Err(WeaverError::template(
                            key,
                            format!("`defines` on `{variable}` must follow an include operation"),
                        ));
                    }
                    known.extend(op.args.iter().cloned());
                    definitions.extend(op.args.iter().cloned());
                    continue;
                }
                if op.name == NOT_OP {
                    let next = ops.get(i + 1).map_or("nothing", |o| o.name.as_str());
                    return Err(WeaverError::template(
                        key,
                        format!("`{NOT_OP}` cannot be applied to `{next}`"),
                    ));
                }
                let Some(kind) = IncludeKind::from_name(&op.name) else {
                    return Err(WeaverError::template(
                        key,
                        format!("unknown operation `{}`", op.name),
                    ));
                };
                if kind == IncludeKind::Includes && op.args.len() != 1 {
                    return Err(WeaverError::template(
                        key,
                        format!("`{INCLUDES_OP}` takes exactly one template"),
                    ));
                }
                for child in &op.args {
                    self.build(child, stack)?;
                    let child_known = &self.contexts[child.as_str()].known;
                    if let Some(missing) = definitions.iter().find(|d| !child_known.contains(*d)) {
                        return Err(WeaverError::template(
                            key,
                            format!("`{missing}` is not defined by template `{child}`"),
                        ));
                    }
                    ctx.children
                        .entry(variable.clone())
                        .or_default()
                        .insert(child.clone(), !negated);
                }
                let mut inbound = InboundOp::Include {
                    kind,
                    variable: variable.clone(),
                    keys: op.args.clone(),
                };
                if negated {
                    inbound = InboundOp::Not(Box::new(inbound));
                    i -= 1;
                }
                ctx.operations.entry(variable.clone()).or_default().push(inbound);
                definitions.clear();
            }
            known.insert(variable.clone());
        }
        ctx.known = Arc::new(known);

        stack.pop();
        log::trace!("built template context `{key}`");
        self.contexts.insert(key.to_string(), ctx);
        Ok(())
    }

    /// Search `code` for the template `key`.
    ///
    /// Matches that violate an include constraint, or that bind different
    /// text to the same variable, are left out of the result.
    pub fn search(&mut self, key: &str, code: &str, matcher: &dyn PatternMatcher) -> WeaverResult<SearchResult> {
        self.build(key, &mut Vec::new())?;
        let searcher = Searcher {
            templates: self,
            matcher,
        };
        let found = match searcher.search(key, key, key, key, code) {
            Ok(found) => found,
            Err(Miss::NotFound | Miss::NotMatch) => Vec::new(),
            Err(Miss::Failed(e)) => return Err(e),
        };
        let ctx = &self.contexts[key];
        let values: Vec<SearchValue> = found
            .into_iter()
            .filter(|s| {
                if let Some((variable, op)) = ctx.operations().find(|(_, op)| !op.validate(s)) {
                    log::debug!("template `{key}`: match rejected by `{op}` on `{variable}`");
                    return false;
                }
                if !s.iterations.iter().all(|it| unify(&it.values)) {
                    log::debug!("template `{key}`: match rejected, variable values differ");
                    return false;
                }
                true
            })
            .collect();
        Ok(SearchResult::new(key, values, ctx.known.clone()))
    }
}

/// Values bound to the same variable at one level must be equal.
fn unify(values: &[SearchValue]) -> bool {
    let mut seen: IndexMap<(&str, &str), &str> = IndexMap::new();
    for value in values {
        if let Some(found) = value.found() {
            let key = (value.key.as_str(), value.template.as_str());
            if *seen.entry(key).or_insert(found) != found {
                return false;
            }
        }
        if !value.iterations.iter().all(|it| unify(&it.values)) {
            return false;
        }
    }
    true
}

struct Searcher<'a> {
    templates: &'a Templates,
    matcher: &'a dyn PatternMatcher,
}

impl Searcher<'_> {
    fn search(&self, key: &str, parent: &str, id: &str, include: &str, target: &str) -> Result<Vec<SearchValue>, Miss> {
        let pattern = self.templates.templates[key].pattern();
        let iterations = self.resolve(key, parent, id, include, &pattern, target)?;
        if iterations.is_empty() {
            return Err(Miss::NotFound);
        }
        Ok(iterations
            .into_iter()
            .map(|it| SearchValue::new(id, key, vec![it]))
            .collect())
    }

    fn resolve(
        &self,
        key: &str,
        parent: &str,
        id: &str,
        include: &str,
        pattern: &str,
        target: &str,
    ) -> Result<Vec<SearchIteration>, Miss> {
        let matches = matcher::execute(self.matcher, pattern, target)?;
        let included = self.templates.contexts[parent].included(id, include);
        if matches.is_empty() {
            return Err(match included {
                Some(true) => Miss::NotMatch,
                _ => Miss::NotFound,
            });
        }
        if included == Some(false) {
            return Err(Miss::NotMatch);
        }

        let mut iterations = Vec::new();
        for m in matches {
            match self.environment(key, &m.environment) {
                Ok(values) => iterations.push(SearchIteration {
                    found: clear_string(&m.matched),
                    values,
                }),
                // Look for a match nested inside the rejected one.
                Err(Miss::NotFound) => {
                    let mut inner = m.matched.chars();
                    if inner.next().is_none() {
                        continue;
                    }
                    match self.resolve(key, parent, id, include, pattern, inner.as_str()) {
                        Ok(found) => iterations.extend(found),
                        Err(Miss::NotFound | Miss::NotMatch) => {}
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(iterations)
    }

    fn environment(&self, key: &str, environment: &[Binding]) -> Result<Vec<SearchValue>, Miss> {
        let ctx = &self.templates.contexts[key];
        let mut values = Vec::new();
        for binding in environment {
            let mut value = SearchValue::new(
                &binding.variable,
                key,
                vec![SearchIteration {
                    found: clear_string(&binding.value),
                    values: Vec::new(),
                }],
            );
            let children = ctx.children.get(&binding.variable);
            let mut invalid = 0;
            for (child, &included) in children.into_iter().flatten() {
                match self.search(child, key, &binding.variable, child, &binding.value) {
                    Ok(found) => value.iterations[0].values.extend(found),
                    Err(Miss::NotMatch) => invalid += 1,
                    Err(Miss::NotFound) if included => invalid += 1,
                    Err(Miss::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
            if invalid > 0 && invalid == children.map_or(0, IndexMap::len) {
                return Err(Miss::NotFound);
            }
            values.push(value);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn search(templates: &mut Templates, key: &str, code: &str) -> Vec<String> {
        templates
            .search(key, code, &StructuralMatcher)
            .unwrap()
            .values()
            .iter()
            .map(|v| v.found().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn pattern_syntax() {
        let t = Template::parse("t", "(call %f:includes(x)%  ? \\?)");
        assert_eq!(t.pattern(), "(call :[f] :[_] ?)");
        assert_eq!(Template::parse("t", "?").pattern(), ":[_]");
        assert_eq!(Template::parse("t", "(br_if ??)").pattern(), "(br_if :[_]:[_])");
        assert_eq!(Template::parse("t", "(é?)").pattern(), "(é:[_])");
    }

    #[test]
    fn unification() {
        let mut templates = Templates::new();
        templates.insert("add", "(i32.add %a% %a%)");
        let result = templates
            .search("add", "(i32.add (i32.const 5) (i32.const 5))", &StructuralMatcher)
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.select("a").unwrap().value(), "(i32.const 5)");
        assert!(search(&mut templates, "add", "(i32.add (i32.const 5) (i32.const 7))").is_empty());
    }

    #[test]
    fn includes() {
        let mut templates = Templates::new();
        templates.insert("t1", "(op %x:includes(t2):defines(y)%)");
        templates.insert("t2", "(local.tee %y%)");
        assert_eq!(search(&mut templates, "t1", "(op (local.tee 1))"), ["(op (local.tee 1))"]);
        assert!(search(&mut templates, "t1", "(op (i32.const 1))").is_empty());

        let result = templates.search("t1", "(op (local.tee 1))", &StructuralMatcher).unwrap();
        assert!(result.is_known("y"));
        assert_eq!(result.select("y").unwrap().value(), "1");
    }

    #[test]
    fn negated_includes() {
        let mut templates = Templates::new();
        templates.insert("t1", "(drop %x:not_includes(t2)%)");
        templates.insert("t2", "(local.tee %y%)");
        let code = "(drop (local.tee 1)) (drop (i32.const 2))";
        assert_eq!(search(&mut templates, "t1", code), ["(drop (i32.const 2))"]);
    }

    #[test]
    fn includes_one_and_all() {
        let mut templates = Templates::new();
        templates.insert("any", "(drop %x:includes_one(c, g)%)");
        templates.insert("c", "(i32.const %v%)");
        templates.insert("g", "(local.get %v%)");
        let code = "(drop (i32.const 1)) (drop (local.get $a)) (drop (nop))";
        assert_eq!(search(&mut templates, "any", code).len(), 2);

        templates.insert("all", "(drop %x:includes_all(c, g)%)");
        assert!(search(&mut templates, "all", code).is_empty());
    }

    #[test]
    fn nested_matches_are_retried() {
        let mut templates = Templates::new();
        templates.insert("t1", "(block %x:not_includes(t2)%)");
        templates.insert("t2", "(br %l%)");
        let code = "(block (br 0) (block (nop)))";
        assert_eq!(search(&mut templates, "t1", code), ["(block (nop))"]);
    }

    #[test]
    fn invalid_operations() {
        let mut templates = Templates::new();
        templates.insert("a", "(x %v:defines(z)%)");
        assert!(templates.context("a").is_err());
        templates.insert("b", "(x %v:frobnicate(z)%)");
        assert!(templates.context("b").is_err());
        templates.insert("c", "(x %v:includes(c)%)");
        assert!(templates.context("c").is_err());
        templates.insert("d", "(x %v:includes(e):defines(w)%)");
        templates.insert("e", "(y %q%)");
        assert!(templates.context("d").is_err());
        templates.insert("f", "(x %v:includes(e):defines(q)%)");
        let ctx = templates.context("f").unwrap();
        assert!(ctx.known_variables().contains("q"));
        assert_eq!(ctx.included("v", "e"), Some(true));
        assert!(templates.context("missing").is_err());
    }
}
