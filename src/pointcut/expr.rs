//! Evaluation of pointcut expressions.
//!
//! Evaluation starts from every internal function of the module. Each
//! method narrows the current join-points to the blocks it finds under them,
//! and those blocks inherit the data of the join-point they were found in.
//! `a && b` runs `b` on the result of `a`; `a || b` runs both on the same
//! join-points and keeps the deepest of overlapping results.

use super::parser::{self, FuncPattern, FunctionScope, NamePattern, Node, Param, VariableKind};
use super::{
    CallData, Environment, FuncData, JoinPoint, JoinPointSearch, find_args, find_calls, find_functions,
    find_instructions, find_returns, init_search,
};
use crate::apply::rearrange_matches;
use crate::code::Block;
use crate::context::ModuleContext;
use crate::error::{WeaverError, WeaverResult};
use crate::keyword::{Object, capitalize};
use crate::template::{PatternMatcher, Templates};
use indexmap::IndexMap;
use log::{debug, trace};
use regex::Regex;
use std::sync::LazyLock;

static LOCAL_GET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\(local\.get (\S+)\)$").unwrap());

/// Named pointcuts, callable from other pointcuts, and the entry point for
/// evaluating pointcut text.
///
/// A named pointcut declares typed parameters, e.g. `(i32 x) => args(x)`,
/// and is called with parameters of the calling pointcut, e.g.
/// `(i32.param[0] a) => func(* * (..)) && reads(a)`.
#[derive(Clone, Debug, Default)]
pub struct Pointcuts {
    named: IndexMap<String, String>,
}

impl Pointcuts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, pointcut: impl Into<String>) {
        self.named.insert(name.into(), pointcut.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.named.get(name).map(String::as_str)
    }

    /// Evaluate the pointcut `text` on `ctx`. Template methods are matched
    /// with `matcher`.
    pub fn evaluate(
        &self,
        ctx: &mut ModuleContext,
        templates: &mut Templates,
        matcher: &dyn PatternMatcher,
        text: &str,
    ) -> WeaverResult<JoinPointSearch> {
        let pointcut = parser::parse(text)?;
        let input = init_search(ctx)?;
        let mut run = Run {
            pointcuts: self,
            ctx,
            templates,
            matcher,
            params: pointcut
                .params
                .iter()
                .map(|p| (p.name.clone(), p.clone()))
                .collect(),
            active: Vec::new(),
        };
        let found = run.filter(&pointcut.expr, input)?;
        debug!("pointcut `{text}`: {} join-points", found.len());
        Ok(found)
    }
}

struct Run<'a> {
    pointcuts: &'a Pointcuts,
    ctx: &'a mut ModuleContext,
    templates: &'a mut Templates,
    matcher: &'a dyn PatternMatcher,
    /// Parameters in scope, keyed by the name the expression uses.
    params: IndexMap<String, Param>,
    /// Named pointcuts being evaluated.
    active: Vec<String>,
}

impl Run<'_> {
    fn filter(&mut self, node: &Node, input: JoinPointSearch) -> WeaverResult<JoinPointSearch> {
        match node {
            Node::Func(f) => refine(self.ctx, input, |ctx, within| {
                find_functions(ctx, within, |_, data| match_function(f, data))
            }),
            Node::Call(f) => refine(self.ctx, input, |ctx, within| {
                find_calls(ctx, within, |_, call| match_function(f, call.callee.as_ref()?))
            }),
            Node::Args(names) => {
                let params = names
                    .iter()
                    .map(|name| self.variable_param(name))
                    .collect::<WeaverResult<Vec<_>>>()?;
                refine(self.ctx, input, |ctx, within| {
                    find_args(ctx, within, |_, call| match_args(&params, call))
                })
            }
            Node::Returns(ty) => refine(self.ctx, input, |ctx, within| {
                find_returns(ctx, within, |_, ret| {
                    ty.as_ref().is_none_or(|t| *t == ret.ty).then(Environment::new)
                })
            }),
            Node::Template { name, just_check } => self.template(name, *just_check, input),
            Node::Named { name, args } => self.named(name, args, input),
            Node::And(lhs, rhs) => {
                let left = self.filter(lhs, input)?;
                self.filter(rhs, left)
            }
            Node::Or(lhs, rhs) => {
                let left = self.filter(lhs, input.clone())?;
                let right = self.filter(rhs, input)?;
                Ok(left.union_deepest(self.ctx.code(), right))
            }
        }
    }

    fn param(&self, name: &str) -> WeaverResult<Param> {
        self.params
            .get(name)
            .cloned()
            .ok_or_else(|| WeaverError::unknown("pointcut parameter", name))
    }

    fn variable_param(&self, name: &str) -> WeaverResult<Param> {
        let param = self.param(name)?;
        if param.var.is_none() {
            return Err(WeaverError::pointcut(
                name,
                "`args` takes parameters declared as `param[...]` or `local[...]`",
            ));
        }
        Ok(param)
    }

    fn template(&mut self, key: &str, just_check: bool, input: JoinPointSearch) -> WeaverResult<JoinPointSearch> {
        let pattern = self
            .templates
            .get(key)
            .map(|t| t.pattern())
            .ok_or_else(|| WeaverError::unknown("template", key))?;
        let mut out = JoinPointSearch::new();
        for jp in input {
            let text = self.ctx.code().string(jp.block());
            let result = self.templates.search(key, &text, self.matcher)?;
            if result.is_empty() {
                continue;
            }
            if just_check {
                out.push(jp);
                continue;
            }
            let mut found = Vec::new();
            for it in result.values().iter().flat_map(|v| &v.iterations) {
                for mut hit in find_instructions(self.ctx, jp.block(), &it.found)? {
                    for value in &it.values {
                        if let Some(text) = value.found() {
                            hit.environment.insert(capitalize(&value.key), Object::from(text));
                        }
                    }
                    inherit(&mut hit, &jp);
                    found.push(hit);
                }
            }
            trace!("template `{key}`: {} blocks in {}", found.len(), jp.block());
            for hit in rearrange_matches(self.ctx.code_mut(), found, &pattern) {
                out.push(hit);
            }
        }
        Ok(out)
    }

    fn named(&mut self, name: &str, args: &[String], input: JoinPointSearch) -> WeaverResult<JoinPointSearch> {
        let pointcuts = self.pointcuts;
        let text = pointcuts
            .get(name)
            .ok_or_else(|| WeaverError::unknown("pointcut", name))?;
        if self.active.iter().any(|a| a == name) {
            return Err(WeaverError::pointcut(text, format!("`{name}` calls itself")));
        }
        let pointcut = parser::parse(text)?;
        if pointcut.params.len() != args.len() {
            return Err(WeaverError::pointcut(
                text,
                format!("`{name}` takes {} arguments but got {}", pointcut.params.len(), args.len()),
            ));
        }
        let mut params = IndexMap::new();
        for (decl, arg) in pointcut.params.iter().zip(args) {
            let param = self.param(arg)?;
            if decl.ty.is_some() && decl.ty != param.ty {
                return Err(WeaverError::pointcut(
                    text,
                    format!(
                        "argument `{arg}` of `{name}` is {}, expected {}",
                        param.ty.as_deref().unwrap_or("untyped"),
                        decl.ty.as_deref().unwrap_or_default()
                    ),
                ));
            }
            params.insert(decl.name.clone(), param);
        }
        let outer = std::mem::replace(&mut self.params, params);
        self.active.push(name.to_string());
        let found = self.filter(&pointcut.expr, input);
        self.active.pop();
        self.params = outer;
        found
    }
}

/// Run `find` under every join-point of `input`.
fn refine(
    ctx: &mut ModuleContext,
    input: JoinPointSearch,
    mut find: impl FnMut(&mut ModuleContext, Block) -> WeaverResult<JoinPointSearch>,
) -> WeaverResult<JoinPointSearch> {
    let mut out = JoinPointSearch::new();
    for jp in input {
        let mut found = find(ctx, jp.block())?;
        found.remove_duplicates(ctx.code());
        for mut hit in found {
            inherit(&mut hit, &jp);
            out.push(hit);
        }
    }
    Ok(out)
}

/// Add the data of `outer` to a join-point found inside it. Data the
/// join-point already has is kept.
fn inherit(jp: &mut JoinPoint, outer: &JoinPoint) {
    match (&mut jp.metadata, &outer.metadata) {
        (Object::Map(inner), Object::Map(from)) => {
            for (k, v) in from {
                inner.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        (inner @ Object::Null, from) => *inner = from.clone(),
        _ => {}
    }
    for (k, v) in &outer.environment {
        jp.environment.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

fn match_function(f: &FuncPattern, data: &FuncData) -> Option<Environment> {
    let named = match &f.name {
        NamePattern::Any => true,
        NamePattern::Name(name) => data.name == *name,
        NamePattern::Index(index) => data.index == *index,
        NamePattern::Order(order) => data.order == *order,
        NamePattern::Regex(re) => re.is_match(&data.name),
    };
    let scoped = match f.scope {
        FunctionScope::Any => true,
        FunctionScope::Internal => !data.is_imported && !data.is_exported,
        FunctionScope::Imported => data.is_imported,
        FunctionScope::Exported => data.is_exported,
        FunctionScope::Start => data.is_start,
    };
    if !named || !scoped || f.result.as_ref().is_some_and(|r| *r != data.result_type) {
        return None;
    }
    if let Some(params) = &f.params {
        let typed = params
            .iter()
            .zip(&data.param_types)
            .all(|(p, ty)| p.ty.as_ref().is_none_or(|t| t == ty));
        if params.len() != data.total_params || !typed {
            return None;
        }
    }

    let mut env = Environment::new();
    if let Some(binding) = &f.name_binding {
        env.insert(binding.clone(), Object::from(data.name.as_str()));
    }
    if let Some(binding) = &f.result_binding {
        env.insert(binding.clone(), Object::from(data.result_type.as_str()));
    }
    for (i, p) in f.params.iter().flatten().enumerate() {
        let (Some(binding), Some(name), Some(ty)) = (&p.binding, data.params.get(i), data.param_types.get(i)) else {
            continue;
        };
        let mut param = IndexMap::new();
        param.insert("Name".to_string(), Object::from(name.as_str()));
        param.insert("Type".to_string(), Object::from(ty.as_str()));
        env.insert(binding.clone(), Object::Map(param));
    }
    Some(env)
}

/// Each parameter must be read by the argument at its position, with
/// `local.get` of the variable it stands for in the caller.
fn match_args(params: &[Param], call: &CallData) -> Option<Environment> {
    let caller = call.caller.as_ref()?;
    if params.len() > call.args.len() {
        return None;
    }
    let mut env = Environment::new();
    for (param, arg) in params.iter().zip(&call.args) {
        let var = param.var.as_ref()?;
        let (names, types, offset) = match var.kind {
            VariableKind::Param => (&caller.params, &caller.param_types, 0),
            VariableKind::Local => (&caller.locals, &caller.local_types, caller.total_params),
        };
        let pos = match var.index.parse::<usize>() {
            Ok(pos) => pos,
            Err(_) => names.iter().position(|n| *n == var.index)?,
        };
        let ty = types.get(pos)?;
        if param.ty.as_ref().is_some_and(|t| t != ty) {
            return None;
        }
        let read = LOCAL_GET.captures(&arg.instr)?;
        let by_name = names.get(pos).is_some_and(|n| *n == read[1]);
        if !by_name && read[1] != (offset + pos).to_string() {
            return None;
        }
        let mut value = IndexMap::new();
        value.insert("Index".to_string(), Object::from(var.index.as_str()));
        value.insert("Type".to_string(), Object::from(var.kind.as_str()));
        value.insert("ElType".to_string(), Object::from(ty.as_str()));
        env.insert(param.name.clone(), Object::Map(value));
    }
    Some(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::StructuralMatcher;

    const MODULE: &str = r#"(module
        (import "env" "log" (func $log (param i32)))
        (func $add (export "add") (param $a i32) (param $b i32) (result i32) (local $t i32)
            (call $log (local.get $a))
            (i32.add (local.get $a) (local.get $b)))
        (func $main
            (call $log (call $add (i32.const 1) (local.get $x)))
            (drop (call $add (i32.const 2) (i32.const 3)))))"#;

    #[track_caller]
    fn run(pointcuts: &Pointcuts, templates: &mut Templates, text: &str) -> (ModuleContext, JoinPointSearch) {
        let mut ctx = ModuleContext::new(MODULE).unwrap();
        let found = pointcuts
            .evaluate(&mut ctx, templates, &StructuralMatcher, text)
            .unwrap();
        (ctx, found)
    }

    #[track_caller]
    fn texts(text: &str) -> Vec<String> {
        let (ctx, found) = run(&Pointcuts::new(), &mut Templates::new(), text);
        found
            .found()
            .iter()
            .map(|jp| ctx.code().string(jp.block()))
            .collect()
    }

    #[track_caller]
    fn functions(text: &str) -> Vec<String> {
        let (ctx, found) = run(&Pointcuts::new(), &mut Templates::new(), text);
        found
            .found()
            .iter()
            .filter_map(|jp| jp.function_def(&ctx).map(|f| f.name.clone()))
            .collect()
    }

    #[test]
    fn func_method() {
        assert_eq!(functions("() => func(* * (..))"), ["$add", "$main"]);
        assert_eq!(functions("() => func(i32 * (..))"), ["$add"]);
        assert_eq!(functions("() => func(void * ())"), ["$main"]);
        assert_eq!(functions("() => func(* add (i32, *))"), ["$add"]);
        assert_eq!(functions("() => func(* $main (..))"), ["$main"]);
        assert_eq!(functions("() => func(* [3] (..))"), ["$main"]);
        assert_eq!(functions("() => func(* /^ad/ (..))"), ["$add"]);
        assert_eq!(functions("() => func(* * (..), exported)"), ["$add"]);
        assert_eq!(functions("() => func(* * (..), internal)"), ["$main"]);
        assert!(functions("() => func(* * (i32))").is_empty());
        assert!(functions("() => func(* * (..), start)").is_empty());
    }

    #[test]
    fn func_method_binds_names() {
        let (_, found) = run(
            &Pointcuts::new(),
            &mut Templates::new(),
            "() => func(%r% %n:add% (* %first%, *))",
        );
        let jp = &found.found()[0];
        assert_eq!(jp.get("n").unwrap(), Object::from("add"));
        assert_eq!(jp.get("r").unwrap(), Object::from("i32"));
        let first = jp.get("first").unwrap();
        assert_eq!(first.prop("Name").unwrap(), Object::from("$a"));
        assert_eq!(first.prop("Type").unwrap(), Object::from("i32"));
        assert!(jp.get("func").is_some());
    }

    #[test]
    fn call_method_inside_functions() {
        assert_eq!(
            texts("() => call(void $log (..))"),
            [
                "(call $log (local.get $a))",
                "(call $log (call $add (i32.const 1) (local.get $x)))"
            ]
        );
        assert_eq!(
            texts("() => func(* * (..), internal) && call(i32 * (..))"),
            [
                "(call $add (i32.const 1) (local.get $x))",
                "(call $add (i32.const 2) (i32.const 3))"
            ]
        );
        let (_, found) = run(
            &Pointcuts::new(),
            &mut Templates::new(),
            "() => func(* main (..)) && call(* $add (..))",
        );
        let jp = &found.found()[0];
        assert!(jp.get("call").is_some());
        assert_eq!(jp.get("func").unwrap().prop("Index").unwrap(), Object::from("$main"));
    }

    #[test]
    fn args_method() {
        let (_, found) = run(
            &Pointcuts::new(),
            &mut Templates::new(),
            "(i32.param[$a] v) => args(v)",
        );
        assert_eq!(found.len(), 1);
        let v = found.found()[0].get("v").unwrap();
        assert_eq!(v.prop("Index").unwrap(), Object::from("$a"));
        assert_eq!(v.prop("Type").unwrap(), Object::from("param"));
        assert_eq!(v.prop("ElType").unwrap(), Object::from("i32"));

        assert_eq!(texts("(param[0] v) => args(v)"), ["(call $log (local.get $a))"]);
        assert!(texts("(param[1] v) => args(v)").is_empty());
        assert!(texts("(f32.param[0] v) => args(v)").is_empty());

        let mut ctx = ModuleContext::new(MODULE).unwrap();
        let err = Pointcuts::new()
            .evaluate(&mut ctx, &mut Templates::new(), &StructuralMatcher, "(i32 v) => args(v)")
            .unwrap_err();
        assert!(matches!(err, WeaverError::Pointcut { .. }), "{err}");
        let err = Pointcuts::new()
            .evaluate(&mut ctx, &mut Templates::new(), &StructuralMatcher, "() => args(w)")
            .unwrap_err();
        assert!(matches!(err, WeaverError::Unknown { .. }), "{err}");
    }

    #[test]
    fn returns_method() {
        assert_eq!(
            texts("() => returns(i32)"),
            ["(i32.add (local.get $a) (local.get $b))"]
        );
        assert_eq!(texts("() => returns(void)"), ["(return)"]);
        assert_eq!(texts("() => returns(*)").len(), 2);
    }

    #[test]
    fn or_keeps_the_deepest_overlap() {
        assert_eq!(
            texts("() => call(* $log (..)) || call(i32 * (..))"),
            [
                "(call $log (local.get $a))",
                "(call $add (i32.const 1) (local.get $x))",
                "(call $add (i32.const 2) (i32.const 3))"
            ]
        );
        assert_eq!(
            functions("() => func(* add (..)) || func(* main (..))"),
            ["$add", "$main"]
        );
        assert_eq!(
            functions("() => (func(* add (..)) || func(* main (..))) && call(* $log (..))"),
            ["$add", "$main"]
        );
    }

    #[test]
    fn template_method() {
        let mut templates = Templates::new();
        templates.insert("const", "(i32.const %v%)");
        let (ctx, found) = run(
            &Pointcuts::new(),
            &mut templates,
            "() => func(* main (..)) && template(const)",
        );
        let texts: Vec<_> = found
            .found()
            .iter()
            .map(|jp| ctx.code().string(jp.block()))
            .collect();
        assert_eq!(texts, ["(i32.const 1)", "(i32.const 2)", "(i32.const 3)"]);
        assert_eq!(found.found()[0].get("v").unwrap(), Object::from("1"));
        assert!(found.found()[0].get("func").is_some());

        let (_, found) = run(&Pointcuts::new(), &mut templates, "() => template(const, true)");
        assert_eq!(found.len(), 1);
        assert!(found.found()[0].get("func").is_some());

        let mut ctx = ModuleContext::new(MODULE).unwrap();
        let err = Pointcuts::new()
            .evaluate(&mut ctx, &mut templates, &StructuralMatcher, "() => template(missing)")
            .unwrap_err();
        assert!(matches!(err, WeaverError::Unknown { .. }), "{err}");
    }

    #[test]
    fn named_pointcuts() {
        let mut pointcuts = Pointcuts::new();
        pointcuts.insert("reads", "(i32 x) => args(x)");
        pointcuts.insert("logs", "() => call(void $log (..))");
        pointcuts.insert("forever", "() => forever()");
        let mut templates = Templates::new();

        let (_, found) = run(&pointcuts, &mut templates, "(i32.param[$a] a) => func(* add (..)) && reads(a)");
        assert_eq!(found.len(), 1);
        assert!(found.found()[0].get("a").is_some());
        assert_eq!(run(&pointcuts, &mut templates, "() => logs()").1.len(), 2);

        let mut ctx = ModuleContext::new(MODULE).unwrap();
        for (text, recursion) in [
            ("() => forever()", true),
            ("(i32.param[0] a) => logs(a)", false),
            ("(f32.param[0] a) => reads(a)", false),
        ] {
            let err = pointcuts
                .evaluate(&mut ctx, &mut templates, &StructuralMatcher, text)
                .unwrap_err();
            assert!(matches!(err, WeaverError::Pointcut { .. }), "{text}: {err}");
            assert_eq!(err.to_string().contains("calls itself"), recursion, "{err}");
        }
        let err = pointcuts
            .evaluate(&mut ctx, &mut templates, &StructuralMatcher, "() => nowhere()")
            .unwrap_err();
        assert!(matches!(err, WeaverError::Unknown { .. }), "{err}");
    }
}
