//! Pointcut search: finding the join-points of a module.
//!
//! A pointcut walks a subtree once and emits a [`JoinPoint`] for every block
//! of a given shape: function definitions, calls, calls whose arguments are
//! plain variable reads, and function exits. Each candidate is described by
//! a serializable data record ([`FuncData`], [`CallData`], [`ReturnsData`])
//! and handed to a filter, which decides whether the candidate is kept and
//! which extra names it brings into scope for the advice.
//!
//! Pointcuts are usually written as text, e.g.
//! `() => func(* * (..), exported) && call(void $log (..))`, and evaluated
//! with [`Pointcuts::evaluate`]; the `find_*` functions are the methods
//! such text is built from.

mod expr;
pub mod parser;

pub use self::expr::Pointcuts;
pub use self::parser::{Pointcut, parse};

use crate::code::{Block, Code};
use crate::context::{FunctionDef, ModuleContext};
use crate::error::WeaverResult;
use crate::keyword::{Object, Scope, capitalize, lower_first};
use indexmap::IndexMap;
use indexmap::map::Entry;
use log::{debug, trace};
use serde_derive::Serialize;

/// Names a filter attaches to an accepted join-point.
pub type Environment = IndexMap<String, Object>;

/// The data of a function definition, as seen by filters and advice.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FuncData {
    /// Internal name, e.g. `$add`.
    pub index: String,
    /// 1-based function index.
    pub order: usize,
    /// Export name, `module.field` for imports, or the bare internal name.
    pub name: String,
    pub params: Vec<String>,
    pub param_types: Vec<String>,
    pub total_params: usize,
    pub locals: Vec<String>,
    pub local_types: Vec<String>,
    pub total_locals: usize,
    pub result_type: String,
    /// Compact text of the function body.
    pub code: String,
    pub is_imported: bool,
    pub is_exported: bool,
    pub is_start: bool,
}

impl FuncData {
    pub fn new(ctx: &ModuleContext, f: &FunctionDef) -> Self {
        let name = match (&f.exported, &f.imported) {
            (Some(export), _) => export.clone(),
            (None, Some(import)) => format!("{}.{}", import.module, import.field),
            (None, None) => f.name.trim_start_matches('$').to_string(),
        };
        let mut locals: Vec<_> = f.locals.values().collect();
        locals.sort_by_key(|l| l.order);
        FuncData {
            index: f.name.clone(),
            order: ctx.function_index(f) + 1,
            name,
            params: f.parameters().map(|p| p.name.clone()).collect(),
            param_types: f.parameters().map(|p| p.ty.clone()).collect(),
            total_params: f.params.len(),
            locals: locals.iter().map(|l| l.name.clone()).collect(),
            local_types: locals.iter().map(|l| l.ty.clone()).collect(),
            total_locals: locals.len(),
            result_type: f.result.clone(),
            code: ctx.code().func_instrs_string(f.instr()),
            is_imported: f.imported.is_some(),
            is_exported: f.exported.is_some(),
            is_start: f.is_start,
        }
    }
}

/// One argument of a call.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArgData {
    /// The declared type of the matching callee parameter.
    #[serde(rename = "Type")]
    pub ty: String,
    /// 0-based argument position.
    pub order: usize,
    /// Compact text of the argument.
    pub instr: String,
}

/// The data of a call site. Used by both the `call` and `args` pointcuts.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallData {
    pub callee: Option<FuncData>,
    pub caller: Option<FuncData>,
    pub args: Vec<ArgData>,
    pub total_args: usize,
}

impl CallData {
    fn new(ctx: &ModuleContext, call: Block, callee: &FunctionDef) -> Self {
        let code = ctx.code();
        let params: Vec<_> = callee.parameters().collect();
        let args: Vec<ArgData> = code.children(call)[1..]
            .iter()
            .zip(&params)
            .enumerate()
            .map(|(order, (arg, param))| ArgData {
                ty: param.ty.clone(),
                order,
                instr: code.string(*arg),
            })
            .collect();
        let caller = code
            .enclosing_function(call)
            .and_then(|f| ctx.function_by_instr(f))
            .map(|f| FuncData::new(ctx, f));
        CallData {
            callee: Some(FuncData::new(ctx, callee)),
            caller,
            total_args: args.len(),
            args,
        }
    }
}

/// The data of a function exit.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReturnsData {
    pub func: FuncData,
    /// Compact text of the exit instruction.
    pub instr: String,
    /// The function's result type.
    #[serde(rename = "Type")]
    pub ty: String,
}

/// Wrap pointcut data under its pointcut name, e.g. `{Call:{...}}`.
fn metadata(key: &str, data: &impl serde::Serialize) -> WeaverResult<Object> {
    let mut map = IndexMap::new();
    map.insert(key.to_string(), Object::from_serialize(data)?);
    Ok(Object::Map(map))
}

/// A block selected by a pointcut, with the data describing it.
#[derive(Clone, Debug)]
pub struct JoinPoint {
    /// Pointcut data, keyed by pointcut name (`Func`, `Call`, `Args`,
    /// `Returns`).
    pub metadata: Object,
    /// Names added by the filter, keyed by their capitalized name.
    pub environment: Environment,
    block: Block,
    function: Option<Block>,
    depth: usize,
}

impl JoinPoint {
    pub(crate) fn new(code: &Code, block: Block, metadata: Object, environment: Environment) -> Self {
        let function = code.enclosing_function(block);
        let depth = function.and_then(|f| code.depth(block, f)).unwrap_or(0);
        JoinPoint {
            metadata,
            environment: environment
                .into_iter()
                .map(|(k, v)| (capitalize(&k), v))
                .collect(),
            block,
            function,
            depth,
        }
    }

    /// The selected block.
    pub fn block(&self) -> Block {
        self.block
    }

    /// The `func` instruction enclosing the block, if any.
    pub fn function(&self) -> Option<Block> {
        self.function
    }

    /// Distance from the block to its enclosing function.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The definition of the enclosing function.
    pub fn function_def<'c>(&self, ctx: &'c ModuleContext) -> Option<&'c FunctionDef> {
        self.function.and_then(|f| ctx.function_by_instr(f))
    }

    /// Look up `key` in the metadata, then in the environment. The first
    /// letter of `key` is case-insensitive.
    pub fn get(&self, key: &str) -> Option<Object> {
        let key = capitalize(key);
        if let Object::Map(m) = &self.metadata {
            if let Some(v) = m.get(&key).filter(|v| **v != Object::Null) {
                return Some(v.clone());
            }
        }
        self.environment.get(&key).cloned()
    }

    /// The keyword scope of this join-point's advice.
    pub fn scope(&self) -> Scope {
        let mut scope = Scope::new();
        for (k, v) in &self.environment {
            scope.insert(lower_first(k), v.clone());
        }
        if let Object::Map(m) = &self.metadata {
            for (k, v) in m {
                scope.insert(lower_first(k), v.clone());
            }
        }
        scope
    }
}

/// The join-points found by one or more searches.
#[derive(Clone, Debug, Default)]
pub struct JoinPointSearch {
    found: Vec<JoinPoint>,
}

impl JoinPointSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn found(&self) -> &[JoinPoint] {
        &self.found
    }

    pub fn into_found(self) -> Vec<JoinPoint> {
        self.found
    }

    pub fn len(&self) -> usize {
        self.found.len()
    }

    pub fn is_empty(&self) -> bool {
        self.found.is_empty()
    }

    pub(crate) fn push(&mut self, jp: JoinPoint) {
        self.found.push(jp);
    }

    /// Collapse join-points that overlap, keeping the first of each group.
    /// Returns whether anything was removed.
    pub fn remove_duplicates(&mut self, code: &Code) -> bool {
        let (found, removed) = remove_duplicates(code, std::mem::take(&mut self.found), |old, _| old);
        self.found = found;
        removed
    }

    /// Append the join-points of `other`, then remove duplicates.
    pub fn merge(&mut self, code: &Code, other: JoinPointSearch) {
        self.found.extend(other.found);
        self.remove_duplicates(code);
    }

    /// The union of two searches. Overlapping join-points are resolved by
    /// `resolver(old, new)`.
    pub fn union(
        mut self,
        code: &Code,
        other: JoinPointSearch,
        resolver: impl FnMut(JoinPoint, JoinPoint) -> JoinPoint,
    ) -> JoinPointSearch {
        self.found.extend(other.found);
        let (found, _) = remove_duplicates(code, self.found, resolver);
        JoinPointSearch { found }
    }

    /// [`JoinPointSearch::union`] keeping the deeper join-point of each
    /// overlap, enriched with the other's metadata.
    pub fn union_deepest(self, code: &Code, other: JoinPointSearch) -> JoinPointSearch {
        self.union(code, other, keep_deepest)
    }
}

impl IntoIterator for JoinPointSearch {
    type Item = JoinPoint;
    type IntoIter = std::vec::IntoIter<JoinPoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.found.into_iter()
    }
}

impl FromIterator<JoinPoint> for JoinPointSearch {
    fn from_iter<I: IntoIterator<Item = JoinPoint>>(iter: I) -> Self {
        JoinPointSearch {
            found: iter.into_iter().collect(),
        }
    }
}

/// The default union resolver.
pub fn keep_deepest(mut old: JoinPoint, mut new: JoinPoint) -> JoinPoint {
    if new.depth > old.depth {
        new.metadata.join(&old.metadata);
        new
    } else {
        old.metadata.join(&new.metadata);
        old
    }
}

/// Group join-points by enclosing function, lift each block to its ancestor
/// at the group's minimum depth and collapse join-points that share one.
fn remove_duplicates(
    code: &Code,
    found: Vec<JoinPoint>,
    mut resolver: impl FnMut(JoinPoint, JoinPoint) -> JoinPoint,
) -> (Vec<JoinPoint>, bool) {
    let mut groups: IndexMap<Option<Block>, Vec<JoinPoint>> = IndexMap::new();
    for jp in found {
        groups.entry(jp.function).or_default().push(jp);
    }
    let mut removed = false;
    let mut out = Vec::new();
    for (_, group) in groups {
        let min_depth = group.iter().map(|jp| jp.depth).min().unwrap_or(0);
        let mut lifted: IndexMap<Block, JoinPoint> = IndexMap::new();
        for jp in group {
            let anchor = std::iter::once(jp.block)
                .chain(code.ancestors(jp.block))
                .nth(jp.depth - min_depth)
                .unwrap_or(jp.block);
            match lifted.entry(anchor) {
                Entry::Occupied(mut e) => {
                    removed = true;
                    let old = e.get().clone();
                    e.insert(resolver(old, jp));
                }
                Entry::Vacant(e) => {
                    e.insert(jp);
                }
            }
        }
        out.extend(lifted.into_values());
    }
    (out, removed)
}

fn is_internal_function(ctx: &ModuleContext, b: Block) -> Option<&FunctionDef> {
    let code = ctx.code();
    if !code.is_named(b, "func") || !code.parent(b).is_some_and(|p| code.is_named(p, "module")) {
        return None;
    }
    ctx.function_by_instr(b).filter(|f| f.imported.is_none())
}

/// The callee of a `call` instruction, resolving script aliases.
fn callee<'c>(ctx: &'c ModuleContext, call: Block, aliases: bool) -> Option<&'c FunctionDef> {
    let name = ctx.code().first_value(call)?;
    if let Some(f) = ctx.function(&name) {
        return Some(f);
    }
    if !aliases {
        return None;
    }
    ctx.alias_key(name.trim_matches('%'))
        .and_then(|internal| ctx.function(internal))
}

/// Every internal function of the module, unfiltered.
pub fn init_search(ctx: &ModuleContext) -> WeaverResult<JoinPointSearch> {
    find_functions(ctx, ctx.root(), |_, _| Some(Environment::new()))
}

/// The `func` pointcut.
pub fn find_functions(
    ctx: &ModuleContext,
    within: Block,
    mut filter: impl FnMut(&ModuleContext, &FuncData) -> Option<Environment>,
) -> WeaverResult<JoinPointSearch> {
    let code = ctx.code();
    let mut search = JoinPointSearch::new();
    for b in code.preorder(within) {
        let Some(f) = is_internal_function(ctx, b) else { continue };
        let data = FuncData::new(ctx, f);
        if let Some(env) = filter(ctx, &data) {
            search.push(JoinPoint::new(code, b, metadata("Func", &data)?, env));
        }
    }
    debug!("func pointcut: {} join-points", search.len());
    Ok(search)
}

/// The `call` pointcut. Callees may be named by their script alias.
pub fn find_calls(
    ctx: &ModuleContext,
    within: Block,
    mut filter: impl FnMut(&ModuleContext, &CallData) -> Option<Environment>,
) -> WeaverResult<JoinPointSearch> {
    let code = ctx.code();
    let mut search = JoinPointSearch::new();
    for b in code.preorder(within) {
        if !code.is_named(b, "call") {
            continue;
        }
        let Some(f) = callee(ctx, b, true) else { continue };
        let data = CallData::new(ctx, b, f);
        if let Some(env) = filter(ctx, &data) {
            search.push(JoinPoint::new(code, b, metadata("Call", &data)?, env));
        }
    }
    debug!("call pointcut: {} join-points", search.len());
    Ok(search)
}

/// Is every argument of `call` a single `local.*` or `global.*` read?
fn has_variable_args(code: &Code, call: Block) -> bool {
    code.children(call)[1..].iter().all(|arg| {
        code.children(*arg).len() == 1
            && code
                .name(*arg)
                .is_some_and(|n| n.starts_with("local") || n.starts_with("global"))
    })
}

/// The `args` pointcut: calls whose arguments are all variable reads.
pub fn find_args(
    ctx: &ModuleContext,
    within: Block,
    mut filter: impl FnMut(&ModuleContext, &CallData) -> Option<Environment>,
) -> WeaverResult<JoinPointSearch> {
    let code = ctx.code();
    let mut search = JoinPointSearch::new();
    for b in code.preorder(within) {
        if !code.is_named(b, "call") || code.children(b).is_empty() {
            continue;
        }
        let Some(f) = callee(ctx, b, false) else { continue };
        if !has_variable_args(code, b) {
            trace!("args pointcut: skipping {}", code.display(b));
            continue;
        }
        let data = CallData::new(ctx, b, f);
        if let Some(env) = filter(ctx, &data) {
            search.push(JoinPoint::new(code, b, metadata("Args", &data)?, env));
        }
    }
    debug!("args pointcut: {} join-points", search.len());
    Ok(search)
}

/// The `returns` pointcut: every `return` of every internal function, plus
/// the function's final instruction.
///
/// A function without a result that does not already end in a `return` gets
/// an explicit `(return)` appended, so that each exit has a block to attach
/// advice to.
pub fn find_returns(
    ctx: &mut ModuleContext,
    within: Block,
    mut filter: impl FnMut(&ModuleContext, &ReturnsData) -> Option<Environment>,
) -> WeaverResult<JoinPointSearch> {
    let funcs: Vec<(Block, String)> = ctx
        .code()
        .preorder(within)
        .into_iter()
        .filter_map(|b| is_internal_function(ctx, b).map(|f| (b, f.result.clone())))
        .collect();

    let mut exits = Vec::new();
    for (func, result) in funcs {
        let code = ctx.code();
        let mut returns: Vec<Block> = code
            .preorder(func)
            .into_iter()
            .filter(|b| code.is_named(*b, "return"))
            .collect();
        let last = code.children(func).last().copied();
        if last.is_none() || last != returns.last().copied() {
            if result.is_empty() {
                let ret = ctx.code_mut().parse_blocks("(return)")?;
                ctx.code_mut().append_children(func, &ret)?;
                returns.extend(ret);
            } else if let Some(last) = last.filter(|b| ctx.code().is_code_instruction(*b)) {
                returns.push(last);
            }
        }
        exits.extend(returns.into_iter().map(|r| (func, r)));
    }

    let ctx = &*ctx;
    let code = ctx.code();
    let mut search = JoinPointSearch::new();
    for (func, ret) in exits {
        let Some(f) = ctx.function_by_instr(func) else { continue };
        let data = ReturnsData {
            func: FuncData::new(ctx, f),
            instr: code.string(ret),
            ty: f.result.clone(),
        };
        if let Some(env) = filter(ctx, &data) {
            search.push(JoinPoint::new(code, ret, metadata("Returns", &data)?, env));
        }
    }
    debug!("returns pointcut: {} join-points", search.len());
    Ok(search)
}

/// Join-points at the blocks under `within` that equal the top-level blocks
/// of `code_text`.
///
/// The first match fixes the search root to its parent, so that the
/// remaining blocks are looked up among its siblings.
pub fn find_instructions(ctx: &ModuleContext, within: Block, code_text: &str) -> WeaverResult<JoinPointSearch> {
    let mut scratch = Code::new();
    let needles: Vec<String> = scratch
        .parse_blocks(code_text)?
        .into_iter()
        .map(|b| scratch.string(b))
        .collect();
    let code = ctx.code();
    let mut root = within;
    let mut search = JoinPointSearch::new();
    for needle in needles {
        let Some(found) = code.find_equal(root, &needle) else { continue };
        if search.is_empty() {
            root = code.parent(found).unwrap_or(root);
        }
        search.push(JoinPoint::new(code, found, Object::Null, Environment::new()));
    }
    Ok(search)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODULE: &str = r#"(module
        (import "env" "log" (func $log (param i32)))
        (func $add (export "add") (param $a i32) (param $b i32) (result i32) (local $t i32)
            (i32.add (local.get $a) (local.get $b)))
        (func $main
            (call $log (call $add (i32.const 1) (local.get $x)))
            (call $add (local.get $y) (global.get $g))
            (if (i32.const 0) (then (return)))))"#;

    fn ctx() -> ModuleContext {
        ModuleContext::new(MODULE).unwrap()
    }

    fn all<T>(_: &ModuleContext, _: &T) -> Option<Environment> {
        Some(Environment::new())
    }

    #[track_caller]
    fn texts(ctx: &ModuleContext, search: &JoinPointSearch) -> Vec<String> {
        search
            .found()
            .iter()
            .map(|jp| ctx.code().string(jp.block()))
            .collect()
    }

    #[test]
    fn func_pointcut() {
        let ctx = ctx();
        let search = init_search(&ctx).unwrap();
        assert_eq!(search.len(), 2);
        let add = &search.found()[0];
        assert_eq!(add.depth(), 0);
        let data = add.get("func").unwrap();
        assert_eq!(data.prop("Name").unwrap(), Object::from("add"));
        assert_eq!(data.prop("Order").unwrap(), Object::from("2"));
        assert_eq!(data.prop("Params").unwrap().to_string(), "[$a,$b]");
        assert_eq!(data.prop("LocalTypes").unwrap().to_string(), "[i32]");
        assert_eq!(data.prop("IsExported").unwrap(), Object::from("true"));
        assert_eq!(data.prop("Code").unwrap(), Object::from("(i32.add (local.get $a) (local.get $b))"));

        let exported = find_functions(&ctx, ctx.root(), |_, f| f.is_exported.then(Environment::new)).unwrap();
        assert_eq!(exported.len(), 1);
    }

    #[test]
    fn call_pointcut() {
        let ctx = ctx();
        let search = find_calls(&ctx, ctx.root(), |_, c| {
            let callee = c.callee.as_ref()?;
            (callee.index == "$add").then(|| {
                let mut env = Environment::new();
                env.insert("this".into(), Object::from(callee.name.as_str()));
                env
            })
        })
        .unwrap();
        assert_eq!(
            texts(&ctx, &search),
            ["(call $add (i32.const 1) (local.get $x))", "(call $add (local.get $y) (global.get $g))"]
        );
        let jp = &search.found()[0];
        assert_eq!(jp.depth(), 2);
        assert_eq!(jp.get("This").unwrap(), Object::from("add"));
        let call = jp.get("call").unwrap();
        assert_eq!(call.prop("TotalArgs").unwrap(), Object::from("2"));
        assert_eq!(call.prop("Caller").unwrap().prop("Index").unwrap(), Object::from("$main"));
        let arg = call.prop("Args").unwrap().index(1).unwrap();
        assert_eq!(arg.prop("Type").unwrap(), Object::from("i32"));
        assert_eq!(arg.prop("Instr").unwrap(), Object::from("(local.get $x)"));
        assert!(jp.scope().get("this").is_some());
        assert!(jp.scope().get("call").is_some());

        let code = "(module (func $m (call %print% (i32.const 1))))";
        let mut aliased = ModuleContext::new(code).unwrap();
        assert_eq!(find_calls(&aliased, aliased.root(), all).unwrap().len(), 0);
        aliased.function_alias.insert("$m".into(), "print".into());
        assert_eq!(find_calls(&aliased, aliased.root(), all).unwrap().len(), 1);
    }

    #[test]
    fn args_pointcut_requires_variable_reads() {
        let ctx = ctx();
        let search = find_args(&ctx, ctx.root(), all).unwrap();
        assert_eq!(texts(&ctx, &search), ["(call $add (local.get $y) (global.get $g))"]);
        assert!(search.found()[0].get("args").is_some());
    }

    #[test]
    fn returns_pointcut() {
        let mut ctx = ctx();
        let root = ctx.root();
        let search = find_returns(&mut ctx, root, all).unwrap();
        assert_eq!(
            texts(&ctx, &search),
            ["(i32.add (local.get $a) (local.get $b))", "(return)", "(return)"]
        );
        let main = ctx.function("$main").unwrap().instr();
        assert!(ctx.code().func_instrs_string(main).ends_with("(then (return))) (return)"));
        let ret = search.found()[0].get("returns").unwrap();
        assert_eq!(ret.prop("Type").unwrap(), Object::from("i32"));

        // A second search finds the same exits without adding more.
        let again = find_returns(&mut ctx, root, all).unwrap();
        assert_eq!(again.len(), 3);
        assert!(ctx.code().func_instrs_string(main).ends_with("(then (return))) (return)"));
    }

    #[test]
    fn duplicates_collapse_to_the_shallowest_block() {
        let ctx = ctx();
        let mut search = find_calls(&ctx, ctx.root(), all).unwrap();
        assert_eq!(search.len(), 3);
        assert!(search.remove_duplicates(ctx.code()));
        assert_eq!(
            texts(&ctx, &search),
            [
                "(call $log (call $add (i32.const 1) (local.get $x)))",
                "(call $add (local.get $y) (global.get $g))"
            ]
        );
        assert!(!search.remove_duplicates(ctx.code()));
    }

    #[test]
    fn union_keeps_the_deeper_join_point() {
        let ctx = ctx();
        let outer = find_calls(&ctx, ctx.root(), |_, c| {
            (c.callee.as_ref()?.index == "$log").then(Environment::new)
        })
        .unwrap();
        let inner = find_calls(&ctx, ctx.root(), |_, c| {
            (c.callee.as_ref()?.index == "$add" && c.args[0].instr.contains("const")).then(Environment::new)
        })
        .unwrap();
        let union = outer.union_deepest(ctx.code(), inner);
        assert_eq!(texts(&ctx, &union), ["(call $add (i32.const 1) (local.get $x))"]);
        assert_eq!(union.found()[0].depth(), 2);
    }

    #[test]
    fn instructions_by_text() {
        let ctx = ctx();
        let add = ctx.function("$add").unwrap().instr();
        let search = find_instructions(&ctx, add, "(local.get $b) (local.get $a)").unwrap();
        assert_eq!(texts(&ctx, &search), ["(local.get $b)", "(local.get $a)"]);
        assert!(search.found().iter().all(|jp| jp.function() == Some(add)));
        assert!(find_instructions(&ctx, add, "(nop)").unwrap().is_empty());

        let mut merged = JoinPointSearch::new();
        merged.merge(ctx.code(), search);
        assert_eq!(merged.len(), 2);
    }
}
