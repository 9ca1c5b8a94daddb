//! Lowering of runtime expressions into host bridge calls.
//!
//! Advice code can contain `/.../` evaluations and `#name` references whose
//! values only exist on the host: strings, arrays, maps, or numbers computed
//! by an expression. After weaving, [`rewrite`] turns every such construct
//! into plain WAT that talks to the host through imported glue functions.
//!
//! The rewrite is a fixed sequence of passes over the whole module:
//!
//! 1. Composite globals are removed and initialized from the start function.
//! 2. A trailing evaluation of a function with a composite result is wrapped
//!    in `(return ...)`.
//! 3. Calls to functions with a composite result are lifted into their own
//!    statement; their value is read back through a `/return_/` evaluation.
//! 4. Composite `param`, `local` and `result` declarations are removed.
//! 5. Evaluations and return references are lowered. Variables an expression
//!    reads are published to the host scope ("zone") first.
//! 6. Imports with a composite signature are served by the `operations`
//!    host module.
//! 7. Element segments are pointed at table 0.
//! 8. Evaluations that were consumed as host call arguments are removed.
//! 9. The glue imports the new code needs are declared.
//!
//! Running the rewrite again on its own output changes nothing.

mod codegen;
mod glue;

pub use self::codegen::string_to_i32;
pub use self::glue::{GlueGroup, ImportFunctionDef};

use crate::code::{Block, BlockKind, Code};
use crate::context::{CODE_INDEX_PREFIX, FunctionDef, FunctionYaml, ModuleContext};
use crate::error::{WeaverError, WeaverResult};
use crate::instructions::{self, Operand};
use crate::types::{self, SimpleType, VariableType};
use indexmap::{IndexMap, IndexSet};
use itertools::Itertools;
use log::{debug, trace, warn};
use std::collections::HashSet;

const RETURN_EVALUATION: &str = "/return_/";
const ZONE_PUSH: &str = "(call $zone.push)";
const ZONE_POP: &str = "(call $zone.pop)";

/// Rewrite bookkeeping for one function.
#[derive(Debug, Default)]
pub(crate) struct FunctionChanges {
    /// `zone.push`/`zone.pop` have been added.
    has_zone: bool,
    /// Composite variables already declared in the host scope.
    composite_zones: HashSet<String>,
    /// Generated block labels.
    ops: usize,
    /// Generated evaluation locals.
    locals: usize,
}

/// Runtime rewrite state kept by a [`ModuleContext`].
#[derive(Debug, Default)]
pub(crate) struct RuntimeState {
    pub(crate) need_js: bool,
    pub(crate) glue_imports: Vec<ImportFunctionDef>,
    pub(crate) operations: bool,
    pub(crate) zone: bool,
    pub(crate) returns: bool,
    pub(crate) error: bool,
    /// Calls whose host arguments have been pushed.
    pub(crate) arg_calls: HashSet<Block>,
    pub(crate) functions: IndexMap<String, FunctionChanges>,
    evals_to_remove: Vec<Block>,
}

impl RuntimeState {
    fn changes(&mut self, func: &str) -> &mut FunctionChanges {
        self.functions.entry(func.to_string()).or_default()
    }
}

/// Lower every runtime expression of the module.
pub fn rewrite(ctx: &mut ModuleContext) -> WeaverResult<()> {
    let moved = move_composite_globals(ctx)?;
    debug!("runtime: moved {moved} composite globals");
    let composite_returns = wrap_composite_returns(ctx)?;
    let lifted = lift_composite_calls(ctx, &composite_returns)?;
    debug!(
        "runtime: {} composite-returning functions, {lifted} calls lifted",
        composite_returns.len()
    );
    remove_composite_props(ctx)?;
    let lowered = rewrite_evaluations(ctx)?;
    debug!("runtime: lowered {lowered} evaluations");
    reroute_composite_imports(ctx)?;
    fix_elem_tables(ctx)?;
    remove_queued_evaluations(ctx)?;
    glue::add_glue_functions(ctx)
}

/// The numeric type named `ty`, if it is one.
fn numeric(ty: &str) -> Option<SimpleType> {
    match VariableType::parse(ty) {
        Ok(VariableType::Simple(s)) if types::is_primitive(ty) => Some(s),
        _ => None,
    }
}

fn operand_type(operand: Operand) -> Option<SimpleType> {
    match operand {
        Operand::I32 => Some(SimpleType::I32),
        Operand::I64 => Some(SimpleType::I64),
        Operand::F32 => Some(SimpleType::F32),
        Operand::F64 => Some(SimpleType::F64),
        Operand::Any => None,
    }
}

// Pass 1.

/// Replace composite globals by host-side initialization in the start
/// function, creating one if needed. Returns the number of globals moved.
fn move_composite_globals(ctx: &mut ModuleContext) -> WeaverResult<usize> {
    let root = ctx.root();
    let mut moved = Vec::new();
    for g in ctx.globals() {
        if g.imported.is_some() || g.is_primitive() || !ctx.code().is_attached(g.instr(), root) {
            continue;
        }
        let name = ctx
            .global_alias
            .get(&g.name)
            .cloned()
            .unwrap_or_else(|| g.name.trim_start_matches('$').to_string());
        let ty = VariableType::parse(&g.ty)?;
        // String initializers are indexed without their quotes.
        let value = match ty {
            VariableType::Simple(SimpleType::String | SimpleType::Identifier) => {
                format!("\"{}\"", g.initial_value)
            }
            _ => g.initial_value.clone(),
        };
        moved.push((g.instr(), codegen::global_composite_init(&name, &value, ty.code())));
    }
    if moved.is_empty() {
        return Ok(0);
    }

    let start = match ctx.start_function() {
        Some(f) => f.name.clone(),
        None => {
            let name = ctx.add_function(&FunctionYaml::default())?;
            ctx.add_start_function(&name)?;
            debug!("created start function {name}");
            name
        }
    };
    let init: String = moved.iter().map(|(_, code)| code.as_str()).collect();
    ctx.add_code_at_func_start(&start, &init)?;
    for (instr, _) in &moved {
        ctx.remove_field(*instr)?;
    }

    // Globals live as long as the instance, so the start function declares
    // them without opening a zone of its own.
    ctx.runtime.changes(&start).has_zone = true;
    ctx.runtime.operations = true;
    ctx.runtime.zone = true;
    Ok(moved.len())
}

// Pass 2.

/// Make a trailing evaluation of a composite-result function an explicit
/// `return`. Returns the names of all composite-result functions.
fn wrap_composite_returns(ctx: &mut ModuleContext) -> WeaverResult<HashSet<String>> {
    let funcs: Vec<(String, Block, bool)> = ctx
        .functions()
        .filter(|f| !f.result.is_empty() && !types::is_primitive(&f.result))
        .map(|f| (f.name.clone(), f.instr(), f.imported.is_none()))
        .collect();
    let mut names = HashSet::new();
    for (name, instr, internal) in funcs {
        let code = ctx.code_mut();
        names.insert(name);
        if !internal {
            continue;
        }
        let Some(&last) = code.children(instr).last() else {
            continue;
        };
        if !matches!(code.kind(last), BlockKind::Evaluation | BlockKind::EvaluationRef(_)) {
            continue;
        }
        let ret = code.create_instruction("return", Vec::new());
        code.replace_child(instr, last, &[ret])?;
        code.append_children(ret, &[last])?;
        trace!("wrapped composite result `{}`", code.string(ret));
    }
    Ok(names)
}

// Pass 3.

/// Move calls to composite-result functions in front of the statement that
/// uses their value, and read the value back with `/return_/`.
///
/// A call under `drop` replaces the `drop`, since the value never reaches
/// the WebAssembly stack.
fn lift_composite_calls(ctx: &mut ModuleContext, funcs: &HashSet<String>) -> WeaverResult<usize> {
    let root = ctx.root();
    let code = ctx.code_mut();
    let calls: Vec<Block> = code
        .preorder(root)
        .into_iter()
        .filter(|b| code.is_named(*b, "call") && code.first_value(*b).is_some_and(|n| funcs.contains(&n)))
        .collect();
    let mut lifted = 0;
    for call in calls {
        let Some(parent) = code.parent(call) else {
            continue;
        };
        if code.is_named(parent, "drop") {
            if let Some(grand) = code.parent(parent) {
                code.replace_child(grand, parent, &[call])?;
                lifted += 1;
            }
            continue;
        }
        let Ok((anchor, index)) = code.instruction_index_on_control_flow(call) else {
            continue;
        };
        if anchor == parent {
            continue;
        }
        let slot = code.parse_blocks(RETURN_EVALUATION)?;
        code.replace_child(parent, call, &slot)?;
        code.add_children_by_index(anchor, index, &[call])?;
        trace!("lifted `{}`", code.string(call));
        lifted += 1;
    }
    Ok(lifted)
}

// Pass 4.

/// Drop composite types from `param`, `local` and `result` declarations.
fn remove_composite_props(ctx: &mut ModuleContext) -> WeaverResult<()> {
    let root = ctx.root();
    let code = ctx.code_mut();
    let is_composite_type =
        |code: &Code, b: Block| code.text(b).is_some_and(|t| !t.starts_with('$') && !types::is_primitive(t));
    for b in code.preorder(root) {
        match code.name(b) {
            Some("param") => {
                let composite: Vec<Block> = code
                    .children(b)
                    .iter()
                    .copied()
                    .filter(|c| is_composite_type(code, *c))
                    .collect();
                if composite.is_empty() {
                    continue;
                }
                for c in composite {
                    code.remove_child(b, c)?;
                }
                let rest = code.children(b);
                let name_only = rest.len() == 1 && code.text(rest[0]).is_some_and(|t| t.starts_with('$'));
                if rest.is_empty() || name_only {
                    code.detach(b)?;
                }
            }
            Some("local" | "result") => {
                let numeric = code
                    .children(b)
                    .last()
                    .and_then(|c| code.text(*c))
                    .is_some_and(types::is_primitive);
                if !numeric {
                    code.detach(b)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// Pass 5.

/// How the value of an evaluation is consumed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Operation {
    Call,
    Local,
    Global,
    Return,
    /// An operand of any other instruction.
    Other,
}

impl Operation {
    fn of(code: &Code, parent: Block) -> Operation {
        match code.name(parent) {
            Some("call") => Operation::Call,
            Some("local.set" | "local.tee") => Operation::Local,
            Some("global.set") => Operation::Global,
            Some("return") => Operation::Return,
            _ => Operation::Other,
        }
    }
}

/// Which names a `#name` reference may resolve to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Names {
    Function,
    Module,
    Both,
}

/// A resolved variable reference.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Reference {
    /// The script name.
    name: String,
    /// Joined subscripts, `a][b` for `#x[a][b]`.
    key: String,
    /// The internal name.
    index: String,
}

/// Split `name[key]` into its name and key.
fn split_variable_name(input: &str) -> (&str, &str) {
    match (input.find('['), input.rfind(']')) {
        (Some(open), Some(close)) if open < close => (&input[..open], &input[open + 1..close]),
        _ => (input, ""),
    }
}

/// Resolve a script name to an internal name.
///
/// Aliases win; a name without an alias refers to the entity called
/// `$name`, if there is one.
fn resolve_name(ctx: &ModuleContext, func: &FunctionDef, names: Names, name: &str) -> Option<String> {
    let in_function = || {
        func.alias_key(name).map(str::to_string).or_else(|| {
            let index = format!("${name}");
            (func.params.contains_key(&index) || func.locals.contains_key(&index)).then_some(index)
        })
    };
    let in_module = || {
        ctx.alias_key(name).map(str::to_string).or_else(|| {
            let index = format!("${name}");
            ctx.global(&index).is_some().then_some(index)
        })
    };
    match names {
        Names::Function => in_function(),
        Names::Module => in_module(),
        Names::Both => in_function().or_else(in_module),
    }
}

/// Resolve the target of a `local.set`, `global.set` or composite return.
fn reference(ctx: &ModuleContext, func: &FunctionDef, names: Names, block: Block) -> WeaverResult<Reference> {
    let code = ctx.code();
    if let BlockKind::EvaluationRef(name) = code.kind(block) {
        let key = code
            .children(block)
            .iter()
            .map(|i| {
                let s = code.string(*i);
                let inner = s.strip_prefix('[').and_then(|s| s.strip_suffix(']')).unwrap_or(&s);
                inner.trim_matches('/').to_string()
            })
            .join("][");
        let index = resolve_name(ctx, func, names, name).ok_or_else(|| WeaverError::unknown("variable", name.clone()))?;
        return Ok(Reference {
            name: name.clone(),
            key,
            index,
        });
    }
    let index = code.string(block);
    let alias = match names {
        Names::Function => func.alias_value(&index),
        Names::Module => ctx.alias_value(&index),
        Names::Both => func.alias_value(&index).or_else(|| ctx.alias_value(&index)),
    };
    let name = alias.unwrap_or_else(|| index.trim_start_matches('$')).to_string();
    Ok(Reference {
        name,
        key: String::new(),
        index,
    })
}

/// A variable an expression reads, and how to publish it to the host scope.
#[derive(Clone, Debug, PartialEq, Eq)]
enum ZoneTarget {
    /// A numeric local, parameter or global, published before each use.
    Primitive {
        name: String,
        index: String,
        ty: SimpleType,
        is_local: bool,
    },
    /// A composite local, declared once at the function start.
    CompositeLocal {
        name: String,
        key: String,
        value: String,
        code: u32,
    },
    /// A composite parameter, bound once at the function start.
    CompositeParam { name: String, position: usize },
}

impl ZoneTarget {
    /// A primitive target for a numeric `ty`, `None` for a composite one.
    fn variable(name: &str, index: &str, ty: &str, is_local: bool) -> WeaverResult<Option<ZoneTarget>> {
        VariableType::parse(ty)?;
        Ok(numeric(ty).map(|ty| ZoneTarget::Primitive {
            name: name.to_string(),
            index: index.to_string(),
            ty,
            is_local,
        }))
    }
}

/// Classify the variable `raw` (`name`, `name[key]` or `$index`) read by an
/// expression in `func`.
fn zone_variable(ctx: &ModuleContext, func: &FunctionDef, raw: &str) -> WeaverResult<Option<ZoneTarget>> {
    let (name, key) = split_variable_name(raw);
    let (name, index) = match name.strip_prefix('$') {
        Some(stripped) => (stripped.to_string(), name.to_string()),
        None => {
            let index = resolve_name(ctx, func, Names::Both, name)
                .ok_or_else(|| WeaverError::unknown("variable", name))?;
            (name.to_string(), index)
        }
    };
    if let Some(p) = func.params.get(&index) {
        return match ZoneTarget::variable(&name, &index, &p.ty, true)? {
            Some(t) => Ok(Some(t)),
            None => Ok(Some(ZoneTarget::CompositeParam { name, position: p.order })),
        };
    }
    if let Some(l) = func.locals.get(&index) {
        return match ZoneTarget::variable(&name, &index, &l.ty, true)? {
            Some(t) => Ok(Some(t)),
            None => Ok(Some(ZoneTarget::CompositeLocal {
                name,
                key: key.to_string(),
                value: l.initial_value.clone(),
                code: VariableType::parse(&l.ty)?.code(),
            })),
        };
    }
    match ctx.global(&index) {
        // Composite globals are declared by the start function.
        Some(g) => ZoneTarget::variable(&name, &index, &g.ty, false),
        None => Ok(None),
    }
}

/// Variables read by the expression rooted at `block`: `#name` identifiers
/// and `$index` subscripts.
fn zone_identifiers(code: &Code, block: Block) -> IndexSet<String> {
    code.preorder(block)
        .into_iter()
        .filter_map(|b| match code.kind(b) {
            BlockKind::EvaluationId(id) => Some(id.clone()),
            BlockKind::EvaluationIndex { base } => {
                let index = &code.children(b)[usize::from(*base).min(code.children(b).len())..];
                match index {
                    [single] => code
                        .text(*single)
                        .map(str::trim)
                        .filter(|t| {
                            t.len() > 1
                                && t.starts_with('$')
                                && t[1..].chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                        })
                        .map(str::to_string),
                    _ => None,
                }
            }
            _ => None,
        })
        .collect()
}

/// The expression text of an evaluation, without its delimiters.
fn expression(code: &Code, eval: Block) -> String {
    let s = code.string(eval);
    s.strip_prefix('/')
        .and_then(|s| s.strip_suffix('/'))
        .unwrap_or(&s)
        .trim()
        .to_string()
}

/// Parse `snippet` and insert it before the statement containing `block`.
///
/// A statement directly preceded by `zone.pop` gets the code before the
/// pop, so the expression still sees its zone.
fn insert_before_statement(ctx: &mut ModuleContext, block: Block, snippet: &str) -> WeaverResult<()> {
    if snippet.is_empty() {
        return Ok(());
    }
    let code = ctx.code_mut();
    let blocks = code.parse_blocks(snippet)?;
    code.add_blocks_to_control_flow_with(block, &blocks, |code, anchor, index| {
        match index.checked_sub(1).and_then(|i| code.child(anchor, i)) {
            Some(prev) if code.string(prev) == ZONE_POP => index - 1,
            _ => index,
        }
    })
}

/// Open a host scope for `func` if it does not have one yet.
fn ensure_zone(ctx: &mut ModuleContext, func: &str) -> WeaverResult<()> {
    let changes = ctx.runtime.changes(func);
    if changes.has_zone {
        return Ok(());
    }
    changes.has_zone = true;
    ctx.runtime.zone = true;
    ctx.add_code_at_func_start(func, ZONE_PUSH)?;
    ctx.add_code_at_func_end(func, ZONE_POP)
}

/// Insert `snippet` right after the `zone.push` of `func`.
fn add_after_zone_push(ctx: &mut ModuleContext, func: &str, snippet: &str) -> WeaverResult<()> {
    let instr = ctx.expect_function(func)?.instr();
    let code = ctx.code_mut();
    let push = code
        .children(instr)
        .iter()
        .position(|b| code.string(*b) == ZONE_PUSH);
    match push {
        Some(index) => {
            let blocks = code.parse_blocks(snippet)?;
            code.add_children_by_index(instr, index + 1, &blocks)
        }
        None => ctx.add_code_at_func_start(func, snippet),
    }
}

/// Publish the variables in `ids` to the host scope before the statement
/// containing `block`.
fn publish_zone_variables(
    ctx: &mut ModuleContext,
    func: &FunctionDef,
    block: Block,
    ids: &IndexSet<String>,
) -> WeaverResult<()> {
    if ids.is_empty() {
        return Ok(());
    }
    ensure_zone(ctx, &func.name)?;
    for id in ids {
        let target = match zone_variable(ctx, func, id) {
            Ok(Some(target)) => target,
            Ok(None) => continue,
            Err(e) => {
                warn!("zone variable `{id}` in {}: {e}", func.name);
                continue;
            }
        };
        trace!("zone target {target:?}");
        match target {
            ZoneTarget::Primitive {
                name,
                index,
                ty,
                is_local,
            } => {
                let snippet = codegen::zone_primitive(&name, &index, ty, is_local);
                insert_before_statement(ctx, block, &snippet)?;
            }
            ZoneTarget::CompositeLocal {
                name,
                key,
                value,
                code,
            } => {
                if ctx.runtime.changes(&func.name).composite_zones.insert(name.clone()) {
                    let snippet = codegen::zone_composite_local(&name, &key, &value, code);
                    add_after_zone_push(ctx, &func.name, &snippet)?;
                }
            }
            ZoneTarget::CompositeParam { name, position } => {
                if ctx.runtime.changes(&func.name).composite_zones.insert(name.clone()) {
                    let snippet = codegen::zone_composite_param(&name, position);
                    add_after_zone_push(ctx, &func.name, &snippet)?;
                }
            }
        }
    }
    Ok(())
}

/// Declare a fresh local of type `ty` in `func` for an evaluation result.
fn evaluation_local(ctx: &mut ModuleContext, func: &str, ty: SimpleType) -> WeaverResult<String> {
    let mut n = ctx.runtime.changes(func).locals;
    let f = ctx.expect_function(func)?;
    let name = loop {
        let name = format!("${CODE_INDEX_PREFIX}local_{}_{n}", ty.name());
        if !f.locals.contains_key(&name) && !f.params.contains_key(&name) {
            break name;
        }
        n += 1;
    };
    ctx.runtime.changes(func).locals = n + 1;
    ctx.add_local_with(func, &name, ty.name(), "")?;
    Ok(name)
}

/// Lower `eval` into a host evaluation read back into a local.
///
/// `target` resolves a `#name` first operand of `parent` to its internal
/// name.
fn primitive_evaluation(
    ctx: &mut ModuleContext,
    func: &FunctionDef,
    eval: Block,
    parent: Block,
    ty: SimpleType,
    target: Option<Names>,
) -> WeaverResult<()> {
    ctx.runtime.operations = true;
    ctx.runtime.error = true;
    let expr = expression(ctx.code(), eval);
    let local = evaluation_local(ctx, &func.name, ty)?;
    let snippet = codegen::primitive_eval(&expr, &local, ty, &mut ctx.runtime.changes(&func.name).ops);
    insert_before_statement(ctx, eval, &snippet)?;
    let code = ctx.code_mut();
    let get = code.parse_blocks(&format!("(local.get {local})"))?;
    code.replace_child(parent, eval, &get)?;

    let Some(names) = target else {
        return Ok(());
    };
    let Some(first) = ctx.code().child(parent, 0) else {
        return Ok(());
    };
    if matches!(ctx.code().kind(first), BlockKind::EvaluationRef(_)) {
        let reference = reference(ctx, func, names, first)?;
        let code = ctx.code_mut();
        let index = code.create_text(reference.index);
        code.replace_child(parent, first, &[index])?;
    }
    Ok(())
}

/// The numeric type a `local.set`/`global.set` stores, or `None` for a
/// composite variable.
fn variable_target(
    ctx: &ModuleContext,
    func: &FunctionDef,
    set: Block,
    names: Names,
) -> WeaverResult<(Reference, Option<SimpleType>)> {
    let code = ctx.code();
    let children = code.children(set);
    if children.len() != 2 {
        return Err(code.block_error(set, "expected a variable and a value"));
    }
    let reference = reference(ctx, func, names, children[0])?;
    let ty = match names {
        Names::Module => ctx.global(&reference.index).map(|g| g.ty.clone()),
        _ => func
            .params
            .get(&reference.index)
            .map(|p| p.ty.clone())
            .or_else(|| func.locals.get(&reference.index).map(|l| l.ty.clone())),
    };
    let kind = if names == Names::Module { "global" } else { "local" };
    let ty = ty.ok_or_else(|| WeaverError::unknown(kind, reference.name.clone()))?;
    VariableType::parse(&ty)?;
    Ok((reference, numeric(&ty)))
}

/// Assign the value of `eval` to a composite host variable and drop the
/// original set.
fn composite_variable(
    ctx: &mut ModuleContext,
    func: &FunctionDef,
    eval: Block,
    set: Block,
    target: &Reference,
    is_local: bool,
) -> WeaverResult<()> {
    ctx.runtime.operations = true;
    ctx.runtime.zone = true;
    let expr = expression(ctx.code(), eval);
    let snippet = codegen::composite_zone_eval(
        &target.name,
        &target.key,
        &expr,
        is_local,
        &mut ctx.runtime.changes(&func.name).ops,
    );
    insert_before_statement(ctx, eval, &snippet)?;
    ctx.code_mut().detach(set)
}

/// Lower an evaluation passed as a call argument.
fn call_evaluation(ctx: &mut ModuleContext, func: &FunctionDef, eval: Block, call: Block) -> WeaverResult<()> {
    let code = ctx.code();
    let callee_name = code
        .first_value(call)
        .ok_or_else(|| code.block_error(call, "call without a callee"))?;
    let callee = ctx
        .function(&callee_name)
        .ok_or_else(|| WeaverError::unknown("function", callee_name.clone()))?;
    let args = code.children(call).len() - 1;
    if callee.params.len() != args {
        return Err(code.block_error(
            call,
            format!("{callee_name} expects {} arguments but got {args}", callee.params.len()),
        ));
    }
    let position = code
        .child_index(call, eval)
        .filter(|p| *p > 0)
        .ok_or_else(|| code.block_error(call, "evaluation is not a call argument"))?
        - 1;
    let param_ty = callee
        .parameters()
        .nth(position)
        .map(|p| p.ty.clone())
        .unwrap_or_default();
    VariableType::parse(&param_ty)?;
    match numeric(&param_ty) {
        Some(ty) => primitive_evaluation(ctx, func, eval, call, ty, None),
        None => composite_call(ctx, func, eval, call, position),
    }
}

/// Pass a composite argument through the host `args` stack.
///
/// The first composite argument of a call pushes a new argument frame and
/// pops it after the call. When the call is the value of a `return`, the
/// result is spilled to a local so the frame is popped before returning.
fn composite_call(
    ctx: &mut ModuleContext,
    func: &FunctionDef,
    eval: Block,
    call: Block,
    position: usize,
) -> WeaverResult<()> {
    let push = ctx.runtime.arg_calls.insert(call);
    ctx.runtime.operations = true;
    let expr = expression(ctx.code(), eval);
    insert_before_statement(ctx, eval, &codegen::composite_call_start(&expr, position, push))?;
    ctx.runtime.evals_to_remove.push(eval);
    if !push {
        return Ok(());
    }

    if let (Some((parent, ret, index)), Some(ty)) = (ctx.code().find_parent_return(eval), numeric(&func.result)) {
        let local = format!("${CODE_INDEX_PREFIX}local_{}_result", ty.name());
        if !ctx.expect_function(&func.name)?.locals.contains_key(&local) {
            ctx.add_local_with(&func.name, &local, ty.name(), "")?;
        }
        let code = ctx.code_mut();
        // `add_local_with` may shift the function header.
        let index = code.child_index(parent, ret).unwrap_or(index);
        let pop = index
            .checked_sub(1)
            .and_then(|i| code.child(parent, i))
            .filter(|p| code.string(*p) == ZONE_POP);
        code.rename(ret, "local.set");
        let name = code.create_text(local.clone());
        code.add_children_by_index(ret, 0, &[name])?;
        let new_ret = code.parse_blocks(&format!("(return (local.get {local}))"))?;
        code.add_children_by_index(parent, index + 1, &new_ret)?;
        if let (Some(pop), Some(first)) = (pop, new_ret.first()) {
            code.add_children(parent, *first, &[pop])?;
        }
    }
    let end = ctx.code_mut().parse_blocks(&codegen::composite_call_end(true))?;
    ctx.code_mut().add_blocks_to_control_flow(eval, &end, 1)
}

/// The numeric type expected for `eval` as an operand of `parent`.
fn operand_slot(ctx: &ModuleContext, func: &FunctionDef, parent: Block, eval: Block) -> WeaverResult<SimpleType> {
    let code = ctx.code();
    let name = code.name(parent).unwrap_or_default();
    if name == "func" {
        return numeric(&func.result)
            .ok_or_else(|| code.block_error(eval, format!("{} does not return a number", func.name)));
    }
    let signature = instructions::signature(name)
        .ok_or_else(|| code.block_error(parent, format!("no signature for `{name}`")))?;
    // Immediates such as `offset=4` are text and take no operand slot.
    let position = code
        .children(parent)
        .iter()
        .take_while(|b| **b != eval)
        .filter(|b| code.text(**b).is_none())
        .count();
    signature
        .args
        .get(position)
        .copied()
        .and_then(operand_type)
        .ok_or_else(|| code.block_error(parent, "evaluation operand has no numeric type"))
}

/// Lower one evaluation.
fn rewrite_evaluation(ctx: &mut ModuleContext, func: &FunctionDef, eval: Block, parent: Block) -> WeaverResult<()> {
    let ids = zone_identifiers(ctx.code(), eval);
    publish_zone_variables(ctx, func, eval, &ids)?;
    match Operation::of(ctx.code(), parent) {
        Operation::Call => call_evaluation(ctx, func, eval, parent),
        Operation::Local => match variable_target(ctx, func, parent, Names::Function)? {
            (_, Some(ty)) => primitive_evaluation(ctx, func, eval, parent, ty, Some(Names::Function)),
            (target, None) => composite_variable(ctx, func, eval, parent, &target, true),
        },
        Operation::Global => match variable_target(ctx, func, parent, Names::Module)? {
            (_, Some(ty)) => primitive_evaluation(ctx, func, eval, parent, ty, Some(Names::Module)),
            (target, None) => composite_variable(ctx, func, eval, parent, &target, false),
        },
        Operation::Return if func.result.is_empty() => {
            Err(ctx.code().block_error(parent, format!("{} has no result", func.name)))
        }
        Operation::Return => match numeric(&func.result) {
            Some(ty) => primitive_evaluation(ctx, func, eval, parent, ty, None),
            None => {
                ctx.runtime.returns = true;
                ctx.runtime.operations = true;
                let expr = expression(ctx.code(), eval);
                insert_before_statement(ctx, eval, &codegen::composite_return(&expr))?;
                ctx.code_mut().remove_child(parent, eval)
            }
        },
        Operation::Other => {
            let ty = operand_slot(ctx, func, parent, eval)?;
            primitive_evaluation(ctx, func, eval, parent, ty, None)
        }
    }
}

/// Lower a `(return #name)` of a composite-result function.
fn rewrite_return_reference(ctx: &mut ModuleContext, func: &FunctionDef, r: Block, ret: Block) -> WeaverResult<()> {
    let reference = reference(ctx, func, Names::Both, r)?;
    let ids: IndexSet<String> = [reference.name.clone()].into_iter().collect();
    publish_zone_variables(ctx, func, r, &ids)?;
    ctx.runtime.returns = true;
    let snippet = codegen::composite_return_ref(&reference.name, &reference.key);
    insert_before_statement(ctx, r, &snippet)?;
    ctx.code_mut().remove_child(ret, r)
}

/// Lower every evaluation and return reference. Returns how many were
/// lowered.
fn rewrite_evaluations(ctx: &mut ModuleContext) -> WeaverResult<usize> {
    let root = ctx.root();
    let code = ctx.code();
    let blocks: Vec<Block> = code
        .preorder(root)
        .into_iter()
        .filter(|b| matches!(code.kind(*b), BlockKind::Evaluation | BlockKind::EvaluationRef(_)))
        .collect();
    let mut lowered = 0;
    for block in blocks {
        let code = ctx.code();
        if !code.is_attached(block, root) {
            trace!("skipping removed {block}");
            continue;
        }
        let Some(parent) = code.parent(block) else {
            continue;
        };
        let func = match code.enclosing_function(block).and_then(|f| ctx.function_by_instr(f)) {
            Some(f) => f.clone(),
            None => {
                warn!("`{}` is outside function code", code.string(block));
                continue;
            }
        };
        if matches!(code.kind(block), BlockKind::Evaluation) {
            rewrite_evaluation(ctx, &func, block, parent)?;
        } else if Operation::of(code, parent) == Operation::Return {
            rewrite_return_reference(ctx, &func, block, parent)?;
        } else {
            continue;
        }
        lowered += 1;
    }
    Ok(lowered)
}

// Pass 6.

/// The `import` instruction of an imported function.
fn import_of(code: &Code, func: Block) -> Option<Block> {
    match code.parent(func) {
        Some(p) if code.is_named(p, "import") => Some(p),
        _ => code
            .children(func)
            .iter()
            .copied()
            .find(|c| code.is_named(*c, "import")),
    }
}

/// Serve imports with a composite signature from the `operations` module.
fn reroute_composite_imports(ctx: &mut ModuleContext) -> WeaverResult<()> {
    const OPERATIONS: &str = "\"operations\"";
    let imports: Vec<Block> = ctx
        .functions()
        .filter(|f| f.imported.is_some())
        .filter(|f| {
            f.params.values().any(|p| !p.is_primitive())
                || (!f.result.is_empty() && !types::is_primitive(&f.result))
        })
        .filter_map(|f| import_of(ctx.code(), f.instr()))
        .collect();
    let code = ctx.code_mut();
    for import in imports {
        match code.child(import, 0) {
            Some(module) if code.string(module) != OPERATIONS => {
                let blocks = code.parse_blocks(OPERATIONS)?;
                code.replace_child(import, module, &blocks)?;
                trace!("rerouted `{}`", code.string(import));
            }
            _ => {}
        }
    }
    Ok(())
}

// Pass 7.

/// Point every element segment at table 0.
fn fix_elem_tables(ctx: &mut ModuleContext) -> WeaverResult<()> {
    let module = ctx.module();
    let code = ctx.code_mut();
    let elems: Vec<Block> = code
        .children(module)
        .iter()
        .copied()
        .filter(|b| code.is_named(*b, "elem"))
        .collect();
    for elem in elems {
        let Some(table) = code.child(elem, 0) else {
            continue;
        };
        if code.text(table).is_some_and(|t| t != "0") {
            let zero = code.create_text("0");
            code.replace_child(elem, table, &[zero])?;
        }
    }
    Ok(())
}

// Pass 8.

fn remove_queued_evaluations(ctx: &mut ModuleContext) -> WeaverResult<()> {
    for eval in std::mem::take(&mut ctx.runtime.evals_to_remove) {
        let code = ctx.code_mut();
        match code.parent(eval) {
            Some(parent) => code.remove_child(parent, eval)?,
            None => warn!("queued evaluation {eval} is no longer in the module"),
        }
    }
    Ok(())
}
