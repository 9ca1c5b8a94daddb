//! Applying advice code at a join-point.
//!
//! Advice replaces the join-point's block. A single advice block simply takes
//! its place. Several blocks can only stand where a statement sequence is
//! expected, so when the join-point is an operand, smart mode moves the
//! advice in front of the enclosing statement and routes the value of the
//! `(target ...)` instruction through a fresh local:
//!
//! ```text
//! (i32.add (i32.const 1) (local.get $x))
//! ;; advice on (local.get $x): (call $log) (target (local.get $x))
//! (local.set $wmr_l1_i32 (i32.const 1))
//! (call $log)
//! (local.set $wmr_l0_i32 (local.get $x))
//! (i32.add (local.get $wmr_l1_i32) (local.get $wmr_l0_i32))
//! ```
//!
//! Operands that were evaluated before the join-point are lifted into locals
//! as well, so the original evaluation order is kept.

use crate::code::{Block, BlockKind, Code, count_instructions};
use crate::context::{CODE_INDEX_PREFIX, FunctionDef, ModuleContext};
use crate::error::{WeaverError, WeaverResult};
use crate::instructions::{Operand, is_control_flow, signature};
use crate::pointcut::JoinPoint;
use log::{debug, trace, warn};

/// Name of the advice instruction that marks where the join-point's value is
/// produced.
const TARGET: &str = "target";

/// What a block has to leave on the value stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Slot {
    /// Nothing, or nothing that can be determined.
    None,
    /// Whatever the surrounding control flow expects.
    Any,
    /// A value of the named type.
    Typed(String),
}

impl Slot {
    fn of(ty: &str) -> Slot {
        if ty.is_empty() {
            Slot::None
        } else {
            Slot::Typed(ty.to_string())
        }
    }
}

fn no_parent(code: &Code, block: Block) -> WeaverError {
    WeaverError::Block {
        block: code.string(block),
        msg: "block does not have a parent".into(),
    }
}

/// Infer the type that `block`, inside `func`, must produce.
pub fn result_type(ctx: &ModuleContext, func: &FunctionDef, block: Block) -> WeaverResult<Slot> {
    let code = ctx.code();
    let Some(name) = code.name(block) else {
        return Ok(Slot::None);
    };
    match name {
        "func" | "return" => return Ok(Slot::of(&func.result)),
        "call" | "call_indirect" => {
            let parent = code.parent(block).ok_or_else(|| no_parent(code, block))?;
            return result_type(ctx, func, parent);
        }
        "local.tee" | "local.set" | "local.get" => {
            let local = code.first_value(block).unwrap_or_default();
            return func
                .locals
                .get(&local)
                .map(|l| Slot::of(&l.ty))
                .or_else(|| func.params.get(&local).map(|p| Slot::of(&p.ty)))
                .ok_or_else(|| WeaverError::unknown("local", local));
        }
        "global.get" | "global.set" => {
            let global = code.first_value(block).unwrap_or_default();
            return ctx
                .global(&global)
                .map(|g| Slot::of(&g.ty))
                .ok_or_else(|| WeaverError::unknown("global", global));
        }
        _ => {}
    }

    let Some(sig) = signature(name).filter(|s| !s.returns.is_empty()) else {
        return Ok(Slot::None);
    };
    if sig.returns[0] != Operand::Any {
        return Ok(Slot::Typed(sig.returns[0].name().to_string()));
    }

    let parent = code.parent(block).ok_or_else(|| no_parent(code, block))?;
    let parent_name = match code.name(parent) {
        Some(n) if !is_control_flow(n) => n,
        _ => return Ok(Slot::Any),
    };
    if parent_name == "func" || parent_name == "return" {
        return Ok(Slot::of(&func.result));
    }
    let Some(parent_sig) = signature(parent_name) else {
        return Ok(Slot::None);
    };
    let index = code
        .child_index(parent, block)
        .ok_or_else(|| no_parent(code, block))?;
    match parent_sig.args.get(index) {
        Some(op) if *op != Operand::Any => Ok(Slot::Typed(op.name().to_string())),
        _ => result_type(ctx, func, parent),
    }
}

/// Where a typed operand sits.
struct OperandSlot {
    parent: Block,
    ty: String,
}

/// The parent and value type of `block`, when it is a typed operand rather
/// than a statement of a control-flow sequence.
fn operand_slot(ctx: &ModuleContext, func: &str, block: Block) -> WeaverResult<Option<OperandSlot>> {
    let code = ctx.code();
    let parent = code.parent(block).ok_or_else(|| no_parent(code, block))?;
    match code.name(parent) {
        Some(name) if !is_control_flow(name) => {}
        _ => return Ok(None),
    }
    let f = ctx.expect_function(func)?;
    Ok(match result_type(ctx, f, block)? {
        Slot::Typed(ty) => Some(OperandSlot { parent, ty }),
        _ => None,
    })
}

/// Add a fresh local `$wmr_l<n><level>_<ty>` to `func`.
fn add_result_local(ctx: &mut ModuleContext, func: &str, level: &str, ty: &str) -> WeaverResult<String> {
    let f = ctx.expect_function(func)?;
    let name = (f.locals.len()..)
        .map(|n| format!("${CODE_INDEX_PREFIX}l{n}{level}_{ty}"))
        .find(|n| !f.locals.contains_key(n) && !f.params.contains_key(n))
        .unwrap_or_default();
    ctx.add_local_with(func, &name, ty, "")?;
    Ok(name)
}

fn local_get(code: &mut Code, local: &str) -> Block {
    let name = code.create_text(local);
    code.create_instruction("local.get", vec![name])
}

/// Wrap `block` in place into `(local.set LOCAL block)`.
fn store_in_local(code: &mut Code, block: Block, local: &str) -> WeaverResult<()> {
    let parent = code.parent(block).ok_or_else(|| no_parent(code, block))?;
    let name = code.create_text(local);
    let set = code.create_instruction("local.set", vec![name]);
    code.replace_child(parent, block, &[set])?;
    code.append_children(set, &[block])
}

/// Replace a `target` instruction by its children.
fn inline_target(code: &mut Code, target: Block) -> WeaverResult<()> {
    let parent = code.parent(target).ok_or_else(|| no_parent(code, target))?;
    let children = code.children(target).to_vec();
    code.replace_child(parent, target, &children)
}

/// Replace the block of `jp` with `advice`.
///
/// In smart mode, advice made of several blocks that lands in an operand
/// position is hoisted in front of the enclosing statement, see the module
/// documentation.
pub fn apply(ctx: &mut ModuleContext, jp: &JoinPoint, advice: &str, smart: bool) -> WeaverResult<()> {
    let blocks = ctx.code_mut().parse_blocks(advice)?;
    if blocks.len() == 1 {
        return ctx.code_mut().replace_blocks(jp.block(), &blocks);
    }
    let func = jp
        .function_def(ctx)
        .ok_or_else(|| WeaverError::Block {
            block: ctx.code().string(jp.block()),
            msg: "join-point is outside function code".into(),
        })?
        .name
        .clone();
    if !smart {
        return apply_non_smart(ctx, &func, jp.block(), &blocks);
    }

    // Keep the advice under a common parent so every target can be edited in
    // place.
    let holder = ctx.code_mut().create(BlockKind::Element);
    ctx.code_mut().append_children(holder, &blocks)?;
    let targets: Vec<Block> = ctx
        .code()
        .preorder(holder)
        .into_iter()
        .filter(|b| ctx.code().is_named(*b, TARGET))
        .collect();

    let Some(slot) = operand_slot(ctx, &func, jp.block())? else {
        let code = ctx.code_mut();
        for target in targets {
            inline_target(code, target)?;
        }
        let blocks = code.children(holder).to_vec();
        return code.replace_blocks(jp.block(), &blocks);
    };

    let local = match targets.split_last() {
        Some((last, rest)) => {
            let local = add_result_local(ctx, &func, "", &slot.ty)?;
            let code = ctx.code_mut();
            for target in rest {
                inline_target(code, *target)?;
            }
            code.rename(*last, "local.set");
            let name = code.create_text(&local);
            code.add_children_by_index(*last, 0, &[name])?;
            local
        }
        None => {
            warn!("no target found in smart advice, looking for the original instruction");
            let original = ctx.code().string(jp.block());
            let Some(copy) = ctx.code().find_equal(holder, &original).filter(|b| *b != holder) else {
                warn!("original instruction not found in the advice either");
                let blocks = ctx.code().children(holder).to_vec();
                return apply_non_smart(ctx, &func, jp.block(), &blocks);
            };
            let local = add_result_local(ctx, &func, "", &slot.ty)?;
            store_in_local(ctx.code_mut(), copy, &local)?;
            local
        }
    };

    let code = ctx.code_mut();
    let blocks = code.children(holder).to_vec();
    code.add_blocks_to_control_flow(jp.block(), &blocks, 0)?;
    let get = local_get(code, &local);
    code.replace_child(slot.parent, jp.block(), &[get])?;
    debug!("smart advice stored in {local}");

    let start = blocks.first().copied().unwrap_or(get);
    hoist_previous_operands(ctx, &func, get, start)
}

/// Starting at `block`, lift every operand evaluated before it into a local
/// placed in front of `start`, then do the same one level up, until a
/// statement position is reached.
fn hoist_previous_operands(ctx: &mut ModuleContext, func: &str, mut block: Block, mut start: Block) -> WeaverResult<()> {
    let mut level = String::new();
    loop {
        let code = ctx.code();
        let parent = code.parent(block).ok_or_else(|| no_parent(code, block))?;
        let index = code
            .child_index(parent, block)
            .ok_or_else(|| no_parent(code, block))?;
        let (next, in_place) = if index > 0 {
            let prev = code.children(parent)[index - 1];
            if code.text(prev).is_some() {
                return Ok(());
            }
            (prev, false)
        } else {
            level.push('p');
            (parent, true)
        };
        if code.is_named(next, "func") {
            return Ok(());
        }
        let Some(slot) = operand_slot(ctx, func, next)? else {
            return Ok(());
        };
        if ctx.code().is_named(slot.parent, "func") {
            return Ok(());
        }

        let local = add_result_local(ctx, func, &level, &slot.ty)?;
        trace!("hoisting operand into {local}");
        let code = ctx.code_mut();
        let name = code.create_text(&local);
        let set = code.create_instruction("local.set", vec![name]);
        // Earlier operands run before the advice; enclosing instructions run
        // where they used to.
        let point = if in_place { block } else { start };
        code.add_blocks_to_control_flow(point, &[set], 0)?;
        let get = local_get(code, &local);
        code.replace_child(slot.parent, next, &[get])?;
        code.append_children(set, &[next])?;
        if !in_place {
            start = set;
        }
        block = get;
    }
}

fn apply_non_smart(ctx: &mut ModuleContext, func: &str, block: Block, blocks: &[Block]) -> WeaverResult<()> {
    let f = ctx.expect_function(func)?;
    match result_type(ctx, f, block) {
        Ok(Slot::Typed(ty)) => warn!(
            "applying advice on an instruction that requires a result of type {ty} (code: {})",
            ctx.code().string_of(blocks)
        ),
        Err(e) => warn!("{e}"),
        Ok(_) => {}
    }
    ctx.code_mut().replace_blocks(block, blocks)
}

/// Compress runs of consecutive join-points of equal depth into groups of at
/// most `max_in_a_row`. The first join-point of each group survives; the
/// blocks of the others are removed from the tree.
pub fn rearrange_blocks(code: &mut Code, jps: Vec<JoinPoint>, max_in_a_row: usize) -> Vec<JoinPoint> {
    let mut out = Vec::new();
    let mut group: Vec<JoinPoint> = Vec::new();
    for jp in jps {
        if let Some(last) = group.last() {
            if jp.depth() == last.depth() && group.len() < max_in_a_row {
                group.push(jp);
                continue;
            }
            out.extend(collapse(code, std::mem::take(&mut group)));
        }
        group.push(jp);
    }
    out.extend(collapse(code, group));
    out
}

/// [`rearrange_blocks`] with groups as long as the number of instructions in
/// `pattern`.
pub fn rearrange_matches(code: &mut Code, jps: Vec<JoinPoint>, pattern: &str) -> Vec<JoinPoint> {
    rearrange_blocks(code, jps, count_instructions(pattern).max(1))
}

fn collapse(code: &mut Code, group: Vec<JoinPoint>) -> Option<JoinPoint> {
    if let [first, second, ..] = group.as_slice() {
        if let Some(parent) = code.parent(first.block()) {
            if let Err(e) = code.remove_children(parent, second.block(), group.len() - 1) {
                warn!("rearranging join-points: {e}");
            }
        }
    }
    group.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointcut::{Environment, find_calls, find_instructions};

    const ADD: &str = r#"(module
        (import "env" "log" (func $log (param i32)))
        (func $f (param $x i32) (result i32)
            (i32.add (i32.const 1) (local.get $x))))"#;

    #[track_caller]
    fn at(ctx: &ModuleContext, func: &str, needle: &str) -> JoinPoint {
        let f = ctx.function(func).unwrap().instr();
        find_instructions(ctx, f, needle).unwrap().into_found().remove(0)
    }

    #[track_caller]
    fn body(ctx: &ModuleContext, func: &str) -> String {
        ctx.code().func_instrs_string(ctx.function(func).unwrap().instr())
    }

    #[test]
    fn result_types() {
        let ctx = ModuleContext::new(
            r#"(module (global $g f64 (f64.const 0))
                (func $f (param $x i64) (result f32)
                    (f32.demote_f64 (select (global.get $g) (f64.const 1) (local.get $c)))))"#,
        )
        .unwrap();
        let f = ctx.function("$f").unwrap();
        let ty = |needle| result_type(&ctx, f, at(&ctx, "$f", needle).block()).unwrap();
        assert_eq!(ty("(global.get $g)"), Slot::Typed("f64".into()));
        assert_eq!(ty("(f64.const 1)"), Slot::Typed("f64".into()));
        assert_eq!(ty("(select (global.get $g) (f64.const 1) (local.get $c))"), Slot::Typed("f64".into()));
        assert_eq!(ty("(f32.demote_f64 (select (global.get $g) (f64.const 1) (local.get $c)))"), Slot::Typed("f32".into()));
        assert!(result_type(&ctx, f, at(&ctx, "$f", "(local.get $c)").block()).is_err());
    }

    #[test]
    fn single_block_replaces() {
        let mut ctx = ModuleContext::new(ADD).unwrap();
        let jp = at(&ctx, "$f", "(local.get $x)");
        apply(&mut ctx, &jp, "(i32.const 5)", true).unwrap();
        assert_eq!(body(&ctx, "$f"), "(i32.add (i32.const 1) (i32.const 5))");
    }

    #[test]
    fn non_smart_splices_every_block() {
        let mut ctx = ModuleContext::new(ADD).unwrap();
        let jp = at(&ctx, "$f", "(local.get $x)");
        apply(&mut ctx, &jp, "(nop) (local.get $x)", false).unwrap();
        assert_eq!(body(&ctx, "$f"), "(i32.add (i32.const 1) (nop) (local.get $x))");
    }

    #[test]
    fn smart_hoists_into_locals() {
        let mut ctx = ModuleContext::new(ADD).unwrap();
        let jp = at(&ctx, "$f", "(local.get $x)");
        apply(&mut ctx, &jp, "(call $log (i32.const 0)) (target (local.get $x))", true).unwrap();
        assert_eq!(
            body(&ctx, "$f"),
            "(local.set $wmr_l1_i32 (i32.const 1)) \
             (call $log (i32.const 0)) \
             (local.set $wmr_l0_i32 (local.get $x)) \
             (i32.add (local.get $wmr_l1_i32) (local.get $wmr_l0_i32))"
        );
        let f = ctx.function("$f").unwrap();
        assert_eq!(f.locals["$wmr_l0_i32"].ty, "i32");
        assert_eq!(f.locals["$wmr_l1_i32"].ty, "i32");
    }

    #[test]
    fn smart_without_target_stores_the_original() {
        let mut ctx = ModuleContext::new(ADD).unwrap();
        let jp = at(&ctx, "$f", "(local.get $x)");
        apply(&mut ctx, &jp, "(nop) (local.get $x)", true).unwrap();
        let body = body(&ctx, "$f");
        assert!(body.contains("(nop) (local.set $wmr_l0_i32 (local.get $x))"), "{body}");
        assert!(body.ends_with("(i32.add (local.get $wmr_l1_i32) (local.get $wmr_l0_i32))"), "{body}");
    }

    #[test]
    fn smart_in_control_flow_inlines_targets() {
        let mut ctx = ModuleContext::new(
            r#"(module
                (func $g) (func $h)
                (func $f (block (call $g) (nop))))"#,
        )
        .unwrap();
        let root = ctx.root();
        let jp = find_calls(&ctx, root, |_, c| {
            (c.callee.as_ref()?.index == "$g").then(Environment::new)
        })
        .unwrap()
        .into_found()
        .remove(0);
        apply(&mut ctx, &jp, "(call $h) (target (call $g))", true).unwrap();
        assert_eq!(body(&ctx, "$f"), "(block (call $h) (call $g) (nop))");
    }

    #[test]
    fn rearrange_groups_consecutive_blocks() {
        let src = "(module (func $f (call $a) (call $b) (call $c) (nop)))";
        let mut ctx = ModuleContext::new(src).unwrap();
        let f = ctx.function("$f").unwrap().instr();
        let jps = find_instructions(&ctx, f, "(call $a) (call $b) (call $c)").unwrap().into_found();
        assert_eq!(jps.len(), 3);
        let kept = rearrange_blocks(ctx.code_mut(), jps, 2);
        assert_eq!(kept.len(), 2);
        assert_eq!(body(&ctx, "$f"), "(call $a) (call $c) (nop)");

        let mut ctx = ModuleContext::new(src).unwrap();
        let f = ctx.function("$f").unwrap().instr();
        let jps = find_instructions(&ctx, f, "(call $a) (call $b) (call $c)").unwrap().into_found();
        let kept = rearrange_matches(ctx.code_mut(), jps, "(call :[x]) (call :[y]) (call :[z])");
        assert_eq!(kept.len(), 1);
        assert_eq!(body(&ctx, "$f"), "(call $a) (nop)");
    }
}
