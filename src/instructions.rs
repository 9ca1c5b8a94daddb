//! Static facts about WebAssembly text instructions.
//!
//! The smart applicator needs to know which value type a block must leave on
//! the stack. That is answered from the operand and result slots of the
//! enclosing instruction, described here as a [`Signature`].

use smallvec::{SmallVec, smallvec};
use std::fmt;

/// A value-stack slot type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Operand {
    I32,
    I64,
    F32,
    F64,
    /// The slot type depends on the context (locals, callee, label).
    Any,
}

impl Operand {
    /// Parse a WAT numeric type name.
    pub fn from_name(name: &str) -> Option<Operand> {
        Some(match name {
            "i32" => Operand::I32,
            "i64" => Operand::I64,
            "f32" => Operand::F32,
            "f64" => Operand::F64,
            _ => return None,
        })
    }

    /// The WAT name of the type, or `"any"`.
    pub fn name(self) -> &'static str {
        match self {
            Operand::I32 => "i32",
            Operand::I64 => "i64",
            Operand::F32 => "f32",
            Operand::F64 => "f64",
            Operand::Any => "any",
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Operand and result slots of an instruction in folded form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    pub args: SmallVec<[Operand; 3]>,
    pub returns: SmallVec<[Operand; 1]>,
}

impl Signature {
    fn new(args: SmallVec<[Operand; 3]>, returns: SmallVec<[Operand; 1]>) -> Self {
        Signature { args, returns }
    }
}

/// Instructions whose children are a sequence of statements rather than
/// typed operands.
const CONTROL_FLOW: &[&str] = &["block", "loop", "then", "else", "unreachable", "drop"];

/// Is `name` a control-flow instruction for the purpose of finding an
/// insertion anchor?
pub fn is_control_flow(name: &str) -> bool {
    CONTROL_FLOW.contains(&name)
}

/// Canonical order weight of a module field.
pub fn order_weight(name: &str) -> u8 {
    match name {
        "type" => 0,
        "import" => 1,
        "func" => 2,
        "table" => 3,
        "memory" => 4,
        "global" => 5,
        "export" => 6,
        "start" => 7,
        "elem" => 8,
        "data" => 9,
        _ => 10,
    }
}

/// Look up the signature of an instruction by name.
///
/// `call` and `call_indirect` depend on their callee and are reported with
/// no fixed slots.
pub fn signature(name: &str) -> Option<Signature> {
    use Operand::*;
    let sig = match name {
        "block" | "loop" | "unreachable" | "nop" | "call" | "call_indirect" => {
            Signature::new(smallvec![], smallvec![])
        }
        "br" | "br_if" | "then" | "else" | "end" | "drop" | "local.set" | "global.set" => {
            Signature::new(smallvec![Any], smallvec![])
        }
        "br_table" => Signature::new(smallvec![Any, I32], smallvec![]),
        "if" => Signature::new(smallvec![I32, Any, Any], smallvec![]),
        "return" | "local.tee" => Signature::new(smallvec![Any], smallvec![Any]),
        "local.get" | "global.get" => Signature::new(smallvec![], smallvec![Any]),
        "select" => Signature::new(smallvec![Any, Any, I32], smallvec![Any]),
        "memory.size" => Signature::new(smallvec![], smallvec![I32]),
        "memory.grow" => Signature::new(smallvec![I32], smallvec![I32]),
        _ => return numeric(name),
    };
    Some(sig)
}

fn numeric(name: &str) -> Option<Signature> {
    use Operand::*;
    let (ty, op) = name.split_once('.')?;
    let t = Operand::from_name(ty)?;
    let unary = |r| Some(Signature::new(smallvec![t], smallvec![r]));
    let binary = |r| Some(Signature::new(smallvec![t, t], smallvec![r]));
    let from = |a: Operand| Some(Signature::new(smallvec![a], smallvec![t]));

    if op == "const" {
        return Some(Signature::new(smallvec![], smallvec![t]));
    }
    if op.starts_with("load") {
        return Some(Signature::new(smallvec![Any], smallvec![t]));
    }
    if op.starts_with("store") {
        return Some(Signature::new(smallvec![Any, t], smallvec![]));
    }
    if let Some(source) = op
        .strip_prefix("convert_")
        .or_else(|| op.strip_prefix("trunc_sat_"))
        .or_else(|| op.strip_prefix("trunc_"))
        .or_else(|| op.strip_prefix("reinterpret_"))
        .or_else(|| op.strip_prefix("extend_"))
        .or_else(|| op.strip_prefix("wrap_"))
        .or_else(|| op.strip_prefix("demote_"))
        .or_else(|| op.strip_prefix("promote_"))
    {
        let source = source.split('_').next().and_then(Operand::from_name)?;
        return from(source);
    }

    match (t, op) {
        (I32 | I64, "add" | "sub" | "mul" | "div_s" | "div_u" | "rem_s" | "rem_u" | "and" | "or" | "xor" | "shl"
        | "shr_s" | "shr_u" | "rotl" | "rotr") => binary(t),
        (I32 | I64, "clz" | "ctz" | "popcnt" | "extend8_s" | "extend16_s" | "extend32_s") => unary(t),
        (I32 | I64, "eqz") => unary(I32),
        (I32 | I64, "eq" | "ne" | "lt_s" | "lt_u" | "le_s" | "le_u" | "gt_s" | "gt_u" | "ge_s" | "ge_u") => {
            binary(I32)
        }
        (F32 | F64, "add" | "sub" | "mul" | "div" | "min" | "max" | "copysign") => binary(t),
        (F32 | F64, "sqrt" | "ceil" | "floor" | "trunc" | "nearest" | "abs" | "neg") => unary(t),
        (F32 | F64, "eq" | "ne" | "lt" | "le" | "gt" | "ge") => binary(I32),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Operand::*;

    #[track_caller]
    fn sig(name: &str) -> (Vec<Operand>, Vec<Operand>) {
        let s = signature(name).unwrap();
        (s.args.to_vec(), s.returns.to_vec())
    }

    #[test]
    fn arithmetic() {
        assert_eq!(sig("i32.add"), (vec![I32, I32], vec![I32]));
        assert_eq!(sig("i64.eqz"), (vec![I64], vec![I32]));
        assert_eq!(sig("f64.sqrt"), (vec![F64], vec![F64]));
        assert_eq!(sig("f32.lt"), (vec![F32, F32], vec![I32]));
        assert_eq!(sig("i64.lt_u"), (vec![I64, I64], vec![I32]));
    }

    #[test]
    fn conversions() {
        assert_eq!(sig("i32.wrap_i64"), (vec![I64], vec![I32]));
        assert_eq!(sig("i64.extend_i32_u"), (vec![I32], vec![I64]));
        assert_eq!(sig("f32.demote_f64"), (vec![F64], vec![F32]));
        assert_eq!(sig("f64.convert_i64_s"), (vec![I64], vec![F64]));
        assert_eq!(sig("i32.trunc_f64_s"), (vec![F64], vec![I32]));
        assert_eq!(sig("f32.reinterpret_i32"), (vec![I32], vec![F32]));
        assert_eq!(sig("i64.extend32_s"), (vec![I64], vec![I64]));
    }

    #[test]
    fn memory_and_control() {
        assert_eq!(sig("i32.load8_u"), (vec![Any], vec![I32]));
        assert_eq!(sig("i64.store32"), (vec![Any, I64], vec![]));
        assert_eq!(sig("memory.grow"), (vec![I32], vec![I32]));
        assert_eq!(sig("memory.size"), (vec![], vec![I32]));
        assert_eq!(sig("if"), (vec![I32, Any, Any], vec![]));
        assert_eq!(sig("call"), (vec![], vec![]));
        assert!(signature("i32.bogus").is_none());
        assert!(signature("module").is_none());
    }

    #[test]
    fn control_flow_and_order() {
        assert!(is_control_flow("block"));
        assert!(is_control_flow("then"));
        assert!(!is_control_flow("if"));
        assert!(order_weight("type") < order_weight("import"));
        assert!(order_weight("start") < order_weight("data"));
        assert_eq!(order_weight("custom"), 10);
    }
}
