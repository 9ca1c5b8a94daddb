//! WAT snippets emitted by the runtime rewriter.
//!
//! Every snippet talks to the host bridge through the glue imports declared
//! in [`super::glue`]. Text payloads (expressions, variable names, keys and
//! initial values) cannot be passed as strings, so they are packed into
//! 32-bit words with [`string_to_i32`] and streamed one word per call.

use crate::context::CODE_INDEX_PREFIX;
use crate::types::{SimpleType, type_code};

const BYTES_PER_WORD: usize = 4;

/// Pack `s` into big-endian 32-bit words, zero-padding the last word.
pub fn string_to_i32(s: &str) -> Vec<i32> {
    s.as_bytes()
        .chunks(BYTES_PER_WORD)
        .map(|chunk| {
            let mut word = [0u8; BYTES_PER_WORD];
            word[..chunk.len()].copy_from_slice(chunk);
            i32::from_be_bytes(word)
        })
        .collect()
}

/// Label of the `n`th generated block of a function.
pub(crate) fn block_label(n: usize) -> String {
    format!("${CODE_INDEX_PREFIX}B{n}")
}

/// One `(call $func (i32.const word))` per packed word of `payload`.
fn stream(out: &mut String, func: &str, payload: &str) {
    for word in string_to_i32(payload) {
        out.push_str(&format!("(call ${func} (i32.const {word}))"));
    }
}

/// Load `expr` into the operations buffer.
fn load_expression(out: &mut String, expr: &str) {
    out.push_str("(call $operations.clear)");
    out.push_str(&format!("(call $operations.new_code (i32.const {}))", expr.len()));
    stream(out, "operations.write", expr);
}

/// Evaluate a primitive expression and store the result in `local`.
///
/// A failed evaluation reports the expression through the `error` bridge and
/// traps.
pub(crate) fn primitive_eval(expr: &str, local: &str, ty: SimpleType, ops: &mut usize) -> String {
    let label = block_label(*ops);
    *ops += 1;
    let mut out = String::new();
    load_expression(&mut out, expr);
    out.push_str(&format!("(block {label} (br_if {label} (call $operations.evaluate))"));
    out.push_str("(call $error.new)");
    stream(&mut out, "error.set", expr);
    out.push_str("(call $error.print) (unreachable))");
    let code = type_code(ty.name());
    let read = match ty {
        SimpleType::F32 => format!("(call $operations.read_f32 (i32.const {code}))"),
        SimpleType::F64 => format!("(call $operations.read_f64 (i32.const {code}))"),
        SimpleType::I64 => format!("(i64.extend_i32_s (call $operations.read (i32.const {code})))"),
        _ => format!("(call $operations.read (i32.const {code}))"),
    };
    out.push_str(&format!("(local.set {local} {read})"));
    out
}

/// Prepare the host argument `index` of the next call from `expr`.
pub(crate) fn composite_call_start(expr: &str, index: usize, push_args: bool) -> String {
    let mut out = String::new();
    if push_args {
        out.push_str("(call $args.push)");
    }
    out.push_str(&format!("(call $args.new (i32.const {index}))"));
    load_expression(&mut out, expr);
    out.push_str("(drop (call $operations.evaluate))");
    out.push_str(&format!("(call $args.copy_operation (i32.const {index}))"));
    out
}

/// Release the host arguments of a call.
pub(crate) fn composite_call_end(pop_args: bool) -> String {
    if pop_args {
        "(call $args.pop)".to_string()
    } else {
        String::new()
    }
}

/// Assign the value of `expr` to the host variable `name[key]`.
///
/// Nothing is assigned when the evaluation fails.
pub(crate) fn composite_zone_eval(name: &str, key: &str, expr: &str, is_local: bool, ops: &mut usize) -> String {
    let label = block_label(*ops);
    *ops += 1;
    let mut out = String::new();
    out.push_str(&format!("(block {label}"));
    load_expression(&mut out, expr);
    out.push_str(&format!("(br_if {label} (i32.eqz (call $operations.evaluate)))"));
    out.push_str("(call $zone.new_copy)");
    stream(&mut out, "zone.copy_name", name);
    stream(&mut out, "zone.copy_key", key);
    if is_local {
        out.push_str("(call $zone.copy_operation (i32.const 0)) (call $zone.set))");
    } else {
        out.push_str("(call $zone.copy_operation_global (i32.const 0)) (call $zone.set_global))");
    }
    out
}

/// Make the value of `expr` the host-side return value.
pub(crate) fn composite_return(expr: &str) -> String {
    let mut out = String::from("(call $returns.new_copy)");
    load_expression(&mut out, expr);
    out.push_str("(drop (call $operations.evaluate))");
    out.push_str("(call $returns.copy_operation (i32.const 0))");
    out
}

/// Make the host variable `name[key]` the host-side return value.
pub(crate) fn composite_return_ref(name: &str, key: &str) -> String {
    let mut out = String::from("(call $returns.new_copy)");
    stream(&mut out, "returns.copy_name", name);
    stream(&mut out, "returns.copy_key", key);
    out.push_str("(call $returns.copy_var)");
    out
}

/// Initialize the composite global `name` from its declared value.
pub(crate) fn global_composite_init(name: &str, value: &str, type_code: u32) -> String {
    let mut out = String::new();
    load_expression(&mut out, value);
    out.push_str("(drop (call $operations.evaluate))");
    out.push_str("(call $zone.new_copy)");
    stream(&mut out, "zone.copy_name", name);
    out.push_str(&format!(
        "(call $zone.copy_operation_global (i32.const {type_code})) (call $zone.set_global)"
    ));
    out
}

/// Publish the current value of a numeric variable to the host scope.
///
/// `index` is the local or global that holds the value.
pub(crate) fn zone_primitive(name: &str, index: &str, ty: SimpleType, is_local: bool) -> String {
    let mut out = String::new();
    out.push_str(&format!("(call $zone.new (i32.const {}))", type_code(ty.name())));
    stream(&mut out, "zone.write_name", name);
    let get = if is_local { "local.get" } else { "global.get" };
    out.push_str(&match ty {
        SimpleType::F32 => format!("(call $zone.write_value_f32 ({get} {index}))"),
        SimpleType::F64 => format!("(call $zone.write_value_f64 ({get} {index}))"),
        SimpleType::I64 => format!("(call $zone.write_value (i32.wrap_i64 ({get} {index})))"),
        _ => format!("(call $zone.write_value ({get} {index}))"),
    });
    out.push_str(if is_local { "(call $zone.set)" } else { "(call $zone.set_global)" });
    out
}

/// Declare a composite local in the host scope with its initial value.
pub(crate) fn zone_composite_local(name: &str, key: &str, value: &str, type_code: u32) -> String {
    let mut out = String::new();
    out.push_str(&format!("(call $zone.new (i32.const {type_code}))"));
    stream(&mut out, "zone.write_name", name);
    stream(&mut out, "zone.write_key", key);
    stream(&mut out, "zone.write_value", value);
    out.push_str("(call $zone.set)");
    out
}

/// Bind the composite parameter at position `index` in the host scope.
pub(crate) fn zone_composite_param(name: &str, index: usize) -> String {
    let mut out = String::from("(call $zone.new_copy)");
    stream(&mut out, "zone.copy_name", name);
    out.push_str(&format!("(call $zone.copy_arg (i32.const {index})) (call $zone.set)"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn packing() {
        assert!(string_to_i32("").is_empty());
        assert_eq!(string_to_i32("abcd"), [0x61626364]);
        assert_eq!(string_to_i32("ab"), [0x61620000]);
        assert_eq!(string_to_i32("abcde"), [0x61626364, 0x65000000]);
        assert_eq!(string_to_i32("\u{ff}"), [0xc3bf0000u32 as i32]);
    }

    #[test]
    fn primitive_eval_snippet() {
        let mut ops = 0;
        let code = primitive_eval("1+2", "$l", SimpleType::I32, &mut ops);
        assert_eq!(ops, 1);
        assert_eq!(
            code,
            "(call $operations.clear)(call $operations.new_code (i32.const 3))\
             (call $operations.write (i32.const 824914432))\
             (block $wmr_B0 (br_if $wmr_B0 (call $operations.evaluate))\
             (call $error.new)(call $error.set (i32.const 824914432))(call $error.print) (unreachable))\
             (local.set $l (call $operations.read (i32.const 2)))"
        );
        let code = primitive_eval("x", "$l", SimpleType::I64, &mut ops);
        assert!(code.contains("$wmr_B1"));
        assert!(code.ends_with("(local.set $l (i64.extend_i32_s (call $operations.read (i32.const 11))))"));
    }

    #[test]
    fn call_snippets() {
        let start = composite_call_start("s", 1, true);
        assert!(start.starts_with("(call $args.push)(call $args.new (i32.const 1))"));
        assert!(start.ends_with("(call $args.copy_operation (i32.const 1))"));
        assert!(!composite_call_start("s", 0, false).contains("args.push"));
        assert_eq!(composite_call_end(true), "(call $args.pop)");
        assert_eq!(composite_call_end(false), "");
    }

    #[test]
    fn zone_snippets() {
        let mut ops = 3;
        let local = composite_zone_eval("s", "", "x", true, &mut ops);
        assert_eq!(ops, 4);
        assert!(local.starts_with("(block $wmr_B3"));
        assert!(local.ends_with("(call $zone.set))"));
        assert!(!local.contains("copy_key"));
        let global = composite_zone_eval("s", "k", "x", false, &mut ops);
        assert!(global.contains("(call $zone.copy_key"));
        assert!(global.ends_with("(call $zone.set_global))"));

        assert_eq!(
            zone_primitive("a", "$a", SimpleType::F64, true),
            "(call $zone.new (i32.const 4))(call $zone.write_name (i32.const 1627389952))\
             (call $zone.write_value_f64 (local.get $a))(call $zone.set)"
        );
        assert!(zone_primitive("g", "$g", SimpleType::I32, false).ends_with("(call $zone.set_global)"));
        assert!(zone_composite_param("p", 2).contains("(call $zone.copy_arg (i32.const 2))"));
        assert!(zone_composite_local("m", "", "", 5).ends_with("(call $zone.set)"));
    }

    proptest! {
        #[test]
        fn packing_preserves_bytes(s in "[ -~]{0,40}") {
            let words = string_to_i32(&s);
            prop_assert_eq!(words.len(), s.len().div_ceil(BYTES_PER_WORD));
            let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
            prop_assert_eq!(&bytes[..s.len()], s.as_bytes());
            prop_assert!(bytes[s.len()..].iter().all(|b| *b == 0));
        }
    }
}
