//! End-to-end weaving: parsing, indexing, pointcuts, advice and the runtime
//! rewrite working together.

use proptest::prelude::*;
use wasm_weaver::apply::apply;
use wasm_weaver::context::FunctionYaml;
use wasm_weaver::instructions::order_weight;
use wasm_weaver::keyword::Object;
use wasm_weaver::pointcut::{Environment, find_calls, find_instructions};
use wasm_weaver::runtime::rewrite;
use wasm_weaver::{Code, ModuleContext, Weaver, WeaverConfig};

#[track_caller]
fn roundtrip(src: &str) -> String {
    let mut code = Code::new();
    let root = code.parse(src).unwrap();
    code.string(root)
}

#[track_caller]
fn body(ctx: &ModuleContext, func: &str) -> String {
    ctx.code().func_instrs_string(ctx.function(func).unwrap().instr())
}

#[track_caller]
fn assert_same_module(expected: &str, actual: &str) {
    if expected != actual {
        let diff = similar::TextDiff::from_lines(expected, actual);
        panic!("modules differ:\n{}", diff.unified_diff());
    }
}

#[test]
fn compact_round_trip() {
    let src = "(module (func $e (result i32) (i32.const 1)))";
    assert_eq!(roundtrip(src), src);
    assert_eq!(
        roundtrip("(module\n  (func $e   (result i32)\n    (i32.const 1)))"),
        src
    );
}

fn sexpr() -> impl Strategy<Value = String> {
    let leaf = prop_oneof!["[a-z][a-z0-9._]{0,6}", "\\$[a-z]{1,5}", "[0-9]{1,4}"];
    leaf.prop_recursive(3, 24, 4, |inner| {
        ("[a-z][a-z0-9.]{0,6}", prop::collection::vec(inner, 0..4)).prop_map(|(name, args)| {
            let mut s = format!("({name}");
            for arg in args {
                s.push(' ');
                s.push_str(&arg);
            }
            s.push(')');
            s
        })
    })
}

proptest! {
    #[test]
    fn compact_form_is_stable(body in prop::collection::vec(sexpr(), 0..4)) {
        let src = format!("(module{})", body.iter().map(|b| format!(" {b}")).collect::<String>());
        prop_assert_eq!(roundtrip(&src), src);
    }
}

#[test]
fn index_is_complete() {
    let ctx = ModuleContext::new(
        r#"(module
            (type $t (func (param i32)))
            (import "env" "log" (func $log (type $t)))
            (func $a (export "a") (call $log (i32.const 1)))
            (func $b (nop))
            (global $g i32 (i32.const 0))
            (export "b" (func $b))
            (start $b))"#,
    )
    .unwrap();
    let names: Vec<&str> = ctx.functions().map(|f| f.name.as_str()).collect();
    for name in ["$log", "$a", "$b"] {
        assert_eq!(names.iter().filter(|n| **n == name).count(), 1, "{name}");
    }
    assert_eq!(ctx.import_function("env", "log").unwrap().name, "$log");
    assert_eq!(ctx.export_function("a").unwrap().name, "$a");
    assert_eq!(ctx.export_function("b").unwrap().name, "$b");
    assert_eq!(ctx.start_function().unwrap().name, "$b");
    assert!(ctx.type_def("$t").is_some());
    assert!(ctx.global("$g").is_some());
}

#[test]
fn additions_keep_canonical_order() {
    let mut ctx = ModuleContext::new(
        r#"(module $m (func $f (nop)) (memory 1) (export "f" (func $f)))"#,
    )
    .unwrap();
    let f = FunctionYaml {
        result: "i32".to_string(),
        code: "(i32.const 0)".to_string(),
        ..FunctionYaml::default()
    };
    let name = ctx.add_function(&f).unwrap();
    ctx.add_global("i32 = 3").unwrap();
    ctx.add_type_with(&["f64".to_string()], "").unwrap();
    ctx.add_custom_import_function("$host", "$wmr_t0", "env", "host").unwrap();
    let export = FunctionYaml {
        exported: Some("g".to_string()),
        ..FunctionYaml::default()
    };
    ctx.add_export_function(&export, &name).unwrap();

    let code = ctx.code();
    let fields = code.children(ctx.module());
    assert_eq!(code.text(fields[0]), Some("$m"), "{}", ctx.string());
    let weights: Vec<u8> = fields[1..]
        .iter()
        .map(|b| code.name(*b).map(order_weight))
        .collect::<Option<_>>()
        .unwrap_or_else(|| panic!("module has stray text: {}", ctx.string()));
    assert!(weights.windows(2).all(|w| w[0] <= w[1]), "{weights:?}\n{}", ctx.string());
}

#[test]
fn generated_names_are_fresh() {
    let mut ctx = ModuleContext::new("(module (func $wmr_f2 (nop)) (func $f (nop)))").unwrap();
    for _ in 0..3 {
        let name = ctx.generate_function_index();
        assert!(ctx.function(&name).is_none(), "{name}");
        assert_eq!(ctx.add_function(&FunctionYaml::default()).unwrap(), name);
    }
    let global = ctx.generate_global_index();
    assert!(ctx.global(&global).is_none());
}

#[test]
fn templates_unify_repeated_variables() {
    let mut weaver = Weaver::new("(module)", &WeaverConfig::new()).unwrap();
    weaver.templates_mut().insert("add", "(i32.add %a% %a%)");
    let found = weaver
        .search_template("add", "(i32.add (i32.const 5) (i32.const 5))")
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found.select("a").unwrap().value(), "(i32.const 5)");
    let found = weaver
        .search_template("add", "(i32.add (i32.const 5) (i32.const 7))")
        .unwrap();
    assert!(found.is_empty());
}

#[test]
fn templates_include_other_templates() {
    let mut weaver = Weaver::new("(module)", &WeaverConfig::new()).unwrap();
    weaver.templates_mut().insert("t1", "(op %x:includes(t2):defines(y)%)");
    weaver.templates_mut().insert("t2", "(local.tee %y%)");
    assert_eq!(weaver.search_template("t1", "(op (local.tee 1))").unwrap().len(), 1);
    assert!(weaver.search_template("t1", "(op (i32.const 1))").unwrap().is_empty());
}

#[test]
fn call_pointcut_finds_the_callee() {
    let ctx = ModuleContext::new("(module (func $f (call $g)) (func $g))").unwrap();
    let f = ctx.function("$f").unwrap().instr();
    let search = find_calls(&ctx, f, |_, _| Some(Environment::new())).unwrap();
    assert_eq!(search.len(), 1);
    let call = search.found()[0].get("call").unwrap();
    assert_eq!(call.prop("Callee").unwrap().prop("Index").unwrap(), Object::from("$g"));
}

#[test]
fn pointcut_text_binds_arguments_for_advice() {
    let mut weaver = Weaver::new(
        r#"(module
            (import "env" "log" (func $log (param i32)))
            (func $f (export "f") (param $p i32) (local $l i32)
                (call $log (local.get $p))
                (call $log (local.get $l))))"#,
        &WeaverConfig::new(),
    )
    .unwrap();
    weaver.pointcuts_mut().insert("logged", "(i32 x) => call(void $log (i32)) && args(x)");
    let search = weaver
        .pointcut("(i32.param[$p] p) => func(* f (..), exported) && logged(p)")
        .unwrap();
    assert_eq!(search.len(), 1);
    let jp = &search.found()[0];
    assert_eq!(weaver.context().code().string(jp.block()), "(call $log (local.get $p))");
    assert_eq!(weaver.expand(jp, "%p.index% %p.type% %p.elType%").unwrap(), "$p param i32");

    let locals = weaver.pointcut("(local[0] l) => args(l)").unwrap();
    assert_eq!(weaver.context().code().string(locals.found()[0].block()), "(call $log (local.get $l))");
}

#[test]
fn smart_advice_keeps_the_operand_typed() {
    let mut ctx = ModuleContext::new(
        "(module (func $f (result i32) (i32.mul (i32.const 2) (i32.const 3))))",
    )
    .unwrap();
    let f = ctx.function("$f").unwrap().instr();
    let jp = find_instructions(&ctx, f, "(i32.const 3)")
        .unwrap()
        .into_found()
        .remove(0);
    apply(
        &mut ctx,
        &jp,
        "(i32.const 10) (i32.const 5) (i32.add) (target (i32.const 3))",
        true,
    )
    .unwrap();
    let body = body(&ctx, "$f");
    assert!(
        body.contains("(i32.const 10) (i32.const 5) (i32.add) (local.set $wmr_l0_i32 (i32.const 3))"),
        "{body}"
    );
    assert!(body.ends_with("(local.get $wmr_l0_i32))"), "{body}");
    assert_eq!(ctx.function("$f").unwrap().locals["$wmr_l0_i32"].ty, "i32");
}

#[test]
fn primitive_evaluation_reads_a_parameter() {
    let mut ctx = ModuleContext::new(
        "(module (func $f (param $a i32) (local $x i32) (local.set $x /#a + 1/)))",
    )
    .unwrap();
    rewrite(&mut ctx).unwrap();

    let body = body(&ctx, "$f");
    assert!(body.starts_with("(call $zone.push)"), "{body}");
    assert!(body.ends_with("(local.set $x (local.get $wmr_local_i32_0)) (call $zone.pop)"), "{body}");
    assert!(body.contains("(call $zone.write_value (local.get $a))"), "{body}");
    let func = ctx.code().string(ctx.function("$f").unwrap().instr());
    assert!(func.contains("(local $wmr_local_i32_0 i32)"), "{func}");

    // One scope per function, opened and closed at the top level.
    let instr = ctx.function("$f").unwrap().instr();
    let top: Vec<String> = ctx
        .code()
        .children(instr)
        .iter()
        .map(|b| ctx.code().string(*b))
        .collect();
    assert_eq!(top.iter().filter(|s| *s == "(call $zone.push)").count(), 1);
    assert_eq!(top.iter().filter(|s| *s == "(call $zone.pop)").count(), 1);
    assert!(ctx.need_js());
}

#[test]
fn composite_results_are_returned_through_the_host() {
    let mut ctx = ModuleContext::new(
        r#"(module
            (func $message (result string) /"hello"/)
            (func $main (drop (call $message)))
            (func $show (local $s string) (local.set $s (call $message))))"#,
    )
    .unwrap();
    rewrite(&mut ctx).unwrap();

    let message = body(&ctx, "$message");
    assert!(message.starts_with("(call $returns.new_copy)"), "{message}");
    assert!(
        message.ends_with("(call $returns.copy_operation (i32.const 0)) (return)"),
        "{message}"
    );
    assert_eq!(body(&ctx, "$main"), "(call $message)");
    let show = body(&ctx, "$show");
    assert!(show.starts_with("(call $message) (block $wmr_B0"), "{show}");
    assert!(!show.contains("local.set"), "{show}");
    assert!(!ctx.string().contains("string"));
}

#[test_log::test]
fn runtime_rewrite_is_idempotent() {
    let mut ctx = ModuleContext::new(
        r#"(module
            (import "env" "show" (func $show (param string) (result i32)))
            (global $names (mut []string) (i32.const 0))
            (func $count (param $n i32) (result i32)
                (local $total f64)
                (local.set $total /#n * 2/)
                (return (call $show /"n = " + #n/))))"#,
    )
    .unwrap();
    rewrite(&mut ctx).unwrap();
    let once = ctx.string();
    rewrite(&mut ctx).unwrap();
    assert_same_module(&once, &ctx.string());
}

#[test]
fn composite_imports_are_served_by_operations() {
    let mut ctx = ModuleContext::new(
        r#"(module
            (import "env" "print" (func $print (param string)))
            (import "env" "name" (func $name (result string)))
            (import "env" "log" (func $log (param i32)))
            (func $f (call $print /"x"/)))"#,
    )
    .unwrap();
    rewrite(&mut ctx).unwrap();
    let code = ctx.code();
    for name in ["$print", "$name", "$log"] {
        let import = code.parent(ctx.function(name).unwrap().instr()).unwrap();
        let module = code.string(code.children(import)[0]);
        let expected = if name == "$log" { "\"env\"" } else { "\"operations\"" };
        assert_eq!(module, expected, "{name}");
    }
}

#[test_log::test]
fn weaving_session() {
    let mut weaver = Weaver::new(
        r#"(module
            (import "env" "log" (func $log (param i32)))
            (func $work (export "work") (param $n i32) (result i32)
                (i32.add (local.get $n) (i32.const 1))))"#,
        &WeaverConfig::new(),
    )
    .unwrap();
    weaver.scope_mut().insert("level", "7");
    let work = weaver.context().function("$work").unwrap().instr();
    let search = find_instructions(weaver.context(), work, "(i32.const 1)").unwrap();
    let woven = weaver
        .weave(
            search,
            "(call $log (i32.const %level%)) (drop (i32.add (i32.const 0) /#n * 2/)) (target (i32.const 1))",
        )
        .unwrap();
    assert_eq!(woven, 1);

    let output = weaver.finish().unwrap();
    assert!(output.need_js);
    assert!(output.wat.contains("(call $log"), "{}", output.wat);
    assert!(output.wat.contains("(i32.const 7)"), "{}", output.wat);
    assert!(output.wat.contains("(call $zone.push)"), "{}", output.wat);
    assert!(!output.wat.contains('/'), "{}", output.wat);
    let modules: Vec<&str> = output.glue_imports.iter().map(|f| f.module_name.as_str()).collect();
    assert!(modules.contains(&"operations"));
    assert!(modules.contains(&"zone"));
    assert!(modules.contains(&"error"));
    assert!(!modules.contains(&"args"));
}
