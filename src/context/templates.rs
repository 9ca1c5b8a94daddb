//! WAT snippets for entities added to a module.

use super::definitions::FunctionYaml;

/// Prefix of every generated name.
pub const CODE_INDEX_PREFIX: &str = "wmr_";

pub(crate) fn global(name: &str, ty: &str, value: &str) -> String {
    let value = match value {
        "" => "0".to_string(),
        v if matches!(ty, "string" | "identifier") => quote(v),
        v => v.to_string(),
    };
    format!("(global {name} (mut {ty}) ({ty}.const {value}))")
}

pub(crate) fn function_type(name: &str, params: &[String], result: &str) -> String {
    let mut out = format!("(type {name} (func");
    if !params.is_empty() {
        out.push_str(" (param");
        for p in params {
            out.push_str(&format!(" {p}"));
        }
        out.push(')');
    }
    if !result.is_empty() {
        out.push_str(&format!(" (result {result})"));
    }
    out.push_str("))");
    out
}

pub(crate) fn function(f: &FunctionYaml, name: &str, type_name: &str) -> String {
    let mut out = format!("(func {name} (type {type_name})");
    for arg in &f.args {
        out.push_str(&format!(" (param ${} {})", arg.name, arg.ty));
    }
    if !f.result.is_empty() {
        out.push_str(&format!(" (result {})", f.result));
    }
    if !f.code.trim().is_empty() {
        out.push_str(&format!(" {}", f.code.trim()));
    }
    out.push(')');
    out
}

pub(crate) fn start(name: &str) -> String {
    format!("(start {name})")
}

pub(crate) fn import_function(name: &str, type_name: &str, module: &str, field: &str) -> String {
    format!("(import \"{module}\" \"{field}\" (func {name} (type {type_name})))")
}

pub(crate) fn export_function(name: &str, export: &str) -> String {
    format!("(export \"{export}\" (func {name}))")
}

pub(crate) fn local(name: &str, ty: &str) -> String {
    format!("(local {name} {ty})")
}

pub(crate) fn set_local(name: &str, ty: &str, value: &str) -> String {
    format!("(local.set {name} ({ty}.const {value}))")
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::definitions::FunctionArgYaml;

    #[test]
    fn snippets() {
        assert_eq!(global("$g", "i32", ""), "(global $g (mut i32) (i32.const 0))");
        assert_eq!(
            global("$g", "string", "a \"b\""),
            r#"(global $g (mut string) (string.const "a \"b\""))"#
        );
        assert_eq!(function_type("$t", &[], ""), "(type $t (func))");
        assert_eq!(
            function_type("$t", &["i32".into(), "f64".into()], "i32"),
            "(type $t (func (param i32 f64) (result i32)))"
        );
        let f = FunctionYaml {
            args: vec![FunctionArgYaml {
                name: "a".into(),
                ty: "i32".into(),
            }],
            result: "i32".into(),
            code: " (local.get $a) ".into(),
            ..Default::default()
        };
        assert_eq!(
            function(&f, "$f", "$t"),
            "(func $f (type $t) (param $a i32) (result i32) (local.get $a))"
        );
    }
}
