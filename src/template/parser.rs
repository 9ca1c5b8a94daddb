//! Parsing of template text into variables and their operations.
//!
//! A variable is written `%name%` and may carry operations:
//! `%body:includes(load):defines(addr)%`. An operation whose name starts
//! with `not_` is split into a `not_` marker followed by the wrapped
//! operation.

use super::{NOT_OP, Template, VariableOperation};
use regex::Regex;
use std::sync::LazyLock;

static VARIABLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"%[a-zA-Z][^%]*%").unwrap());
static OPERATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":!?[a-zA-Z][\w\d]*\([^)]*\)").unwrap());

fn variable_name(variable: &str) -> &str {
    let end = variable.find(':').unwrap_or(variable.len());
    variable[..end].trim_matches('%')
}

fn operation_name(operation: &str) -> &str {
    let end = operation.find('(').unwrap_or(operation.len() - 1);
    &operation[1..end]
}

fn operation_args(operation: &str) -> Vec<String> {
    let Some(start) = operation.find('(') else {
        return Vec::new();
    };
    operation[start + 1..operation.len() - 1]
        .split(',')
        .map(|arg| arg.trim().to_string())
        .collect()
}

impl Template {
    /// Parse a template named `key` from its text.
    pub fn parse(key: impl Into<String>, value: impl Into<String>) -> Template {
        let mut template = Template {
            key: key.into(),
            value: value.into(),
            variables: Default::default(),
        };
        let value = template.value.clone();
        for variable in VARIABLE.find_iter(&value) {
            let variable = variable.as_str();
            let name = variable_name(variable);
            let ops = template.variables.entry(name.to_string()).or_default();
            for op in OPERATION.find_iter(variable) {
                let op = op.as_str();
                let op_name = operation_name(op);
                match op_name.strip_prefix(NOT_OP) {
                    Some(wrapped) => {
                        ops.push(VariableOperation {
                            name: NOT_OP.to_string(),
                            args: Vec::new(),
                        });
                        ops.push(VariableOperation {
                            name: wrapped.to_string(),
                            args: operation_args(op),
                        });
                    }
                    None => ops.push(VariableOperation {
                        name: op_name.to_string(),
                        args: operation_args(op),
                    }),
                }
            }
        }
        template
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variables_and_operations() {
        let t = Template::parse(
            "t",
            "(i32.store %addr:includes(load):defines(x, y)% %value:not_includes_one(a,b)%)",
        );
        assert_eq!(t.variables.len(), 2);
        let addr = &t.variables["addr"];
        assert_eq!(addr[0].name, "includes");
        assert_eq!(addr[0].args, ["load"]);
        assert_eq!(addr[1].name, "defines");
        assert_eq!(addr[1].args, ["x", "y"]);
        let value = &t.variables["value"];
        assert_eq!(value[0].name, "not_");
        assert_eq!(value[1].name, "includes_one");
        assert_eq!(value[1].args, ["a", "b"]);
    }

    #[test]
    fn plain_variables() {
        let t = Template::parse("t", "(i32.add %a% %a%)");
        assert_eq!(t.variables.len(), 1);
        assert!(t.variables["a"].is_empty());
        let t = Template::parse("t", "(i32.const 100%)");
        assert!(t.variables.is_empty());
    }
}
