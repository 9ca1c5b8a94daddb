//! The keyword language embedded in advice code.
//!
//! Advice code is WAT text with `%...%` keywords, for example
//! `(call $log (i32.const %this.order%))`. Keywords are small expressions
//! over the values in scope: join-point data, script variables and template
//! search results. They support property access (`.name`), indexing
//! (`[0]`), methods (`:map((x, i) => ...)`), operators inside parentheses
//! and union (`a; b`), which joins its operands as text.

mod eval;
mod lexer;
mod parser;
mod value;

pub use eval::Evaluator;
pub use lexer::{BinOp, Lexer, Token};
pub use parser::{Arg, Expr, Lambda, Method, parse};
pub use value::{Object, Scope, Value};

pub(crate) use eval::format_number;
pub(crate) use value::{capitalize, lower_first};

use crate::code::{is_quote, is_remainder, quoted_len};
use crate::error::WeaverResult;
use indexmap::IndexMap;

/// Evaluate keyword text with `scopes` searched in order.
pub fn evaluate(input: &str, order: &IndexMap<String, usize>, scopes: &[&Scope]) -> WeaverResult<String> {
    let evaluator = scopes.iter().fold(Evaluator::new(order), |e, s| e.scope(s));
    expand(&evaluator, input)
}

/// Expand the keywords of advice code. A `%` that is a remainder operator of
/// a runtime expression `/.../` is kept as it is.
pub fn expand(evaluator: &Evaluator<'_>, input: &str) -> WeaverResult<String> {
    let mut out = String::with_capacity(input.len());
    let mut start = 0;
    for pos in remainder_operators(input) {
        out.push_str(&evaluator.evaluate(&input[start..pos])?);
        out.push('%');
        start = pos + 1;
    }
    out.push_str(&evaluator.evaluate(&input[start..])?);
    Ok(out)
}

/// Does `input` contain a keyword?
pub fn has_keywords(input: &str) -> bool {
    input.matches('%').count() > remainder_operators(input).len()
}

/// Offsets of the remainder operators in the runtime expressions of
/// `input`, found the same way the code parser tells them from keywords.
fn remainder_operators(input: &str) -> Vec<usize> {
    let src = input.as_bytes();
    let mut found = Vec::new();
    let mut in_evaluation = false;
    let mut pos = 0;
    while pos < src.len() {
        let rest = &src[pos..];
        let skip = |open: &[u8], close: &[u8]| {
            rest[open.len()..]
                .windows(close.len())
                .position(|w| w == close)
                .map_or(rest.len(), |p| p + open.len() + close.len())
        };
        pos += match rest[0] {
            c if is_quote(c) => quoted_len(rest),
            _ if rest.starts_with(b";;") => skip(b";;", b"\n"),
            _ if rest.starts_with(b"(;") => skip(b"(;", b";)"),
            b'%' if in_evaluation && is_remainder(rest, b'/') => {
                found.push(pos);
                1
            }
            b'%' => skip(b"%", b"%"),
            b'/' => {
                in_evaluation = !in_evaluation;
                1
            }
            _ => 1,
        };
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remainder_operators_are_not_keywords() {
        assert_eq!(remainder_operators("(drop /#a % 2/)"), [10]);
        assert!(remainder_operators("(i32.const %v%) /%x%/").is_empty());
        assert_eq!(remainder_operators(r#"/"%" + #a %2/"#), [10]);
        assert!(remainder_operators("%a%2%b% ;; /x % y/").is_empty());
        assert!(!has_keywords("(drop /#a % 2/)"));
        assert!(has_keywords("(drop /#a % %n%/)"));
    }

    #[test]
    fn expands_around_remainders() {
        let order = IndexMap::new();
        let mut scope = Scope::new();
        scope.insert("v", "3");
        let out = evaluate("(drop (i32.add (i32.const %v%) /#a % 2/))", &order, &[&scope]).unwrap();
        assert_eq!(out, "(drop (i32.add (i32.const 3) /#a % 2/))");
        let out = evaluate("(drop /#a % %v%/)", &order, &[&scope]).unwrap();
        assert_eq!(out, "(drop /#a % 3/)");
    }
}
