//! Evaluation of keyword expressions.
//!
//! Evaluation is synchronous and single threaded. A failed `assert` unwinds
//! as [`Flow::Abort`] up to the innermost keyword, group or method argument,
//! which then evaluates to the empty string.

use super::lexer::BinOp;
use super::parser::{Arg, Expr, Lambda, Method, parse};
use super::value::{Object, Scope, Value, bool_to_text, capitalize, index_error, text_to_bool};
use crate::error::{WeaverError, WeaverResult};
use crate::template::ReplaceArg;
use indexmap::IndexMap;

/// Why evaluation stopped early.
#[derive(Debug)]
enum Flow {
    /// An `assert` failed.
    Abort,
    Error(WeaverError),
}

impl From<WeaverError> for Flow {
    fn from(e: WeaverError) -> Flow {
        Flow::Error(e)
    }
}

type Eval<T> = Result<T, Flow>;

fn error(expr: impl Into<String>, msg: impl Into<String>) -> Flow {
    Flow::Error(WeaverError::keyword(expr, msg))
}

/// Lambda arguments, innermost first.
struct Frame<'f> {
    bindings: Vec<(String, Value)>,
    parent: Option<&'f Frame<'f>>,
}

/// Evaluates keyword text against a set of scopes.
pub struct Evaluator<'a> {
    order: &'a IndexMap<String, usize>,
    scopes: Vec<&'a Scope>,
}

impl<'a> Evaluator<'a> {
    /// An evaluator that resolves `order()` through `order`, a map from
    /// function name to its 1-based order.
    pub fn new(order: &'a IndexMap<String, usize>) -> Self {
        Evaluator {
            order,
            scopes: Vec::new(),
        }
    }

    /// Add a scope. Scopes added first take precedence.
    pub fn scope(mut self, scope: &'a Scope) -> Self {
        self.scopes.push(scope);
        self
    }

    /// Evaluate every keyword in `input` and splice the results into the
    /// surrounding text.
    pub fn evaluate(&self, input: &str) -> WeaverResult<String> {
        let expr = parse(input)?;
        log::trace!("evaluating keyword text {input:?}");
        self.evaluate_expr(&expr).map(|v| v.to_text())
    }

    /// Evaluate a parsed expression.
    pub fn evaluate_expr(&self, expr: &Expr) -> WeaverResult<Value> {
        match self.eval(expr, None) {
            Ok(v) => Ok(v),
            Err(Flow::Abort) => Ok(Value::String(String::new())),
            Err(Flow::Error(e)) => Err(e),
        }
    }

    fn lookup(&self, name: &str, mut frame: Option<&Frame>) -> Eval<Value> {
        while let Some(f) = frame {
            if let Some((_, v)) = f.bindings.iter().find(|(n, _)| n == name) {
                return Ok(v.clone());
            }
            frame = f.parent;
        }
        self.scopes
            .iter()
            .find_map(|s| s.get(name))
            .cloned()
            .ok_or_else(|| error(name, "not found in scope"))
    }

    fn eval(&self, expr: &Expr, frame: Option<&Frame>) -> Eval<Value> {
        match expr {
            Expr::Text(s) => Ok(Value::String(s.clone())),
            Expr::Number(n) => Ok(Value::String(format_number(*n))),
            Expr::Ident(name) => self.lookup(name, frame),
            Expr::Concat(parts) => {
                let mut res = String::new();
                for part in parts {
                    res.push_str(&self.eval(part, frame)?.to_text());
                }
                Ok(Value::String(res))
            }
            Expr::Union(exprs) => match self.eval_union(exprs, frame) {
                Err(Flow::Abort) => Ok(Value::String(String::new())),
                res => res,
            },
            Expr::Not(e) => Ok(Value::String(bool_to_text(!self.eval(e, frame)?.to_bool()))),
            Expr::Binary(op, lhs, rhs) => self.binary(*op, lhs, rhs, frame),
            Expr::Call(recv, method) => {
                let value = self.eval(recv, frame)?;
                self.method(value, method, frame)
            }
        }
    }

    fn eval_union(&self, exprs: &[Expr], frame: Option<&Frame>) -> Eval<Value> {
        if let [expr] = exprs {
            return self.eval(expr, frame);
        }
        let mut res = String::new();
        for expr in exprs {
            res.push_str(&self.eval(expr, frame)?.to_text());
        }
        Ok(Value::String(res))
    }

    fn text(&self, expr: &Expr, frame: Option<&Frame>) -> Eval<String> {
        Ok(self.eval(expr, frame)?.to_text())
    }

    fn binary(&self, op: BinOp, lhs: &Expr, rhs: &Expr, frame: Option<&Frame>) -> Eval<Value> {
        let res = match op {
            BinOp::And | BinOp::Or => {
                let left = self.eval(lhs, frame)?.to_bool();
                match (op, left) {
                    (BinOp::And, false) => false,
                    (BinOp::Or, true) => true,
                    _ => self.eval(rhs, frame)?.to_bool(),
                }
            }
            BinOp::Eq => self.text(lhs, frame)? == self.text(rhs, frame)?,
            BinOp::Ne => self.text(lhs, frame)? != self.text(rhs, frame)?,
            _ => {
                let l = self.eval(lhs, frame)?.to_number()?;
                let r = self.eval(rhs, frame)?.to_number()?;
                return arithmetic(op, l, r).map(Value::String);
            }
        };
        Ok(Value::String(bool_to_text(res)))
    }

    fn call_lambda(&self, lambda: &Lambda, args: Vec<Value>, frame: Option<&Frame>) -> Eval<Value> {
        if lambda.params.len() > args.len() {
            return Err(error(
                lambda.params.join(", "),
                format!("lambda expects {} arguments but got {}", lambda.params.len(), args.len()),
            ));
        }
        let inner = Frame {
            bindings: lambda.params.iter().cloned().zip(args).collect(),
            parent: frame,
        };
        self.eval(&lambda.body, Some(&inner))
    }

    fn method(&self, value: Value, method: &Method, frame: Option<&Frame>) -> Eval<Value> {
        Ok(match method {
            Method::String => Value::String(value.to_text()),
            Method::Type => Value::String(value.type_name().to_string()),
            Method::Count => {
                let count = match &value {
                    Value::StringSlice(v) => v.len(),
                    Value::Object(o) if !o.is_primitive() => o.elements().len(),
                    v => v.to_text().chars().count(),
                };
                Value::String(count.to_string())
            }
            Method::Order => {
                let name = value.to_text();
                let order = self.order.get(&name).map(|o| o.to_string());
                Value::String(order.unwrap_or_default())
            }
            Method::Reverse => match value {
                Value::StringSlice(mut v) => {
                    v.reverse();
                    Value::StringSlice(v)
                }
                Value::Object(o) if !o.is_primitive() => {
                    let mut v = o.string_slice();
                    v.reverse();
                    Value::StringSlice(v)
                }
                v => Value::String(v.to_text().chars().rev().collect()),
            },
            Method::Index(i) => {
                let i = usize::try_from(*i).map_err(|_| error(format!("[{i}]"), "negative index"))?;
                match value {
                    Value::StringSlice(v) => {
                        let len = v.len();
                        Value::String(v.into_iter().nth(i).ok_or_else(|| index_error(i, len))?)
                    }
                    Value::Object(o) => Value::Object(o.index(i)?),
                    v => {
                        let text = v.to_text();
                        let c = text.chars().nth(i).ok_or_else(|| index_error(i, text.chars().count()))?;
                        Value::String(c.to_string())
                    }
                }
            }
            Method::Prop(name) => match value {
                Value::Object(o) => Value::Object(o.prop(&capitalize(name))?),
                v => {
                    return Err(error(
                        format!(".{name}"),
                        format!("cannot access properties of {} values", v.type_name()),
                    ));
                }
            },
            Method::Map(lambda) => self.map(value, lambda, frame)?,
            Method::Filter(lambda) => self.filter(value, lambda, frame)?,
            Method::Assert(lambda) => {
                let res = self.call_lambda(lambda, vec![value.clone(), "0".into()], frame)?;
                let valid = match res {
                    Value::StringSlice(v) => v.iter().all(|s| text_to_bool(s)),
                    Value::Object(o) if !o.is_primitive() => {
                        o.string_slice().iter().all(|s| text_to_bool(s))
                    }
                    v => v.to_bool(),
                };
                if !valid {
                    log::trace!("assertion failed on {:?}", value.to_text());
                    return Err(Flow::Abort);
                }
                value
            }
            Method::Repeat(times) => {
                let items = match &value {
                    Value::Object(Object::Array(_)) => value.to_slice(),
                    Value::Object(o) => vec![o.to_string()],
                    v => v.to_slice(),
                };
                Value::StringSlice(std::iter::repeat_n(items, *times).flatten().collect())
            }
            Method::Join(sep) => {
                let sep = self.text(sep, frame)?;
                match value {
                    Value::String(s) => Value::String(s),
                    Value::Search(_) => return Err(error("join", "cannot join template search values")),
                    v => Value::String(v.to_slice().join(&sep)),
                }
            }
            Method::Split(sep) => {
                let sep = self.text(sep, frame)?;
                let text = match value {
                    Value::StringSlice(_) => {
                        return Err(error("split", "cannot split string slice values"));
                    }
                    Value::Object(o) if !o.is_primitive() => {
                        return Err(error("split", "cannot split arrays or objects"));
                    }
                    v => v.to_text(),
                };
                Value::StringSlice(split(&text, &sep))
            }
            Method::Contains(needle) => {
                let needle = self.text(needle, frame)?;
                let found = match &value {
                    Value::StringSlice(v) => v.contains(&needle),
                    Value::Object(o @ Object::Array(_)) => o.string_slice().contains(&needle),
                    Value::Object(o @ Object::Map(_)) => o.keys().contains(&needle),
                    v => v.to_text().contains(&needle),
                };
                Value::String(bool_to_text(found))
            }
            Method::Slice(start, end) | Method::Splice(start, end) => {
                let keep = matches!(method, Method::Slice(..));
                match value {
                    Value::StringSlice(v) => Value::StringSlice(cut(v, *start, *end, keep)?),
                    Value::Object(o) if !o.is_primitive() => {
                        Value::StringSlice(cut(o.string_slice(), *start, *end, keep)?)
                    }
                    v => {
                        let chars = v.to_text().chars().collect::<Vec<_>>();
                        Value::String(cut(chars, *start, *end, keep)?.into_iter().collect())
                    }
                }
            }
            Method::Replace(old, new) => self.replace(value, old, new, frame)?,
            Method::Remove(arg) => {
                let target = self.arg_text(arg, frame)?;
                match value {
                    Value::Search(s) => Value::Search(s.remove(&target)?),
                    Value::StringSlice(v) => {
                        Value::StringSlice(v.into_iter().filter(|s| *s != target).collect())
                    }
                    Value::Object(Object::Map(mut m)) => {
                        m.shift_remove(&capitalize(&target));
                        Value::Object(Object::Map(m))
                    }
                    Value::Object(Object::Array(a)) => Value::Object(Object::Array(
                        a.into_iter().filter(|o| o.to_string() != target).collect(),
                    )),
                    v => Value::String(v.to_text().replace(&target, "")),
                }
            }
            Method::Select(variable) => match value {
                Value::Search(s) => Value::Search(s.select(variable)?),
                v => {
                    return Err(error(
                        format!("select({variable})"),
                        format!("cannot select in {} values", v.type_name()),
                    ));
                }
            },
        })
    }

    fn arg_text(&self, arg: &Arg, frame: Option<&Frame>) -> Eval<String> {
        match arg {
            Arg::Reference(name) => Ok(name.clone()),
            Arg::Value(expr) => self.text(expr, frame),
        }
    }

    fn replace(&self, value: Value, old: &Arg, new: &Arg, frame: Option<&Frame>) -> Eval<Value> {
        if let Value::Search(s) = value {
            let arg = |a: &Arg| -> Eval<ReplaceArg> {
                Ok(match a {
                    Arg::Reference(name) => ReplaceArg::Variable(name.clone()),
                    Arg::Value(expr) => ReplaceArg::Text(self.text(expr, frame)?),
                })
            };
            return Ok(Value::Search(s.replace(&arg(old)?, &arg(new)?)?));
        }
        let old = self.arg_text(old, frame)?;
        let new = self.arg_text(new, frame)?;
        Ok(match value {
            Value::StringSlice(v) => Value::StringSlice(
                v.into_iter()
                    .map(|s| if s == old { new.clone() } else { s })
                    .collect(),
            ),
            Value::Object(Object::Map(mut m)) => {
                if let Some(field) = m.get_mut(&capitalize(&old)) {
                    *field = Object::Primitive(new);
                }
                Value::Object(Object::Map(m))
            }
            Value::Object(Object::Array(a)) => Value::Object(Object::Array(
                a.into_iter()
                    .map(|o| if o.to_string() == old { Object::Primitive(new.clone()) } else { o })
                    .collect(),
            )),
            v => Value::String(v.to_text().replace(&old, &new)),
        })
    }

    fn map(&self, value: Value, lambda: &Lambda, frame: Option<&Frame>) -> Eval<Value> {
        let strings = |items: Vec<String>| -> Eval<Vec<String>> {
            items
                .into_iter()
                .enumerate()
                .map(|(i, s)| {
                    let args = vec![Value::String(s), Value::String(i.to_string())];
                    Ok(self.call_lambda(lambda, args, frame)?.to_text())
                })
                .collect()
        };
        Ok(match value {
            Value::StringSlice(v) => Value::StringSlice(strings(v)?),
            Value::Search(s) => Value::StringSlice(strings(vec![s.value()])?),
            Value::Object(o) if !o.is_primitive() => {
                let mut res = Vec::new();
                for (i, e) in o.elements().into_iter().enumerate() {
                    let args = vec![Value::Object(e), Value::String(i.to_string())];
                    res.push(self.call_lambda(lambda, args, frame)?.to_object());
                }
                Value::Object(Object::Array(res))
            }
            v => {
                let args = vec![Value::String(v.to_text()), "0".into()];
                Value::String(self.call_lambda(lambda, args, frame)?.to_text())
            }
        })
    }

    fn filter(&self, value: Value, lambda: &Lambda, frame: Option<&Frame>) -> Eval<Value> {
        let keep = |s: &str, i: usize| -> Eval<bool> {
            let args = vec![Value::String(s.to_string()), Value::String(i.to_string())];
            Ok(self.call_lambda(lambda, args, frame)?.to_bool())
        };
        let slice = match value {
            Value::StringSlice(v) => v,
            Value::Object(o) if !o.is_primitive() => o.string_slice(),
            v => {
                let mut res = String::new();
                for (i, c) in v.to_text().chars().enumerate() {
                    if keep(c.encode_utf8(&mut [0; 4]), i)? {
                        res.push(c);
                    }
                }
                return Ok(Value::String(res));
            }
        };
        let mut res = Vec::new();
        for (i, s) in slice.into_iter().enumerate() {
            if keep(&s, i)? {
                res.push(s);
            }
        }
        Ok(Value::StringSlice(res))
    }
}

/// Numbers print in their shortest form: `2`, not `2.0`.
pub(crate) fn format_number(n: f64) -> String {
    format!("{n}")
}

fn arithmetic(op: BinOp, l: f64, r: f64) -> Eval<String> {
    let int = |op: &str, res: Option<i64>| {
        res.map(|n| n.to_string())
            .ok_or_else(|| error(format!("{l} {op} {r}"), "invalid integer operation"))
    };
    Ok(match op {
        BinOp::Ge => bool_to_text(l >= r),
        BinOp::Gt => bool_to_text(l > r),
        BinOp::Le => bool_to_text(l <= r),
        BinOp::Lt => bool_to_text(l < r),
        BinOp::Shl => int("<<", u32::try_from(r as i64).ok().and_then(|r| (l as i64).checked_shl(r)))?,
        BinOp::Shr => int(">>", u32::try_from(r as i64).ok().and_then(|r| (l as i64).checked_shr(r)))?,
        BinOp::Rem => int("%", (l as i64).checked_rem(r as i64))?,
        BinOp::Add => format_number(l + r),
        BinOp::Sub => format_number(l - r),
        BinOp::Mul => format_number(l * r),
        BinOp::Div => format_number(l / r),
        BinOp::Or | BinOp::And | BinOp::Eq | BinOp::Ne => unreachable!("not an arithmetic operator"),
    })
}

fn split(text: &str, sep: &str) -> Vec<String> {
    if sep.is_empty() {
        return text.chars().map(String::from).collect();
    }
    text.split(sep).map(String::from).collect()
}

/// `slice` keeps `start..end`; `splice` removes it. Without an end, `slice`
/// keeps the tail and `splice` keeps the head.
fn cut<T>(mut items: Vec<T>, start: i64, end: Option<i64>, keep: bool) -> Eval<Vec<T>> {
    let len = items.len();
    let bound = |i: i64| {
        usize::try_from(i)
            .ok()
            .filter(|i| *i <= len)
            .ok_or_else(|| error(format!("{start}..{end:?}"), format!("range out of bounds (length {len})")))
    };
    let start = bound(start)?;
    let end = match end {
        Some(end) => bound(end)?,
        None if keep => len,
        None => {
            items.truncate(start);
            return Ok(items);
        }
    };
    if start > end {
        return Err(error(format!("{start}..{end}"), "range start is after its end"));
    }
    if keep {
        items.truncate(end);
        items.drain(..start);
    } else {
        items.drain(start..end);
    }
    Ok(items)
}
