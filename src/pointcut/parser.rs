//! Parser for pointcut expressions.
//!
//! A pointcut names its parameters and then combines pointcut methods with
//! `&&` and `||`, for example
//!
//! ```text
//! (i32.param[$a] a) => func(i32 %name:/^add/% (..), exported) && args(a)
//! ```
//!
//! `&&` binds tighter than `||` and parentheses group. Parameters either
//! point at a variable of the calling function (`i32.local[0] x`), for use
//! with `args`, or are plain typed names (`i32 x`), as in the declaration of
//! a named pointcut.

use crate::error::{WeaverError, WeaverResult};
use regex::Regex;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Ident(String),
    /// `$name`
    Index(String),
    Number(usize),
    /// `/.../`, without the slashes and with `\/` unescaped.
    Regex(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    DotDot,
    Colon,
    Star,
    Percent,
    Arrow,
    AndAnd,
    OrOr,
}

/// A parsed pointcut.
#[derive(Clone, Debug)]
pub struct Pointcut {
    pub params: Vec<Param>,
    pub expr: Node,
}

/// A pointcut parameter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    /// Declared value type; `None` accepts any.
    pub ty: Option<String>,
    /// The variable of the calling function the parameter stands for.
    pub var: Option<Variable>,
}

/// `param[i]` or `local[i]`, where `i` is a position or a `$name`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Variable {
    pub kind: VariableKind,
    pub index: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VariableKind {
    Param,
    Local,
}

impl VariableKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VariableKind::Param => "param",
            VariableKind::Local => "local",
        }
    }
}

/// A node of a pointcut expression.
#[derive(Clone, Debug)]
pub enum Node {
    /// `func(...)`: function definitions.
    Func(FuncPattern),
    /// `call(...)`: calls whose callee matches.
    Call(FuncPattern),
    /// `args(a, b)`: calls whose leading arguments read the variables the
    /// parameters stand for.
    Args(Vec<String>),
    /// `returns(T)`: function exits. `None` matches every exit and
    /// `Some("")` the exits of functions without a result.
    Returns(Option<String>),
    /// `template(name)` narrows to the template's matches;
    /// `template(name, true)` only checks that there is one.
    Template { name: String, just_check: bool },
    /// A named pointcut called with parameters of the calling pointcut.
    Named { name: String, args: Vec<String> },
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
}

/// The shape of a function, `result name (params), scope`.
#[derive(Clone, Debug, Default)]
pub struct FuncPattern {
    /// `None` accepts any result, `Some("")` only functions without one.
    pub result: Option<String>,
    /// Name bound to the result type, from `%r%` or `%r:T%`.
    pub result_binding: Option<String>,
    pub name: NamePattern,
    /// Name bound to the function name, from `%n%` or `%n:pattern%`.
    pub name_binding: Option<String>,
    /// `None` for `(..)`.
    pub params: Option<Vec<ParamPattern>>,
    pub scope: FunctionScope,
}

#[derive(Clone, Debug, Default)]
pub enum NamePattern {
    #[default]
    Any,
    /// Export name, `module.field` for imports, or the bare internal name.
    Name(String),
    /// Internal `$name`.
    Index(String),
    /// 1-based function order, `[n]`.
    Order(usize),
    Regex(Regex),
}

/// One parameter of a [`FuncPattern`], `T` or `*`, optionally bound with
/// `%name%`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParamPattern {
    pub ty: Option<String>,
    pub binding: Option<String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FunctionScope {
    #[default]
    Any,
    Internal,
    Imported,
    Exported,
    Start,
}

fn is_value_type(s: &str) -> bool {
    matches!(s, "i32" | "i64" | "f32" | "f64")
}

fn ident_len(s: &str) -> usize {
    s.find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(s.len())
}

/// The body of a `/.../` literal that starts right after its opening slash,
/// and the number of bytes up to and including the closing slash.
fn regex_literal(s: &str) -> Option<(String, usize)> {
    let mut body = String::new();
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '/' => return Some((body, i + 1)),
            '\\' => match chars.next()? {
                (_, '/') => body.push('/'),
                (_, e) => {
                    body.push('\\');
                    body.push(e);
                }
            },
            c => body.push(c),
        }
    }
    None
}

fn error(src: &str, at: usize, msg: impl std::fmt::Display) -> WeaverError {
    WeaverError::pointcut(src, format!("{msg} (at byte {at})"))
}

fn lex(src: &str) -> WeaverResult<Vec<(usize, Token)>> {
    let mut tokens = Vec::new();
    let mut pos = 0;
    while let Some(c) = src[pos..].chars().next() {
        let start = pos;
        let rest = &src[pos..];
        pos += c.len_utf8();
        let token = match c {
            _ if c.is_whitespace() => continue,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            ',' => Token::Comma,
            ':' => Token::Colon,
            '*' => Token::Star,
            '%' => Token::Percent,
            _ if rest.starts_with("..") => {
                pos += 1;
                Token::DotDot
            }
            '.' => Token::Dot,
            _ if rest.starts_with("=>") || rest.starts_with("&&") || rest.starts_with("||") => {
                pos += 1;
                match c {
                    '=' => Token::Arrow,
                    '&' => Token::AndAnd,
                    _ => Token::OrOr,
                }
            }
            '/' => {
                let (body, len) = regex_literal(&src[pos..]).ok_or_else(|| error(src, start, "unterminated regex"))?;
                pos += len;
                Token::Regex(body)
            }
            '$' => {
                let len = ident_len(&src[pos..]);
                if len == 0 {
                    return Err(error(src, start, "expected a name after `$`"));
                }
                pos += len;
                Token::Index(src[start..pos].to_string())
            }
            _ if c.is_ascii_digit() => {
                pos += src[pos..]
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(src.len() - pos);
                let n = src[start..pos].parse().map_err(|e| error(src, start, e))?;
                Token::Number(n)
            }
            _ if c.is_alphabetic() || c == '_' => {
                pos += ident_len(&src[pos..]);
                Token::Ident(src[start..pos].to_string())
            }
            _ => return Err(error(src, start, format!("unexpected `{c}`"))),
        };
        tokens.push((start, token));
    }
    Ok(tokens)
}

/// Parse a pointcut, `(params) => expr`.
pub fn parse(src: &str) -> WeaverResult<Pointcut> {
    let mut p = Parser {
        src,
        tokens: lex(src)?,
        pos: 0,
    };
    p.expect(&Token::LParen)?;
    let params = p.list(Parser::param)?;
    p.expect(&Token::Arrow)?;
    let expr = p.expr()?;
    if p.peek().is_some() {
        return Err(p.error("expected `&&`, `||` or the end of the pointcut"));
    }
    Ok(Pointcut { params, expr })
}

struct Parser<'src> {
    src: &'src str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, msg: impl std::fmt::Display) -> WeaverError {
        let at = self.tokens.get(self.pos).map_or(self.src.len(), |(at, _)| *at);
        error(self.src, at, msg)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> WeaverResult<Token> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| self.error("unexpected end of pointcut"))?;
        self.pos += 1;
        Ok(token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        let found = self.peek() == Some(token);
        if found {
            self.pos += 1;
        }
        found
    }

    fn expect(&mut self, token: &Token) -> WeaverResult<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {token:?}")))
        }
    }

    fn ident(&mut self) -> WeaverResult<String> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error("expected a name")),
        }
    }

    fn value_type(&mut self) -> WeaverResult<String> {
        let ty = self.ident()?;
        if !is_value_type(&ty) {
            self.pos -= 1;
            return Err(self.error(format!("`{ty}` is not a value type")));
        }
        Ok(ty)
    }

    /// Comma separated items up to and including the closing parenthesis.
    fn list<T>(&mut self, mut item: impl FnMut(&mut Self) -> WeaverResult<T>) -> WeaverResult<Vec<T>> {
        let mut items = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(items);
        }
        loop {
            items.push(item(self)?);
            if self.eat(&Token::RParen) {
                return Ok(items);
            }
            self.expect(&Token::Comma)?;
        }
    }

    fn param(&mut self) -> WeaverResult<Param> {
        let mut ty = None;
        if matches!(self.peek(), Some(Token::Ident(t)) if is_value_type(t)) {
            ty = Some(self.ident()?);
            if !self.eat(&Token::Dot) {
                let name = self.ident()?;
                return Ok(Param { name, ty, var: None });
            }
        }
        let word = self.ident()?;
        let kind = match word.as_str() {
            "param" if self.peek() == Some(&Token::LBracket) => VariableKind::Param,
            "local" if self.peek() == Some(&Token::LBracket) => VariableKind::Local,
            _ if ty.is_none() => return Ok(Param { name: word, ty, var: None }),
            _ => return Err(self.error(format!("expected `param[...]` or `local[...]`, found `{word}`"))),
        };
        self.expect(&Token::LBracket)?;
        let index = match self.next()? {
            Token::Number(n) => n.to_string(),
            Token::Index(name) | Token::Ident(name) => name,
            _ => {
                self.pos -= 1;
                return Err(self.error("expected a variable index"));
            }
        };
        self.expect(&Token::RBracket)?;
        let name = self.ident()?;
        Ok(Param {
            name,
            ty,
            var: Some(Variable { kind, index }),
        })
    }

    fn expr(&mut self) -> WeaverResult<Node> {
        let mut node = self.and()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.and()?;
            node = Node::Or(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn and(&mut self) -> WeaverResult<Node> {
        let mut node = self.primary()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.primary()?;
            node = Node::And(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn primary(&mut self) -> WeaverResult<Node> {
        if self.eat(&Token::LParen) {
            let node = self.expr()?;
            self.expect(&Token::RParen)?;
            return Ok(node);
        }
        let method = self.ident()?;
        self.expect(&Token::LParen)?;
        let node = match method.as_str() {
            "func" => Node::Func(self.func_pattern()?),
            "call" => Node::Call(self.func_pattern()?),
            "args" => return Ok(Node::Args(self.list(Self::ident)?)),
            "returns" => {
                let ty = match self.next()? {
                    Token::Star => None,
                    Token::Ident(t) if t == "void" => Some(String::new()),
                    Token::Ident(t) if is_value_type(&t) => Some(t),
                    _ => {
                        self.pos -= 1;
                        return Err(self.error("expected `*`, `void` or a value type"));
                    }
                };
                Node::Returns(ty)
            }
            "template" => {
                let name = self.ident()?;
                let just_check = if self.eat(&Token::Comma) {
                    match self.ident()?.as_str() {
                        "true" => true,
                        "false" => false,
                        _ => {
                            self.pos -= 1;
                            return Err(self.error("expected `true` or `false`"));
                        }
                    }
                } else {
                    false
                };
                Node::Template { name, just_check }
            }
            _ => {
                let args = self.list(Self::ident)?;
                return Ok(Node::Named { name: method, args });
            }
        };
        self.expect(&Token::RParen)?;
        Ok(node)
    }

    fn func_pattern(&mut self) -> WeaverResult<FuncPattern> {
        let mut f = FuncPattern::default();
        match self.next()? {
            Token::Star => {}
            Token::Ident(t) if t == "void" => f.result = Some(String::new()),
            Token::Ident(t) if is_value_type(&t) => f.result = Some(t),
            Token::Percent => {
                f.result_binding = Some(self.ident()?);
                if self.eat(&Token::Colon) {
                    f.result = Some(self.value_type()?);
                }
                self.expect(&Token::Percent)?;
            }
            _ => {
                self.pos -= 1;
                return Err(self.error("expected a result type"));
            }
        }
        match self.next()? {
            Token::Star => {}
            Token::Percent => {
                f.name_binding = Some(self.ident()?);
                if self.eat(&Token::Colon) {
                    let token = self.next()?;
                    f.name = self.name_pattern(token)?;
                }
                self.expect(&Token::Percent)?;
            }
            token => f.name = self.name_pattern(token)?,
        }
        self.expect(&Token::LParen)?;
        f.params = if self.eat(&Token::DotDot) {
            self.expect(&Token::RParen)?;
            None
        } else {
            Some(self.list(Self::param_pattern)?)
        };
        if self.eat(&Token::Comma) {
            f.scope = match self.ident()?.as_str() {
                "internal" => FunctionScope::Internal,
                "imported" => FunctionScope::Imported,
                "exported" => FunctionScope::Exported,
                "start" => FunctionScope::Start,
                scope => {
                    let msg = format!("unknown function scope `{scope}`");
                    self.pos -= 1;
                    return Err(self.error(msg));
                }
            };
        }
        Ok(f)
    }

    fn name_pattern(&mut self, token: Token) -> WeaverResult<NamePattern> {
        Ok(match token {
            Token::Ident(name) => NamePattern::Name(name),
            Token::Index(name) => NamePattern::Index(name),
            Token::LBracket => {
                let Token::Number(n) = self.next()? else {
                    self.pos -= 1;
                    return Err(self.error("expected a function order"));
                };
                self.expect(&Token::RBracket)?;
                NamePattern::Order(n)
            }
            Token::Regex(body) => {
                let re = Regex::new(&body).map_err(|e| self.error(format!("invalid regex: {e}")))?;
                NamePattern::Regex(re)
            }
            _ => {
                self.pos -= 1;
                return Err(self.error("expected a function name"));
            }
        })
    }

    fn param_pattern(&mut self) -> WeaverResult<ParamPattern> {
        let ty = match self.next()? {
            Token::Star => None,
            Token::Ident(t) if is_value_type(&t) => Some(t),
            _ => {
                self.pos -= 1;
                return Err(self.error("expected `*` or a value type"));
            }
        };
        let binding = if self.eat(&Token::Percent) {
            let name = self.ident()?;
            self.expect(&Token::Percent)?;
            Some(name)
        } else {
            self.eat(&Token::Star);
            None
        };
        Ok(ParamPattern { ty, binding })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn expr(src: &str) -> Node {
        parse(src).unwrap().expr
    }

    #[track_caller]
    fn func(node: Node) -> FuncPattern {
        match node {
            Node::Func(f) | Node::Call(f) => f,
            other => panic!("not a function pattern: {other:?}"),
        }
    }

    #[test]
    fn parameters() {
        let pc = parse("(i32.param[0] a, local[$t] b, f64 c, d) => args(a, b)").unwrap();
        assert_eq!(
            pc.params,
            [
                Param {
                    name: "a".into(),
                    ty: Some("i32".into()),
                    var: Some(Variable {
                        kind: VariableKind::Param,
                        index: "0".into()
                    }),
                },
                Param {
                    name: "b".into(),
                    ty: None,
                    var: Some(Variable {
                        kind: VariableKind::Local,
                        index: "$t".into()
                    }),
                },
                Param {
                    name: "c".into(),
                    ty: Some("f64".into()),
                    var: None,
                },
                Param {
                    name: "d".into(),
                    ty: None,
                    var: None,
                },
            ]
        );
        assert!(matches!(pc.expr, Node::Args(ref a) if a == &["a", "b"]));
        assert!(parse("(i32.global[0] a) => args(a)").is_err());
    }

    #[test]
    fn function_patterns() {
        let f = func(expr("() => func(* * (..))"));
        assert_eq!(f.result, None);
        assert!(matches!(f.name, NamePattern::Any));
        assert_eq!(f.params, None);
        assert_eq!(f.scope, FunctionScope::Any);

        let f = func(expr("() => call(void $log (i32 %x%, *), imported)"));
        assert_eq!(f.result.as_deref(), Some(""));
        assert!(matches!(f.name, NamePattern::Index(ref n) if n == "$log"));
        assert_eq!(
            f.params.unwrap(),
            [
                ParamPattern {
                    ty: Some("i32".into()),
                    binding: Some("x".into())
                },
                ParamPattern::default()
            ]
        );
        assert_eq!(f.scope, FunctionScope::Imported);

        let f = func(expr("() => func(%r:i32% %n:/^a\\/b/% ())"));
        assert_eq!(f.result.as_deref(), Some("i32"));
        assert_eq!(f.result_binding.as_deref(), Some("r"));
        assert_eq!(f.name_binding.as_deref(), Some("n"));
        assert!(matches!(f.name, NamePattern::Regex(ref re) if re.as_str() == "^a/b"));
        assert_eq!(f.params, Some(Vec::new()));

        let f = func(expr("() => func(i64 [3] (..), start)"));
        assert!(matches!(f.name, NamePattern::Order(3)));
        let f = func(expr("() => func(* %n:add% (..))"));
        assert!(matches!(f.name, NamePattern::Name(ref n) if n == "add"));
    }

    #[test]
    fn operators_and_grouping() {
        // `&&` binds tighter than `||`.
        let node = expr("() => func(* * (..)) || call(* * (..)) && returns(*)");
        let Node::Or(lhs, rhs) = node else { panic!("expected `||` at the root") };
        assert!(matches!(*lhs, Node::Func(_)));
        assert!(matches!(*rhs, Node::And(ref a, ref b) if matches!(**a, Node::Call(_)) && matches!(**b, Node::Returns(None))));

        let node = expr("() => (func(* * (..)) || call(* * (..))) && template(t, true)");
        let Node::And(lhs, rhs) = node else { panic!("expected `&&` at the root") };
        assert!(matches!(*lhs, Node::Or(..)));
        assert!(matches!(*rhs, Node::Template { ref name, just_check: true } if name == "t"));

        assert!(matches!(expr("(a) => logged(a)"), Node::Named { ref name, ref args } if name == "logged" && args == &["a"]));
        assert!(matches!(expr("() => returns(void)"), Node::Returns(Some(ref t)) if t.is_empty()));
    }

    #[test]
    fn errors() {
        for src in [
            "func(* * (..))",
            "() => func(* * (..)",
            "() => func(i33 * (..))",
            "() => func(* * (..), everywhere)",
            "() => func(* /(/ (..))",
            "() => func(* /a (..))",
            "() => returns(string)",
            "() => template(t, maybe)",
            "() => func(* * (..)) call(* * (..))",
            "() => func(* * (..)) ^",
        ] {
            let err = parse(src).unwrap_err();
            assert!(matches!(err, WeaverError::Pointcut { .. }), "{src}: {err}");
        }
    }
}
