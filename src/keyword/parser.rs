//! Parser for keyword text.
//!
//! Takes the lexer's tokens and builds an expression tree. Binary operators
//! are resolved by precedence climbing; methods, property accesses and
//! indexing are postfix and bind tighter than any operator, and `!` binds
//! tighter than binary operators but looser than postfix forms.

use super::lexer::{BinOp, Lexer, Token};
use crate::error::{WeaverError, WeaverResult};

/// A keyword expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// Literal text.
    Text(String),
    Number(f64),
    /// A variable looked up in the keyword scopes.
    Ident(String),
    /// Text pieces and keywords, evaluated to text and joined.
    Concat(Vec<Expr>),
    /// `a; b`: a single expression passes its value through, several are
    /// joined as text. Assertion failures inside stop here.
    Union(Vec<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Method),
}

/// A lambda argument, `(x, i) => body`.
#[derive(Clone, Debug, PartialEq)]
pub struct Lambda {
    pub params: Vec<String>,
    pub body: Box<Expr>,
}

/// An argument of `replace` and `remove`: a bare name refers to a template
/// variable, anything else is evaluated as text.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    Reference(String),
    Value(Box<Expr>),
}

/// A postfix operation applied to a value.
#[derive(Clone, Debug, PartialEq)]
pub enum Method {
    String,
    Type,
    Count,
    Order,
    Reverse,
    Index(i64),
    Prop(String),
    Map(Lambda),
    Filter(Lambda),
    Assert(Lambda),
    Repeat(usize),
    Join(Box<Expr>),
    Split(Box<Expr>),
    Contains(Box<Expr>),
    Slice(i64, Option<i64>),
    Splice(i64, Option<i64>),
    Replace(Arg, Arg),
    Remove(Arg),
    Select(String),
}

/// Parse keyword text into a [`Expr::Concat`] of text and keywords.
pub fn parse(src: &str) -> WeaverResult<Expr> {
    let tokens = Lexer::lex(src)?;
    let mut parser = Parser {
        src,
        tokens,
        pos: 0,
    };
    let mut parts = Vec::new();
    while let Some(token) = parser.next() {
        match token {
            Token::Text(text) => parts.push(Expr::Text(text)),
            Token::KeywordStart => parts.push(parser.parse_keyword()?),
            t => return Err(parser.error(format!("unexpected token {t:?}"))),
        }
    }
    Ok(Expr::Concat(parts))
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, msg: impl Into<String>) -> WeaverError {
        let offset = self
            .tokens
            .get(self.pos.saturating_sub(1))
            .map_or(self.src.len(), |(offset, _)| *offset);
        WeaverError::keyword(self.src, format!("{} (at byte {offset})", msg.into()))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn peek_nth(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn is(&self, token: &Token) -> bool {
        self.peek() == Some(token)
    }

    fn expect(&mut self, token: Token, context: &str) -> WeaverResult<()> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            Some(t) => Err(self.error(format!("{context}: expected {token:?} but got {t:?}"))),
            None => Err(self.error(format!("{context}: expected {token:?} but got end of input"))),
        }
    }

    fn ident(&mut self, context: &str) -> WeaverResult<String> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            t => Err(self.error(format!("{context}: expected a name but got {t:?}"))),
        }
    }

    fn integer(&mut self, context: &str) -> WeaverResult<i64> {
        match self.next() {
            Some(Token::Number(n)) if n.fract() == 0.0 => Ok(n as i64),
            t => Err(self.error(format!("{context}: expected an integer but got {t:?}"))),
        }
    }

    /// The body of a `%...%` or `${...}` keyword, after its start.
    fn parse_keyword(&mut self) -> WeaverResult<Expr> {
        let expr = self.parse_union()?;
        self.expect(Token::KeywordEnd, "keyword")?;
        Ok(expr)
    }

    fn parse_union(&mut self) -> WeaverResult<Expr> {
        let mut exprs = vec![self.parse_expr(0)?];
        while self.is(&Token::Union) {
            self.next();
            exprs.push(self.parse_expr(0)?);
        }
        Ok(Expr::Union(exprs))
    }

    fn parse_expr(&mut self, min_precedence: u8) -> WeaverResult<Expr> {
        let mut lhs = self.parse_unary()?;
        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            if op.precedence() < min_precedence {
                break;
            }
            self.next();
            let rhs = self.parse_expr(op.precedence() + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> WeaverResult<Expr> {
        if self.is(&Token::Bang) {
            self.next();
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        let mut expr = self.parse_primary()?;
        loop {
            let method = match self.peek().cloned() {
                Some(Token::Method(name)) => {
                    self.next();
                    self.parse_method(&name)?
                }
                Some(Token::Prop(name)) => {
                    self.next();
                    Method::Prop(name)
                }
                Some(Token::LBracket) => {
                    self.next();
                    let index = self.integer("index access")?;
                    self.expect(Token::RBracket, "index access")?;
                    Method::Index(index)
                }
                _ => break,
            };
            expr = Expr::Call(Box::new(expr), method);
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> WeaverResult<Expr> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::StrStart) => self.parse_string(),
            Some(Token::LParen) => {
                let expr = self.parse_union()?;
                self.expect(Token::RParen, "group")?;
                Ok(expr)
            }
            Some(t) => Err(self.error(format!("invalid keyword start {t:?}"))),
            None => Err(self.error("unexpected end of keyword")),
        }
    }

    fn parse_string(&mut self) -> WeaverResult<Expr> {
        let mut parts = Vec::new();
        loop {
            match self.next() {
                Some(Token::Text(text)) => parts.push(Expr::Text(text)),
                Some(Token::KeywordStart) => parts.push(self.parse_keyword()?),
                Some(Token::StrEnd) => return Ok(Expr::Concat(parts)),
                t => return Err(self.error(format!("unexpected {t:?} in string"))),
            }
        }
    }

    fn parse_method(&mut self, name: &str) -> WeaverResult<Method> {
        let context = format!("method {name}");
        self.expect(Token::LParen, &context)?;
        let method = match name {
            "string" => Method::String,
            "type" => Method::Type,
            "count" => Method::Count,
            "order" => Method::Order,
            "reverse" => Method::Reverse,
            "map" => Method::Map(self.parse_lambda(&context)?),
            "filter" => Method::Filter(self.parse_lambda(&context)?),
            "assert" => Method::Assert(self.parse_lambda(&context)?),
            "repeat" => {
                let times = self.integer(&context)?;
                let times = usize::try_from(times)
                    .map_err(|_| self.error("method repeat: negative count"))?;
                Method::Repeat(times)
            }
            "join" => Method::Join(Box::new(self.parse_union()?)),
            "split" => Method::Split(Box::new(self.parse_union()?)),
            "contains" => Method::Contains(Box::new(self.parse_union()?)),
            "slice" | "splice" => {
                let start = self.integer(&context)?;
                let end = if self.is(&Token::Comma) {
                    self.next();
                    Some(self.integer(&context)?)
                } else {
                    None
                };
                if name == "slice" {
                    Method::Slice(start, end)
                } else {
                    Method::Splice(start, end)
                }
            }
            "replace" => {
                let old = self.parse_arg()?;
                self.expect(Token::Comma, &context)?;
                Method::Replace(old, self.parse_arg()?)
            }
            "remove" => Method::Remove(self.parse_arg()?),
            "select" => Method::Select(self.ident(&context)?),
            _ => return Err(self.error(format!("unknown method `{name}`"))),
        };
        self.expect(Token::RParen, &context)?;
        Ok(method)
    }

    fn parse_lambda(&mut self, context: &str) -> WeaverResult<Lambda> {
        self.expect(Token::LParen, context)?;
        let mut params = vec![self.ident(context)?];
        while self.is(&Token::Comma) {
            self.next();
            params.push(self.ident(context)?);
        }
        if params.len() > 2 {
            return Err(self.error(format!("{context}: a lambda takes one or two arguments")));
        }
        self.expect(Token::RParen, context)?;
        self.expect(Token::Arrow, context)?;
        Ok(Lambda {
            params,
            body: Box::new(self.parse_union()?),
        })
    }

    fn parse_arg(&mut self) -> WeaverResult<Arg> {
        if let Some(Token::Ident(name)) = self.peek() {
            if matches!(self.peek_nth(1), Some(Token::Comma | Token::RParen)) {
                let name = name.clone();
                self.next();
                return Ok(Arg::Reference(name));
            }
        }
        Ok(Arg::Value(Box::new(self.parse_expr(0)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn keyword(src: &str) -> Expr {
        match parse(src).unwrap() {
            Expr::Concat(mut parts) => {
                assert_eq!(parts.len(), 1);
                match parts.remove(0) {
                    Expr::Union(mut exprs) if exprs.len() == 1 => exprs.remove(0),
                    e => e,
                }
            }
            e => panic!("unexpected {e:?}"),
        }
    }

    fn ident(name: &str) -> Box<Expr> {
        Box::new(Expr::Ident(name.into()))
    }

    #[test]
    fn precedence() {
        let e = keyword("%(a + b * c == d || e)%");
        let Expr::Union(exprs) = e else {
            panic!("expected a group")
        };
        let product = Expr::Binary(BinOp::Mul, ident("b"), ident("c"));
        let sum = Expr::Binary(BinOp::Add, ident("a"), Box::new(product));
        let eq = Expr::Binary(BinOp::Eq, Box::new(sum), ident("d"));
        assert_eq!(exprs, [Expr::Binary(BinOp::Or, Box::new(eq), ident("e"))]);
    }

    #[test]
    fn postfix_binds_tighter_than_not() {
        assert_eq!(
            keyword("%!a:count()%"),
            Expr::Not(Box::new(Expr::Call(ident("a"), Method::Count)))
        );
        assert_eq!(
            keyword("%a.params[1].type%"),
            Expr::Call(
                Box::new(Expr::Call(
                    Box::new(Expr::Call(ident("a"), Method::Prop("params".into()))),
                    Method::Index(1)
                )),
                Method::Prop("type".into())
            )
        );
    }

    #[test]
    fn methods() {
        let Expr::Call(_, Method::Map(lambda)) = keyword("%a:map((x, i) => x; i)%") else {
            panic!("expected map")
        };
        assert_eq!(lambda.params, ["x", "i"]);
        assert_eq!(
            *lambda.body,
            Expr::Union(vec![Expr::Ident("x".into()), Expr::Ident("i".into())])
        );
        assert_eq!(
            keyword("%a:slice(1, 3)%"),
            Expr::Call(ident("a"), Method::Slice(1, Some(3)))
        );
        assert_eq!(
            keyword("%t:replace(x, 'y')%"),
            Expr::Call(
                ident("t"),
                Method::Replace(
                    Arg::Reference("x".into()),
                    Arg::Value(Box::new(Expr::Concat(vec![Expr::Text("y".into())])))
                )
            )
        );
        assert_eq!(
            keyword("%t:select(body)%"),
            Expr::Call(ident("t"), Method::Select("body".into()))
        );
    }

    #[test]
    fn text_around_keywords() {
        let Expr::Concat(parts) = parse("(call %f% (i32.const %n%))").unwrap() else {
            panic!("expected concat")
        };
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0], Expr::Text("(call ".into()));
        assert_eq!(parts[4], Expr::Text("))".into()));
    }

    #[test]
    fn errors() {
        assert!(parse("%a:nope()%").is_err());
        assert!(parse("%a:map(x)%").is_err());
        assert!(parse("%a:map((x, y, z) => x)%").is_err());
        assert!(parse("%a +%").is_err());
        assert!(parse("%a b%").is_err());
        assert!(parse("%a:slice('x')%").is_err());
    }
}
