//! Lexer for keyword text.
//!
//! Keyword text is plain code with embedded `%...%` keywords. Inside a
//! keyword the lexer produces expression tokens; quoted strings may embed
//! further keywords, and backquoted strings also accept `${...}`.

use crate::error::{WeaverError, WeaverResult};

/// A binary operator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Ge,
    Gt,
    Le,
    Lt,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinOp {
    /// Binding strength; operators with equal precedence associate left.
    pub fn precedence(self) -> u8 {
        match self {
            BinOp::Or => 1,
            BinOp::And => 2,
            BinOp::Eq | BinOp::Ne => 3,
            BinOp::Ge | BinOp::Gt | BinOp::Le | BinOp::Lt => 4,
            BinOp::Shl | BinOp::Shr => 5,
            BinOp::Add | BinOp::Sub => 6,
            BinOp::Mul | BinOp::Div | BinOp::Rem => 7,
        }
    }
}

/// A token of keyword text.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    /// Plain text, outside a keyword or inside a string.
    Text(String),
    /// `%` or `${` opening a keyword.
    KeywordStart,
    /// `%` or `}` closing a keyword.
    KeywordEnd,
    /// Opening quote.
    StrStart,
    /// Closing quote.
    StrEnd,
    /// An identifier, e.g. `this`.
    Ident(String),
    /// A number literal.
    Number(f64),
    /// `:name`, the start of a method call.
    Method(String),
    /// `.name`, an object property access.
    Prop(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    /// `;`
    Union,
    /// `!`
    Bang,
    /// `=>`
    Arrow,
    Op(BinOp),
}

impl Token {
    /// Can this token end an operand? Decides whether a `-` is a sign or an
    /// operator.
    fn ends_operand(&self) -> bool {
        matches!(
            self,
            Token::Ident(_)
                | Token::Number(_)
                | Token::Prop(_)
                | Token::StrEnd
                | Token::RParen
                | Token::RBracket
        )
    }
}

#[derive(Copy, Clone, Debug)]
enum Mode {
    Text,
    Keyword { end: char, depth: usize },
    Str { quote: char },
}

/// The lexer.
#[derive(Debug)]
pub struct Lexer<'src> {
    src: &'src str,
    pos: usize,
    modes: Vec<Mode>,
    tokens: Vec<(usize, Token)>,
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

impl<'src> Lexer<'src> {
    /// Lex the whole input into tokens paired with their byte offsets.
    pub fn lex(src: &'src str) -> WeaverResult<Vec<(usize, Token)>> {
        let mut l = Lexer {
            src,
            pos: 0,
            modes: vec![Mode::Text],
            tokens: Vec::new(),
        };
        l.run()?;
        Ok(l.tokens)
    }

    fn error(&self, msg: impl Into<String>) -> WeaverError {
        WeaverError::keyword(self.src, format!("{} (at byte {})", msg.into(), self.pos))
    }

    fn rest(&self) -> &'src str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.rest().chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn push(&mut self, start: usize, token: Token) {
        self.tokens.push((start, token));
    }

    fn run(&mut self) -> WeaverResult<()> {
        while let Some(mode) = self.modes.last().copied() {
            match mode {
                Mode::Text => {
                    if self.lex_text() {
                        return Ok(());
                    }
                }
                Mode::Str { quote } => self.lex_str(quote)?,
                Mode::Keyword { end, depth } => self.lex_keyword(end, depth)?,
            }
        }
        Ok(())
    }

    /// Lex plain text up to the next keyword. Returns `true` at the end of
    /// input.
    fn lex_text(&mut self) -> bool {
        let start = self.pos;
        let len = self.rest().find('%').unwrap_or(self.rest().len());
        self.pos += len;
        if len > 0 {
            self.push(start, Token::Text(self.src[start..self.pos].to_string()));
        }
        if self.peek().is_none() {
            return true;
        }
        self.push(self.pos, Token::KeywordStart);
        self.pos += 1;
        self.modes.push(Mode::Keyword { end: '%', depth: 0 });
        false
    }

    fn lex_str(&mut self, quote: char) -> WeaverResult<()> {
        let mut text = String::new();
        let start = self.pos;
        let flush = |l: &mut Self, text: &mut String| {
            if !text.is_empty() {
                l.push(start, Token::Text(std::mem::take(text)));
            }
        };
        loop {
            let Some(c) = self.peek() else {
                return Err(self.error("unclosed quoted string"));
            };
            match c {
                '\\' => {
                    self.bump();
                    match self.bump() {
                        Some(escaped) => text.push(escaped),
                        None => return Err(self.error("unclosed quoted string")),
                    }
                }
                '%' => {
                    flush(self, &mut text);
                    self.push(self.pos, Token::KeywordStart);
                    self.pos += 1;
                    self.modes.push(Mode::Keyword { end: '%', depth: 0 });
                    return Ok(());
                }
                '$' if quote == '`' && self.peek_nth(1) == Some('{') => {
                    flush(self, &mut text);
                    self.push(self.pos, Token::KeywordStart);
                    self.pos += 2;
                    self.modes.push(Mode::Keyword { end: '}', depth: 0 });
                    return Ok(());
                }
                '\n' if quote != '`' => return Err(self.error("newline in quoted string")),
                c if c == quote => {
                    flush(self, &mut text);
                    self.push(self.pos, Token::StrEnd);
                    self.pos += 1;
                    self.modes.pop();
                    return Ok(());
                }
                c => {
                    self.bump();
                    text.push(c);
                }
            }
        }
    }

    fn set_depth(&mut self, depth: usize) {
        if let Some(Mode::Keyword { depth: d, .. }) = self.modes.last_mut() {
            *d = depth;
        }
    }

    /// Lex a single token inside a keyword.
    fn lex_keyword(&mut self, end: char, depth: usize) -> WeaverResult<()> {
        let start = self.pos;
        let Some(c) = self.bump() else {
            return Err(self.error("unclosed keyword"));
        };
        let next = self.peek();
        let token = match c {
            c if c.is_whitespace() => return Ok(()),
            c if c == end && depth == 0 => {
                self.push(start, Token::KeywordEnd);
                self.modes.pop();
                return Ok(());
            }
            '"' | '\'' | '`' => {
                self.push(start, Token::StrStart);
                self.modes.push(Mode::Str { quote: c });
                return Ok(());
            }
            '(' => {
                self.set_depth(depth + 1);
                Token::LParen
            }
            ')' => {
                if depth == 0 {
                    return Err(self.error("unbalanced `)`"));
                }
                self.set_depth(depth - 1);
                Token::RParen
            }
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            ',' => Token::Comma,
            ';' => Token::Union,
            ':' => Token::Method(self.name("method")?),
            '.' => Token::Prop(self.name("property")?),
            '!' if next == Some('=') => {
                self.bump();
                Token::Op(BinOp::Ne)
            }
            '!' => Token::Bang,
            '=' if next == Some('=') => {
                self.bump();
                Token::Op(BinOp::Eq)
            }
            '=' if next == Some('>') => {
                self.bump();
                Token::Arrow
            }
            '<' | '>' => {
                let op = match (c, next) {
                    ('<', Some('<')) => Some(BinOp::Shl),
                    ('<', Some('=')) => Some(BinOp::Le),
                    ('>', Some('>')) => Some(BinOp::Shr),
                    ('>', Some('=')) => Some(BinOp::Ge),
                    _ => None,
                };
                match op {
                    Some(op) => {
                        self.bump();
                        Token::Op(op)
                    }
                    None if c == '<' => Token::Op(BinOp::Lt),
                    None => Token::Op(BinOp::Gt),
                }
            }
            '&' | '|' => {
                if next != Some(c) {
                    return Err(self.error(format!("invalid operator `{c}`")));
                }
                self.bump();
                Token::Op(if c == '&' { BinOp::And } else { BinOp::Or })
            }
            '+' => Token::Op(BinOp::Add),
            '*' => Token::Op(BinOp::Mul),
            '/' => Token::Op(BinOp::Div),
            '%' => Token::Op(BinOp::Rem),
            '-' => {
                let after_operand = self.tokens.last().is_some_and(|(_, t)| t.ends_operand());
                if !after_operand && next.is_some_and(|n| n.is_ascii_digit()) {
                    self.pos = start;
                    Token::Number(self.number()?)
                } else {
                    Token::Op(BinOp::Sub)
                }
            }
            c if c.is_ascii_digit() => {
                self.pos = start;
                Token::Number(self.number()?)
            }
            c if is_ident_start(c) => {
                while self.peek().is_some_and(is_ident_char) {
                    self.bump();
                }
                Token::Ident(self.src[start..self.pos].to_string())
            }
            c => return Err(self.error(format!("unexpected character `{c}` in keyword"))),
        };
        self.push(start, token);
        Ok(())
    }

    fn name(&mut self, what: &str) -> WeaverResult<String> {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.bump();
        }
        if start == self.pos {
            return Err(self.error(format!("expected a {what} name")));
        }
        Ok(self.src[start..self.pos].to_string())
    }

    fn number(&mut self) -> WeaverResult<f64> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.bump();
        }
        let digits = |l: &mut Self| {
            while l.peek().is_some_and(|c| c.is_ascii_digit()) {
                l.bump();
            }
        };
        digits(self);
        if self.peek() == Some('.') && self.peek_nth(1).is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
            digits(self);
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            self.bump();
            if matches!(self.peek(), Some('+' | '-')) {
                self.bump();
            }
            digits(self);
        }
        if self.peek().is_some_and(is_ident_char) {
            return Err(self.error("bad number syntax"));
        }
        let text = &self.src[start..self.pos];
        text.parse()
            .map_err(|_| self.error(format!("bad number syntax `{text}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn tokens(src: &str) -> Vec<Token> {
        Lexer::lex(src).unwrap().into_iter().map(|(_, t)| t).collect()
    }

    fn ident(s: &str) -> Token {
        Token::Ident(s.to_string())
    }

    fn text(s: &str) -> Token {
        Token::Text(s.to_string())
    }

    #[test]
    fn text_and_keywords() {
        assert_eq!(
            tokens("(call %this.name%)"),
            [
                text("(call "),
                Token::KeywordStart,
                ident("this"),
                Token::Prop("name".into()),
                Token::KeywordEnd,
                text(")"),
            ]
        );
        assert_eq!(tokens("(nop)"), [text("(nop)")]);
    }

    #[test]
    fn methods_and_lambdas() {
        assert_eq!(
            tokens("%args:map((a, i) => a.type)[0]%"),
            [
                Token::KeywordStart,
                ident("args"),
                Token::Method("map".into()),
                Token::LParen,
                Token::LParen,
                ident("a"),
                Token::Comma,
                ident("i"),
                Token::RParen,
                Token::Arrow,
                ident("a"),
                Token::Prop("type".into()),
                Token::RParen,
                Token::LBracket,
                Token::Number(0.0),
                Token::RBracket,
                Token::KeywordEnd,
            ]
        );
    }

    #[test]
    fn operators_inside_parens() {
        assert_eq!(
            tokens("%(a % 2 == 0 && b >= -1)%"),
            [
                Token::KeywordStart,
                Token::LParen,
                ident("a"),
                Token::Op(BinOp::Rem),
                Token::Number(2.0),
                Token::Op(BinOp::Eq),
                Token::Number(0.0),
                Token::Op(BinOp::And),
                ident("b"),
                Token::Op(BinOp::Ge),
                Token::Number(-1.0),
                Token::RParen,
                Token::KeywordEnd,
            ]
        );
        assert_eq!(
            tokens("%(a-1)%")[3],
            Token::Op(BinOp::Sub),
        );
    }

    #[test]
    fn nested_strings() {
        assert_eq!(
            tokens(r#"%"x %a% \"y\""; `${b}!`%"#),
            [
                Token::KeywordStart,
                Token::StrStart,
                text("x "),
                Token::KeywordStart,
                ident("a"),
                Token::KeywordEnd,
                text(" \"y\""),
                Token::StrEnd,
                Token::Union,
                Token::StrStart,
                Token::KeywordStart,
                ident("b"),
                Token::KeywordEnd,
                text("!"),
                Token::StrEnd,
                Token::KeywordEnd,
            ]
        );
    }

    #[test]
    fn errors() {
        assert!(Lexer::lex("%a").is_err());
        assert!(Lexer::lex("%'abc%").is_err());
        assert!(Lexer::lex("%a & b%").is_err());
        assert!(Lexer::lex("%12ab%").is_err());
        assert!(Lexer::lex("%a)%").is_err());
    }
}
