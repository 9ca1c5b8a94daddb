//! Single-pass parser from text to blocks.
//!
//! The parser is deliberately forgiving about what goes *inside* an
//! instruction: anything that is not one of the lead characters below is a
//! text token. It is strict about termination, so an unbalanced `(` or an
//! unterminated string is an error.
//!
//! | lead | block |
//! |------|-------|
//! | `(`  | instruction (or `(; ... ;)` comment) |
//! | `"`, `'`, `` ` `` | quoted string |
//! | `%`  | keyword |
//! | `/`  | evaluation |
//! | `#`  | evaluation reference (inside instructions) |
//! | `;`  | line comment |

use super::{Block, BlockKind, Code};
use crate::error::{WeaverError, WeaverResult};

/// Normalize code text: strip comments, trim, drop whitespace just inside
/// parentheses and collapse whitespace runs to a single space.
///
/// Quoted spans are copied verbatim. A comment counts as whitespace, so it
/// never joins the tokens around it.
pub fn clear_string(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    let mut space = false;
    let mut pos = 0;
    while let Some(c) = code[pos..].chars().next() {
        let rest = &code[pos..];
        if rest.starts_with(";;") {
            pos += rest.find('\n').unwrap_or(rest.len());
            space = true;
            continue;
        }
        if rest.starts_with("(;") {
            let Some(end) = rest[2..].find(";)") else {
                // Left for the parser to report.
                out.push_str(rest);
                break;
            };
            pos += end + 4;
            space = true;
            continue;
        }
        if c.is_ascii_whitespace() {
            pos += 1;
            space = true;
            continue;
        }
        if space && !out.is_empty() && !out.ends_with('(') && c != ')' {
            out.push(' ');
        }
        space = false;
        let len = if c.is_ascii() && is_quote(c as u8) {
            quoted_len(rest.as_bytes())
        } else {
            c.len_utf8()
        };
        out.push_str(&rest[..len]);
        pos += len;
    }
    out
}

/// Length of the quoted span at the start of `src`, closing quote included.
/// An unterminated span runs to the end of `src`.
pub(crate) fn quoted_len(src: &[u8]) -> usize {
    let quote = src[0];
    let mut escaped = false;
    for (i, c) in src.iter().enumerate().skip(1) {
        match *c {
            _ if escaped => escaped = false,
            b'\\' => escaped = true,
            c if c == quote => return i + 1,
            _ => {}
        }
    }
    src.len()
}

/// Is the `%` at the start of `rest` the remainder operator of a runtime
/// expression closed by `end`, rather than the start of a keyword?
///
/// A keyword needs a closing `%` before the expression ends and never starts
/// with whitespace.
pub(crate) fn is_remainder(rest: &[u8], end: u8) -> bool {
    let body = rest.get(1..).unwrap_or_default();
    match body.first() {
        None => true,
        Some(c) if c.is_ascii_whitespace() => true,
        Some(_) => match body.iter().position(|c| *c == b'%') {
            Some(close) => body[..close].contains(&end),
            None => true,
        },
    }
}

pub(crate) fn is_quote(c: u8) -> bool {
    matches!(c, b'"' | b'\'' | b'`')
}

fn is_identifier(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

impl Code {
    /// Parse `src` into a new [`BlockKind::Element`] root.
    pub fn parse(&mut self, src: &str) -> WeaverResult<Block> {
        let text = clear_string(src);
        let mut parser = Parser {
            src: text.as_bytes(),
            pos: 0,
            code: self,
        };
        parser.element()
    }

    /// Parse `src` and return its top-level blocks, detached and ready to be
    /// inserted somewhere else.
    pub fn parse_blocks(&mut self, src: &str) -> WeaverResult<Vec<Block>> {
        let root = self.parse(src)?;
        let blocks = std::mem::take(self.children_mut(root));
        for b in &blocks {
            self.set_parent(*b, None);
        }
        Ok(blocks)
    }
}

/// Pending literal bytes of the block being parsed.
#[derive(Default)]
struct Buffer(Vec<u8>);

impl Buffer {
    fn push(&mut self, c: u8) {
        self.0.push(c);
    }

    fn take(&mut self) -> String {
        let s = String::from_utf8_lossy(&self.0).into_owned();
        self.0.clear();
        s
    }

    fn is_blank(&self) -> bool {
        self.0.iter().all(|c| c.is_ascii_whitespace())
    }
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    code: &'a mut Code,
}

impl<'a> Parser<'a> {
    fn error(&self, offset: usize, msg: impl Into<String>) -> WeaverError {
        WeaverError::Parse {
            offset,
            msg: msg.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.peek() {
            if c == b'\n' {
                break;
            }
            self.pos += 1;
        }
    }

    /// Push pending text as a child of an element-like block.
    fn flush_text(&mut self, parent: Block, buf: &mut Buffer, trim: bool) {
        if buf.is_blank() {
            buf.take();
            return;
        }
        let s = buf.take();
        let s = if trim { s.trim().to_string() } else { s };
        let text = self.code.create_text(s);
        self.code.push(parent, text);
    }

    fn flush_eval_text(&mut self, parent: Block, buf: &mut Buffer) {
        if buf.is_blank() {
            buf.take();
            return;
        }
        let s = buf.take();
        let text = self.code.create(BlockKind::EvaluationText(s));
        self.code.push(parent, text);
    }

    fn element(&mut self) -> WeaverResult<Block> {
        let root = self.code.create(BlockKind::Element);
        let mut buf = Buffer::default();
        while let Some(c) = self.peek() {
            let child = match c {
                b'(' => self.instruction()?,
                b'%' => Some(self.keyword()?),
                b'/' => Some(self.evaluation()?),
                c if is_quote(c) => Some(self.string(false)?),
                b';' => {
                    self.skip_line();
                    None
                }
                _ => {
                    buf.push(c);
                    self.pos += 1;
                    continue;
                }
            };
            self.flush_text(root, &mut buf, true);
            if let Some(child) = child {
                self.code.push(root, child);
            }
        }
        self.flush_text(root, &mut buf, true);
        Ok(root)
    }

    /// Parse an instruction starting at `(`. Returns `None` for a block
    /// comment.
    fn instruction(&mut self) -> WeaverResult<Option<Block>> {
        let start = self.pos;
        self.pos += 1;
        if self.peek() == Some(b';') {
            return self.block_comment(start).map(|()| None);
        }
        let instr = self.code.create(BlockKind::Instruction(String::new()));
        let mut named = false;
        let mut buf = Buffer::default();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.error(start, "unterminated instruction"));
            };
            let child = match c {
                b')' => {
                    self.flush_token(instr, &mut buf, &mut named);
                    self.pos += 1;
                    return Ok(Some(instr));
                }
                b'(' => self.instruction()?,
                b'#' => Some(self.evaluation_ref()?),
                b'%' => Some(self.keyword()?),
                b'/' => Some(self.evaluation()?),
                b';' => {
                    self.skip_line();
                    None
                }
                c if is_quote(c) => Some(self.string(false)?),
                c if c.is_ascii_whitespace() => {
                    self.flush_token(instr, &mut buf, &mut named);
                    self.pos += 1;
                    continue;
                }
                _ => {
                    buf.push(c);
                    self.pos += 1;
                    continue;
                }
            };
            self.flush_token(instr, &mut buf, &mut named);
            if let Some(child) = child {
                self.code.push(instr, child);
            }
        }
    }

    /// The first token of an instruction is its name, later ones are text
    /// children.
    fn flush_token(&mut self, instr: Block, buf: &mut Buffer, named: &mut bool) {
        if buf.is_blank() {
            buf.take();
            return;
        }
        let token = buf.take();
        if *named {
            let text = self.code.create_text(token);
            self.code.push(instr, text);
        } else {
            self.code.rename(instr, token);
            *named = true;
        }
    }

    fn block_comment(&mut self, start: usize) -> WeaverResult<()> {
        while self.pos < self.src.len() {
            if self.src[self.pos..].starts_with(b";)") {
                self.pos += 2;
                return Ok(());
            }
            self.pos += 1;
        }
        Err(self.error(start, "unterminated block comment"))
    }

    fn keyword(&mut self) -> WeaverResult<Block> {
        let start = self.pos;
        self.pos += 1;
        let kw = self.code.create(BlockKind::Keyword);
        let mut buf = Buffer::default();
        loop {
            match self.peek() {
                None => return Err(self.error(start, "unterminated keyword")),
                Some(b'%') => {
                    self.flush_text(kw, &mut buf, false);
                    self.pos += 1;
                    return Ok(kw);
                }
                Some(c) if is_quote(c) => {
                    self.flush_text(kw, &mut buf, false);
                    let quoted = self.string(true)?;
                    self.code.push(kw, quoted);
                }
                Some(c) => {
                    buf.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    /// Parse a quoted string. Keywords are only recognized inside strings
    /// that are themselves inside a keyword.
    fn string(&mut self, keywords: bool) -> WeaverResult<Block> {
        let start = self.pos;
        let quote = self.src[start];
        self.pos += 1;
        let quoted = self.code.create(BlockKind::Quoted(char::from(quote)));
        let mut buf = Buffer::default();
        let mut escaped = false;
        loop {
            match self.peek() {
                None => return Err(self.error(start, "unterminated string")),
                Some(c) if c == quote && !escaped => {
                    self.push_raw(quoted, &mut buf);
                    self.pos += 1;
                    return Ok(quoted);
                }
                Some(b'%') if keywords && !escaped => {
                    self.push_raw(quoted, &mut buf);
                    let kw = self.keyword()?;
                    self.code.push(quoted, kw);
                }
                Some(c) => {
                    escaped = c == b'\\' && !escaped;
                    buf.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn push_raw(&mut self, parent: Block, buf: &mut Buffer) {
        if buf.0.is_empty() {
            return;
        }
        let text = self.code.create_text(buf.take());
        self.code.push(parent, text);
    }

    fn evaluation(&mut self) -> WeaverResult<Block> {
        let start = self.pos;
        let eval = self.code.create(BlockKind::Evaluation);
        self.evaluation_like(eval, b'/')
            .map_err(|_| self.error(start, "unterminated evaluation"))?;
        Ok(eval)
    }

    /// Parse the inside of an evaluation-like block up to `end`. The cursor
    /// starts on the opening delimiter and finishes after the closing one.
    fn evaluation_like(&mut self, block: Block, end: u8) -> WeaverResult<()> {
        let start = self.pos;
        self.pos += 1;
        let mut buf = Buffer::default();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.error(start, "unterminated expression"));
            };
            match c {
                c if c == end => {
                    self.flush_eval_text(block, &mut buf);
                    self.pos += 1;
                    return Ok(());
                }
                b'%' if !is_remainder(&self.src[self.pos..], end) => {
                    self.flush_eval_text(block, &mut buf);
                    let kw = self.keyword()?;
                    self.code.push(block, kw);
                }
                b'#' => {
                    self.flush_eval_text(block, &mut buf);
                    let id = self.evaluation_id();
                    self.code.push(block, id);
                }
                b'[' => match self.index_base(block, &mut buf) {
                    Some(base) => {
                        let index = self.code.create(BlockKind::EvaluationIndex { base: true });
                        self.code.push(index, base);
                        self.evaluation_like(index, b']')?;
                        self.code.push(block, index);
                    }
                    None => {
                        buf.push(c);
                        self.pos += 1;
                    }
                },
                c if is_quote(c) => {
                    self.flush_eval_text(block, &mut buf);
                    let quoted = self.evaluation_quote()?;
                    self.code.push(block, quoted);
                }
                _ => {
                    buf.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    /// Split the indexed expression off the pending text. If nothing is
    /// pending, the previous block is the base.
    fn index_base(&mut self, block: Block, buf: &mut Buffer) -> Option<Block> {
        if buf.is_blank() {
            buf.take();
            let last = self.code.children_mut(block).pop()?;
            self.code.set_parent(last, None);
            return Some(last);
        }
        let pending = buf.take();
        let trimmed = pending.trim_end();
        let split = trimmed
            .bytes()
            .rposition(|c| !(is_identifier(c) || c == b'$' || c == b'.'))
            .map_or(0, |p| p + 1);
        if split == trimmed.len() {
            buf.0.extend_from_slice(pending.as_bytes());
            return None;
        }
        let (prefix, ident) = trimmed.split_at(split);
        if !prefix.trim().is_empty() {
            let text = self.code.create(BlockKind::EvaluationText(prefix.to_string()));
            self.code.push(block, text);
        }
        Some(self.code.create(BlockKind::EvaluationText(ident.to_string())))
    }

    fn evaluation_id(&mut self) -> Block {
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !is_identifier(c) && c != b'$' {
                break;
            }
            self.pos += 1;
        }
        let id = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        self.code.create(BlockKind::EvaluationId(id))
    }

    fn evaluation_quote(&mut self) -> WeaverResult<Block> {
        let start = self.pos;
        let quote = self.src[start];
        self.pos += 1;
        let quoted = self
            .code
            .create(BlockKind::EvaluationQuoted(char::from(quote)));
        let mut buf = Buffer::default();
        let mut escaped = false;
        loop {
            match self.peek() {
                None => return Err(self.error(start, "unterminated string")),
                Some(c) if c == quote && !escaped => {
                    self.push_raw(quoted, &mut buf);
                    self.pos += 1;
                    return Ok(quoted);
                }
                Some(_) if escaped => {
                    escaped = false;
                    buf.push(self.src[self.pos]);
                    self.pos += 1;
                }
                Some(b'%') => {
                    self.push_raw(quoted, &mut buf);
                    let kw = self.keyword()?;
                    self.code.push(quoted, kw);
                }
                Some(b'$') if quote == b'`' && self.peek_at(1) == Some(b'{') => {
                    self.push_raw(quoted, &mut buf);
                    let kw = self.code.create(BlockKind::EvaluationKeyword);
                    self.pos += 1;
                    self.evaluation_like(kw, b'}')?;
                    self.code.push(quoted, kw);
                }
                Some(c) => {
                    escaped = c == b'\\';
                    buf.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn evaluation_ref(&mut self) -> WeaverResult<Block> {
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_whitespace() || matches!(c, b'(' | b')' | b'[') {
                break;
            }
            self.pos += 1;
        }
        let name = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        let r = self.code.create(BlockKind::EvaluationRef(name));
        while self.peek() == Some(b'[') {
            let index = self.code.create(BlockKind::EvaluationIndex { base: false });
            self.evaluation_like(index, b']')?;
            self.code.push(r, index);
        }
        Ok(r)
    }
}
