//! Compact and indented serialization of blocks.

use super::{Block, BlockKind, Code};
use std::fmt::{self, Write};

/// Names of function header fields; everything else inside a `func` is code.
const HEADER_FIELDS: &[&str] = &["type", "param", "result", "local"];

/// A `Display` adapter for the compact form of a block.
pub struct DisplayBlock<'a> {
    code: &'a Code,
    block: Block,
}

impl fmt::Display for DisplayBlock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.code.write_compact(f, self.block)
    }
}

impl Code {
    /// Return an object that can display `block` in compact form.
    pub fn display(&self, block: Block) -> DisplayBlock<'_> {
        DisplayBlock { code: self, block }
    }

    /// Compact form of `block`: single spaces between tokens, no comments.
    pub fn string(&self, block: Block) -> String {
        self.display(block).to_string()
    }

    /// Compact form of several blocks separated by single spaces.
    pub fn string_of(&self, blocks: &[Block]) -> String {
        let mut out = String::new();
        for (i, b) in blocks.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(&self.string(*b));
        }
        out
    }

    fn write_concat(&self, f: &mut dyn Write, blocks: &[Block]) -> fmt::Result {
        for b in blocks {
            self.write_compact(f, *b)?;
        }
        Ok(())
    }

    fn write_compact(&self, f: &mut dyn Write, block: Block) -> fmt::Result {
        let children = self.children(block);
        match self.kind(block) {
            BlockKind::Element => {
                let mut first = true;
                for child in children {
                    let s = self.string(*child);
                    let s = s.trim();
                    if s.is_empty() {
                        continue;
                    }
                    if !first {
                        f.write_char(' ')?;
                    }
                    f.write_str(s)?;
                    first = false;
                }
                Ok(())
            }
            BlockKind::Instruction(name) => {
                write!(f, "({name}")?;
                for child in children {
                    f.write_char(' ')?;
                    self.write_compact(f, *child)?;
                }
                f.write_char(')')
            }
            BlockKind::Text(s) | BlockKind::EvaluationText(s) => f.write_str(s),
            BlockKind::Quoted(q) => {
                f.write_char(*q)?;
                self.write_concat(f, children)?;
                f.write_char(*q)
            }
            BlockKind::Keyword => {
                f.write_char('%')?;
                self.write_concat(f, children)?;
                f.write_char('%')
            }
            BlockKind::Evaluation => {
                f.write_char('/')?;
                self.write_concat(f, children)?;
                f.write_char('/')
            }
            BlockKind::EvaluationRef(name) => {
                write!(f, "#{name}")?;
                self.write_concat(f, children)
            }
            BlockKind::EvaluationId(id) => write!(f, "#{id}"),
            BlockKind::EvaluationKeyword => {
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        f.write_char('+')?;
                    }
                    self.write_compact(f, *child)?;
                }
                Ok(())
            }
            BlockKind::EvaluationIndex { base } => {
                let index = match (base, children.split_first()) {
                    (true, Some((first, rest))) => {
                        self.write_compact(f, *first)?;
                        rest
                    }
                    _ => children,
                };
                f.write_char('[')?;
                self.write_concat(f, index)?;
                f.write_char(']')
            }
            BlockKind::EvaluationQuoted(_) => {
                if children.is_empty() {
                    return f.write_str("\"\"");
                }
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        f.write_char('+')?;
                    }
                    match self.kind(*child) {
                        BlockKind::Text(s) => write!(f, "\"{}\"", escape_quotes(s))?,
                        _ => self.write_compact(f, *child)?,
                    }
                }
                Ok(())
            }
            BlockKind::Comment => Ok(()),
        }
    }

    /// Indented form of `block` using `width` spaces per level.
    ///
    /// Leading non-instruction children stay on the instruction's line.
    /// Children of `module`, and code instructions inside a function, go on
    /// their own lines; everything else stays inline.
    pub fn string_indent(&self, block: Block, width: usize) -> String {
        let mut out = String::new();
        self.write_indent(&mut out, block, "", width);
        out
    }

    fn write_indent(&self, out: &mut String, block: Block, indent: &str, width: usize) {
        match self.kind(block) {
            BlockKind::Element => {
                for child in self.children(block) {
                    out.push_str(indent);
                    self.write_indent(out, *child, indent, width);
                    out.push('\n');
                }
            }
            BlockKind::Instruction(name) => {
                let children = self.children(block);
                if children.is_empty() {
                    out.push_str(&self.string(block));
                    return;
                }
                let inner = format!("{indent}{:width$}", "");
                out.push('(');
                out.push_str(name);
                let split = children
                    .iter()
                    .position(|c| self.is_instruction(*c))
                    .unwrap_or(children.len());
                for child in &children[..split] {
                    out.push(' ');
                    self.write_indent(out, *child, &inner, width);
                }
                let is_module = name == "module";
                let in_function = !is_module && self.enclosing_function(block).is_some();
                for child in &children[split..] {
                    let own_line = is_module || (in_function && self.is_code_instruction(*child));
                    if own_line {
                        out.push('\n');
                        out.push_str(&inner);
                    } else {
                        out.push(' ');
                    }
                    self.write_indent(out, *child, &inner, width);
                }
                if is_module {
                    out.push('\n');
                }
                out.push(')');
            }
            _ => out.push_str(&self.string(block)),
        }
    }

    /// Is `block` an instruction that is not part of a function header?
    pub fn is_code_instruction(&self, block: Block) -> bool {
        match self.name(block) {
            Some(name) => !HEADER_FIELDS.contains(&name),
            None => false,
        }
    }
}

/// Backslash-escape every `"` that is not already escaped.
fn escape_quotes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;
    for c in s.chars() {
        if c == '"' && !escaped {
            out.push('\\');
        }
        escaped = c == '\\' && !escaped;
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn indent(src: &str) -> String {
        let mut code = Code::new();
        let root = code.parse(src).unwrap();
        code.string_indent(root, 2)
    }

    #[test]
    fn indented_module() {
        let out = indent("(module (type $t (func)) (func $f (param $a i32) (result i32) (local.get $a)))");
        assert_eq!(
            out,
            "(module\n  (type $t (func))\n  (func $f (param $a i32) (result i32)\n    (local.get $a))\n)\n"
        );
    }

    #[test]
    fn nested_code_lines() {
        let out = indent("(module (func $f (block (nop) (nop))))");
        assert_eq!(
            out,
            "(module\n  (func $f\n    (block\n      (nop)\n      (nop)))\n)\n"
        );
    }

    #[test]
    fn escape() {
        assert_eq!(escape_quotes(r#"a"b\"c"#), r#"a\"b\"c"#);
        assert_eq!(escape_quotes(r#"\\""#), r#"\\\""#);
    }

    #[test]
    fn display_adapter() {
        let mut code = Code::new();
        let root = code.parse("(a  b)").unwrap();
        assert_eq!(format!("{}", code.display(root)), "(a b)");
    }
}
