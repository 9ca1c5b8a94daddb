//! The block tree code model.
//!
//! A module's text is parsed into a tree of [`Block`]s stored in a [`Code`]
//! arena. Blocks are opaque `u32` references; parent links and child lists are
//! kept side by side in [`BlockData`] so that edits are plain index updates.
//!
//! Blocks removed from the tree are never freed. They stay in the arena with no
//! parent, which is how a stale reference can be detected with
//! [`Code::is_attached`].

use cranelift_entity::{PrimaryMap, entity_impl};

mod display;
mod edit;
mod parser;

pub use self::display::DisplayBlock;
pub use self::parser::clear_string;
pub(crate) use self::parser::{is_quote, is_remainder, quoted_len};

/// An opaque reference to a block of code in a [`Code`] arena.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// The variant of a block, together with the data that is specific to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockKind {
    /// Top-level wrapper around sibling blocks that live outside any
    /// instruction.
    Element,
    /// An S-expression `(name child...)`.
    Instruction(String),
    /// A literal token.
    Text(String),
    /// A quoted string literal. Children are text and keyword blocks.
    Quoted(char),
    /// A `%...%` interpolation.
    Keyword,
    /// A `/.../` runtime expression.
    Evaluation,
    /// A `#name` runtime variable reference. Children are subscripts.
    EvaluationRef(String),
    /// A `#name` identifier inside an evaluation.
    EvaluationId(String),
    /// Raw expression text inside an evaluation.
    EvaluationText(String),
    /// A `${...}` interpolation inside a back-quoted evaluation string.
    EvaluationKeyword,
    /// A subscript `base[index]`.
    ///
    /// When `base` is set the first child is the indexed expression and the
    /// remaining children form the index; otherwise every child is part of the
    /// index, which is how subscripts of an [`BlockKind::EvaluationRef`] are
    /// stored.
    EvaluationIndex {
        /// Whether the first child is the indexed expression.
        base: bool,
    },
    /// A quoted string inside an evaluation.
    EvaluationQuoted(char),
    /// A WebAssembly comment. Comments are dropped while parsing.
    Comment,
}

impl BlockKind {
    /// Is this one of the blocks that make up the inside of an evaluation?
    pub fn is_evaluation_part(&self) -> bool {
        matches!(
            self,
            BlockKind::EvaluationId(_)
                | BlockKind::EvaluationText(_)
                | BlockKind::EvaluationKeyword
                | BlockKind::EvaluationIndex { .. }
                | BlockKind::EvaluationQuoted(_)
        )
    }
}

/// Per-block storage.
#[derive(Clone, Debug)]
pub struct BlockData {
    kind: BlockKind,
    parent: Option<Block>,
    children: Vec<Block>,
}

/// An arena of blocks.
///
/// A single `Code` usually holds a whole module plus every snippet that was
/// parsed while weaving it, so blocks can freely move between trees.
#[derive(Clone, Default)]
pub struct Code {
    blocks: PrimaryMap<Block, BlockData>,
}

impl Code {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks ever allocated in this arena.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Is the arena empty?
    pub fn is_empty(&self) -> bool {
        self.blocks.len() == 0
    }

    /// Allocate a new detached block.
    pub fn create(&mut self, kind: BlockKind) -> Block {
        self.blocks.push(BlockData {
            kind,
            parent: None,
            children: Vec::new(),
        })
    }

    /// Allocate a detached [`BlockKind::Text`] block.
    pub fn create_text(&mut self, value: impl Into<String>) -> Block {
        self.create(BlockKind::Text(value.into()))
    }

    /// Allocate a detached instruction owning `children`.
    pub fn create_instruction(&mut self, name: impl Into<String>, children: Vec<Block>) -> Block {
        let instr = self.create(BlockKind::Instruction(name.into()));
        for child in children {
            self.push(instr, child);
        }
        instr
    }

    /// The variant of `block`.
    pub fn kind(&self, block: Block) -> &BlockKind {
        &self.blocks[block].kind
    }

    /// The parent of `block`, or `None` for a root or a removed block.
    pub fn parent(&self, block: Block) -> Option<Block> {
        self.blocks[block].parent
    }

    /// The ordered children of `block`.
    pub fn children(&self, block: Block) -> &[Block] {
        &self.blocks[block].children
    }

    /// The child of `block` at `index`.
    pub fn child(&self, block: Block, index: usize) -> Option<Block> {
        self.blocks[block].children.get(index).copied()
    }

    /// The instruction name of `block`, if it is an instruction.
    pub fn name(&self, block: Block) -> Option<&str> {
        match &self.blocks[block].kind {
            BlockKind::Instruction(name) => Some(name),
            _ => None,
        }
    }

    /// Is `block` an instruction called `name`?
    pub fn is_named(&self, block: Block, name: &str) -> bool {
        self.name(block) == Some(name)
    }

    /// Is `block` an instruction?
    pub fn is_instruction(&self, block: Block) -> bool {
        matches!(self.blocks[block].kind, BlockKind::Instruction(_))
    }

    /// The literal value of a text-like block.
    pub fn text(&self, block: Block) -> Option<&str> {
        match &self.blocks[block].kind {
            BlockKind::Text(s) | BlockKind::EvaluationText(s) => Some(s),
            _ => None,
        }
    }

    /// Rename an instruction.
    pub fn rename(&mut self, block: Block, name: impl Into<String>) {
        if let BlockKind::Instruction(old) = &mut self.blocks[block].kind {
            *old = name.into();
        }
    }

    /// Replace the literal of a text block.
    pub fn set_text(&mut self, block: Block, value: impl Into<String>) {
        if let BlockKind::Text(old) = &mut self.blocks[block].kind {
            *old = value.into();
        }
    }

    /// Append `child` to `parent`, taking ownership of it.
    pub(crate) fn push(&mut self, parent: Block, child: Block) {
        self.blocks[child].parent = Some(parent);
        self.blocks[parent].children.push(child);
    }

    pub(crate) fn set_parent(&mut self, child: Block, parent: Option<Block>) {
        self.blocks[child].parent = parent;
    }

    pub(crate) fn children_mut(&mut self, block: Block) -> &mut Vec<Block> {
        &mut self.blocks[block].children
    }

    /// Collect `root` and all of its descendants in pre-order.
    ///
    /// The result is a snapshot: passes that edit the tree while walking it
    /// iterate over the snapshot and skip blocks that became detached.
    pub fn preorder(&self, root: Block) -> Vec<Block> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(block) = stack.pop() {
            out.push(block);
            stack.extend(self.children(block).iter().rev().copied());
        }
        out
    }

    /// Iterate over the strict ancestors of `block`, nearest first.
    pub fn ancestors(&self, block: Block) -> impl Iterator<Item = Block> + '_ {
        std::iter::successors(self.parent(block), move |b| self.parent(*b))
    }

    /// The nearest instruction named `func` that is `block` or one of its
    /// ancestors.
    pub fn enclosing_function(&self, block: Block) -> Option<Block> {
        std::iter::once(block)
            .chain(self.ancestors(block))
            .find(|b| self.is_named(*b, "func"))
    }

    /// Is `block` still reachable from `root`?
    pub fn is_attached(&self, block: Block, root: Block) -> bool {
        block == root || self.ancestors(block).any(|b| b == root)
    }

    /// Number of parent links between `block` and `ancestor`.
    pub fn depth(&self, block: Block, ancestor: Block) -> Option<usize> {
        if block == ancestor {
            return Some(0);
        }
        self.ancestors(block)
            .position(|b| b == ancestor)
            .map(|p| p + 1)
    }

    /// The `module` instruction of a parsed root, or the root itself if it
    /// already is one.
    pub fn module(&self, root: Block) -> Option<Block> {
        if self.is_named(root, "module") {
            return Some(root);
        }
        self.children(root)
            .iter()
            .copied()
            .find(|b| self.is_named(*b, "module"))
    }

    /// Compact text of the first child of an instruction; for most module
    /// fields this is its `$name`.
    pub fn first_value(&self, block: Block) -> Option<String> {
        self.child(block, 0).map(|c| self.string(c))
    }

    /// Find the first block in the subtree of `root` whose compact text
    /// equals `needle`.
    pub fn find_equal(&self, root: Block, needle: &str) -> Option<Block> {
        self.preorder(root)
            .into_iter()
            .filter(|b| !self.kind(*b).is_evaluation_part())
            .find(|b| self.string(*b) == needle)
    }

    /// Find every block in the subtree of `root` whose compact text equals
    /// `needle`, without descending into matches.
    pub fn find_all_equal(&self, root: Block, needle: &str) -> Vec<Block> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(block) = stack.pop() {
            if !self.kind(block).is_evaluation_part() && self.string(block) == needle {
                out.push(block);
                continue;
            }
            stack.extend(self.children(block).iter().rev().copied());
        }
        out
    }

    /// Deep-copy `block` into a new detached subtree.
    pub fn deep_clone(&mut self, block: Block) -> Block {
        let kind = self.kind(block).clone();
        let copy = self.create(kind);
        let children = self.children(block).to_vec();
        for child in children {
            let child_copy = self.deep_clone(child);
            self.push(copy, child_copy);
        }
        copy
    }
}

/// Number of top-level instructions in a code snippet.
///
/// Only parentheses at nesting depth zero are counted; quoted text is skipped.
pub fn count_instructions(code: &str) -> usize {
    let mut depth = 0usize;
    let mut count = 0;
    let mut quote = None;
    let mut prev = '\0';
    for c in code.chars() {
        match quote {
            Some(q) => {
                if c == q && prev != '\\' {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' | '`' => quote = Some(c),
                '(' => {
                    if depth == 0 {
                        count += 1;
                    }
                    depth += 1;
                }
                ')' => depth = depth.saturating_sub(1),
                _ => {}
            },
        }
        prev = c;
    }
    count
}
