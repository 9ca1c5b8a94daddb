//! Tree surgery primitives.
//!
//! Every primitive reports a missing child or an out-of-range index as an
//! error; none of them silently does nothing. Inserted blocks are detached
//! from their previous parent, so moving a block is a single insertion.

use super::{Block, Code};
use crate::error::{WeaverError, WeaverResult};
use crate::instructions::is_control_flow;

/// Instructions that belong to a function header rather than to its body.
const FUNCTION_HEADER: &[&str] = &["type", "param", "result", "local", "export", "import"];

impl Code {
    pub(crate) fn block_error(&self, block: Block, msg: impl Into<String>) -> WeaverError {
        WeaverError::Block {
            block: self.string(block),
            msg: msg.into(),
        }
    }

    /// Index of `child` in `parent`'s child list.
    pub fn child_index(&self, parent: Block, child: Block) -> Option<usize> {
        self.children(parent).iter().position(|b| *b == child)
    }

    fn index_of(&self, parent: Block, child: Block) -> WeaverResult<usize> {
        self.child_index(parent, child)
            .ok_or_else(|| self.block_error(parent, "child block not found"))
    }

    /// Take ownership of `blocks`, unlinking them from wherever they were.
    /// Returns `index` adjusted for blocks that were removed before it.
    fn adopt(&mut self, parent: Block, blocks: &[Block], mut index: usize) -> usize {
        for b in blocks {
            match self.parent(*b) {
                Some(old) if old == parent => {
                    if let Some(p) = self.child_index(parent, *b) {
                        self.children_mut(parent).remove(p);
                        if p < index {
                            index -= 1;
                        }
                    }
                }
                Some(old) => self.children_mut(old).retain(|c| c != b),
                None => {}
            }
            self.set_parent(*b, Some(parent));
        }
        index
    }

    fn release(&mut self, parent: Block, removed: &[Block]) {
        for b in removed {
            if self.parent(*b) == Some(parent) && !self.children(parent).contains(b) {
                self.set_parent(*b, None);
            }
        }
    }

    /// Insert `blocks` at the position currently held by `relative`, which
    /// moves after them.
    pub fn add_children(&mut self, parent: Block, relative: Block, blocks: &[Block]) -> WeaverResult<()> {
        let index = self.index_of(parent, relative)?;
        self.add_children_by_index(parent, index, blocks)
    }

    /// Insert `blocks` so that the first one ends up at `index`. An index
    /// equal to the number of children appends.
    pub fn add_children_by_index(&mut self, parent: Block, index: usize, blocks: &[Block]) -> WeaverResult<()> {
        let len = self.children(parent).len();
        if index > len {
            return Err(WeaverError::OutOfRange { index, len });
        }
        let index = self.adopt(parent, blocks, index);
        let children = self.children_mut(parent);
        children.splice(index..index, blocks.iter().copied());
        Ok(())
    }

    /// Append `blocks` to `parent`.
    pub fn append_children(&mut self, parent: Block, blocks: &[Block]) -> WeaverResult<()> {
        let len = self.children(parent).len();
        self.add_children_by_index(parent, len, blocks)
    }

    /// Remove `child` from `parent`.
    pub fn remove_child(&mut self, parent: Block, child: Block) -> WeaverResult<()> {
        self.remove_children(parent, child, 1)
    }

    /// Remove `count` children of `parent` starting at `child`.
    pub fn remove_children(&mut self, parent: Block, child: Block, count: usize) -> WeaverResult<()> {
        let index = self.index_of(parent, child)?;
        self.remove_children_by_index(parent, index, count)
    }

    /// Remove the child at `index`.
    pub fn remove_child_by_index(&mut self, parent: Block, index: usize) -> WeaverResult<()> {
        self.remove_children_by_index(parent, index, 1)
    }

    /// Remove up to `count` children starting at `index`.
    pub fn remove_children_by_index(&mut self, parent: Block, index: usize, count: usize) -> WeaverResult<()> {
        let len = self.children(parent).len();
        if index >= len {
            return Err(WeaverError::OutOfRange { index, len });
        }
        let end = (index + count).min(len);
        let removed: Vec<Block> = self.children_mut(parent).drain(index..end).collect();
        self.release(parent, &removed);
        Ok(())
    }

    /// Replace `child` with `blocks`.
    pub fn replace_child(&mut self, parent: Block, child: Block, blocks: &[Block]) -> WeaverResult<()> {
        let index = self.index_of(parent, child)?;
        self.replace_child_by_index(parent, index, blocks)
    }

    /// Replace the child at `index` with `blocks`.
    pub fn replace_child_by_index(&mut self, parent: Block, index: usize, blocks: &[Block]) -> WeaverResult<()> {
        let len = self.children(parent).len();
        if index >= len {
            return Err(WeaverError::OutOfRange { index, len });
        }
        let old = self.children(parent)[index];
        self.children_mut(parent).remove(index);
        self.add_children_by_index(parent, index.min(self.children(parent).len()), blocks)?;
        self.release(parent, &[old]);
        Ok(())
    }

    /// Replace `child` with the blocks parsed from `code`.
    pub fn replace_child_with_code(&mut self, parent: Block, child: Block, code: &str) -> WeaverResult<Vec<Block>> {
        let blocks = self.parse_blocks(code)?;
        self.replace_child(parent, child, &blocks)?;
        Ok(blocks)
    }

    /// Remove `block` from its parent.
    pub fn detach(&mut self, block: Block) -> WeaverResult<()> {
        let parent = self
            .parent(block)
            .ok_or_else(|| self.block_error(block, "block has no parent"))?;
        self.remove_child(parent, block)
    }

    /// Replace `block` in its parent by `blocks`.
    ///
    /// A function directly under `module` is not replaced as a whole: its
    /// header is kept and only its body is swapped.
    pub fn replace_blocks(&mut self, block: Block, blocks: &[Block]) -> WeaverResult<()> {
        if self.is_named(block, "func") {
            let parent_is_module = self
                .parent(block)
                .is_some_and(|p| self.is_named(p, "module"));
            if parent_is_module || self.parent(block).is_none() {
                return self.replace_function_body(block, blocks);
            }
        }
        let parent = self
            .parent(block)
            .ok_or_else(|| self.block_error(block, "block has no parent"))?;
        self.replace_child(parent, block, blocks)
    }

    fn replace_function_body(&mut self, func: Block, blocks: &[Block]) -> WeaverResult<()> {
        let start = self
            .find_first_instruction(func)
            .unwrap_or(self.children(func).len());
        let len = self.children(func).len();
        if start < len {
            self.remove_children_by_index(func, start, len - start)?;
        }
        self.append_children(func, blocks)
    }

    /// Index of the first body block of a function, skipping its name and
    /// header fields.
    pub fn find_first_instruction(&self, func: Block) -> Option<usize> {
        self.children(func).iter().position(|b| match self.name(*b) {
            Some(name) => !FUNCTION_HEADER.contains(&name),
            None => self.text(*b).is_none(),
        })
    }

    /// Compact text of a function body.
    pub fn func_instrs_string(&self, func: Block) -> String {
        match self.find_first_instruction(func) {
            Some(start) => self.string_of(&self.children(func)[start..]),
            None => String::new(),
        }
    }

    fn top_level_index(&self, block: Block, stop: impl Fn(&Code, Block) -> bool) -> WeaverResult<(Block, usize)> {
        let mut child = block;
        let mut parent = self.parent(block);
        while let Some(p) = parent {
            if stop(self, p) {
                let index = self.index_of(p, child)?;
                return Ok((p, index));
            }
            child = p;
            parent = self.parent(p);
        }
        Err(self.block_error(block, "block is outside function code"))
    }

    /// Walk up to the enclosing `func` and return it together with the index
    /// of the top-level child that contains `block`.
    pub fn instruction_index_on_function(&self, block: Block) -> WeaverResult<(Block, usize)> {
        self.top_level_index(block, |code, b| code.is_named(b, "func"))
    }

    /// Walk up to the nearest control-flow instruction or `func` and return
    /// it together with the index of the child that contains `block`.
    pub fn instruction_index_on_control_flow(&self, block: Block) -> WeaverResult<(Block, usize)> {
        self.top_level_index(block, |code, b| match code.name(b) {
            Some(name) => name == "func" || is_control_flow(name),
            None => false,
        })
    }

    /// Insert `blocks` into the nearest control-flow ancestor of `block`,
    /// `offset` positions after the child that contains it.
    pub fn add_blocks_to_control_flow(&mut self, block: Block, blocks: &[Block], offset: usize) -> WeaverResult<()> {
        self.add_blocks_to_control_flow_with(block, blocks, |_, _, index| index + offset)
    }

    /// Like [`Code::add_blocks_to_control_flow`], with the insertion index
    /// computed from the anchor and the index of the containing child.
    pub fn add_blocks_to_control_flow_with(
        &mut self,
        block: Block,
        blocks: &[Block],
        index_fn: impl FnOnce(&Code, Block, usize) -> usize,
    ) -> WeaverResult<()> {
        let (anchor, index) = self.instruction_index_on_control_flow(block)?;
        let index = index_fn(self, anchor, index);
        self.add_children_by_index(anchor, index, blocks)
    }

    /// Parse `code` and insert it with [`Code::add_blocks_to_control_flow`].
    pub fn add_code_to_control_flow(&mut self, block: Block, code: &str, offset: usize) -> WeaverResult<()> {
        let blocks = self.parse_blocks(code)?;
        self.add_blocks_to_control_flow(block, &blocks, offset)
    }

    /// Find the nearest `return` instruction enclosing `block` within its
    /// function. Returns the return's parent, the return and its index.
    pub fn find_parent_return(&self, block: Block) -> Option<(Block, Block, usize)> {
        for ancestor in self.ancestors(block) {
            if self.is_named(ancestor, "func") {
                return None;
            }
            if self.is_named(ancestor, "return") {
                let parent = self.parent(ancestor)?;
                let index = self.child_index(parent, ancestor)?;
                return Some((parent, ancestor, index));
            }
        }
        None
    }
}
