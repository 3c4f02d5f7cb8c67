//! The copy-on-write B-tree.
//!
//! A [`Table`] keeps one block per tree level in memory (its built-in
//! path). Modified blocks are given fresh block numbers the first time they
//! change in a revision, so the tree committed at the previous revision
//! stays intact on disk until the free list hands those blocks out again
//! after the next commit.

mod check;
mod cursor;
mod table;

pub use check::{CheckReport, TableReport};
pub use cursor::Cursor;
pub use table::Table;

use crate::block::Block;
use crate::error::Result;
use crate::freelist::BLK_UNUSED;
use std::cmp::Ordering;

/// Maximum height of a tree.
pub const MAX_LEVELS: usize = 10;

/// Number of consecutive appends before sequential mode kicks in.
pub(crate) const SEQ_START_POINT: i32 = -10;

/// One level of a path from the root to a leaf.
#[derive(Debug, Clone)]
pub(crate) struct Level {
    /// Block contents, possibly modified in memory.
    pub block: Block,
    /// Block number, or [`BLK_UNUSED`] when nothing is loaded.
    pub n: u32,
    /// Current item index. -1 in a leaf means "before the first item".
    pub c: isize,
    /// The block has been modified and must be written out.
    pub rewrite: bool,
}

impl Level {
    pub fn unset() -> Self {
        Self {
            block: Block::from_vec(Vec::new()),
            n: BLK_UNUSED,
            c: -1,
            rewrite: false,
        }
    }

    /// A read-only copy, as held by cursors.
    pub fn detached(&self) -> Self {
        Self {
            rewrite: false,
            ..self.clone()
        }
    }
}

impl Default for Level {
    fn default() -> Self {
        Self::unset()
    }
}

/// Blocks from the leaf (index 0) up to the root.
pub(crate) type TreePath = Vec<Level>;

/// Finds the last item in `block` that is `<= (key, component)`.
///
/// Branch item 0 stands for minus infinity, so branch searches never return
/// less than 0. Leaf searches return -1 when every item is greater. `hint`
/// is a likely answer, tried first to speed up sequential access.
pub(crate) fn find_in_block(block: &Block, key: &[u8], component: u16, leaf: bool, hint: isize) -> Result<isize> {
    let mut i: isize = if leaf { -1 } else { 0 };
    let mut j = block.count() as isize;
    let greater = |k: isize| -> Result<bool> { Ok(block.item(k as usize)?.compare(key, component) == Ordering::Greater) };

    if hint != -1 {
        if hint < j && i < hint && !greater(hint)? {
            i = hint;
        }
        let next = hint + 1;
        if next < j && i < next && greater(next)? {
            j = next;
        }
    }

    while j - i > 1 {
        let k = i + (j - i) / 2;
        if greater(k)? {
            j = k;
        } else {
            i = k;
        }
    }
    Ok(i)
}
