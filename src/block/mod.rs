//! Fixed-size block pages.
//!
//! Every table file is a sequence of equally sized blocks. Each block begins
//! with an 11 byte header, followed by a directory of 2-byte item offsets kept
//! in key order. Items are packed from the tail of the block backwards.
//!
//! ```text
//! [revision: u32][level: u8][dir_end: u16][max_free: u16][total_free: u16]
//! [dir 0: u16][dir 1: u16]...          free space          ...[item 1][item 0]
//! ```

pub mod item;
pub mod page;
pub mod store;

pub use item::Item;
pub use page::Block;
pub use store::BlockStore;

/// Smallest supported block size.
pub const MIN_BLOCK_SIZE: usize = 2048;

/// Largest supported block size.
pub const MAX_BLOCK_SIZE: usize = 65536;

/// Offset of the first directory entry.
pub const DIR_START: usize = 11;

/// Size of one directory entry.
pub const D2: usize = 2;

/// Level byte marking a free-list block.
pub const LEVEL_FREELIST: u8 = 254;

/// Every block must be able to hold at least this many items.
pub const BLOCK_CAPACITY: usize = 4;

/// Longest key that can be stored.
pub const MAX_KEY_LEN: usize = 252;

/// Largest item that may be placed in a block of `block_size` bytes.
pub fn max_item_size(block_size: usize) -> usize {
    (block_size - DIR_START - BLOCK_CAPACITY * D2) / BLOCK_CAPACITY
}

/// Size class of `block_size` as recorded in changesets (log2 of size / 2048).
pub fn size_class(block_size: usize) -> u8 {
    (block_size.trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros()) as u8
}
