//! In-memory block buffers and the primitives that edit them.

use super::item::Item;
use super::{D2, DIR_START};
use crate::error::{Error, Result};
use std::sync::Arc;

/// A block buffer.
///
/// Blocks are shared copy-on-write: cloning is cheap, and the first edit of
/// a shared block copies it.
#[derive(Debug, Clone)]
pub struct Block {
    data: Arc<Vec<u8>>,
}

impl Block {
    /// Creates a zero-filled block.
    pub fn new(block_size: usize) -> Self {
        Self {
            data: Arc::new(vec![0u8; block_size]),
        }
    }

    /// Creates an empty node at `level` with no items.
    pub fn empty_node(block_size: usize, level: u8) -> Self {
        let mut block = Self::new(block_size);
        block.set_level(level);
        block.set_dir_end(DIR_START);
        block.set_max_free(block_size - DIR_START);
        block.set_total_free(block_size - DIR_START);
        block
    }

    /// Wraps raw block bytes.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data: Arc::new(data) }
    }

    /// Block size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true for a zero-length buffer.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    fn get_u16(&self, o: usize) -> usize {
        u16::from_be_bytes([self.data[o], self.data[o + 1]]) as usize
    }

    fn set_u16(&mut self, o: usize, v: usize) {
        self.bytes_mut()[o..o + 2].copy_from_slice(&(v as u16).to_be_bytes());
    }

    /// Reads a big-endian u32 at `o`.
    pub fn read_u32(&self, o: usize) -> u32 {
        u32::from_be_bytes([self.data[o], self.data[o + 1], self.data[o + 2], self.data[o + 3]])
    }

    /// Writes a big-endian u32 at `o`.
    pub fn write_u32(&mut self, o: usize, v: u32) {
        self.bytes_mut()[o..o + 4].copy_from_slice(&v.to_be_bytes());
    }

    /// Fills `range` with `byte`.
    pub fn fill(&mut self, range: std::ops::Range<usize>, byte: u8) {
        self.bytes_mut()[range].fill(byte);
    }

    /// Revision the block was written under.
    pub fn revision(&self) -> u32 {
        self.read_u32(0)
    }

    /// Sets the revision stamp.
    pub fn set_revision(&mut self, rev: u32) {
        self.write_u32(0, rev);
    }

    /// Tree level (0 for leaves).
    pub fn level(&self) -> u8 {
        self.data[4]
    }

    /// Sets the tree level.
    pub fn set_level(&mut self, level: u8) {
        self.bytes_mut()[4] = level;
    }

    /// Offset just past the directory.
    pub fn dir_end(&self) -> usize {
        self.get_u16(5)
    }

    fn set_dir_end(&mut self, v: usize) {
        self.set_u16(5, v);
    }

    /// Contiguous free space between the directory and the items.
    pub fn max_free(&self) -> usize {
        self.get_u16(7)
    }

    fn set_max_free(&mut self, v: usize) {
        self.set_u16(7, v);
    }

    /// All free space, including holes left by removed items.
    pub fn total_free(&self) -> usize {
        self.get_u16(9)
    }

    fn set_total_free(&mut self, v: usize) {
        self.set_u16(9, v);
    }

    /// Number of items in the directory.
    pub fn count(&self) -> usize {
        self.dir_end().saturating_sub(DIR_START) / D2
    }

    /// Whether this block is a leaf.
    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    /// Offset of item `i` as recorded in the directory.
    pub fn item_offset(&self, i: usize) -> usize {
        self.get_u16(DIR_START + i * D2)
    }

    /// Item `i` in key order.
    pub fn item(&self, i: usize) -> Result<Item<'_>> {
        if i >= self.count() {
            return Err(Error::corruption(format!(
                "item {} requested from a block holding {}",
                i,
                self.count()
            )));
        }
        let offset = self.item_offset(i);
        if offset < self.dir_end() {
            return Err(Error::corruption(format!("item offset {} overlaps the directory", offset)));
        }
        Item::parse(&self.data, offset, self.is_leaf())
    }

    /// Inserts `item` so that it becomes item `i`.
    ///
    /// The caller must have ensured `max_free() >= item.len() + D2`.
    pub fn insert_at(&mut self, i: usize, item: &[u8]) -> Result<()> {
        let needed = item.len() + D2;
        let count = self.count();
        if i > count || self.max_free() < needed {
            return Err(Error::corruption(format!(
                "no room for a {} byte item at slot {} (max_free {})",
                item.len(),
                i,
                self.max_free()
            )));
        }
        let dir_end = self.dir_end();
        let new_max = self.max_free() - needed;
        let new_total = self.total_free() - needed;
        let at = DIR_START + i * D2;
        let o = dir_end + D2 + new_max;
        let bytes = self.bytes_mut();
        bytes.copy_within(at..dir_end, at + D2);
        bytes[o..o + item.len()].copy_from_slice(item);
        self.set_u16(at, o);
        self.set_dir_end(dir_end + D2);
        self.set_max_free(new_max);
        self.set_total_free(new_total);
        Ok(())
    }

    /// Removes item `i`, leaving its bytes as a hole.
    pub fn remove_at(&mut self, i: usize) -> Result<()> {
        let size = self.item(i)?.size();
        let dir_end = self.dir_end() - D2;
        let at = DIR_START + i * D2;
        self.bytes_mut().copy_within(at + D2..dir_end + D2, at);
        self.set_dir_end(dir_end);
        let max_free = self.max_free() + D2;
        self.set_max_free(max_free);
        let total = self.total_free() + size + D2;
        self.set_total_free(total);
        Ok(())
    }

    /// Replaces item `i` with `item` if that can be done without moving
    /// other items. Returns false when there is no room.
    pub fn replace_at(&mut self, i: usize, item: &[u8]) -> Result<bool> {
        let old_size = self.item(i)?.size();
        let offset = self.item_offset(i);
        if item.len() <= old_size {
            self.bytes_mut()[offset..offset + item.len()].copy_from_slice(item);
            let total = self.total_free() + old_size - item.len();
            self.set_total_free(total);
            return Ok(true);
        }
        let grow = item.len() - old_size;
        if self.max_free() < item.len() || self.total_free() < grow {
            return Ok(false);
        }
        let new_max = self.max_free() - item.len();
        let o = self.dir_end() + new_max;
        self.bytes_mut()[o..o + item.len()].copy_from_slice(item);
        self.set_u16(DIR_START + i * D2, o);
        self.set_max_free(new_max);
        let total = self.total_free() - grow;
        self.set_total_free(total);
        Ok(true)
    }

    /// Points branch item `i` at block `n`.
    pub fn set_child(&mut self, i: usize, n: u32) -> Result<()> {
        let item = self.item(i)?;
        if item.size() < item.child_offset() + 4 {
            return Err(Error::corruption("branch item too short for a child pointer"));
        }
        let o = self.item_offset(i) + item.child_offset();
        self.write_u32(o, n);
        Ok(())
    }

    /// Repacks all items against the tail so that `max_free == total_free`.
    pub fn compact(&mut self) -> Result<()> {
        let block_size = self.len();
        let dir_end = self.dir_end();
        let mut scratch = vec![0u8; block_size];
        let mut e = block_size;
        let mut offsets = Vec::with_capacity(self.count());
        for i in 0..self.count() {
            let item = self.item(i)?;
            let size = item.size();
            if e < dir_end + size {
                return Err(Error::corruption("items overflow the block during compaction"));
            }
            e -= size;
            scratch[e..e + size].copy_from_slice(item.as_bytes());
            offsets.push(e);
        }
        let bytes = self.bytes_mut();
        bytes[e..].copy_from_slice(&scratch[e..]);
        for (i, o) in offsets.into_iter().enumerate() {
            self.set_u16(DIR_START + i * D2, o);
        }
        let free = e - dir_end;
        self.set_max_free(free);
        self.set_total_free(free);
        Ok(())
    }

    /// Keeps items `0..m` only.
    pub fn truncate(&mut self, m: usize) -> Result<()> {
        self.set_dir_end(DIR_START + m.min(self.count()) * D2);
        self.compact()
    }

    /// Drops items `0..m`, shifting the rest down.
    pub fn drain_front(&mut self, m: usize) -> Result<()> {
        let dir_end = self.dir_end();
        let from = DIR_START + m.min(self.count()) * D2;
        self.bytes_mut().copy_within(from..dir_end, DIR_START);
        self.set_dir_end(dir_end - (from - DIR_START));
        self.compact()
    }

    /// Directory slot that splits the item bytes roughly in half.
    ///
    /// Always leaves at least one item on each side.
    pub fn mid_point(&self) -> Result<usize> {
        let count = self.count();
        if count < 2 {
            return Err(Error::corruption("cannot split a block with fewer than two items"));
        }
        let size = self.len() - self.total_free() - self.dir_end();
        let mut n = 0;
        let mut m = count;
        for i in 0..count {
            let l = self.item(i)?.size();
            n += 2 * l;
            if n >= size {
                m = if l < n - size { i } else { i + 1 };
                break;
            }
        }
        Ok(m.clamp(1, count - 1))
    }

    /// Verifies the directory and free-space accounting.
    pub fn validate(&self) -> Result<()> {
        let dir_end = self.dir_end();
        if dir_end < DIR_START || dir_end > self.len() || (dir_end - DIR_START) % D2 != 0 {
            return Err(Error::corruption(format!("dir_end {} invalid", dir_end)));
        }
        let mut used = 0;
        let mut lowest = self.len();
        for i in 0..self.count() {
            let item = self.item(i)?;
            used += item.size();
            lowest = lowest.min(self.item_offset(i));
        }
        if self.total_free() != self.len() - dir_end - used {
            return Err(Error::corruption(format!(
                "total_free {} but {} bytes are unaccounted for",
                self.total_free(),
                self.len() - dir_end - used
            )));
        }
        if self.max_free() > lowest - dir_end {
            return Err(Error::corruption(format!(
                "max_free {} exceeds the gap of {}",
                self.max_free(),
                lowest - dir_end
            )));
        }
        Ok(())
    }
}
