//! Item encoding within a block.
//!
//! Item format:
//! ```text
//! [size: u16 (bit 15 = compressed)][key_len: u8][key][component: u16]
//! leaf:   [components: u16][fragment]
//! branch: [child: u32]
//! ```
//!
//! Items sort by `(key, component)`, so all components of one value are
//! adjacent. The empty key is reserved: in leaves it is the sentinel that
//! occupies the first slot of the leftmost leaf, and in branches it marks
//! the leftmost child, which compares below every key.

use crate::error::{Error, Result};
use bytes::BufMut;
use std::cmp::Ordering;

/// Size field.
pub const I2: usize = 2;
/// Key length field.
pub const K1: usize = 1;
/// Component field.
pub const C2: usize = 2;
/// Child pointer in branch items.
pub const CHILD_LEN: usize = 4;

/// Bytes a leaf item needs besides its key and fragment.
pub const LEAF_OVERHEAD: usize = I2 + K1 + C2 + C2;
/// Bytes a branch item needs besides its key.
pub const BRANCH_OVERHEAD: usize = I2 + K1 + C2 + CHILD_LEN;

const COMPRESSED_BIT: u16 = 0x8000;
const SIZE_MASK: u16 = 0x7fff;

/// A borrowed view of one item inside a block.
#[derive(Debug, Clone, Copy)]
pub struct Item<'a> {
    data: &'a [u8],
    leaf: bool,
}

impl<'a> Item<'a> {
    /// Parses the item at `offset` in `block`, checking it lies within bounds.
    pub fn parse(block: &'a [u8], offset: usize, leaf: bool) -> Result<Self> {
        let header = block
            .get(offset..offset + I2 + K1)
            .ok_or_else(|| Error::corruption(format!("item offset {} out of range", offset)))?;
        let size = (u16::from_be_bytes([header[0], header[1]]) & SIZE_MASK) as usize;
        let key_len = header[2] as usize;
        let overhead = if leaf { LEAF_OVERHEAD } else { BRANCH_OVERHEAD };
        if size < overhead + key_len {
            return Err(Error::corruption(format!(
                "item at offset {} has size {} but key length {}",
                offset, size, key_len
            )));
        }
        let data = block
            .get(offset..offset + size)
            .ok_or_else(|| Error::corruption(format!("item at offset {} overruns block", offset)))?;
        Ok(Self { data, leaf })
    }

    /// Total encoded size of the item.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Whether the value fragment is compressed.
    pub fn is_compressed(&self) -> bool {
        self.data[0] & 0x80 != 0
    }

    /// The key bytes (empty for the sentinel and for null branch keys).
    pub fn key(&self) -> &'a [u8] {
        let len = self.data[I2] as usize;
        &self.data[I2 + K1..I2 + K1 + len]
    }

    /// The 1-based component number.
    pub fn component(&self) -> u16 {
        let o = I2 + K1 + self.key().len();
        u16::from_be_bytes([self.data[o], self.data[o + 1]])
    }

    /// Total number of components of the value (leaf items only).
    pub fn components(&self) -> u16 {
        if !self.leaf {
            return 0;
        }
        let o = I2 + K1 + self.key().len() + C2;
        u16::from_be_bytes([self.data[o], self.data[o + 1]])
    }

    /// The value fragment held by a leaf item.
    pub fn fragment(&self) -> &'a [u8] {
        if !self.leaf {
            return &[];
        }
        &self.data[LEAF_OVERHEAD + self.key().len()..]
    }

    /// The child block number held by a branch item.
    pub fn child(&self) -> u32 {
        if self.leaf {
            return 0;
        }
        let o = I2 + K1 + self.key().len() + C2;
        u32::from_be_bytes([self.data[o], self.data[o + 1], self.data[o + 2], self.data[o + 3]])
    }

    /// Offset of the child pointer from the start of the item.
    pub(crate) fn child_offset(&self) -> usize {
        I2 + K1 + self.key().len() + C2
    }

    /// Orders this item against the search key `(key, component)`.
    pub fn compare(&self, key: &[u8], component: u16) -> Ordering {
        self.key().cmp(key).then(self.component().cmp(&component))
    }

    /// Raw encoded bytes.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }
}

fn put_header(buf: &mut Vec<u8>, size: usize, compressed: bool, key: &[u8], component: u16) {
    let mut size_field = size as u16;
    if compressed {
        size_field |= COMPRESSED_BIT;
    }
    buf.put_u16(size_field);
    buf.put_u8(key.len() as u8);
    buf.put_slice(key);
    buf.put_u16(component);
}

/// Encodes a leaf item holding one component of a value.
pub fn leaf_item(key: &[u8], component: u16, components: u16, compressed: bool, fragment: &[u8]) -> Vec<u8> {
    let size = LEAF_OVERHEAD + key.len() + fragment.len();
    let mut buf = Vec::with_capacity(size);
    put_header(&mut buf, size, compressed, key, component);
    buf.put_u16(components);
    buf.put_slice(fragment);
    buf
}

/// Encodes a branch item pointing at `child`.
pub fn branch_item(key: &[u8], component: u16, child: u32) -> Vec<u8> {
    let size = BRANCH_OVERHEAD + key.len();
    let mut buf = Vec::with_capacity(size);
    put_header(&mut buf, size, false, key, component);
    buf.put_u32(child);
    buf
}

/// Encodes the keyless branch item that heads every branch block.
pub fn null_branch_item(child: u32) -> Vec<u8> {
    branch_item(&[], 0, child)
}

/// Encodes the sentinel that occupies the first slot of the leftmost leaf.
pub fn sentinel_item() -> Vec<u8> {
    leaf_item(&[], 1, 1, false, &[])
}

/// Shortest prefix of `next` that still sorts after `prev`.
///
/// Used for separators entered directly above the leaves, so `next` is the
/// first key of the right-hand block and `prev` the last of the left-hand one.
pub fn separator<'k>(prev: &[u8], next: &'k [u8]) -> &'k [u8] {
    let common = prev.iter().zip(next).take_while(|(a, b)| a == b).count();
    let len = if common < next.len() { common + 1 } else { common };
    &next[..len]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_item_layout() {
        let item = leaf_item(b"apple", 2, 3, true, b"fragment");
        assert_eq!(item.len(), LEAF_OVERHEAD + 5 + 8);
        let view = Item::parse(&item, 0, true).unwrap();
        assert!(view.is_compressed());
        assert_eq!(view.key(), b"apple");
        assert_eq!(view.component(), 2);
        assert_eq!(view.components(), 3);
        assert_eq!(view.fragment(), b"fragment");
        assert_eq!(view.size(), item.len());
    }

    #[test]
    fn test_branch_item_layout() {
        let item = branch_item(b"m", 1, 0xdead_beef);
        let view = Item::parse(&item, 0, false).unwrap();
        assert!(!view.is_compressed());
        assert_eq!(view.key(), b"m");
        assert_eq!(view.child(), 0xdead_beef);

        let null = null_branch_item(7);
        let view = Item::parse(&null, 0, false).unwrap();
        assert!(view.key().is_empty());
        assert_eq!(view.child(), 7);
    }

    #[test]
    fn test_ordering_uses_component() {
        let a1 = leaf_item(b"a", 1, 2, false, b"x");
        let a2 = leaf_item(b"a", 2, 2, false, b"y");
        let v1 = Item::parse(&a1, 0, true).unwrap();
        let v2 = Item::parse(&a2, 0, true).unwrap();
        assert_eq!(v1.compare(b"a", 2), Ordering::Less);
        assert_eq!(v2.compare(b"a", 1), Ordering::Greater);
        assert_eq!(v2.compare(b"ab", 1), Ordering::Less);
        assert_eq!(v1.compare(b"a", 1), Ordering::Equal);
    }

    #[test]
    fn test_separator_truncation() {
        assert_eq!(separator(b"apple", b"banana"), b"b");
        assert_eq!(separator(b"apple", b"apricot"), b"apr");
        assert_eq!(separator(b"app", b"apple"), b"appl");
        assert_eq!(separator(b"", b"zebra"), b"z");
        assert_eq!(separator(b"same", b"same"), b"same");
    }

    #[test]
    fn test_parse_rejects_bad_items() {
        let mut item = leaf_item(b"key", 1, 1, false, b"v");
        assert!(Item::parse(&item, 1, true).is_err());
        item[2] = 200;
        assert!(Item::parse(&item, 0, true).is_err());
        let short = [0u8, 20, 0];
        assert!(Item::parse(&short, 0, true).is_err());
    }
}
