//! Free-list management.
//!
//! Reusable block numbers are kept in a chain of dedicated blocks. Each
//! free-list block holds 4-byte block numbers from offset 8 up to its last
//! four bytes, which link to the next block in the chain:
//!
//! ```text
//! [revision: u32][level = 254: u8][pad: 3][n][n][n]...[0xffffffff...][next: u32]
//! ```
//!
//! Entries between the read cursor and the read-end cursor may be handed out
//! by [`FreeList::get_block`]. Blocks released with
//! [`FreeList::mark_block_unused`] are appended after the read-end cursor, so
//! they only become reusable once [`FreeList::commit`] advances it. This is
//! what keeps the previous revision intact for readers.

use crate::block::{Block, BlockStore, LEVEL_FREELIST};
use crate::error::{Error, Result};
use crate::pack::{pack_uint, unpack_u32, unpack_uint};
use log::debug;

/// First byte used for entries in a free-list block.
const C_BASE: usize = 8;

/// Sentinel for "no block".
pub const BLK_UNUSED: u32 = u32::MAX;

/// Position within the free-list chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FlCursor {
    /// Free-list block number.
    n: u32,
    /// Byte offset within that block; 0 means no block yet.
    c: usize,
}

impl FlCursor {
    fn pack(&self, buf: &mut Vec<u8>) {
        pack_uint(buf, self.n as u64);
        pack_uint(buf, (self.c / 4) as u64);
    }

    fn unpack(buf: &mut &[u8]) -> Result<Self> {
        let n = unpack_u32(buf)?;
        let c = unpack_uint(buf)?;
        let c = usize::try_from(c)
            .ok()
            .and_then(|c| c.checked_mul(4))
            .ok_or_else(|| Error::corruption("Bad freelist metadata"))?;
        Ok(Self { n, c })
    }
}

/// The persistent free list of one table.
#[derive(Debug, Clone, Default)]
pub struct FreeList {
    revision: u32,
    first_unused_block: u32,
    fl: FlCursor,
    fl_end: FlCursor,
    flw: FlCursor,
    flw_appending: bool,
    /// Cached copy of the block at `fl.n`.
    p: Option<Block>,
    /// Buffer for the block at `flw.n`.
    pw: Option<Block>,
}

impl FreeList {
    /// Creates an empty free list for a new table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores state saved by [`FreeList::pack`].
    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::new());
        }
        let mut buf = data;
        let revision = unpack_u32(&mut buf)?;
        let first_unused_block = unpack_u32(&mut buf)?;
        let fl = FlCursor::unpack(&mut buf)?;
        let fl_end = FlCursor::unpack(&mut buf)?;
        if !buf.is_empty() {
            return Err(Error::corruption("Bad freelist metadata"));
        }
        Ok(Self {
            revision,
            first_unused_block,
            fl,
            fl_end,
            flw: fl_end,
            flw_appending: fl_end.c != 0,
            p: None,
            pw: None,
        })
    }

    /// Serialises the committed state.
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        pack_uint(&mut buf, self.revision as u64);
        pack_uint(&mut buf, self.first_unused_block as u64);
        self.fl.pack(&mut buf);
        self.fl_end.pack(&mut buf);
        buf
    }

    /// Starts over with `first_unused_block` and no free entries.
    pub(crate) fn rebuilt(revision: u32, first_unused_block: u32) -> Self {
        Self {
            revision,
            first_unused_block,
            ..Self::default()
        }
    }

    /// Revision of the last commit.
    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Sets the revision the next commit will be stamped with.
    pub fn set_revision(&mut self, revision: u32) {
        self.revision = revision;
    }

    /// One past the highest block number ever handed out.
    pub fn first_unused_block(&self) -> u32 {
        self.first_unused_block
    }

    /// Whether no committed free entries remain.
    pub fn is_empty(&self) -> bool {
        self.fl == self.fl_end
    }

    fn read_fl_block(store: &BlockStore, n: u32) -> Result<Block> {
        let block = store.read_block(n)?;
        if block.level() != LEVEL_FREELIST {
            return Err(Error::corruption(format!("Freelist corrupt: block {} is not a freelist block", n)));
        }
        Ok(block)
    }

    fn write_fl_block(store: &BlockStore, n: u32, block: &mut Block, rev: u32) -> Result<()> {
        block.set_revision(rev);
        block.write_u32(4, 0);
        block.set_level(LEVEL_FREELIST);
        store.write_block(n, block)
    }

    /// Hands out a block number, reusing a free one when possible.
    pub fn get_block(&mut self, store: &BlockStore) -> Result<u32> {
        let mut deferred = None;
        let n = self.next_free(store, &mut deferred)?;
        if let Some(old) = deferred {
            self.mark_block_unused(store, old)?;
        }
        Ok(n)
    }

    /// Pops the next free block. An exhausted free-list block is reported
    /// through `deferred` so the caller can release it once it is safe to.
    fn next_free(&mut self, store: &BlockStore, deferred: &mut Option<u32>) -> Result<u32> {
        let block_size = store.block_size();
        loop {
            if self.fl == self.fl_end {
                let n = self.first_unused_block;
                self.first_unused_block = n
                    .checked_add(1)
                    .filter(|&next| next != BLK_UNUSED)
                    .ok_or_else(|| Error::unimplemented("table has run out of block numbers"))?;
                return Ok(n);
            }
            let p = match &self.p {
                Some(p) => p.clone(),
                None => {
                    let p = Self::read_fl_block(store, self.fl.n)?;
                    self.p = Some(p.clone());
                    p
                }
            };
            if self.fl.c >= block_size - 4 {
                let old = self.fl.n;
                self.fl.n = p.read_u32(block_size - 4);
                self.fl.c = C_BASE;
                if self.fl.n == BLK_UNUSED {
                    return Err(Error::corruption(format!("freelist block {} has no successor", old)));
                }
                self.p = Some(Self::read_fl_block(store, self.fl.n)?);
                debug_assert!(deferred.is_none());
                *deferred = Some(old);
                debug!("freelist moved from block {} to {}", old, self.fl.n);
                continue;
            }
            let blk = p.read_u32(self.fl.c);
            if blk == BLK_UNUSED {
                return Err(Error::corruption(format!(
                    "Ran off end of freelist ({}, {})",
                    self.fl.n, self.fl.c
                )));
            }
            self.fl.c += 4;
            return Ok(blk);
        }
    }

    /// Records `blk` as free once the revision being built is committed.
    pub fn mark_block_unused(&mut self, store: &BlockStore, blk: u32) -> Result<()> {
        let block_size = store.block_size();
        let mut deferred = None;

        let mut pw = match self.pw.take() {
            Some(pw) => pw,
            None if self.flw.c != 0 => {
                self.flw_appending = true;
                Self::read_fl_block(store, self.flw.n)?
            }
            None => Block::new(block_size),
        };

        if self.flw.c == 0 {
            let n = self.next_free(store, &mut deferred)?;
            self.flw = FlCursor { n, c: C_BASE };
            if self.fl.c == 0 {
                self.fl = self.flw;
                self.fl_end = self.flw;
            }
            self.flw_appending = n + 1 == self.first_unused_block;
            pw.write_u32(block_size - 4, BLK_UNUSED);
        } else if self.flw.c >= block_size - 4 {
            // The chain can't continue into `blk` itself: it is only free
            // once the current revision is released.
            let n = self.next_free(store, &mut deferred)?;
            pw.write_u32(block_size - 4, n);
            Self::write_fl_block(store, self.flw.n, &mut pw, self.revision + 1)?;
            if self.p.is_some() && self.flw.n == self.fl.n {
                self.p = Some(pw.clone());
            }
            debug!("freelist chain extended from block {} to {}", self.flw.n, n);
            self.flw = FlCursor { n, c: C_BASE };
            self.flw_appending = n + 1 == self.first_unused_block;
            pw.write_u32(block_size - 4, BLK_UNUSED);
        }

        pw.write_u32(self.flw.c, blk);
        self.flw.c += 4;
        self.pw = Some(pw);

        if let Some(old) = deferred {
            self.mark_block_unused(store, old)?;
        }
        Ok(())
    }

    /// Writes out pending entries and makes them readable.
    pub fn commit(&mut self, store: &BlockStore) -> Result<()> {
        let block_size = store.block_size();
        if self.flw.c == 0 {
            return Ok(());
        }
        if let Some(pw) = self.pw.as_mut() {
            pw.fill(self.flw.c..block_size - 4, 0xff);
            Self::write_fl_block(store, self.flw.n, pw, self.revision)?;
            if self.p.is_some() && self.flw.n == self.fl.n {
                self.p = Some(pw.clone());
            }
            self.flw_appending = true;
            self.fl_end = self.flw;
        }
        Ok(())
    }

    /// Lists the readable free entries and the free-list blocks holding
    /// them, without consuming anything.
    pub fn walk(&self, store: &BlockStore) -> Result<FreeListWalk> {
        let block_size = store.block_size();
        let mut walk = FreeListWalk::default();
        let mut cur = self.fl;
        if cur.c == 0 {
            return Ok(walk);
        }
        let mut block = Self::read_fl_block(store, cur.n)?;
        walk.chain.push(cur.n);
        while cur != self.fl_end {
            if cur.c >= block_size - 4 {
                let next = block.read_u32(block_size - 4);
                if next == BLK_UNUSED || walk.chain.contains(&next) {
                    return Err(Error::corruption(format!("freelist chain broken after block {}", cur.n)));
                }
                cur = FlCursor { n: next, c: C_BASE };
                block = Self::read_fl_block(store, next)?;
                walk.chain.push(next);
                continue;
            }
            walk.free.push(block.read_u32(cur.c));
            cur.c += 4;
        }
        Ok(walk)
    }
}

/// Result of [`FreeList::walk`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeListWalk {
    /// Free block numbers in chain order.
    pub free: Vec<u32>,
    /// Free-list blocks in chain order.
    pub chain: Vec<u32>,
}

/// Bitmap of blocks not yet accounted for, used by the consistency check.
#[derive(Debug, Clone)]
pub struct FreeListChecker {
    bitmap: Vec<u64>,
    len: u32,
}

impl FreeListChecker {
    /// Starts with every block below `first_unused` outstanding.
    pub fn new(first_unused: u32) -> Self {
        let words = (first_unused as usize).div_ceil(64);
        let mut bitmap = vec![u64::MAX; words];
        let remainder = first_unused % 64;
        if remainder != 0 {
            if let Some(last) = bitmap.last_mut() {
                *last = (1u64 << remainder) - 1;
            }
        }
        Self {
            bitmap,
            len: first_unused,
        }
    }

    /// Accounts for `n`. Returns false if it was out of range or already
    /// accounted for.
    pub fn mark_used(&mut self, n: u32) -> bool {
        if n >= self.len {
            return false;
        }
        let (word, bit) = ((n / 64) as usize, n % 64);
        let mask = 1u64 << bit;
        let was_set = self.bitmap[word] & mask != 0;
        self.bitmap[word] &= !mask;
        was_set
    }

    /// Blocks never accounted for.
    pub fn outstanding(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for (i, &word) in self.bitmap.iter().enumerate() {
            let mut w = word;
            while w != 0 {
                let bit = w.trailing_zeros();
                out.push(i as u32 * 64 + bit);
                w &= w - 1;
            }
        }
        out
    }
}
