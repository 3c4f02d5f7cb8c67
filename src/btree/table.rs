//! A single B-tree table stored in one file.

use super::cursor::Cursor;
use super::{find_in_block, Level, TreePath, MAX_LEVELS, SEQ_START_POINT};
use crate::block::item::{branch_item, leaf_item, null_branch_item, sentinel_item, separator, LEAF_OVERHEAD};
use crate::block::{max_item_size, Block, BlockStore, D2, MAX_KEY_LEN};
use crate::changes::ChangesetWriter;
use crate::compress::{decompress, try_compress};
use crate::config::CompressionType;
use crate::error::{Error, Result};
use crate::freelist::{FreeList, BLK_UNUSED};
use crate::version::RootInfo;
use log::{debug, info, trace, warn};
use parking_lot::{Mutex, MutexGuard};
use std::mem;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Bytes a full-compaction first component must be able to hold beyond the
/// key before it is worth filling the free tail of a leaf.
const FULL_COMPACTION_SLACK: usize = 34;

/// Upper bound on the buffer reserved up front when reassembling a value.
const TAG_RESERVE_LIMIT: usize = 1 << 20;

fn tag_capacity(chunk: usize, components: u16) -> usize {
    chunk.saturating_mul(components as usize).min(TAG_RESERVE_LIMIT)
}

fn key_repr(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_argument("Keys must not be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::invalid_argument(format!(
            "Key too long: length was {} bytes, maximum length of a key is {} bytes",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

/// An ordered key-value table backed by a copy-on-write B-tree.
///
/// A writable table collects modifications in memory and in fresh blocks
/// until [`Table::commit`] publishes them as a new revision, or
/// [`Table::cancel`] throws them away. Readers opened at an older revision
/// keep seeing that revision until the blocks it uses are reused.
///
/// # Example
///
/// ```rust,no_run
/// use larch::{Options, RootInfo, Table};
///
/// # fn main() -> Result<(), larch::Error> {
/// let root = RootInfo::new(&Options::default());
/// let mut table = Table::create("/tmp/postlist.lrt", &root, false)?;
/// table.add(b"apple", b"red")?;
/// let root = table.commit(1)?;
/// assert_eq!(table.get_exact_entry(b"apple")?, Some(b"red".to_vec()));
/// # let _ = root;
/// # Ok(())
/// # }
/// ```
pub struct Table {
    name: String,
    store: Option<BlockStore>,
    writable: bool,
    dangerous: bool,
    block_size: usize,
    max_item_size: usize,
    compression: CompressionType,
    compress_min: u32,

    /// Revision the table is open at.
    revision: u32,
    /// Root info of `revision`, restored by `cancel()`.
    committed: RootInfo,

    root: u32,
    level: usize,
    item_count: u64,
    faked_root: bool,
    sequential: bool,
    free_list: FreeList,

    /// The built-in path. Mutators take it out for the duration of the
    /// operation; readers lock it.
    path: Mutex<TreePath>,

    full_compaction: bool,
    seq_count: i32,
    changed_n: u32,
    changed_c: isize,
    modified: bool,
    last_readahead: AtomicU32,
}

impl Table {
    /// Creates a new, empty table file at `path`.
    pub fn create<P: AsRef<Path>>(path: P, root_info: &RootInfo, dangerous: bool) -> Result<Self> {
        let store = BlockStore::create(path, root_info.block_size)?;
        info!("created table {:?} with block size {}", store.path(), root_info.block_size);
        Self::with_store(store, root_info, 0, true, dangerous)
    }

    /// Opens an existing table for writing at `revision`.
    pub fn open<P: AsRef<Path>>(path: P, root_info: &RootInfo, revision: u32, dangerous: bool) -> Result<Self> {
        let store = BlockStore::open(path, root_info.block_size, true)?;
        Self::with_store(store, root_info, revision, true, dangerous)
    }

    /// Opens an existing table for reading at `revision`.
    pub fn open_readonly<P: AsRef<Path>>(path: P, root_info: &RootInfo, revision: u32) -> Result<Self> {
        let store = BlockStore::open(path, root_info.block_size, false)?;
        Self::with_store(store, root_info, revision, false, false)
    }

    fn with_store(store: BlockStore, root_info: &RootInfo, revision: u32, writable: bool, dangerous: bool) -> Result<Self> {
        let name = store
            .path()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let block_size = store.block_size();
        let mut table = Self {
            name,
            store: Some(store),
            writable,
            dangerous,
            block_size,
            max_item_size: max_item_size(block_size),
            compression: root_info.compression,
            compress_min: root_info.compress_min,
            revision,
            committed: root_info.clone(),
            root: 0,
            level: 0,
            item_count: 0,
            faked_root: true,
            sequential: true,
            free_list: FreeList::new(),
            path: Mutex::new(Vec::new()),
            full_compaction: false,
            seq_count: SEQ_START_POINT,
            changed_n: 0,
            changed_c: 0,
            modified: false,
            last_readahead: AtomicU32::new(BLK_UNUSED),
        };
        table.apply_root_info(root_info)?;
        table.read_root()?;
        debug!(
            "opened table {} at revision {} ({}, {} levels, {} entries)",
            table.name,
            revision,
            if writable { "writable" } else { "read-only" },
            table.level + 1,
            table.item_count
        );
        Ok(table)
    }

    fn apply_root_info(&mut self, root_info: &RootInfo) -> Result<()> {
        if root_info.block_size != self.block_size {
            return Err(Error::corruption(format!(
                "root info block size {} doesn't match table block size {}",
                root_info.block_size, self.block_size
            )));
        }
        let level = root_info.level as usize;
        if level >= MAX_LEVELS || (root_info.root_is_fake && level != 0) {
            return Err(Error::corruption(format!("root info has impossible level {}", level)));
        }
        self.root = root_info.root;
        self.level = level;
        self.item_count = root_info.num_entries;
        self.faked_root = root_info.root_is_fake;
        self.sequential = root_info.sequential;
        self.compress_min = root_info.compress_min;
        self.compression = root_info.compression;
        self.free_list = FreeList::unpack(&root_info.free_list)?;
        self.committed = root_info.clone();
        Ok(())
    }

    /// Rebuilds the built-in path from the root.
    fn read_root(&mut self) -> Result<()> {
        let mut path: TreePath = (0..=self.level).map(|_| Level::unset()).collect();
        if self.faked_root {
            let mut block = Block::empty_node(self.block_size, 0);
            block.insert_at(0, &sentinel_item())?;
            // A writer allocates the real block on first modification.
            let (revision, n) = if self.writable { (self.revision + 1, BLK_UNUSED) } else { (0, 0) };
            block.set_revision(revision);
            path[0] = Level {
                block,
                n,
                c: -1,
                rewrite: false,
            };
        } else {
            self.load_level(&mut path, self.level, self.root, None)?;
            if path[self.level].block.revision() > self.revision {
                return Err(self.overwritten());
            }
        }
        *self.path.get_mut() = path;
        Ok(())
    }

    fn overwritten(&self) -> Error {
        if self.writable {
            Error::corruption("Db block overwritten - are there multiple writers?")
        } else {
            Error::modified("The revision being read has been discarded - reopen the database and retry the operation")
        }
    }

    pub(super) fn store(&self) -> Result<&BlockStore> {
        self.store.as_ref().ok_or(Error::Closed)
    }

    fn check_writable(&self) -> Result<()> {
        self.store()?;
        if !self.writable {
            return Err(Error::invalid_operation(format!("table {} is open read-only", self.name)));
        }
        Ok(())
    }

    pub(super) fn builtin(&self) -> MutexGuard<'_, TreePath> {
        self.path.lock()
    }

    /// Puts block `n` at level `j` of `path`.
    ///
    /// A dirty block already at that level is written out first. Blocks also
    /// held by `builtin` are shared from there, since the on-disk copy may be
    /// stale.
    pub(super) fn load_level(&self, path: &mut TreePath, j: usize, n: u32, builtin: Option<&TreePath>) -> Result<()> {
        if path[j].n == n {
            return Ok(());
        }
        let store = self.store()?;
        if path[j].rewrite {
            store.write_block(path[j].n, &path[j].block)?;
            path[j].rewrite = false;
        }
        let block = match builtin.and_then(|b| b.get(j)).filter(|l| l.n == n) {
            Some(level) => level.block.clone(),
            None => store.read_block(n)?,
        };
        if j + 1 < path.len() && block.revision() > path[j + 1].block.revision() {
            return Err(self.overwritten());
        }
        if block.level() as usize != j {
            return Err(Error::corruption(format!(
                "Expected block {} to be level {}, not {}",
                n,
                j,
                block.level()
            )));
        }
        path[j].block = block;
        path[j].n = n;
        Ok(())
    }

    /// Descends to the leaf where `(key, component)` belongs.
    ///
    /// Leaves `path[0].c` at the last item `<=` the search key and returns
    /// whether it is an exact match.
    pub(super) fn find(&self, path: &mut TreePath, key: &[u8], component: u16, builtin: Option<&TreePath>) -> Result<bool> {
        let level = path.len() - 1;
        for j in (1..=level).rev() {
            let c = find_in_block(&path[j].block, key, component, false, path[j].c)?;
            path[j].c = c;
            let child = path[j].block.item(c as usize)?.child();
            self.load_level(path, j - 1, child, builtin)?;
        }
        let c = find_in_block(&path[0].block, key, component, true, path[0].c)?;
        path[0].c = c;
        if c < 0 {
            return Ok(false);
        }
        Ok(path[0].block.item(c as usize)?.compare(key, component) == std::cmp::Ordering::Equal)
    }

    /// Moves `path` to the next leaf item. Returns false at the end.
    pub(super) fn next_item(&self, path: &mut TreePath, builtin: Option<&TreePath>) -> Result<bool> {
        let level = path.len() - 1;
        let mut j = 0;
        loop {
            let c = path[j].c + 1;
            if (c as usize) < path[j].block.count() {
                path[j].c = c;
                break;
            }
            if j == level {
                return Ok(false);
            }
            j += 1;
        }
        while j > 0 {
            let child = path[j].block.item(path[j].c as usize)?.child();
            self.load_level(path, j - 1, child, builtin)?;
            j -= 1;
            path[j].c = 0;
        }
        Ok(true)
    }

    /// Moves `path` to the previous leaf item. Returns false at the start.
    pub(super) fn prev_item(&self, path: &mut TreePath, builtin: Option<&TreePath>) -> Result<bool> {
        let level = path.len() - 1;
        let mut j = 0;
        loop {
            if path[j].c > 0 {
                path[j].c -= 1;
                break;
            }
            if j == level {
                return Ok(false);
            }
            j += 1;
        }
        while j > 0 {
            let child = path[j].block.item(path[j].c as usize)?.child();
            self.load_level(path, j - 1, child, builtin)?;
            j -= 1;
            path[j].c = path[j].block.count() as isize - 1;
        }
        Ok(true)
    }

    /// Reassembles the value whose first component `path[0]` is on.
    ///
    /// Leaves `path[0]` on the last component.
    pub(super) fn read_tag(&self, path: &mut TreePath, builtin: Option<&TreePath>) -> Result<Vec<u8>> {
        let c = usize::try_from(path[0].c).map_err(|_| Error::corruption("no entry to read"))?;
        let first = path[0].block.item(c)?;
        let key = first.key().to_vec();
        let components = first.components();
        let compressed = first.is_compressed();
        if first.component() != 1 || components == 0 {
            return Err(Error::corruption(format!(
                "entry {:?} starts with component {} of {}",
                key_repr(&key),
                first.component(),
                components
            )));
        }
        let chunk = self.max_item_size.saturating_sub(LEAF_OVERHEAD + key.len());
        let mut tag = Vec::with_capacity(tag_capacity(chunk, components));
        tag.extend_from_slice(first.fragment());

        for i in 2..=components {
            if !self.next_item(path, builtin)? {
                return Err(Error::corruption("Unexpected end of table when reading continuation of tag"));
            }
            let item = path[0].block.item(path[0].c as usize)?;
            if item.key() != key.as_slice() || item.component() != i || item.components() != components {
                return Err(Error::corruption(format!(
                    "component sequence broken for key {:?}: expected {} of {}, found {} of {}",
                    key_repr(&key),
                    i,
                    components,
                    item.component(),
                    item.components()
                )));
            }
            tag.extend_from_slice(item.fragment());
        }

        if compressed {
            decompress(self.compression, &tag)
        } else {
            Ok(tag)
        }
    }

    // Mutation.

    fn get_block(&mut self) -> Result<u32> {
        let store = self.store.as_ref().ok_or(Error::Closed)?;
        self.free_list.get_block(store)
    }

    fn mark_unused(&mut self, n: u32) -> Result<()> {
        let store = self.store.as_ref().ok_or(Error::Closed)?;
        self.free_list.mark_block_unused(store, n)
    }

    /// Runs a mutation against the built-in path, rolling back to the last
    /// commit if it fails part way.
    fn mutate<T>(&mut self, f: impl FnOnce(&mut Self, &mut TreePath) -> Result<T>) -> Result<T> {
        let mut path = mem::take(self.path.get_mut());
        let result = f(self, &mut path);
        *self.path.get_mut() = path;
        if let Err(e) = &result {
            // Argument checks run before the closure, so any error here may
            // have left the path part way through an edit.
            if !self.dangerous && !matches!(e, Error::Closed) {
                warn!("table {}: rolling back to revision {} after error: {}", self.name, self.revision, e);
                if let Err(cancel_err) = self.cancel() {
                    warn!("table {}: rollback failed: {}", self.name, cancel_err);
                }
            }
        }
        result
    }

    /// Gives every block on the path that is about to change a number that
    /// is free in the committed revision.
    fn alter(&mut self, path: &mut TreePath) -> Result<()> {
        if self.dangerous {
            path[0].rewrite = true;
            if path[0].n == BLK_UNUSED {
                path[0].n = self.get_block()?;
            }
            return Ok(());
        }
        let next_revision = self.revision + 1;
        let mut j = 0;
        loop {
            if path[j].rewrite {
                return Ok(());
            }
            path[j].rewrite = true;
            if path[j].block.revision() == next_revision {
                if path[j].n == BLK_UNUSED {
                    path[j].n = self.get_block()?;
                }
                return Ok(());
            }
            let old = path[j].n;
            self.mark_unused(old)?;
            path[j].block.set_revision(next_revision);
            let n = self.get_block()?;
            trace!("table {}: level {} block {} moves to {}", self.name, j, old, n);
            path[j].n = n;
            if j == self.level {
                return Ok(());
            }
            j += 1;
            let c = path[j].c as usize;
            path[j].block.set_child(c, n)?;
        }
    }

    /// Inserts `item` at `path[j].c`, splitting blocks upwards as needed.
    fn add_item(&mut self, path: &mut TreePath, item: Vec<u8>, j: usize) -> Result<()> {
        let mut pending = Some((item, j));
        while let Some((item, j)) = pending.take() {
            let needed = item.len() + D2;
            let c = usize::try_from(path[j].c).map_err(|_| Error::corruption("insert position before block start"))?;

            if path[j].block.total_free() >= needed {
                if path[j].block.max_free() < needed {
                    path[j].block.compact()?;
                }
                path[j].block.insert_at(c, &item)?;
                if j == 0 {
                    self.changed_n = path[0].n;
                    self.changed_c = c as isize;
                }
                continue;
            }

            // Random inserts split at the midpoint; sequential ones at the
            // insertion point, so the left half stays full.
            let m = if self.seq_count < 0 { path[j].block.mid_point()? } else { c };
            let split_n = path[j].n;
            let upper_n = self.get_block()?;
            let mut split = path[j].block.clone();
            split.truncate(m)?;
            path[j].block.drain_front(m)?;
            path[j].n = upper_n;

            let to_upper = if self.seq_count < 0 { c >= m } else { split.total_free() < needed };
            let (n, c) = if to_upper {
                path[j].block.insert_at(c - m, &item)?;
                path[j].c = (c - m) as isize;
                (upper_n, c - m)
            } else {
                split.insert_at(c, &item)?;
                (split_n, c)
            };
            if j == 0 {
                self.changed_n = n;
                self.changed_c = c as isize;
            }
            debug!(
                "table {}: split level {} block {} at item {} (upper half now block {})",
                self.name, j, split_n, m, upper_n
            );
            self.write_split(split_n, &split)?;

            if j == self.level {
                self.split_root(path, split_n)?;
            }

            let last = split
                .count()
                .checked_sub(1)
                .ok_or_else(|| Error::corruption("split left an empty lower half"))?;
            let prev_key = split.item(last)?.key().to_vec();
            let first = path[j].block.item(0)?;
            let (next_key, next_component) = (first.key().to_vec(), first.component());
            pending = Some(self.enter_key(path, j + 1, &prev_key, &next_key, next_component)?);
        }
        Ok(())
    }

    fn write_split(&self, n: u32, block: &Block) -> Result<()> {
        self.store()?.write_block(n, block)
    }

    /// Adds a level above the current root, pointing at `split_n`.
    fn split_root(&mut self, path: &mut TreePath, split_n: u32) -> Result<()> {
        let level = self.level + 1;
        if level >= MAX_LEVELS {
            return Err(Error::corruption(format!("Btree has grown impossibly large ({} levels)", MAX_LEVELS)));
        }
        let mut block = Block::empty_node(self.block_size, level as u8);
        block.set_revision(self.revision + 1);
        block.insert_at(0, &null_branch_item(split_n))?;
        let n = self.get_block()?;
        path.push(Level {
            block,
            n,
            c: 0,
            rewrite: true,
        });
        self.level = level;
        info!("table {}: root split, tree now has {} levels", self.name, level + 1);
        Ok(())
    }

    /// Builds the separator for the block at `path[j - 1]` and positions
    /// `path[j]` to receive it.
    ///
    /// `prev_key` is the last key of the left-hand block and `next_key` the
    /// first of the right-hand one. Only separators directly above the
    /// leaves are truncated; higher up the full key is kept and the first
    /// item of the right-hand block becomes the null key instead.
    fn enter_key(
        &mut self,
        path: &mut TreePath,
        j: usize,
        prev_key: &[u8],
        next_key: &[u8],
        next_component: u16,
    ) -> Result<(Vec<u8>, usize)> {
        let child = path[j - 1].n;
        let key = if j == 1 { separator(prev_key, next_key) } else { next_key };
        let item = branch_item(key, next_component, child);

        if j > 1 {
            let first_child = path[j - 1].block.item(0)?.child();
            path[j - 1].block.replace_at(0, &null_branch_item(first_child))?;
        }

        path[j].c = find_in_block(&path[j].block, key, next_component, false, 0)? + 1;
        path[j].rewrite = true;
        Ok((item, j))
    }

    /// Removes the item at `path[j].c`.
    ///
    /// With `repeatedly`, blocks emptied by the removal are freed and their
    /// parent entries removed in turn, and a root left with a single child
    /// is replaced by that child.
    fn delete_item(&mut self, path: &mut TreePath, j: usize, repeatedly: bool) -> Result<()> {
        let mut j = j;
        loop {
            let c = usize::try_from(path[j].c).map_err(|_| Error::corruption("delete position before block start"))?;
            path[j].block.remove_at(c)?;
            if !repeatedly {
                return Ok(());
            }
            if j < self.level {
                if path[j].block.count() != 0 {
                    return Ok(());
                }
                let n = path[j].n;
                self.mark_unused(n)?;
                debug!("table {}: freed empty level {} block {}", self.name, j, n);
                path[j].rewrite = false;
                path[j].n = BLK_UNUSED;
                path[j + 1].rewrite = true;
                j += 1;
                continue;
            }
            while self.level > 0 && path[self.level].block.count() == 1 {
                let new_root = path[self.level].block.item(0)?.child();
                let old_root = path[self.level].n;
                self.mark_unused(old_root)?;
                path.pop();
                self.level -= 1;
                self.load_level(path, self.level, new_root, None)?;
                info!(
                    "table {}: root {} collapsed into {}, tree now has {} levels",
                    self.name,
                    old_root,
                    new_root,
                    self.level + 1
                );
            }
            return Ok(());
        }
    }

    /// Stores one leaf item found (or not) by the preceding `find`.
    ///
    /// Returns the component count of the item replaced, or 0.
    fn add_kt(&mut self, path: &mut TreePath, found: bool, item: &[u8]) -> Result<u16> {
        self.alter(path)?;
        if found {
            self.seq_count = SEQ_START_POINT;
            self.sequential = false;
            let c = path[0].c as usize;
            let components = path[0].block.item(c)?.components();
            if !path[0].block.replace_at(c, item)? {
                self.delete_item(path, 0, false)?;
                self.add_item(path, item.to_vec(), 0)?;
            }
            return Ok(components);
        }
        if self.changed_n == path[0].n && self.changed_c == path[0].c {
            if self.seq_count < 0 {
                self.seq_count += 1;
            }
        } else {
            self.seq_count = SEQ_START_POINT;
            self.sequential = false;
        }
        path[0].c += 1;
        self.add_item(path, item.to_vec(), 0)?;
        Ok(0)
    }

    /// Deletes component `component` of `key` if present.
    ///
    /// Returns the component count of the deleted item, or 0.
    fn delete_kt(&mut self, path: &mut TreePath, key: &[u8], component: u16) -> Result<u16> {
        if !self.find(path, key, component, None)? {
            return Ok(0);
        }
        self.seq_count = SEQ_START_POINT;
        self.sequential = false;
        let components = path[0].block.item(path[0].c as usize)?.components();
        self.alter(path)?;
        self.delete_item(path, 0, true)?;
        Ok(components)
    }

    fn add_entry(&mut self, path: &mut TreePath, key: &[u8], tag: &[u8], compressed: bool) -> Result<()> {
        let cd = key.len() + LEAF_OVERHEAD;
        let l = self.max_item_size - cd;
        let mut first_l = l;

        let mut found = self.find(path, key, 1, None)?;
        if !found {
            // Fill the free tail of the target leaf with the first component
            // when that doesn't cost an extra component.
            let n = path[0].block.total_free() % (self.max_item_size + D2);
            if n > D2 + cd {
                let n = n - (D2 + cd);
                let last = tag.len() % l;
                if n >= last || (self.full_compaction && n >= key.len() + FULL_COMPACTION_SLACK) {
                    first_l = n;
                }
            }
        }

        let mut m = if tag.is_empty() { 1 } else { (tag.len() + l - 1 - first_l) / l + 1 };
        if m > u16::MAX as usize {
            // A short first component can cost one more; check_components
            // already allowed the count without it.
            first_l = l;
            m = (tag.len() - 1) / l + 1;
        }

        let mut o = 0;
        let mut old_components = 0;
        let mut replacement = false;
        for i in 1..=m {
            let len = if i == m {
                tag.len() - o
            } else if i == 1 {
                first_l
            } else {
                l
            };
            let component = i as u16;
            let item = leaf_item(key, component, m as u16, compressed, &tag[o..o + len]);
            o += len;
            if i > 1 {
                found = self.find(path, key, component, None)?;
            }
            old_components = self.add_kt(path, found, &item)?;
            if old_components > 0 {
                replacement = true;
            }
        }
        for i in (m + 1)..=(old_components as usize) {
            self.delete_kt(path, key, i as u16)?;
        }

        if !replacement {
            self.item_count += 1;
        }
        self.modified = true;
        Ok(())
    }

    /// Rejects values needing more components than an item can number.
    fn check_components(&self, key: &[u8], tag: &[u8]) -> Result<()> {
        let l = self.max_item_size - (key.len() + LEAF_OVERHEAD);
        let m = if tag.is_empty() { 1 } else { (tag.len() - 1) / l + 1 };
        if m > u16::MAX as usize {
            return Err(Error::unimplemented(format!(
                "Can't handle insanely large tags ({} bytes in {} components)",
                tag.len(),
                m
            )));
        }
        Ok(())
    }

    fn add_impl(&mut self, key: &[u8], value: &[u8], already_compressed: bool) -> Result<()> {
        self.check_writable()?;
        check_key(key)?;
        let compressed_value;
        let (tag, compressed) = if already_compressed {
            (value, true)
        } else {
            match try_compress(self.compression, self.compress_min as usize, value) {
                Some(v) => {
                    compressed_value = v;
                    (compressed_value.as_slice(), true)
                }
                None => (value, false),
            }
        };
        self.check_components(key, tag)?;
        self.mutate(|table, path| table.add_entry(path, key, tag, compressed))
    }

    /// Stores `value` under `key`, replacing any existing value.
    ///
    /// Values longer than the compression threshold are compressed if that
    /// makes them smaller. Values too large for a single item are split
    /// into components.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.add_impl(key, value, false)
    }

    /// Stores a value already compressed with this table's compression type.
    pub fn add_compressed(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.add_impl(key, value, true)
    }

    /// Removes `key`. Returns false if it wasn't present.
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        self.check_writable()?;
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Ok(false);
        }
        self.mutate(|table, path| {
            let n = table.delete_kt(path, key, 1)?;
            if n == 0 {
                return Ok(false);
            }
            for i in 2..=n {
                table.delete_kt(path, key, i)?;
            }
            table.item_count -= 1;
            table.modified = true;
            Ok(true)
        })
    }

    /// Reads the value stored under `key`.
    pub fn get_exact_entry(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.store()?;
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Ok(None);
        }
        let mut path = self.path.lock();
        if !self.find(&mut path, key, 1, None)? {
            return Ok(None);
        }
        self.read_tag(&mut path, None).map(Some)
    }

    /// Returns true if `key` is present.
    pub fn key_exists(&self, key: &[u8]) -> Result<bool> {
        self.store()?;
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Ok(false);
        }
        let mut path = self.path.lock();
        self.find(&mut path, key, 1, None)
    }

    /// Reads the leaf `key` would be stored in ahead of an expected lookup.
    ///
    /// Returns true if a block was read. Trees with a single level and
    /// leaves already in memory or just read ahead are skipped.
    pub fn readahead(&self, key: &[u8]) -> Result<bool> {
        let store = self.store()?;
        if self.level == 0 || key.is_empty() || key.len() > MAX_KEY_LEN {
            return Ok(false);
        }
        let builtin = self.path.lock();
        let mut path: TreePath = builtin.iter().map(Level::detached).collect();
        for j in (2..=self.level).rev() {
            let c = find_in_block(&path[j].block, key, 1, false, path[j].c)?;
            path[j].c = c;
            let child = path[j].block.item(c as usize)?.child();
            self.load_level(&mut path, j - 1, child, Some(&builtin))?;
        }
        let c = find_in_block(&path[1].block, key, 1, false, path[1].c)?;
        let leaf = path[1].block.item(c as usize)?.child();
        if leaf == builtin[0].n || leaf == self.last_readahead.load(Ordering::Relaxed) {
            return Ok(false);
        }
        self.last_readahead.store(leaf, Ordering::Relaxed);
        store.read_block(leaf)?;
        trace!("table {}: read ahead block {}", self.name, leaf);
        Ok(true)
    }

    /// Opens a cursor over the entries visible to this table.
    pub fn cursor(&self) -> Result<Cursor<'_>> {
        Cursor::new(self)
    }

    /// Writes every modified block on the built-in path.
    pub fn flush(&mut self) -> Result<()> {
        self.check_writable()?;
        let store = self.store.as_ref().ok_or(Error::Closed)?;
        for level in self.path.get_mut().iter_mut().rev() {
            if level.rewrite {
                store.write_block(level.n, &level.block)?;
                level.rewrite = false;
            }
        }
        if self.modified {
            self.faked_root = false;
        }
        Ok(())
    }

    /// Publishes all changes as `revision`, which must exceed the current one.
    ///
    /// Returns the root info the version file needs to reopen the table at
    /// the new revision.
    pub fn commit(&mut self, revision: u32) -> Result<RootInfo> {
        self.check_writable()?;
        if revision <= self.revision {
            return Err(Error::invalid_argument(format!(
                "New revision {} too low: table {} is at revision {}",
                revision, self.name, self.revision
            )));
        }
        self.flush()?;

        let root = if self.faked_root { 0 } else { self.path.get_mut()[self.level].n };
        let store = self.store.as_ref().ok_or(Error::Closed)?;
        self.free_list.set_revision(revision);
        self.free_list.commit(store)?;

        let root_info = RootInfo {
            root,
            level: self.level as u32,
            num_entries: self.item_count,
            root_is_fake: self.faked_root,
            sequential: self.sequential,
            block_size: self.block_size,
            compress_min: self.compress_min,
            compression: self.compression,
            free_list: self.free_list.pack(),
        };
        self.root = root;
        self.revision = revision;
        self.committed = root_info.clone();
        self.modified = false;
        self.read_root()?;
        self.reset_sequential_state();
        info!(
            "table {} committed revision {} (root {}, {} levels, {} entries)",
            self.name,
            revision,
            root,
            self.level + 1,
            self.item_count
        );
        Ok(root_info)
    }

    /// Discards everything since the last commit.
    pub fn cancel(&mut self) -> Result<()> {
        self.check_writable()?;
        if self.dangerous {
            return Err(Error::invalid_operation("cancel() not supported in dangerous mode"));
        }
        let root_info = self.committed.clone();
        self.cancel_to(&root_info, self.revision)
    }

    /// Resets the table to `root_info` at `revision`.
    pub(crate) fn cancel_to(&mut self, root_info: &RootInfo, revision: u32) -> Result<()> {
        self.check_writable()?;
        self.revision = revision;
        self.apply_root_info(root_info)?;
        self.modified = false;
        self.read_root()?;
        self.reset_sequential_state();
        info!("table {} reset to revision {}", self.name, revision);
        Ok(())
    }

    fn reset_sequential_state(&mut self) {
        self.changed_n = 0;
        self.changed_c = 0;
        self.seq_count = SEQ_START_POINT;
    }

    /// Closes the table. Later calls fail with [`Error::Closed`].
    pub fn close(&mut self) {
        if self.store.take().is_some() {
            debug!("closed table {}", self.name);
        }
        self.path.get_mut().clear();
    }

    /// Whether the table is still open.
    pub fn is_open(&self) -> bool {
        self.store.is_some()
    }

    /// Packs leaves as tightly as possible, for tables written once.
    pub fn set_full_compaction(&mut self, on: bool) {
        if on {
            self.seq_count = 0;
        }
        self.full_compaction = on;
    }

    /// Replaces the free list with one listing exactly `unused`.
    pub(crate) fn rebuild_free_list(&mut self, unused: &[u32]) -> Result<()> {
        self.check_writable()?;
        if self.modified {
            return Err(Error::invalid_operation(format!(
                "table {} has uncommitted changes",
                self.name
            )));
        }
        let store = self.store.as_ref().ok_or(Error::Closed)?;
        let mut free_list = FreeList::rebuilt(self.free_list.revision(), self.free_list.first_unused_block());
        for &n in unused {
            free_list.mark_block_unused(store, n)?;
        }
        self.free_list = free_list;
        warn!("table {}: free list rebuilt with {} blocks", self.name, unused.len());
        Ok(())
    }

    pub(crate) fn set_changes(&mut self, table_id: u8, changes: Option<Arc<ChangesetWriter>>) -> Result<()> {
        self.store.as_mut().ok_or(Error::Closed)?.set_changes(table_id, changes);
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.store()?.sync()
    }

    /// Table name (the file stem).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of keys stored.
    pub fn entry_count(&self) -> u64 {
        self.item_count
    }

    /// Revision the table is open at.
    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Height of the tree minus one.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Block size of the table file.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Whether there are uncommitted changes.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Whether the table accepts modifications.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Root info of the revision the table is open at.
    pub fn root_info(&self) -> &RootInfo {
        &self.committed
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("revision", &self.revision)
            .field("level", &self.level)
            .field("entries", &self.item_count)
            .field("writable", &self.writable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use tempfile::TempDir;

    fn new_table(dir: &TempDir, block_size: usize) -> Table {
        let root = RootInfo::new(&Options::default().block_size(block_size));
        Table::create(dir.path().join("t.lrt"), &root, false).unwrap()
    }

    #[test]
    fn test_empty_table() {
        let dir = TempDir::new().unwrap();
        let table = new_table(&dir, 2048);
        assert_eq!(table.entry_count(), 0);
        assert_eq!(table.level(), 0);
        assert_eq!(table.get_exact_entry(b"missing").unwrap(), None);
        assert!(!table.key_exists(b"missing").unwrap());
    }

    #[test]
    fn test_add_get_replace() {
        let dir = TempDir::new().unwrap();
        let mut table = new_table(&dir, 2048);
        table.add(b"key", b"first").unwrap();
        assert_eq!(table.get_exact_entry(b"key").unwrap(), Some(b"first".to_vec()));
        table.add(b"key", b"second, and longer").unwrap();
        assert_eq!(table.get_exact_entry(b"key").unwrap(), Some(b"second, and longer".to_vec()));
        assert_eq!(table.entry_count(), 1);
        assert!(table.is_modified());
    }

    #[test]
    fn test_invalid_keys() {
        let dir = TempDir::new().unwrap();
        let mut table = new_table(&dir, 2048);
        assert!(matches!(table.add(b"", b"v"), Err(Error::InvalidArgument(_))));
        let long = vec![b'k'; MAX_KEY_LEN + 1];
        assert!(matches!(table.add(&long, b"v"), Err(Error::InvalidArgument(_))));
        let longest = vec![b'k'; MAX_KEY_LEN];
        table.add(&longest, b"v").unwrap();
        assert!(table.key_exists(&longest).unwrap());
        assert!(!table.del(&long).unwrap());
    }

    #[test]
    fn test_multi_component_value() {
        let dir = TempDir::new().unwrap();
        let mut table = new_table(&dir, 2048);
        let value: Vec<u8> = (0..7000u32).map(|i| (i * 7 % 251) as u8).collect();
        table.add(b"big", &value).unwrap();
        table.add(b"after", b"x").unwrap();
        assert_eq!(table.get_exact_entry(b"big").unwrap(), Some(value.clone()));
        // Shrink it back to one component.
        table.add(b"big", b"small").unwrap();
        assert_eq!(table.get_exact_entry(b"big").unwrap(), Some(b"small".to_vec()));
        assert_eq!(table.entry_count(), 2);
        table.commit(1).unwrap();
        assert_eq!(table.get_exact_entry(b"big").unwrap(), Some(b"small".to_vec()));
    }

    #[test]
    fn test_splits_grow_the_tree() {
        let dir = TempDir::new().unwrap();
        let mut table = new_table(&dir, 2048);
        for i in 0..2000u32 {
            let key = format!("key{:06}", (i * 7919) % 2000);
            table.add(key.as_bytes(), format!("value {}", i).as_bytes()).unwrap();
        }
        assert!(table.level() >= 1);
        table.commit(1).unwrap();
        for i in 0..2000u32 {
            let key = format!("key{:06}", i);
            assert!(table.key_exists(key.as_bytes()).unwrap(), "{} missing", key);
        }
        assert_eq!(table.entry_count(), 2000);
    }

    #[test]
    fn test_delete_collapses_tree() {
        let dir = TempDir::new().unwrap();
        let mut table = new_table(&dir, 2048);
        for i in 0..1000u32 {
            table.add(format!("k{:05}", i).as_bytes(), &[7u8; 40]).unwrap();
        }
        assert!(table.level() >= 1);
        for i in 0..1000u32 {
            assert!(table.del(format!("k{:05}", i).as_bytes()).unwrap());
        }
        assert_eq!(table.level(), 0);
        assert_eq!(table.entry_count(), 0);
        assert!(!table.del(b"k00001").unwrap());
        table.commit(1).unwrap();
        assert!(!table.cursor().unwrap().next().unwrap());
    }

    #[test]
    fn test_cancel_restores_committed_state() {
        let dir = TempDir::new().unwrap();
        let mut table = new_table(&dir, 2048);
        table.add(b"keep", b"1").unwrap();
        let committed = table.commit(1).unwrap();

        for i in 0..500u32 {
            table.add(format!("tmp{}", i).as_bytes(), &[1u8; 30]).unwrap();
        }
        table.del(b"keep").unwrap();
        table.cancel().unwrap();

        assert_eq!(table.get_exact_entry(b"keep").unwrap(), Some(b"1".to_vec()));
        assert!(!table.key_exists(b"tmp0").unwrap());
        assert_eq!(table.entry_count(), 1);
        assert_eq!(table.root_info(), &committed);
    }

    #[test]
    fn test_revision_must_increase() {
        let dir = TempDir::new().unwrap();
        let mut table = new_table(&dir, 2048);
        table.commit(3).unwrap();
        assert!(matches!(table.commit(3), Err(Error::InvalidArgument(_))));
        assert!(matches!(table.commit(2), Err(Error::InvalidArgument(_))));
        table.commit(4).unwrap();
    }

    #[test]
    fn test_untouched_table_keeps_fake_root() {
        let dir = TempDir::new().unwrap();
        let mut table = new_table(&dir, 2048);
        let root = table.commit(1).unwrap();
        assert!(root.root_is_fake);
        assert_eq!(table.store().unwrap().block_count().unwrap(), 0);
    }

    #[test]
    fn test_block_exhaustion_rolls_back() {
        let dir = TempDir::new().unwrap();
        let mut root = RootInfo::new(&Options::default().block_size(2048).compression(CompressionType::None));
        // Room for the first leaf only; the first split finds no block number.
        let mut free_list = Vec::new();
        crate::pack::pack_uint(&mut free_list, 0);
        crate::pack::pack_uint(&mut free_list, (u32::MAX - 2) as u64);
        free_list.extend_from_slice(&[0, 0, 0, 0]);
        root.free_list = free_list;
        let mut table = Table::create(dir.path().join("t.lrt"), &root, false).unwrap();

        let mut result = Ok(());
        for i in 0..100u32 {
            result = table.add(format!("{:04}", i).as_bytes(), &[7u8; 100]);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(Error::Unimplemented(_))), "got {:?}", result);
        assert!(!table.is_modified());
        assert_eq!(table.entry_count(), 0);
        assert!(!table.key_exists(b"0000").unwrap());
        assert!(!table.cursor().unwrap().next().unwrap());
    }

    #[test]
    fn test_tag_reservation_is_capped() {
        assert_eq!(tag_capacity(100, 3), 300);
        assert_eq!(tag_capacity(16000, u16::MAX), TAG_RESERVE_LIMIT);
        assert_eq!(tag_capacity(usize::MAX, 2), TAG_RESERVE_LIMIT);
    }

    #[test]
    fn test_reopen_committed_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.lrt");
        let root = {
            let mut table = new_table(&dir, 4096);
            for i in 0..300u32 {
                table.add(format!("{:04}", i).as_bytes(), format!("v{}", i).as_bytes()).unwrap();
            }
            table.commit(1).unwrap()
        };
        let table = Table::open_readonly(&path, &root, 1).unwrap();
        assert_eq!(table.entry_count(), 300);
        assert_eq!(table.get_exact_entry(b"0123").unwrap(), Some(b"v123".to_vec()));
        assert!(!table.is_writable());
    }

    #[test]
    fn test_readonly_table_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.lrt");
        let root = new_table(&dir, 2048).commit(1).unwrap();
        let mut table = Table::open_readonly(&path, &root, 1).unwrap();
        assert!(matches!(table.add(b"k", b"v"), Err(Error::InvalidOperation(_))));
        assert!(matches!(table.cancel(), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_closed_table() {
        let dir = TempDir::new().unwrap();
        let mut table = new_table(&dir, 2048);
        table.close();
        assert!(!table.is_open());
        assert!(matches!(table.get_exact_entry(b"k"), Err(Error::Closed)));
        assert!(matches!(table.add(b"k", b"v"), Err(Error::Closed)));
        assert!(matches!(table.cursor(), Err(Error::Closed)));
    }

    #[test]
    fn test_dangerous_mode_refuses_cancel() {
        let dir = TempDir::new().unwrap();
        let root = RootInfo::new(&Options::default().block_size(2048));
        let mut table = Table::create(dir.path().join("t.lrt"), &root, true).unwrap();
        table.add(b"k", b"v").unwrap();
        assert!(matches!(table.cancel(), Err(Error::InvalidOperation(_))));
        table.commit(1).unwrap();
        assert_eq!(table.get_exact_entry(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_readahead() {
        let dir = TempDir::new().unwrap();
        let mut table = new_table(&dir, 2048);
        assert!(!table.readahead(b"anything").unwrap());
        for i in 0..2000u32 {
            table.add(format!("{:06}", i).as_bytes(), &[3u8; 20]).unwrap();
        }
        table.commit(1).unwrap();
        assert!(table.level() >= 1);
        let first = table.readahead(b"000001").unwrap();
        let last = table.readahead(b"001999").unwrap();
        assert!(first || last);
        // Reading the same leaf again is skipped.
        assert!(!table.readahead(b"001999").unwrap());
    }
}
