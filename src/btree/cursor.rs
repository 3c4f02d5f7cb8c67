//! Ordered traversal of a table.

use super::table::Table;
use super::{Level, TreePath};
use crate::block::MAX_KEY_LEN;
use crate::error::{Error, Result};

/// A position within a [`Table`].
///
/// A cursor keeps its own path from the root to a leaf, sharing unmodified
/// blocks with the table. It borrows the table, so the table can't change
/// underneath it; a reader whose revision is discarded by a writer in
/// another handle gets [`Error::Modified`] and should reopen.
///
/// A new cursor sits before the first entry:
///
/// ```rust,no_run
/// # fn walk(table: &larch::Table) -> Result<(), larch::Error> {
/// let mut cursor = table.cursor()?;
/// while cursor.next()? {
///     let key = cursor.key().unwrap_or_default().to_vec();
///     let value = cursor.value()?;
///     println!("{:?} => {} bytes", key, value.len());
/// }
/// # Ok(())
/// # }
/// ```
pub struct Cursor<'a> {
    table: &'a Table,
    path: TreePath,
    positioned: bool,
    after_end: bool,
    current_key: Vec<u8>,
}

impl<'a> Cursor<'a> {
    pub(super) fn new(table: &'a Table) -> Result<Self> {
        table.store()?;
        let path = table.builtin().iter().map(Level::detached).collect();
        Ok(Self {
            table,
            path,
            positioned: false,
            after_end: false,
            current_key: Vec::new(),
        })
    }

    fn item_key(&self) -> Result<Vec<u8>> {
        Ok(self.path[0].block.item(self.path[0].c as usize)?.key().to_vec())
    }

    fn component(&self) -> Result<u16> {
        Ok(self.path[0].block.item(self.path[0].c as usize)?.component())
    }

    /// Positions the path on `key`, or the item before where it would be.
    fn seek(&mut self, key: &[u8], builtin: &TreePath) -> Result<bool> {
        if key.len() > MAX_KEY_LEN {
            self.table.find(&mut self.path, &key[..MAX_KEY_LEN], 1, Some(builtin))?;
            return Ok(false);
        }
        self.table.find(&mut self.path, key, 1, Some(builtin))
    }

    /// Moves back to the first component of the entry the path is on.
    fn to_first_component(&mut self, builtin: &TreePath) -> Result<()> {
        while self.component()? != 1 {
            if !self.table.prev_item(&mut self.path, Some(builtin))? {
                self.positioned = false;
                return Err(Error::corruption("find_entry failed to find any entry at all!"));
            }
        }
        Ok(())
    }

    /// Moves forward to the next first component. Returns false at the end.
    fn to_next_entry(&mut self, builtin: &TreePath) -> Result<bool> {
        loop {
            if !self.table.next_item(&mut self.path, Some(builtin))? {
                self.positioned = false;
                self.after_end = true;
                return Ok(false);
            }
            if self.component()? == 1 {
                return Ok(true);
            }
        }
    }

    /// Positions before the first entry.
    pub fn rewind(&mut self) -> Result<()> {
        self.find_entry(b"")?;
        Ok(())
    }

    /// Positions on `key` if present, otherwise on the last entry before it.
    ///
    /// Returns whether `key` itself was found. With no earlier entry the
    /// cursor ends up before the first entry and [`Cursor::key`] is `None`.
    pub fn find_entry(&mut self, key: &[u8]) -> Result<bool> {
        let table = self.table;
        table.store()?;
        let builtin = table.builtin();
        self.after_end = false;
        self.positioned = true;

        if self.seek(key, &builtin)? {
            self.current_key = key.to_vec();
            return Ok(true);
        }
        if self.path[0].c < 0 {
            self.path[0].c = 0;
            table.prev_item(&mut self.path, Some(&builtin))?;
        }
        self.to_first_component(&builtin)?;
        self.current_key = self.item_key()?;
        Ok(false)
    }

    /// Positions on the first entry `>= key`.
    ///
    /// Returns whether `key` itself was found. If every entry is smaller
    /// the cursor ends up after the end.
    pub fn find_entry_ge(&mut self, key: &[u8]) -> Result<bool> {
        let table = self.table;
        table.store()?;
        let builtin = table.builtin();
        self.after_end = false;
        self.positioned = true;

        if self.seek(key, &builtin)? {
            self.current_key = key.to_vec();
            return Ok(true);
        }
        if !self.to_next_entry(&builtin)? {
            return Ok(false);
        }
        self.current_key = self.item_key()?;
        Ok(false)
    }

    /// Positions on the last entry `< key`.
    ///
    /// Returns false if there is none, leaving the cursor before the first
    /// entry.
    pub fn find_entry_lt(&mut self, key: &[u8]) -> Result<bool> {
        if self.find_entry(key)? {
            return self.prev();
        }
        Ok(self.key().is_some())
    }

    /// Positions on `key` only if it is present.
    pub fn find_exact(&mut self, key: &[u8]) -> Result<bool> {
        let table = self.table;
        table.store()?;
        self.after_end = false;
        self.positioned = false;
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Ok(false);
        }
        let builtin = table.builtin();
        if !table.find(&mut self.path, key, 1, Some(&builtin))? {
            return Ok(false);
        }
        self.positioned = true;
        self.current_key = key.to_vec();
        Ok(true)
    }

    /// Advances to the next entry. Returns false once past the last one.
    ///
    /// An unpositioned cursor starts from the beginning.
    pub fn next(&mut self) -> Result<bool> {
        if self.after_end {
            return Ok(false);
        }
        if !self.positioned {
            self.rewind()?;
        }
        let table = self.table;
        let builtin = table.builtin();
        if !self.to_next_entry(&builtin)? {
            return Ok(false);
        }
        self.current_key = self.item_key()?;
        Ok(true)
    }

    /// Steps back to the previous entry. Returns false when there is none.
    ///
    /// A cursor after the end moves to the last entry.
    pub fn prev(&mut self) -> Result<bool> {
        let table = self.table;
        table.store()?;
        if self.after_end {
            // Longer than any key, so this finds the last entry.
            self.find_entry(&[0xff; MAX_KEY_LEN + 1])?;
            return Ok(self.key().is_some());
        }
        if !self.positioned {
            return Ok(false);
        }
        let builtin = table.builtin();
        loop {
            if !table.prev_item(&mut self.path, Some(&builtin))? {
                self.positioned = false;
                return Ok(false);
            }
            if self.component()? == 1 {
                break;
            }
        }
        self.current_key = self.item_key()?;
        Ok(!self.current_key.is_empty())
    }

    /// Key of the current entry, if the cursor is on one.
    pub fn key(&self) -> Option<&[u8]> {
        if self.positioned && !self.current_key.is_empty() {
            Some(&self.current_key)
        } else {
            None
        }
    }

    /// Value of the current entry, reassembled and decompressed.
    pub fn value(&self) -> Result<Vec<u8>> {
        if self.key().is_none() {
            return Err(Error::invalid_operation("cursor is not positioned on an entry"));
        }
        let table = self.table;
        table.store()?;
        let builtin = table.builtin();
        let mut path = self.path.clone();
        table.read_tag(&mut path, Some(&builtin))
    }

    /// Whether the cursor has moved past the last entry.
    pub fn is_after_end(&self) -> bool {
        self.after_end
    }

    /// Whether the cursor is on an entry or before the first one.
    pub fn is_positioned(&self) -> bool {
        self.positioned
    }
}
