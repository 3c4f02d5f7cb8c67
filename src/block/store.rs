//! Raw block I/O against one table file.

use super::{Block, DIR_START, LEVEL_FREELIST};
use crate::changes::ChangesetWriter;
use crate::error::{Error, Result};
use log::trace;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Fixed-size page I/O for a single table file.
pub struct BlockStore {
    path: PathBuf,
    file: Mutex<File>,
    block_size: usize,
    writable: bool,
    table_id: u8,
    changes: Option<Arc<ChangesetWriter>>,
}

impl BlockStore {
    /// Creates (or truncates) the table file at `path`.
    pub fn create<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::opening(&path, e))?;
        Ok(Self::with_file(path, file, block_size, true))
    }

    /// Opens an existing table file.
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize, writable: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path)
            .map_err(|e| Error::opening(&path, e))?;
        Ok(Self::with_file(path, file, block_size, writable))
    }

    fn with_file(path: PathBuf, file: File, block_size: usize, writable: bool) -> Self {
        Self {
            path,
            file: Mutex::new(file),
            block_size,
            writable,
            table_id: 0,
            changes: None,
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block size of this table.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Routes subsequent block writes into `changes` as table `table_id`.
    pub fn set_changes(&mut self, table_id: u8, changes: Option<Arc<ChangesetWriter>>) {
        self.table_id = table_id;
        self.changes = changes;
    }

    /// Reads block `n`.
    ///
    /// Blocks other than free-list blocks must have a directory end inside
    /// the block.
    pub fn read_block(&self, n: u32) -> Result<Block> {
        let mut buf = vec![0u8; self.block_size];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(n as u64 * self.block_size as u64))?;
            file.read_exact(&mut buf).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    Error::corruption(format!("block {} lies beyond the end of {:?}", n, self.path))
                } else {
                    Error::Io(e)
                }
            })?;
        }
        let block = Block::from_vec(buf);
        if block.level() != LEVEL_FREELIST {
            let dir_end = block.dir_end();
            if dir_end < DIR_START || dir_end > self.block_size {
                return Err(Error::corruption(format!("dir_end invalid in block {}", n)));
            }
        }
        trace!("read block {} of {:?}", n, self.path);
        Ok(block)
    }

    /// Writes block `n`, mirroring it into the active changeset if any.
    pub fn write_block(&self, n: u32, block: &Block) -> Result<()> {
        if !self.writable {
            return Err(Error::invalid_operation("table is open read-only"));
        }
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(n as u64 * self.block_size as u64))?;
            file.write_all(block.as_slice())?;
        }
        if let Some(changes) = &self.changes {
            changes.write_block(self.table_id, self.block_size, n, block.as_slice())?;
        }
        trace!("wrote block {} of {:?}", n, self.path);
        Ok(())
    }

    /// Flushes file data to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    /// Current file length in blocks.
    pub fn block_count(&self) -> Result<u64> {
        let len = self.file.lock().metadata()?.len();
        Ok(len / self.block_size as u64)
    }
}
