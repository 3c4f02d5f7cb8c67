//! Changesets: a record of every block written between two revisions.
//!
//! When enabled, each commit leaves a file `changes<old_rev>` in the
//! database directory. A replication consumer can apply it to a copy of
//! the database at `old_rev` to bring it to the next revision.
//!
//! ```text
//! header:  "LarchChanges" [version: u8] [old_rev: varint] [new_rev: varint] [dangerous: u8]
//! block:   [table_id | size_class << 3: u8] [block number: varint] [raw block]
//! version: [0xfe] [revision: varint] [length: varint] [version file image]
//! end:     [0xff]
//! ```

use crate::block::size_class;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::pack::{pack_uint, unpack_u32, unpack_uint};
use bytes::Buf;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MAGIC: &[u8] = b"LarchChanges";
const CHANGES_VERSION: u8 = 1;
const VERSION_RECORD: u8 = 0xfe;
const END_RECORD: u8 = 0xff;

/// Largest table id that fits in a block record.
pub const MAX_TABLES: usize = 8;

/// File name of the changeset starting at `old_rev`.
pub fn changeset_name(old_rev: u32) -> String {
    format!("changes{}", old_rev)
}

/// Changeset policy for one database directory.
#[derive(Debug, Clone)]
pub struct Changes {
    dir: PathBuf,
    max_changesets: u32,
    dangerous: bool,
    no_sync: bool,
}

impl Changes {
    /// Returns `None` when changesets are disabled.
    pub fn new(dir: &Path, options: &Options) -> Option<Self> {
        if options.max_changesets == 0 {
            return None;
        }
        Some(Self {
            dir: dir.to_path_buf(),
            max_changesets: options.max_changesets,
            dangerous: options.dangerous,
            no_sync: options.no_sync,
        })
    }

    fn tmp_path(&self) -> PathBuf {
        self.dir.join("changes.tmp")
    }

    /// Begins recording the changes from `old_rev` to `new_rev`.
    pub fn start(&self, old_rev: u32, new_rev: u32) -> Result<Arc<ChangesetWriter>> {
        let path = self.tmp_path();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::opening(&path, e))?;
        let mut writer = BufWriter::new(file);
        let mut header = Vec::with_capacity(MAGIC.len() + 12);
        header.extend_from_slice(MAGIC);
        header.push(CHANGES_VERSION);
        pack_uint(&mut header, old_rev as u64);
        pack_uint(&mut header, new_rev as u64);
        header.push(u8::from(self.dangerous));
        writer.write_all(&header)?;
        debug!("changeset started for revision {} -> {}", old_rev, new_rev);
        Ok(Arc::new(ChangesetWriter {
            path,
            old_rev,
            new_rev,
            state: Mutex::new(Some(writer)),
        }))
    }

    /// Terminates `writer`, moves it into place and prunes old changesets.
    pub fn commit(&self, writer: &ChangesetWriter) -> Result<()> {
        writer.finish(!self.no_sync)?;
        let target = self.dir.join(changeset_name(writer.old_rev));
        fs::rename(&writer.path, &target)?;
        info!("changeset {:?} written", target);
        self.prune(writer.new_rev)
    }

    fn prune(&self, new_rev: u32) -> Result<()> {
        if new_rev <= self.max_changesets {
            return Ok(());
        }
        let stop = new_rev - self.max_changesets;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(rev) = name
                .to_str()
                .and_then(|n| n.strip_prefix("changes"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            if rev < stop {
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!("couldn't remove old changeset {:?}: {}", entry.path(), e);
                }
            }
        }
        Ok(())
    }
}

/// An open changeset being written.
pub struct ChangesetWriter {
    path: PathBuf,
    old_rev: u32,
    new_rev: u32,
    state: Mutex<Option<BufWriter<File>>>,
}

impl ChangesetWriter {
    fn with_writer<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
    {
        let mut state = self.state.lock();
        let writer = state
            .as_mut()
            .ok_or_else(|| Error::invalid_operation("changeset already finished"))?;
        f(writer)?;
        Ok(())
    }

    /// Records a raw block written to table `table_id`.
    pub fn write_block(&self, table_id: u8, block_size: usize, n: u32, data: &[u8]) -> Result<()> {
        if table_id as usize >= MAX_TABLES {
            return Err(Error::invalid_argument(format!("table id {} too large for changesets", table_id)));
        }
        let mut head = vec![table_id | size_class(block_size) << 3];
        pack_uint(&mut head, n as u64);
        self.with_writer(|w| {
            w.write_all(&head)?;
            w.write_all(data)
        })
    }

    /// Records the version file image for `revision`.
    pub fn write_version(&self, revision: u32, image: &[u8]) -> Result<()> {
        let mut head = vec![VERSION_RECORD];
        pack_uint(&mut head, revision as u64);
        pack_uint(&mut head, image.len() as u64);
        self.with_writer(|w| {
            w.write_all(&head)?;
            w.write_all(image)
        })
    }

    fn finish(&self, sync: bool) -> Result<()> {
        let mut state = self.state.lock();
        let mut writer = state
            .take()
            .ok_or_else(|| Error::invalid_operation("changeset already finished"))?;
        writer.write_all(&[END_RECORD])?;
        writer.flush()?;
        if sync {
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

impl Drop for ChangesetWriter {
    fn drop(&mut self) {
        if self.state.get_mut().take().is_some() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// One block recorded in a changeset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedBlock {
    /// Table id (position in the database's table list).
    pub table_id: u8,
    /// Block size of that table.
    pub block_size: usize,
    /// Block number.
    pub block_number: u32,
    /// Raw block contents.
    pub data: Vec<u8>,
}

/// A parsed changeset file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changeset {
    /// Revision the changeset applies to.
    pub old_rev: u32,
    /// Revision the changeset produces.
    pub new_rev: u32,
    /// Written in dangerous mode; cannot be applied to a live database.
    pub dangerous: bool,
    /// Blocks in the order they were written.
    pub blocks: Vec<ChangedBlock>,
    /// Version file image for `new_rev`.
    pub version: Option<Vec<u8>>,
}

/// Parses and validates the changeset at `path`.
pub fn read_changeset<P: AsRef<Path>>(path: P) -> Result<Changeset> {
    let path = path.as_ref();
    let data = fs::read(path).map_err(|e| Error::opening(path, e))?;
    let mut buf = &data[..];

    if buf.len() < MAGIC.len() + 1 || &buf[..MAGIC.len()] != MAGIC {
        return Err(Error::corruption("Changes file has wrong magic"));
    }
    buf.advance(MAGIC.len());
    if buf.get_u8() != CHANGES_VERSION {
        return Err(Error::Version("Changes file has unknown version".into()));
    }
    let old_rev = unpack_u32(&mut buf)?;
    let new_rev = unpack_u32(&mut buf)?;
    if new_rev <= old_rev {
        return Err(Error::corruption("Changes file has rev <= old_rev"));
    }
    let dangerous = match buf.first() {
        Some(0) => false,
        Some(1) => true,
        _ => return Err(Error::corruption("Changes file has bad dangerous flag")),
    };
    buf.advance(1);

    let mut blocks = Vec::new();
    let mut version = None;
    loop {
        if !buf.has_remaining() {
            return Err(Error::corruption("Changes file truncated"));
        }
        let v = buf.get_u8();
        if v == END_RECORD {
            if buf.has_remaining() {
                return Err(Error::corruption("Changes file - junk at end"));
            }
            break;
        }
        if v == VERSION_RECORD {
            let rev = unpack_u32(&mut buf)?;
            if rev != new_rev {
                return Err(Error::corruption("Version file revision != changes file new revision"));
            }
            let len = unpack_uint(&mut buf)? as usize;
            if buf.remaining() < len {
                return Err(Error::corruption("Changes file - version file data truncated"));
            }
            version = Some(buf[..len].to_vec());
            buf.advance(len);
            continue;
        }
        let table_id = v & 0x7;
        let class = v >> 3;
        if class > 5 {
            return Err(Error::corruption("Changes file - bad block size"));
        }
        let block_size = 2048usize << class;
        let block_number = unpack_u32(&mut buf)?;
        if buf.remaining() < block_size {
            return Err(Error::corruption("Changes file - block data truncated"));
        }
        blocks.push(ChangedBlock {
            table_id,
            block_size,
            block_number,
            data: buf[..block_size].to_vec(),
        });
        buf.advance(block_size);
    }

    Ok(Changeset {
        old_rev,
        new_rev,
        dangerous,
        blocks,
        version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn changes(dir: &TempDir, keep: u32) -> Changes {
        Changes::new(dir.path(), &Options::default().max_changesets(keep)).unwrap()
    }

    #[test]
    fn test_disabled_by_default() {
        let dir = TempDir::new().unwrap();
        assert!(Changes::new(dir.path(), &Options::default()).is_none());
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let changes = changes(&dir, 5);
        let writer = changes.start(3, 4).unwrap();
        writer.write_block(2, 4096, 77, &vec![0xab; 4096]).unwrap();
        writer.write_version(4, b"version image").unwrap();
        changes.commit(&writer).unwrap();
        drop(writer);

        let cs = read_changeset(dir.path().join("changes3")).unwrap();
        assert_eq!(cs.old_rev, 3);
        assert_eq!(cs.new_rev, 4);
        assert!(!cs.dangerous);
        assert_eq!(cs.blocks.len(), 1);
        assert_eq!(cs.blocks[0].table_id, 2);
        assert_eq!(cs.blocks[0].block_size, 4096);
        assert_eq!(cs.blocks[0].block_number, 77);
        assert_eq!(cs.version.as_deref(), Some(&b"version image"[..]));
    }

    #[test]
    fn test_retention() {
        let dir = TempDir::new().unwrap();
        let changes = changes(&dir, 2);
        for rev in 1..=5 {
            let writer = changes.start(rev - 1, rev).unwrap();
            changes.commit(&writer).unwrap();
        }
        assert!(!dir.path().join("changes0").exists());
        assert!(!dir.path().join("changes2").exists());
        assert!(dir.path().join("changes3").exists());
        assert!(dir.path().join("changes4").exists());
    }

    #[test]
    fn test_abandoned_changeset_is_removed() {
        let dir = TempDir::new().unwrap();
        let changes = changes(&dir, 1);
        let writer = changes.start(0, 1).unwrap();
        assert!(dir.path().join("changes.tmp").exists());
        drop(writer);
        assert!(!dir.path().join("changes.tmp").exists());
    }

    #[test]
    fn test_truncated_changeset() {
        let dir = TempDir::new().unwrap();
        let changes = changes(&dir, 1);
        let writer = changes.start(0, 1).unwrap();
        writer.write_block(0, 2048, 1, &[0u8; 2048]).unwrap();
        changes.commit(&writer).unwrap();
        let path = dir.path().join("changes0");
        let mut data = fs::read(&path).unwrap();
        data.truncate(data.len() - 100);
        fs::write(&path, data).unwrap();
        assert!(matches!(read_changeset(&path), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_bad_table_id() {
        let dir = TempDir::new().unwrap();
        let writer = changes(&dir, 1).start(0, 1).unwrap();
        assert!(writer.write_block(8, 2048, 0, &[0u8; 2048]).is_err());
    }
}
