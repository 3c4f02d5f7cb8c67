//! The version file: per-revision root information for every table.
//!
//! The file `iamlarch` in the database directory names the current
//! revision. A commit writes the new contents to `v.tmp`, syncs it and
//! renames it over `iamlarch`, so a crash leaves either the old or the new
//! revision in place.
//!
//! ```text
//! [magic: 14][format: u16][uuid: 16][revision: varint][tables: varint]
//! per table: [name: string][root info]
//! [crc32 of everything above: u32]
//! ```

use crate::block::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::changes::ChangesetWriter;
use crate::config::{CompressionType, Options};
use crate::error::{Error, Result};
use crate::pack::{pack_string, pack_uint, unpack_string, unpack_u32, unpack_uint};
use bytes::{Buf, BufMut};
use log::{debug, info};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Name of the version file.
pub const VERSION_FILE: &str = "iamlarch";

/// Temporary name used while committing.
const VERSION_TMP: &str = "v.tmp";

const MAGIC: &[u8; 14] = b"\x0f\x0dLarchVersion";

/// Format version this build reads and writes.
pub const FORMAT_VERSION: u16 = 1;

/// Metadata needed to open a table at one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootInfo {
    /// Root block number.
    pub root: u32,
    /// Height of the tree minus one.
    pub level: u32,
    /// Number of keys stored.
    pub num_entries: u64,
    /// The root exists only in memory (table never written).
    pub root_is_fake: bool,
    /// Keys were added in ascending order so far.
    pub sequential: bool,
    /// Block size of the table file.
    pub block_size: usize,
    /// Values no longer than this are stored uncompressed.
    pub compress_min: u32,
    /// Compression applied to values.
    pub compression: CompressionType,
    /// Serialised free list.
    pub free_list: Vec<u8>,
}

impl RootInfo {
    /// Root information for a new, empty table.
    pub fn new(options: &Options) -> Self {
        Self {
            root: 0,
            level: 0,
            num_entries: 0,
            root_is_fake: true,
            sequential: true,
            block_size: options.block_size,
            compress_min: options.compress_min as u32,
            compression: options.compression,
            free_list: Vec::new(),
        }
    }

    /// Appends the encoded root info to `buf`.
    pub fn serialise(&self, buf: &mut Vec<u8>) {
        pack_uint(buf, self.root as u64);
        let mut flags = (self.level as u64) << 2;
        if self.sequential {
            flags |= 0x02;
        }
        if self.root_is_fake {
            flags |= 0x01;
        }
        pack_uint(buf, flags);
        pack_uint(buf, self.num_entries);
        pack_uint(buf, (self.block_size >> 11) as u64);
        pack_uint(buf, self.compress_min as u64);
        pack_uint(buf, self.compression as u64);
        pack_string(buf, &self.free_list);
    }

    /// Decodes a root info from the front of `buf`.
    pub fn unserialise(buf: &mut &[u8]) -> Result<Self> {
        let root = unpack_u32(buf)?;
        let flags = unpack_uint(buf)?;
        let num_entries = unpack_uint(buf)?;
        let block_size = usize::try_from(unpack_uint(buf)?)
            .ok()
            .and_then(|b| b.checked_shl(11))
            .unwrap_or(0);
        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
            return Err(Error::corruption(format!("root info has bad block size {}", block_size)));
        }
        let compress_min = unpack_u32(buf)?;
        let kind = unpack_uint(buf)?;
        let compression = u8::try_from(kind)
            .ok()
            .and_then(CompressionType::from_u8)
            .ok_or_else(|| Error::unimplemented(format!("compression type {} is not supported by this build", kind)))?;
        let free_list = unpack_string(buf)?;
        Ok(Self {
            root,
            level: u32::try_from(flags >> 2).map_err(|_| Error::corruption("root info level overflow"))?,
            num_entries,
            root_is_fake: flags & 0x01 != 0,
            sequential: flags & 0x02 != 0,
            block_size,
            compress_min,
            compression,
            free_list,
        })
    }
}

/// In-memory form of the version file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionFile {
    uuid: Uuid,
    revision: u32,
    tables: Vec<(String, RootInfo)>,
}

impl VersionFile {
    /// A revision-0 version file for a new database.
    pub fn create(tables: &[&str], options: &Options) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            revision: 0,
            tables: tables.iter().map(|name| (name.to_string(), RootInfo::new(options))).collect(),
        }
    }

    /// Path of the version file in `dir`.
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(VERSION_FILE)
    }

    /// Reads and validates the version file in `dir`.
    pub fn read(dir: &Path) -> Result<Self> {
        let path = Self::path(dir);
        let data = fs::read(&path).map_err(|e| Error::opening(&path, e))?;
        Self::parse(&data)
    }

    /// Decodes a version file image.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MAGIC.len() + 2 + 16 + 4 {
            return Err(Error::corruption("version file is truncated"));
        }
        if &data[..MAGIC.len()] != MAGIC {
            return Err(Error::corruption("version file magic incorrect"));
        }
        let (body, trailer) = data.split_at(data.len() - 4);
        let mut buf = &body[MAGIC.len()..];
        let format = buf.get_u16();
        if format != FORMAT_VERSION {
            return Err(Error::Version(format!(
                "database is format version {} but only version {} is understood",
                format, FORMAT_VERSION
            )));
        }
        let stored_crc = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let crc = crc32fast::hash(body);
        if crc != stored_crc {
            return Err(Error::corruption(format!(
                "version file checksum mismatch: expected {:08x}, got {:08x}",
                stored_crc, crc
            )));
        }
        let mut uuid = [0u8; 16];
        buf.copy_to_slice(&mut uuid);
        let revision = unpack_u32(&mut buf)?;
        let count = unpack_uint(&mut buf)?;
        let mut tables = Vec::new();
        for _ in 0..count {
            let name = String::from_utf8(unpack_string(&mut buf)?)
                .map_err(|_| Error::corruption("table name is not UTF-8"))?;
            let root = RootInfo::unserialise(&mut buf)?;
            tables.push((name, root));
        }
        if !buf.is_empty() {
            return Err(Error::corruption("version file has junk at end"));
        }
        Ok(Self {
            uuid: Uuid::from_bytes(uuid),
            revision,
            tables,
        })
    }

    /// Encodes the version file image, including its checksum.
    pub fn serialise(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.put_slice(MAGIC);
        buf.put_u16(FORMAT_VERSION);
        buf.put_slice(self.uuid.as_bytes());
        pack_uint(&mut buf, self.revision as u64);
        pack_uint(&mut buf, self.tables.len() as u64);
        for (name, root) in &self.tables {
            pack_string(&mut buf, name.as_bytes());
            root.serialise(&mut buf);
        }
        let crc = crc32fast::hash(&buf);
        buf.put_u32(crc);
        buf
    }

    /// Writes this version file into `dir`.
    ///
    /// Normally writes `v.tmp` and renames it into place; with `dangerous`
    /// the live file is overwritten directly. The image is also recorded in
    /// `changes` when a changeset is being written.
    pub fn write(
        &self,
        dir: &Path,
        dangerous: bool,
        no_sync: bool,
        changes: Option<&ChangesetWriter>,
    ) -> Result<()> {
        let image = self.serialise();
        let target = Self::path(dir);
        let tmp = if dangerous { target.clone() } else { dir.join(VERSION_TMP) };

        let result = (|| -> io::Result<()> {
            let mut file: File = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
            file.write_all(&image)?;
            if !no_sync {
                file.sync_all()?;
            }
            Ok(())
        })();
        if let Err(e) = result {
            if !dangerous {
                let _ = fs::remove_file(&tmp);
            }
            return Err(Error::opening(&tmp, e));
        }

        if let Some(changes) = changes {
            changes.write_version(self.revision, &image)?;
        }

        if !dangerous {
            fs::rename(&tmp, &target)?;
            if !no_sync {
                if let Ok(d) = File::open(dir) {
                    let _ = d.sync_all();
                }
            }
        }
        debug!("wrote version file for revision {}", self.revision);
        Ok(())
    }

    /// Database identity.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Revision this file describes.
    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Table names and root infos, in table-id order.
    pub fn tables(&self) -> &[(String, RootInfo)] {
        &self.tables
    }

    /// Root info of `name`.
    pub fn root(&self, name: &str) -> Option<&RootInfo> {
        self.tables.iter().find(|(n, _)| n == name).map(|(_, r)| r)
    }

    /// Replaces the revision and all root infos.
    pub fn advance(&mut self, revision: u32, roots: Vec<RootInfo>) {
        info!("version advancing from revision {} to {}", self.revision, revision);
        self.revision = revision;
        for ((_, slot), root) in self.tables.iter_mut().zip(roots) {
            *slot = root;
        }
    }
}
