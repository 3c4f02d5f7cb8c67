//! Configuration options for the larch storage engine.

use crate::block::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Default block size for new tables (8KB).
pub const DEFAULT_BLOCK_SIZE: usize = 8 * 1024;

/// Only values longer than this many bytes are compression candidates.
pub const DEFAULT_COMPRESS_MIN: usize = 4;

/// Configuration options for creating or opening a database.
#[derive(Debug, Clone)]
pub struct Options {
    /// Create the database if it doesn't exist.
    /// Default: true
    pub create_if_missing: bool,

    /// Error if the database already exists.
    /// Default: false
    pub error_if_exists: bool,

    /// Block size for newly created tables (in bytes).
    /// Must be a power of two between 2KB and 64KB. Existing tables keep
    /// the block size they were created with.
    /// Default: 8KB
    pub block_size: usize,

    /// Compression algorithm for values.
    /// Default: CompressionType::Snappy
    pub compression: CompressionType,

    /// Values no longer than this are stored uncompressed.
    /// Default: 4
    pub compress_min: usize,

    /// Write blocks in place instead of copy-on-write.
    ///
    /// Faster, but readers of the previous revision may see torn blocks and
    /// `cancel()` is refused.
    /// Default: false
    pub dangerous: bool,

    /// Skip fsync on commit.
    /// Default: false
    pub no_sync: bool,

    /// Number of changeset files to retain. 0 disables changesets.
    /// Default: 0
    pub max_changesets: u32,

    /// Pack blocks as full as possible (for tables built once and then read).
    /// Default: false
    pub full_compaction: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            block_size: DEFAULT_BLOCK_SIZE,
            compression: CompressionType::default(),
            compress_min: DEFAULT_COMPRESS_MIN,
            dangerous: false,
            no_sync: false,
            max_changesets: 0,
            full_compaction: false,
        }
    }
}

/// Compression algorithms supported by larch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    /// No compression.
    None = 0,

    /// Snappy compression (fast, moderate compression ratio).
    #[cfg(feature = "snappy")]
    Snappy = 1,

    /// LZ4 compression (very fast, lower compression ratio).
    #[cfg(feature = "lz4-compression")]
    Lz4 = 2,
}

impl CompressionType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionType::None),
            #[cfg(feature = "snappy")]
            1 => Some(CompressionType::Snappy),
            #[cfg(feature = "lz4-compression")]
            2 => Some(CompressionType::Lz4),
            _ => None,
        }
    }
}

impl Default for CompressionType {
    fn default() -> Self {
        #[cfg(feature = "snappy")]
        return CompressionType::Snappy;

        #[cfg(not(feature = "snappy"))]
        CompressionType::None
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if it doesn't exist.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether opening an existing database is an error.
    pub fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    /// Sets the block size for new tables.
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Sets the compression algorithm.
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the compression threshold.
    pub fn compress_min(mut self, len: usize) -> Self {
        self.compress_min = len;
        self
    }

    /// Enables or disables in-place block writes.
    pub fn dangerous(mut self, value: bool) -> Self {
        self.dangerous = value;
        self
    }

    /// Enables or disables fsync on commit.
    pub fn no_sync(mut self, value: bool) -> Self {
        self.no_sync = value;
        self
    }

    /// Sets how many changesets to keep.
    pub fn max_changesets(mut self, count: u32) -> Self {
        self.max_changesets = count;
        self
    }

    /// Enables or disables full compaction.
    pub fn full_compaction(mut self, value: bool) -> Self {
        self.full_compaction = value;
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if !self.block_size.is_power_of_two()
            || self.block_size < MIN_BLOCK_SIZE
            || self.block_size > MAX_BLOCK_SIZE
        {
            return Err(crate::Error::invalid_argument(format!(
                "block_size must be a power of two between {} and {}, got {}",
                MIN_BLOCK_SIZE, MAX_BLOCK_SIZE, self.block_size
            )));
        }
        if u32::try_from(self.compress_min).is_err() {
            return Err(crate::Error::invalid_argument("compress_min is too large"));
        }
        Ok(())
    }
}
