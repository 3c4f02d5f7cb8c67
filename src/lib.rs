//! # larch - An Embedded Copy-on-Write B-tree Storage Engine
//!
//! larch stores ordered key-value tables in fixed-size blocks and commits
//! them as numbered revisions. Modified blocks are always written to fresh
//! block numbers, so the previous revision stays readable on disk while the
//! next one is built, and a crash at any point leaves one complete revision.
//!
//! ## Architecture
//!
//! - **Block store**: a table file as an array of fixed-size pages
//! - **Items**: packed keys with value fragments or child pointers
//! - **Free list**: a persistent chain of reusable block numbers
//! - **B-tree**: copy-on-write insert, delete, split and collapse
//! - **Cursor**: ordered traversal in both directions
//! - **Version file**: the root of every table at the current revision
//! - **Changesets**: a per-commit log of written blocks for replication
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use larch::{Database, Options};
//!
//! # fn main() -> Result<(), larch::Error> {
//! let mut db = Database::create("./data", &["docs"], Options::default())?;
//!
//! let docs = db.table_mut("docs")?;
//! docs.add(b"key1", b"value1")?;
//! docs.add(b"key2", b"value2")?;
//! docs.del(b"key1")?;
//! db.commit()?;
//!
//! let mut cursor = db.table("docs")?.cursor()?;
//! while cursor.next()? {
//!     println!("{:?} => {:?}", cursor.key(), cursor.value()?);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod block;
pub mod btree;
pub mod changes;
pub mod compress;
pub mod config;
pub mod database;
pub mod error;
pub mod freelist;
pub mod pack;
pub mod version;

// Re-exports
pub use btree::{CheckReport, Cursor, Table, TableReport};
pub use config::{CompressionType, Options};
pub use database::Database;
pub use error::{Error, Result};
pub use version::RootInfo;
