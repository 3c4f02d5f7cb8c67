//! A set of tables committed together.

use crate::btree::{CheckReport, Table};
use crate::changes::{ChangesetWriter, Changes, MAX_TABLES};
use crate::config::Options;
use crate::error::{Error, Result};
use crate::version::VersionFile;
use log::{error, info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Extension of table files.
pub const TABLE_EXTENSION: &str = "lrt";

fn check_table_names(names: &[&str]) -> Result<()> {
    if names.is_empty() {
        return Err(Error::invalid_argument("a database needs at least one table"));
    }
    if names.len() > MAX_TABLES {
        return Err(Error::invalid_argument(format!(
            "{} tables requested, at most {} are supported",
            names.len(),
            MAX_TABLES
        )));
    }
    for (i, name) in names.iter().enumerate() {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::invalid_argument(format!("bad table name {:?}", name)));
        }
        if names[..i].contains(name) {
            return Err(Error::invalid_argument(format!("table name {:?} given twice", name)));
        }
    }
    Ok(())
}

/// A database directory: a version file plus one file per table.
///
/// A writable handle is the only writer; it commits every table at once by
/// replacing the version file. Read-only handles see the revision current
/// when they were opened until [`Database::reopen`] moves them forward.
///
/// # Example
///
/// ```rust,no_run
/// use larch::{Database, Options};
///
/// # fn main() -> Result<(), larch::Error> {
/// let mut db = Database::create("./data", &["postlist", "termlist"], Options::default())?;
/// db.table_mut("postlist")?.add(b"apple", b"1,4,9")?;
/// let revision = db.commit()?;
///
/// let reader = Database::open_readonly("./data", Options::default())?;
/// assert_eq!(reader.revision(), revision);
/// assert!(reader.table("postlist")?.key_exists(b"apple")?);
/// # Ok(())
/// # }
/// ```
pub struct Database {
    dir: PathBuf,
    options: Options,
    writable: bool,
    version: VersionFile,
    tables: Vec<Table>,
    /// Revision the next commit will use. Never reuses a failed one.
    next_revision: u32,
    changes: Option<Changes>,
    changeset: Option<Arc<ChangesetWriter>>,
}

impl Database {
    /// Creates a database with the named tables, or opens it if it exists.
    ///
    /// Fails if the database exists and `error_if_exists` is set, or if it
    /// doesn't and `create_if_missing` is cleared. An existing database must
    /// hold exactly the named tables, in the same order.
    pub fn create<P: AsRef<Path>>(dir: P, table_names: &[&str], options: Options) -> Result<Self> {
        options.validate()?;
        check_table_names(table_names)?;
        let dir = dir.as_ref();
        let version_path = VersionFile::path(dir);
        if version_path.exists() {
            if options.error_if_exists {
                return Err(Error::invalid_operation(format!("database already exists at {:?}", dir)));
            }
            let existing = VersionFile::read(dir)?;
            let names: Vec<&str> = existing.tables().iter().map(|(name, _)| name.as_str()).collect();
            if names != table_names {
                return Err(Error::invalid_argument(format!(
                    "database at {:?} has tables {:?}, not {:?}",
                    dir, names, table_names
                )));
            }
            return Self::open(dir, options);
        }
        if !options.create_if_missing {
            return Err(Error::opening(
                version_path,
                io::Error::new(io::ErrorKind::NotFound, "database does not exist"),
            ));
        }

        fs::create_dir_all(dir).map_err(|e| Error::opening(dir, e))?;
        let version = VersionFile::create(table_names, &options);
        let tables = version
            .tables()
            .iter()
            .map(|(name, root)| Table::create(Self::table_path(dir, name), root, options.dangerous))
            .collect::<Result<Vec<_>>>()?;
        version.write(dir, false, options.no_sync, None)?;
        info!(
            "created database {:?} ({}) with tables {:?}",
            dir,
            version.uuid(),
            table_names
        );
        Self::assemble(dir, options, true, version, tables)
    }

    /// Opens an existing database for writing.
    pub fn open<P: AsRef<Path>>(dir: P, options: Options) -> Result<Self> {
        Self::open_with(dir.as_ref(), options, true)
    }

    /// Opens an existing database for reading.
    pub fn open_readonly<P: AsRef<Path>>(dir: P, options: Options) -> Result<Self> {
        Self::open_with(dir.as_ref(), options, false)
    }

    fn open_with(dir: &Path, options: Options, writable: bool) -> Result<Self> {
        options.validate()?;
        let version = VersionFile::read(dir)?;
        let tables = Self::open_tables(dir, &version, writable, options.dangerous)?;
        info!(
            "opened database {:?} at revision {} ({})",
            dir,
            version.revision(),
            if writable { "writable" } else { "read-only" }
        );
        Self::assemble(dir, options, writable, version, tables)
    }

    fn open_tables(dir: &Path, version: &VersionFile, writable: bool, dangerous: bool) -> Result<Vec<Table>> {
        let revision = version.revision();
        version
            .tables()
            .iter()
            .map(|(name, root)| {
                let path = Self::table_path(dir, name);
                if writable {
                    Table::open(path, root, revision, dangerous)
                } else {
                    Table::open_readonly(path, root, revision)
                }
            })
            .collect()
    }

    fn assemble(dir: &Path, options: Options, writable: bool, version: VersionFile, mut tables: Vec<Table>) -> Result<Self> {
        if writable && options.full_compaction {
            for table in &mut tables {
                table.set_full_compaction(true);
            }
        }
        let changes = if writable { Changes::new(dir, &options) } else { None };
        let mut db = Self {
            dir: dir.to_path_buf(),
            next_revision: version.revision() + 1,
            options,
            writable,
            version,
            tables,
            changes,
            changeset: None,
        };
        db.start_changeset()?;
        Ok(db)
    }

    fn table_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{}.{}", name, TABLE_EXTENSION))
    }

    fn check_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(Error::invalid_operation("database is open read-only"));
        }
        Ok(())
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.version
            .tables()
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| Error::invalid_argument(format!("no table named {:?}", name)))
    }

    /// The table called `name`.
    pub fn table(&self, name: &str) -> Result<&Table> {
        let i = self.index_of(name)?;
        Ok(&self.tables[i])
    }

    /// The table called `name`, for modification.
    pub fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.check_writable()?;
        let i = self.index_of(name)?;
        Ok(&mut self.tables[i])
    }

    /// Names of the tables, in table-id order.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.version.tables().iter().map(|(name, _)| name.as_str())
    }

    /// Revision currently visible.
    pub fn revision(&self) -> u32 {
        self.version.revision()
    }

    /// Identity of the database, fixed at creation.
    pub fn uuid(&self) -> Uuid {
        self.version.uuid()
    }

    /// Database directory.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Whether this handle can commit.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn start_changeset(&mut self) -> Result<()> {
        let Some(changes) = &self.changes else {
            return Ok(());
        };
        let writer = changes.start(self.version.revision(), self.next_revision)?;
        for (id, table) in self.tables.iter_mut().enumerate() {
            table.set_changes(id as u8, Some(writer.clone()))?;
        }
        self.changeset = Some(writer);
        Ok(())
    }

    fn detach_changeset(&mut self) -> Option<Arc<ChangesetWriter>> {
        let writer = self.changeset.take()?;
        for (id, table) in self.tables.iter_mut().enumerate() {
            if let Err(e) = table.set_changes(id as u8, None) {
                warn!("couldn't detach changeset from table {}: {}", table.name(), e);
            }
        }
        Some(writer)
    }

    fn finish_changeset(&mut self) -> Result<()> {
        if let (Some(writer), Some(changes)) = (self.detach_changeset(), self.changes.as_ref()) {
            changes.commit(&writer)?;
        }
        Ok(())
    }

    /// Makes `revision` durable: tables first, then the version file.
    fn publish(&mut self, revision: u32) -> Result<()> {
        for table in &mut self.tables {
            table.flush()?;
        }
        let mut roots = Vec::with_capacity(self.tables.len());
        for table in &mut self.tables {
            roots.push(table.commit(revision)?);
        }
        if !self.options.no_sync {
            for table in &self.tables {
                table.sync()?;
            }
        }
        let mut version = self.version.clone();
        version.advance(revision, roots);
        version.write(&self.dir, self.options.dangerous, self.options.no_sync, self.changeset.as_deref())?;
        self.version = version;
        self.next_revision = revision + 1;
        Ok(())
    }

    /// Commits all tables as a new revision and returns its number.
    ///
    /// If anything fails before the version file is replaced, every table
    /// is rolled back to the last good revision and an empty revision is
    /// committed past the failed one, so that number is never reused.
    pub fn commit(&mut self) -> Result<u32> {
        self.check_writable()?;
        let revision = self.next_revision;
        if let Err(e) = self.publish(revision) {
            error!("commit of revision {} failed: {}", revision, e);
            self.next_revision = revision + 1;
            if !self.options.dangerous {
                if let Err(recover_err) = self.recover() {
                    error!("recovery after failed commit also failed: {}", recover_err);
                }
            }
            return Err(e);
        }
        // The revision is durable from here on.
        self.finish_changeset()?;
        self.start_changeset()?;
        info!("database {:?} committed revision {}", self.dir, revision);
        Ok(revision)
    }

    fn recover(&mut self) -> Result<()> {
        drop(self.detach_changeset());
        self.version = VersionFile::read(&self.dir)?;
        let revision = self.version.revision();
        for (table, (_, root)) in self.tables.iter_mut().zip(self.version.tables()) {
            table.cancel_to(root, revision)?;
        }
        let replacement = self.next_revision;
        warn!(
            "database {:?} back at revision {}, committing {} in place of the failed revision",
            self.dir, revision, replacement
        );
        // The changeset header takes its new revision from next_revision.
        self.start_changeset()?;
        if let Err(e) = self.publish(replacement) {
            self.next_revision = replacement + 1;
            return Err(e);
        }
        self.finish_changeset()?;
        self.start_changeset()
    }

    /// Discards all changes since the last commit.
    pub fn cancel(&mut self) -> Result<()> {
        self.check_writable()?;
        if self.options.dangerous {
            return Err(Error::invalid_operation("cancel() not supported in dangerous mode"));
        }
        drop(self.detach_changeset());
        for table in &mut self.tables {
            table.cancel()?;
        }
        self.start_changeset()?;
        info!("database {:?} cancelled back to revision {}", self.dir, self.revision());
        Ok(())
    }

    /// Moves a read-only handle to the newest revision.
    ///
    /// Returns true if the revision changed. A writer is always current.
    pub fn reopen(&mut self) -> Result<bool> {
        if self.writable {
            return Ok(false);
        }
        let version = VersionFile::read(&self.dir)?;
        if version.revision() == self.version.revision() {
            return Ok(false);
        }
        self.tables = Self::open_tables(&self.dir, &version, false, false)?;
        info!(
            "database {:?} reopened at revision {} (was {})",
            self.dir,
            version.revision(),
            self.version.revision()
        );
        self.next_revision = version.revision() + 1;
        self.version = version;
        Ok(true)
    }

    /// Checks every table at the latest committed revision.
    ///
    /// With `fix`, tables whose only problem is leaked blocks get a free
    /// list listing every block outside the tree, and the result is
    /// committed. Fixing needs a writable handle with no pending changes.
    pub fn check(&mut self, fix: bool) -> Result<CheckReport> {
        if fix {
            self.check_writable()?;
            if let Some(table) = self.tables.iter().find(|t| t.is_modified()) {
                return Err(Error::invalid_operation(format!(
                    "table {} has uncommitted changes",
                    table.name()
                )));
            }
        }
        let version = VersionFile::read(&self.dir)?;
        let mut report = CheckReport {
            revision: version.revision(),
            ..CheckReport::default()
        };
        for (name, root) in version.tables() {
            let table = Table::open_readonly(Self::table_path(&self.dir, name), root, version.revision())?;
            report.tables.push(table.check()?);
        }

        if fix {
            if version.revision() != self.version.revision() {
                return Err(Error::invalid_operation("database changed underneath the writer"));
            }
            for (i, table_report) in report.tables.iter().enumerate() {
                if table_report.leaked_blocks.is_empty() || !table_report.errors.is_empty() {
                    continue;
                }
                self.tables[i].rebuild_free_list(&table_report.unused)?;
                report.fixed.push(table_report.name.clone());
            }
            if !report.fixed.is_empty() {
                let revision = self.commit()?;
                info!("free lists of {:?} rebuilt at revision {}", report.fixed, revision);
            }
        }
        Ok(report)
    }

    /// Closes every table. Uncommitted changes are lost.
    pub fn close(&mut self) {
        drop(self.detach_changeset());
        for table in &mut self.tables {
            table.close();
        }
        info!("database {:?} closed", self.dir);
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("dir", &self.dir)
            .field("revision", &self.version.revision())
            .field("writable", &self.writable)
            .field("tables", &self.tables)
            .finish()
    }
}
