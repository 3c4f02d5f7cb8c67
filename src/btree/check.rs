//! Structural consistency checks.

use super::table::Table;
use crate::block::BlockStore;
use crate::error::{Error, Result};
use crate::freelist::{FreeList, FreeListChecker};
use log::{debug, warn};
use serde::Serialize;

/// Findings for one table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableReport {
    /// Table name.
    pub name: String,
    /// Revision checked.
    pub revision: u32,
    /// Height of the tree minus one.
    pub level: usize,
    /// Entries counted in the leaves.
    pub entries: u64,
    /// Blocks reachable from the root.
    pub blocks_used: usize,
    /// Entries on the free list.
    pub free_blocks: usize,
    /// Blocks neither in the tree nor on the free list.
    pub leaked_blocks: Vec<u32>,
    /// Structural problems found.
    pub errors: Vec<String>,
    /// Every block number not used by the tree.
    #[serde(skip)]
    pub(crate) unused: Vec<u32>,
}

impl TableReport {
    /// No errors and no leaks.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty() && self.leaked_blocks.is_empty()
    }
}

/// Findings for a whole database.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckReport {
    /// Revision checked.
    pub revision: u32,
    /// One report per table.
    pub tables: Vec<TableReport>,
    /// Tables whose free list was rebuilt.
    pub fixed: Vec<String>,
}

impl CheckReport {
    /// Whether every table checked out.
    pub fn is_ok(&self) -> bool {
        self.tables.iter().all(TableReport::is_ok)
    }
}

type Bound = Option<(Vec<u8>, u16)>;

struct Walker<'a> {
    store: &'a BlockStore,
    used: FreeListChecker,
    report: &'a mut TableReport,
}

impl Walker<'_> {
    fn error(&mut self, msg: String) {
        warn!("check {}: {}", self.report.name, msg);
        self.report.errors.push(msg);
    }

    fn check_block(&mut self, n: u32, level: usize, max_revision: u32, lower: &Bound, upper: &Bound) {
        if !self.used.mark_used(n) {
            self.error(format!("block {} is referenced twice or lies beyond the end of the table", n));
            return;
        }
        self.report.blocks_used += 1;
        let block = match self.store.read_block(n) {
            Ok(block) => block,
            Err(e) => {
                self.error(format!("block {}: {}", n, e));
                return;
            }
        };
        if block.level() as usize != level {
            self.error(format!("block {} has level {}, expected {}", n, block.level(), level));
            return;
        }
        if block.revision() > max_revision {
            self.error(format!(
                "block {} has revision {}, newer than its parent's {}",
                n,
                block.revision(),
                max_revision
            ));
        }
        if let Err(e) = block.validate() {
            self.error(format!("block {}: {}", n, e));
            return;
        }

        let count = block.count();
        let mut keys = Vec::with_capacity(count);
        for i in 0..count {
            match block.item(i) {
                Ok(item) => keys.push((item.key().to_vec(), item.component(), item.child())),
                Err(e) => {
                    self.error(format!("block {} item {}: {}", n, i, e));
                    return;
                }
            }
        }

        // Item 0 of a branch stands for minus infinity and has no key.
        let first_keyed = if level == 0 { 0 } else { 1 };
        for i in first_keyed..count {
            let here = (keys[i].0.as_slice(), keys[i].1);
            if i > first_keyed && (keys[i - 1].0.as_slice(), keys[i - 1].1) >= here {
                self.error(format!("block {}: items {} and {} are out of order", n, i - 1, i));
            }
            if let Some((key, component)) = lower {
                if here < (key.as_slice(), *component) {
                    self.error(format!("block {}: item {} sorts before its parent's separator", n, i));
                }
            }
            if let Some((key, component)) = upper {
                if here >= (key.as_slice(), *component) {
                    self.error(format!("block {}: item {} sorts after the next separator", n, i));
                }
            }
        }

        if level == 0 {
            self.report.entries += keys.iter().filter(|(k, c, _)| !k.is_empty() && *c == 1).count() as u64;
            return;
        }
        if count == 0 {
            self.error(format!("branch block {} is empty", n));
            return;
        }
        for i in 0..count {
            let child_lower = if i == 0 { lower.clone() } else { Some((keys[i].0.clone(), keys[i].1)) };
            let child_upper = match keys.get(i + 1) {
                Some((key, component, _)) => Some((key.clone(), *component)),
                None => upper.clone(),
            };
            self.check_block(keys[i].2, level - 1, block.revision(), &child_lower, &child_upper);
        }
    }
}

impl Table {
    /// Checks the committed revision of the table.
    ///
    /// Walks every block reachable from the root checking levels, ordering,
    /// separators and revisions, then reconciles the tree against the free
    /// list. Problems are collected in the report rather than returned as
    /// errors.
    pub fn check(&self) -> Result<TableReport> {
        let store = self.store()?;
        if self.is_modified() {
            return Err(Error::invalid_operation(format!(
                "table {} has uncommitted changes",
                self.name()
            )));
        }
        let root_info = self.root_info();
        let mut report = TableReport {
            name: self.name().to_string(),
            revision: self.revision(),
            level: root_info.level as usize,
            ..TableReport::default()
        };
        let free_list = FreeList::unpack(&root_info.free_list)?;
        let first_unused = free_list.first_unused_block();

        let mut walker = Walker {
            store,
            used: FreeListChecker::new(first_unused),
            report: &mut report,
        };
        if !root_info.root_is_fake {
            walker.check_block(root_info.root, root_info.level as usize, self.revision(), &None, &None);
        }
        let mut tree_only = walker.used.clone();

        match free_list.walk(store) {
            Ok(walk) => {
                walker.report.free_blocks = walk.free.len();
                for &n in &walk.chain {
                    if !walker.used.mark_used(n) {
                        walker.error(format!("free-list block {} is also in use", n));
                    }
                }
                for &n in &walk.free {
                    if !walker.used.mark_used(n) {
                        walker.error(format!("block {} is on the free list but already accounted for", n));
                    }
                }
                walker.report.leaked_blocks = walker.used.outstanding();
            }
            Err(e) => walker.error(format!("free list: {}", e)),
        }

        // The tree's blocks are the only ones a rebuilt free list must keep.
        for n in 0..first_unused {
            if tree_only.mark_used(n) {
                report.unused.push(n);
            }
        }

        if report.entries != root_info.num_entries {
            let msg = format!(
                "counted {} entries but the root info records {}",
                report.entries, root_info.num_entries
            );
            warn!("check {}: {}", report.name, msg);
            report.errors.push(msg);
        }
        debug!(
            "checked table {} at revision {}: {} blocks, {} free, {} leaked, {} errors",
            report.name,
            report.revision,
            report.blocks_used,
            report.free_blocks,
            report.leaked_blocks.len(),
            report.errors.len()
        );
        Ok(report)
    }
}
