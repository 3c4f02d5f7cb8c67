//! larch-check
//!
//! Verifies the structure of a larch database and any changesets kept
//! next to it, and optionally rebuilds leaked free lists.

use anyhow::{bail, Context, Result};
use clap::Parser;
use larch::changes::read_changeset;
use larch::{CheckReport, Database, Options};
use std::fs;
use std::path::{Path, PathBuf};

/// Check a larch database for structural problems
#[derive(Parser, Debug)]
#[command(name = "larch-check")]
#[command(about = "Check a larch database for structural problems")]
struct Args {
    /// Database directory
    dir: PathBuf,

    /// Rebuild the free list of tables that leak blocks
    #[arg(long)]
    fix: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

fn print_report(report: &CheckReport) {
    println!("revision {}", report.revision);
    for table in &report.tables {
        println!(
            "{}: {} levels, {} entries, {} blocks, {} free",
            table.name,
            table.level + 1,
            table.entries,
            table.blocks_used,
            table.free_blocks
        );
        for err in &table.errors {
            println!("  error: {}", err);
        }
        if !table.leaked_blocks.is_empty() {
            println!("  {} leaked blocks: {:?}", table.leaked_blocks.len(), table.leaked_blocks);
        }
    }
    for name in &report.fixed {
        println!("{}: free list rebuilt", name);
    }
}

/// Parses every `changes<N>` file in `dir`, returning how many were bad.
fn check_changesets(dir: &Path, quiet: bool) -> Result<usize> {
    let mut bad = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("listing {:?}", dir))? {
        let path = entry?.path();
        let is_changeset = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("changes"))
            .is_some_and(|rev| rev.parse::<u32>().is_ok());
        if !is_changeset {
            continue;
        }
        match read_changeset(&path) {
            Ok(cs) if !quiet => println!(
                "{}: revision {} to {}, {} blocks",
                path.display(),
                cs.old_rev,
                cs.new_rev,
                cs.blocks.len()
            ),
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", path.display(), e);
                bad += 1;
            }
        }
    }
    Ok(bad)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let options = Options::default();
    let mut db = if args.fix {
        Database::open(&args.dir, options)
    } else {
        Database::open_readonly(&args.dir, options)
    }
    .with_context(|| format!("opening database {:?}", args.dir))?;

    let report = db.check(args.fix).context("checking database")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    let bad_changesets = check_changesets(&args.dir, args.json)?;

    let damaged = report.tables.iter().filter(|t| !t.errors.is_empty()).count();
    if damaged > 0 {
        bail!("{} table(s) have structural errors", damaged);
    }
    if bad_changesets > 0 {
        bail!("{} changeset(s) could not be read", bad_changesets);
    }
    if !args.fix && !report.is_ok() {
        bail!("leaked blocks found; rerun with --fix");
    }
    Ok(())
}
