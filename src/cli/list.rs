//! Implementation of the `q` sub-command (spec §6): list every job across
//! all three directories.

use anyhow::Result;

use crate::paths::{Paths, resolve_root};
use crate::store::{Dir, Store};

pub struct ListOpts<'a> {
    pub root: Option<&'a str>,
}

pub fn execute(opts: ListOpts) -> Result<()> {
    let paths = Paths::new(resolve_root(opts.root));
    paths.ensure_layout()?;
    let store = Store::new(paths);

    let mut rows = Vec::new();
    for dir in [Dir::Queue, Dir::Running, Dir::Finished] {
        rows.extend(store.list(dir)?);
    }
    rows.sort_by_key(|r| r.jobid);

    println!(
        "{:<8} {:<9} {:<20} {:>5} {:>8} {:>12} {:>12} {:>12}",
        "JOBID", "STATE", "NAME", "CORES", "MEM_MB", "SUBMITTED", "STARTED", "ENDED"
    );
    for r in rows {
        println!(
            "{:<8} {:<9} {:<20} {:>5} {:>8} {:>12} {:>12} {:>12}",
            r.jobid,
            r.state,
            r.name,
            r.cores,
            r.mem_mb,
            fmt_time(r.submit_time),
            fmt_time(r.start_time),
            fmt_time(r.end_time),
        );
    }
    Ok(())
}

fn fmt_time(t: Option<u64>) -> String {
    t.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string())
}
