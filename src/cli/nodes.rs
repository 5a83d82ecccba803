//! Implementation of the `nodes` sub-command (spec §6, supplemented per
//! §B of the expanded spec): print free vs total cores and memory.

use anyhow::Result;

use crate::accountant::{load_limits, load_usage};
use crate::paths::{Paths, resolve_root};

pub struct NodesOpts<'a> {
    pub root: Option<&'a str>,
}

pub fn execute(opts: NodesOpts) -> Result<()> {
    let paths = Paths::new(resolve_root(opts.root));
    paths.ensure_layout()?;

    let limits = load_limits(&paths)?;
    let usage = load_usage(&paths)?;

    let cores_free = limits.cores_total.saturating_sub(usage.cores_used);
    let mem_free = limits.mem_mb_total.saturating_sub(usage.mem_mb_used);

    println!("cores: {}/{} (free: {})", usage.cores_used, limits.cores_total, cores_free);
    println!("mem_mb: {}/{} (free: {})", usage.mem_mb_used, limits.mem_mb_total, mem_free);
    Ok(())
}
