//! Implementation of the `cancel` sub-command (spec §6).

use anyhow::Result;

use crate::paths::{Paths, resolve_root};
use crate::store::Store;

pub struct CancelOpts<'a> {
    pub jobid: u64,
    pub root: Option<&'a str>,
}

/// Set `cancel_requested=true`. `NotFound`/`AlreadyTerminal` propagate as
/// `JqsError`, handled at the exit-code boundary in `main`.
pub fn execute(opts: CancelOpts) -> Result<()> {
    let paths = Paths::new(resolve_root(opts.root));
    paths.ensure_layout()?;
    let store = Store::new(paths);

    store.mark_cancel_requested(opts.jobid)?;
    println!("cancel requested for job {}", opts.jobid);
    Ok(())
}
