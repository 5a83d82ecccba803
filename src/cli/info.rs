//! Implementation of the `info` sub-command (spec §6): print the full
//! decoded record for one job.

use anyhow::Result;

use crate::paths::{Paths, resolve_root};
use crate::store::Store;

pub struct InfoOpts<'a> {
    pub jobid: u64,
    pub root: Option<&'a str>,
}

pub fn execute(opts: InfoOpts) -> Result<()> {
    let paths = Paths::new(resolve_root(opts.root));
    paths.ensure_layout()?;
    let store = Store::new(paths);

    let (dir, record) = store.find(opts.jobid)?;
    println!("jobid: {}", record.jobid);
    println!("name: {}", record.name);
    println!("state: {} ({:?})", record.state, dir);
    println!("script_path: {}", record.script_path);
    println!("workdir: {}", record.workdir);
    println!("cores: {}", record.cores);
    println!("mem_mb: {}", record.mem_mb);
    println!("stdout_path: {}", record.stdout_path);
    println!("stderr_path: {}", record.stderr_path);
    println!("time_limit_sec: {}", opt(record.time_limit_sec));
    println!("submit_time: {}", opt(record.submit_time));
    println!("start_time: {}", opt(record.start_time));
    println!("end_time: {}", opt(record.end_time));
    println!("supervisor_handle: {}", record.supervisor_handle.as_deref().unwrap_or("-"));
    println!("exit_code: {}", opt(record.exit_code));
    println!("cancel_requested: {}", record.cancel_requested);
    println!("reason: {}", record.reason.as_deref().unwrap_or("-"));
    Ok(())
}

fn opt<T: std::fmt::Display>(v: Option<T>) -> String {
    v.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string())
}
