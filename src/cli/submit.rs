//! Implementation of the `submit` sub-command (spec §6).

use anyhow::{Context, Result};
use tracing::info;

use crate::accountant::{self, Request};
use crate::directive::parse_directives;
use crate::paths::{Paths, resolve_root};
use crate::record::{JobRecord, JobState};
use crate::store::Store;

pub struct SubmitOpts<'a> {
    pub script: &'a str,
    pub root: Option<&'a str>,
}

/// Parse the script's `#JS` header, assign a jobid, and enqueue it. Prints
/// the jobid on success. A job whose request exceeds total capacity is
/// still accepted here — it is only classified `OversizedRequest` when the
/// scheduler inspects it at admission time (spec §4.4).
pub fn execute(opts: SubmitOpts) -> Result<()> {
    let script_path = std::fs::canonicalize(opts.script)
        .with_context(|| format!("script not found: {}", opts.script))?;
    let contents = std::fs::read_to_string(&script_path)
        .with_context(|| format!("read script {}", script_path.display()))?;

    let req = parse_directives(&contents)?;

    let paths = Paths::new(resolve_root(opts.root));
    paths.ensure_layout()?;
    let store = Store::new(paths);

    let jobid = store.new_jobid()?;
    let name = req.name.unwrap_or_else(|| {
        script_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("job-{jobid}"))
    });
    let workdir = req
        .workdir
        .map(std::path::PathBuf::from)
        .unwrap_or(std::env::current_dir().context("resolve current directory")?);
    let stdout_path = req
        .stdout
        .unwrap_or_else(|| workdir.join(format!("{jobid}.stdout")).to_string_lossy().into_owned());
    let stderr_path = req
        .stderr
        .unwrap_or_else(|| workdir.join(format!("{jobid}.stderr")).to_string_lossy().into_owned());

    let record = JobRecord {
        jobid,
        name,
        script_path: script_path.to_string_lossy().into_owned(),
        workdir: workdir.to_string_lossy().into_owned(),
        cores: req.cores,
        mem_mb: req.mem_mb,
        stdout_path,
        stderr_path,
        time_limit_sec: req.time_limit_sec,
        state: JobState::Queued,
        submit_time: Some(crate::scheduler::now()),
        start_time: None,
        end_time: None,
        supervisor_handle: None,
        exit_code: None,
        cancel_requested: false,
        reason: None,
    };

    let oversized = {
        let limits = accountant::load_limits(&store.paths)?;
        accountant::is_oversized(
            Request { cores: record.cores as u64, mem_mb: record.mem_mb as u64 },
            &limits,
        )
    };
    if oversized {
        tracing::warn!(jobid, "submitted job request exceeds total capacity; will fail at admission");
    }

    store.enqueue(&record)?;
    info!(jobid, "job submitted");
    println!("{jobid}");
    Ok(())
}
