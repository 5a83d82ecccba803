//! User-facing error kinds (spec §7).
//!
//! `OversizedRequest` is deliberately absent: a request that exceeds total
//! capacity is accepted at submission and only fails at admission time, as
//! a scheduler-internal finalization reason recorded on the job record —
//! never a CLI-facing error. Likewise `LaunchError`, `OrphanedOnRestart`,
//! `CorruptRecord`, and `TimeLimitExceeded` are `reason` strings on a
//! `FAILED`/`CANCELLED` record, not variants here; the scheduler loop never
//! aborts on a per-job problem, so none of them propagate as a Rust error.
//! Anything else (generic I/O failure) passes through as a plain
//! `anyhow::Error` and is reported with exit code 3, matching spec §6's
//! `IOError` kind.
//!
//! `FatalInit` is the one variant that isn't a CLI command's own error: it
//! covers the `scheduler` subcommand's two startup-fatal conditions from
//! spec §7 — an unreadable root directory tree, or an unreadable
//! `limits.json` — and maps to exit code 1 per spec §6's `scheduler` row.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JqsError {
    #[error("bad directive at line {line}: {reason}")]
    BadDirective { line: usize, reason: String },

    #[error("job not found: {job_id}")]
    NotFound { job_id: u64 },

    #[error("job {job_id} is already terminal")]
    AlreadyTerminal { job_id: u64 },

    #[error("fatal scheduler init error: {message}")]
    FatalInit { message: String },
}

impl JqsError {
    /// Exit code per spec §6.
    pub fn exit_code(&self) -> i32 {
        match self {
            JqsError::BadDirective { .. } => 2,
            JqsError::NotFound { .. } => 4,
            JqsError::AlreadyTerminal { .. } => 5,
            JqsError::FatalInit { .. } => 1,
        }
    }
}
