//! Resource accountant (C4).
//!
//! Holds `(cores_total, mem_mb_total)` from `limits.json` and
//! `(cores_used, mem_mb_used)` from `usage.json`. All mutating operations
//! are serialized under `resources.lock`; `fits`/reads are lock-free
//! (callers that need a consistent read-then-act pair acquire the lock
//! themselves, as the scheduler does around its admit step).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::paths::{FileLock, Paths, atomic_write};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Limits {
    pub cores_total: u64,
    pub mem_mb_total: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Usage {
    pub cores_used: u64,
    pub mem_mb_used: u64,
}

/// A resource request's shape, independent of the full job record.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub cores: u64,
    pub mem_mb: u64,
}

pub fn load_limits(paths: &Paths) -> Result<Limits> {
    let raw = std::fs::read(paths.limits_path()).context("read limits.json")?;
    serde_json::from_slice(&raw).context("parse limits.json")
}

pub fn load_usage(paths: &Paths) -> Result<Usage> {
    let raw = std::fs::read(paths.usage_path()).context("read usage.json")?;
    serde_json::from_slice(&raw).context("parse usage.json")
}

fn save_usage(paths: &Paths, usage: &Usage) -> Result<()> {
    let contents = serde_json::to_string_pretty(usage).context("serialize usage.json")?;
    atomic_write(&paths.usage_path(), contents.as_bytes())
}

/// Whether `req` is inherently unschedulable against the total capacity
/// (spec §4.4: "a job request with cores > cores_total or mem_mb >
/// mem_mb_total is classified unschedulable").
pub fn is_oversized(req: Request, limits: &Limits) -> bool {
    req.cores > limits.cores_total || req.mem_mb > limits.mem_mb_total
}

pub fn fits(req: Request, limits: &Limits, usage: &Usage) -> bool {
    req.cores + usage.cores_used <= limits.cores_total
        && req.mem_mb + usage.mem_mb_used <= limits.mem_mb_total
}

/// Atomically check-and-reserve `req` against current usage. Returns
/// `Ok(true)` if reserved, `Ok(false)` if it doesn't currently fit (the
/// caller should leave the job queued and try a later candidate —
/// backfill, spec §4.6 step 4).
pub fn try_reserve(paths: &Paths, req: Request) -> Result<bool> {
    let _lock = FileLock::acquire(&paths.resources_lock_path())?;
    let limits = load_limits(paths)?;
    let mut usage = load_usage(paths)?;
    if !fits(req, &limits, &usage) {
        return Ok(false);
    }
    usage.cores_used += req.cores;
    usage.mem_mb_used += req.mem_mb;
    save_usage(paths, &usage)?;
    Ok(true)
}

/// Release a previously reserved `req`. Saturates at zero; logs a warning
/// if it would have gone negative, which indicates a prior accounting bug
/// (spec §4.4).
pub fn release(paths: &Paths, req: Request) -> Result<()> {
    let _lock = FileLock::acquire(&paths.resources_lock_path())?;
    let mut usage = load_usage(paths)?;

    if usage.cores_used < req.cores {
        tracing::warn!(
            cores_used = usage.cores_used,
            releasing = req.cores,
            "release would underflow cores_used; saturating at zero"
        );
        usage.cores_used = 0;
    } else {
        usage.cores_used -= req.cores;
    }

    if usage.mem_mb_used < req.mem_mb {
        tracing::warn!(
            mem_mb_used = usage.mem_mb_used,
            releasing = req.mem_mb,
            "release would underflow mem_mb_used; saturating at zero"
        );
        usage.mem_mb_used = 0;
    } else {
        usage.mem_mb_used -= req.mem_mb;
    }

    save_usage(paths, &usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::Paths;

    fn setup() -> (tempfile::TempDir, Paths) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path().join("root"));
        paths.ensure_layout().unwrap();
        atomic_write(
            &paths.limits_path(),
            b"{\n  \"cores_total\": 8,\n  \"mem_mb_total\": 16384\n}\n",
        )
        .unwrap();
        (tmp, paths)
    }

    #[test]
    fn fits_exact_boundary() {
        let limits = Limits { cores_total: 8, mem_mb_total: 16384 };
        let usage = Usage { cores_used: 6, mem_mb_used: 0 };
        assert!(fits(Request { cores: 2, mem_mb: 0 }, &limits, &usage));
        assert!(!fits(Request { cores: 3, mem_mb: 0 }, &limits, &usage));
    }

    #[test]
    fn oversized_detection() {
        let limits = Limits { cores_total: 8, mem_mb_total: 16384 };
        assert!(is_oversized(Request { cores: 9, mem_mb: 0 }, &limits));
        assert!(is_oversized(Request { cores: 1, mem_mb: 20000 }, &limits));
        assert!(!is_oversized(Request { cores: 8, mem_mb: 16384 }, &limits));
    }

    #[test]
    fn reserve_then_release_round_trips_to_zero() {
        let (_tmp, paths) = setup();
        assert!(try_reserve(&paths, Request { cores: 4, mem_mb: 1024 }).unwrap());
        let usage = load_usage(&paths).unwrap();
        assert_eq!(usage.cores_used, 4);
        assert_eq!(usage.mem_mb_used, 1024);

        release(&paths, Request { cores: 4, mem_mb: 1024 }).unwrap();
        let usage = load_usage(&paths).unwrap();
        assert_eq!(usage.cores_used, 0);
        assert_eq!(usage.mem_mb_used, 0);
    }

    #[test]
    fn reserve_fails_when_it_would_exceed_capacity() {
        let (_tmp, paths) = setup();
        assert!(try_reserve(&paths, Request { cores: 8, mem_mb: 16384 }).unwrap());
        assert!(!try_reserve(&paths, Request { cores: 1, mem_mb: 0 }).unwrap());
    }

    #[test]
    fn release_saturates_at_zero_on_underflow() {
        let (_tmp, paths) = setup();
        release(&paths, Request { cores: 5, mem_mb: 100 }).unwrap();
        let usage = load_usage(&paths).unwrap();
        assert_eq!(usage.cores_used, 0);
        assert_eq!(usage.mem_mb_used, 0);
    }
}
