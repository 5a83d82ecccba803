//! Scheduler loop (C6): observes the queue, admits eligible jobs under
//! resource limits, launches supervised children, reaps terminated jobs,
//! and updates accounting. Single long-lived loop, one logical actor per
//! spec §5 — no per-job blocking wait ever happens here.

use anyhow::Result;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::accountant::{self, Request};
use crate::launcher::Launcher;
use crate::paths::Paths;
use crate::record::{JobRecord, JobState};
use crate::store::{Dir, Store};

pub const T_TICK: Duration = Duration::from_secs(1);
pub const T_KILL_GRACE_SEC: u64 = 10;

const MAX_RETRIES_PER_JOB: u32 = 3;

pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct Scheduler {
    store: Store,
    launcher: Box<dyn Launcher>,
    first_tick: bool,
    /// In-memory, best-effort retry counters for transient per-job errors
    /// (spec §4.6 failure semantics: "retry the affected item up to 3
    /// times at the next tick"). Ephemeral by design — the durable
    /// invariant is the on-disk state, not this counter.
    retry_counts: HashMap<u64, u32>,
    /// When each job's graceful termination signal was sent, so a later
    /// tick can escalate to a forceful kill once `T_KILL_GRACE_SEC` has
    /// elapsed without blocking the tick that sent it (spec §4.6 step 3 /
    /// §5). Ephemeral: lost on restart, which just re-sends the graceful
    /// signal on the next tick that observes `cancel_requested`.
    terminate_requested_at: HashMap<u64, u64>,
}

impl Scheduler {
    pub fn new(paths: Paths, launcher: Box<dyn Launcher>) -> Self {
        Scheduler {
            store: Store::new(paths),
            launcher,
            first_tick: true,
            retry_counts: HashMap::new(),
            terminate_requested_at: HashMap::new(),
        }
    }

    /// Run the tick loop forever (the `scheduler` foreground command).
    pub fn run_forever(&mut self) -> Result<()> {
        loop {
            if let Err(e) = self.tick() {
                tracing::error!(error = %e, "scheduler tick failed; continuing");
            }
            std::thread::sleep(T_TICK);
        }
    }

    /// Run exactly one tick. Exposed separately from `run_forever` so
    /// tests can drive the scheduler deterministically.
    pub fn tick(&mut self) -> Result<()> {
        if self.first_tick {
            self.recover()?;
            self.first_tick = false;
        }
        self.quarantine_corrupt_records()?;
        self.honor_queued_cancellations()?;
        self.honor_running_cancellations()?;
        self.admit()?;
        self.reap()?;
        self.enforce_time_limits()?;
        Ok(())
    }

    /// Quarantine any `.job` file in `queue/` or `running/` that failed to
    /// decode, before the tick's other steps iterate those directories
    /// (spec §4.6 failure semantics: "never crash the loop"; §8: a corrupt
    /// record is isolated without affecting other jobs). `finished/`
    /// records are write-once and read-only, so a corrupt one there is
    /// left alone rather than quarantined again.
    fn quarantine_corrupt_records(&mut self) -> Result<()> {
        let when = now();
        for dir in [Dir::Queue, Dir::Running] {
            for (path, decoded) in self.store.list_raw(dir)? {
                if decoded.is_err() {
                    match self.store.quarantine_corrupt(&path, when) {
                        Ok(jobid) => {
                            self.retry_counts.remove(&jobid);
                            self.terminate_requested_at.remove(&jobid);
                        }
                        Err(e) => {
                            tracing::error!(path = %path.display(), error = %e, "failed to quarantine corrupt record");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Step 1: crash recovery. Cleans stale tmp files / duplicate records,
    /// then finalizes any `running/` job whose handle no longer
    /// corresponds to a live unit as `FAILED(OrphanedOnRestart)`.
    fn recover(&mut self) -> Result<()> {
        self.store.recover_startup()?;

        for record in self.store.list(Dir::Running)? {
            let alive = record
                .supervisor_handle
                .as_deref()
                .map(|h| self.launcher.alive(h))
                .unwrap_or(false);
            if alive {
                continue;
            }
            tracing::info!(jobid = record.jobid, "orphaned job found on restart");
            self.finalize(
                record.jobid,
                JobState::Failed,
                None,
                Some("OrphanedOnRestart"),
            )?;
        }
        Ok(())
    }

    /// Step 2: queued jobs with `cancel_requested` move straight to
    /// `finished/` as `CANCELLED`.
    fn honor_queued_cancellations(&mut self) -> Result<()> {
        for record in self.store.list(Dir::Queue)? {
            if !record.cancel_requested {
                continue;
            }
            let when = now();
            let result = self
                .store
                .move_job(record.jobid, Dir::Queue, Dir::Finished, |mut r| {
                    r.state = JobState::Cancelled;
                    r.end_time = Some(when);
                    r
                })
                .map(|_| ());
            self.note_result(record.jobid, result);
        }
        Ok(())
    }

    /// Step 3: running jobs with `cancel_requested` are driven through the
    /// non-blocking termination state machine; reaping (step 5 on a later
    /// tick) finalizes them once the unit actually exits.
    fn honor_running_cancellations(&mut self) -> Result<()> {
        for record in self.store.list(Dir::Running)? {
            if !record.cancel_requested {
                continue;
            }
            let Some(handle) = record.supervisor_handle.clone() else {
                continue;
            };
            self.advance_termination(record.jobid, &handle);
        }
        Ok(())
    }

    /// Drive one job's termination forward by exactly one step, without
    /// ever blocking the tick: send the graceful signal the first time
    /// this job is seen, then escalate to a forceful kill once
    /// `T_KILL_GRACE_SEC` has elapsed and the unit is still alive (spec
    /// §4.6 step 3 / §5 — reaping itself happens in a later tick's step
    /// 5, never here).
    fn advance_termination(&mut self, jobid: u64, handle: &str) {
        match self.terminate_requested_at.get(&jobid).copied() {
            None => {
                let result = self.launcher.terminate(handle);
                self.note_result(jobid, result);
                self.terminate_requested_at.insert(jobid, now());
            }
            Some(requested_at) => {
                if now().saturating_sub(requested_at) >= T_KILL_GRACE_SEC && self.launcher.alive(handle) {
                    tracing::info!(jobid, "grace period elapsed; forcefully killing job");
                    let result = self.launcher.force_kill(handle);
                    self.note_result(jobid, result);
                }
            }
        }
    }

    /// Step 4: admit head-of-queue-in-order candidates that fit, with
    /// backfill for jobs further back that fit even when an earlier one
    /// doesn't (spec §4.6 step 4, §8 scenario 2).
    fn admit(&mut self) -> Result<()> {
        let limits = accountant::load_limits(&self.store.paths)?;

        for record in self.store.list(Dir::Queue)? {
            if record.cancel_requested {
                // Already handled (or will be next tick) by step 2.
                continue;
            }

            let req = Request { cores: record.cores as u64, mem_mb: record.mem_mb as u64 };
            if accountant::is_oversized(req, &limits) {
                self.finalize_from_queue(record.jobid, "OversizedRequest")?;
                continue;
            }

            let reserved = accountant::try_reserve(&self.store.paths, req)?;
            if !reserved {
                // Doesn't fit right now; skip and keep scanning (backfill).
                continue;
            }

            let jobid = record.jobid;
            let when = now();
            let moved = self.store.move_job(jobid, Dir::Queue, Dir::Running, |mut r| {
                r.state = JobState::Running;
                r.start_time = Some(when);
                r
            })?;

            match self.launcher.launch(&moved) {
                Ok(handle) => {
                    self.store.rewrite_in_place(Dir::Running, jobid, |mut r| {
                        r.supervisor_handle = Some(handle);
                        r
                    })?;
                    tracing::info!(jobid, "job admitted and launched");
                }
                Err(e) => {
                    tracing::warn!(jobid, error = %e, "launch failed");
                    accountant::release(&self.store.paths, req)?;
                    self.store.move_job(jobid, Dir::Running, Dir::Finished, |mut r| {
                        r.state = JobState::Failed;
                        r.end_time = Some(now());
                        r.reason = Some("LaunchError".to_string());
                        r
                    })?;
                }
            }
        }
        Ok(())
    }

    /// A job whose request exceeds total capacity never goes through
    /// `running/`; finalize it straight from `queue/`.
    fn finalize_from_queue(&mut self, jobid: u64, reason: &str) -> Result<()> {
        let when = now();
        let reason = reason.to_string();
        self.store.move_job(jobid, Dir::Queue, Dir::Finished, move |mut r| {
            r.state = JobState::Failed;
            r.end_time = Some(when);
            r.reason = Some(reason);
            r
        })?;
        Ok(())
    }

    /// Step 5: reap running jobs whose unit has exited, releasing their
    /// reservation and recording the appropriate terminal state.
    fn reap(&mut self) -> Result<()> {
        for record in self.store.list(Dir::Running)? {
            let Some(handle) = record.supervisor_handle.clone() else {
                // Admitted but not yet launched (shouldn't normally
                // persist across a tick boundary); leave for next tick.
                continue;
            };
            if self.launcher.alive(&handle) {
                continue;
            }

            let exit_code = self.launcher.exit_code(&handle);
            let cancel_requested = record.cancel_requested;
            let final_state = if cancel_requested {
                JobState::Cancelled
            } else {
                match exit_code {
                    Some(0) => JobState::Finished,
                    _ => JobState::Failed,
                }
            };

            self.finalize(record.jobid, final_state, exit_code, None)?;
        }
        Ok(())
    }

    /// Step 6: terminate and mark-for-cancellation any running job that
    /// has exceeded its time limit. Recorded with reason
    /// `TimeLimitExceeded` once actually reaped as `CANCELLED` (spec §7).
    fn enforce_time_limits(&mut self) -> Result<()> {
        for record in self.store.list(Dir::Running)? {
            let Some(limit) = record.time_limit_sec else { continue };
            let Some(start) = record.start_time else { continue };
            if now().saturating_sub(start) <= limit {
                continue;
            }
            if record.cancel_requested {
                continue;
            }
            tracing::info!(jobid = record.jobid, "time limit exceeded; requesting cancellation");
            if let Some(handle) = record.supervisor_handle.clone() {
                self.advance_termination(record.jobid, &handle);
            }
            self.store.rewrite_in_place(Dir::Running, record.jobid, |mut r| {
                r.cancel_requested = true;
                r.reason = Some("TimeLimitExceeded".to_string());
                r
            })?;
        }
        Ok(())
    }

    /// Move a `RUNNING` job to `finished/` and release its reservation.
    fn finalize(
        &mut self,
        jobid: u64,
        state: JobState,
        exit_code: Option<i32>,
        reason: Option<&str>,
    ) -> Result<()> {
        let (_, record) = self.store.find(jobid)?;
        let req = Request { cores: record.cores as u64, mem_mb: record.mem_mb as u64 };
        let reason = reason.map(str::to_string).or_else(|| record.reason.clone());
        let when = now();

        self.store.move_job(jobid, Dir::Running, Dir::Finished, move |mut r| {
            r.state = state;
            r.exit_code = exit_code;
            r.end_time = Some(when);
            r.reason = reason;
            r
        })?;
        accountant::release(&self.store.paths, req)?;
        self.terminate_requested_at.remove(&jobid);
        Ok(())
    }

    /// Record the outcome of an operation on `jobid`, tolerating up to
    /// [`MAX_RETRIES_PER_JOB`] transient failures before giving up for this
    /// tick (spec §4.6: "no tick is aborted by a single job error").
    fn note_result(&mut self, jobid: u64, result: Result<()>) {
        match result {
            Ok(()) => {
                self.retry_counts.remove(&jobid);
            }
            Err(e) => {
                let count = self.retry_counts.entry(jobid).or_insert(0);
                *count += 1;
                if *count > MAX_RETRIES_PER_JOB {
                    tracing::error!(jobid, error = %e, "giving up on job after repeated failures this tick");
                } else {
                    tracing::warn!(jobid, attempt = *count, error = %e, "transient error, will retry next tick");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::DirectLauncher;
    use crate::paths::atomic_write;

    fn new_scheduler() -> (tempfile::TempDir, Scheduler) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path().join("root"));
        paths.ensure_layout().unwrap();
        atomic_write(
            &paths.limits_path(),
            b"{\n  \"cores_total\": 4,\n  \"mem_mb_total\": 4096\n}\n",
        )
        .unwrap();
        let scheduler = Scheduler::new(paths, Box::new(DirectLauncher::new()));
        (tmp, scheduler)
    }

    fn script(tmp: &tempfile::TempDir, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = tmp.path().join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn submit(
        scheduler: &Scheduler,
        tmp: &tempfile::TempDir,
        jobid: u64,
        cores: u32,
        mem_mb: u32,
        script_path: String,
    ) {
        let record = JobRecord {
            jobid,
            name: format!("job-{jobid}"),
            script_path,
            workdir: tmp.path().to_string_lossy().into_owned(),
            cores,
            mem_mb,
            stdout_path: tmp.path().join(format!("{jobid}.out")).to_string_lossy().into_owned(),
            stderr_path: tmp.path().join(format!("{jobid}.err")).to_string_lossy().into_owned(),
            time_limit_sec: None,
            state: JobState::Queued,
            submit_time: Some(now()),
            start_time: None,
            end_time: None,
            supervisor_handle: None,
            exit_code: None,
            cancel_requested: false,
            reason: None,
        };
        scheduler.store.enqueue(&record).unwrap();
    }

    #[test]
    fn fit_and_finish() {
        let (tmp, mut scheduler) = new_scheduler();
        let sh = script(&tmp, "a.sh", "#!/bin/sh\nexit 0\n");
        submit(&scheduler, &tmp, 1, 2, 1024, sh);

        scheduler.tick().unwrap();
        let (dir, _) = scheduler.store.find(1).unwrap();
        assert_eq!(dir, Dir::Running);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            scheduler.tick().unwrap();
            let (dir, record) = scheduler.store.find(1).unwrap();
            if dir == Dir::Finished {
                assert_eq!(record.state, JobState::Finished);
                assert_eq!(record.exit_code, Some(0));
                break;
            }
            assert!(std::time::Instant::now() < deadline, "job never finished");
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        let usage = accountant::load_usage(&scheduler.store.paths).unwrap();
        assert_eq!(usage.cores_used, 0);
        assert_eq!(usage.mem_mb_used, 0);
    }

    #[test]
    fn oversized_request_fails_immediately() {
        let (tmp, mut scheduler) = new_scheduler();
        let sh = script(&tmp, "a.sh", "#!/bin/sh\nexit 0\n");
        submit(&scheduler, &tmp, 1, 100, 1024, sh);

        scheduler.tick().unwrap();
        let (dir, record) = scheduler.store.find(1).unwrap();
        assert_eq!(dir, Dir::Finished);
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.reason.as_deref(), Some("OversizedRequest"));
    }

    #[test]
    fn backfill_admits_smaller_later_job_while_head_is_running() {
        let (tmp, mut scheduler) = new_scheduler();
        let sleeper = script(&tmp, "sleep.sh", "#!/bin/sh\nsleep 5\n");
        let quick = script(&tmp, "quick.sh", "#!/bin/sh\nexit 0\n");

        // A needs all 4 cores; B needs 2 (won't fit while A runs); C needs 1 (will).
        submit(&scheduler, &tmp, 1, 4, 1024, sleeper);
        submit(&scheduler, &tmp, 2, 2, 1024, quick.clone());
        scheduler.tick().unwrap();
        let (dir_a, _) = scheduler.store.find(1).unwrap();
        assert_eq!(dir_a, Dir::Running);
        let (dir_b, _) = scheduler.store.find(2).unwrap();
        assert_eq!(dir_b, Dir::Queue);

        submit(&scheduler, &tmp, 3, 1, 512, quick);
        scheduler.tick().unwrap();
        let (dir_c, _) = scheduler.store.find(3).unwrap();
        // C is smaller and was admitted ahead of B (backfill).
        assert_eq!(dir_c, Dir::Running);
        let (dir_b, _) = scheduler.store.find(2).unwrap();
        assert_eq!(dir_b, Dir::Queue);
    }

    #[test]
    fn cancel_queued_job_finalizes_as_cancelled() {
        let (tmp, mut scheduler) = new_scheduler();
        let sh = script(&tmp, "a.sh", "#!/bin/sh\nsleep 5\n");
        submit(&scheduler, &tmp, 1, 100, 1024, sh);
        scheduler.tick().unwrap(); // oversized -> FAILED already, use a fitting job instead
        let (_, record) = scheduler.store.find(1).unwrap();
        assert_eq!(record.state, JobState::Failed);

        let sh2 = script(&tmp, "b.sh", "#!/bin/sh\nsleep 5\n");
        submit(&scheduler, &tmp, 2, 4, 4096, sh2);
        // Make it not fit initially is not needed; cancel while queued directly.
        scheduler.store.mark_cancel_requested(2).unwrap();
        scheduler.tick().unwrap();
        let (dir, record) = scheduler.store.find(2).unwrap();
        assert_eq!(dir, Dir::Finished);
        assert_eq!(record.state, JobState::Cancelled);
    }

    #[test]
    fn cancelling_a_running_job_does_not_block_the_tick() {
        let (tmp, mut scheduler) = new_scheduler();
        let sh = script(&tmp, "sleep.sh", "#!/bin/sh\nsleep 300\n");
        submit(&scheduler, &tmp, 1, 1, 128, sh);

        scheduler.tick().unwrap(); // admits job 1
        let (dir, _) = scheduler.store.find(1).unwrap();
        assert_eq!(dir, Dir::Running);

        scheduler.store.mark_cancel_requested(1).unwrap();
        let start = std::time::Instant::now();
        scheduler.tick().unwrap(); // sends the graceful signal
        let elapsed = start.elapsed();

        // T_KILL_GRACE_SEC is 10s; a tick that sent the graceful signal and
        // returned immediately must take nowhere near that long.
        assert!(
            elapsed < Duration::from_secs(2),
            "tick() blocked for {elapsed:?}, expected it to return immediately"
        );
        assert!(scheduler.terminate_requested_at.contains_key(&1));
    }

    #[test]
    fn escalates_to_force_kill_only_after_grace_period_elapses() {
        let (tmp, mut scheduler) = new_scheduler();
        let sh = script(&tmp, "ignore-term.sh", "#!/bin/sh\ntrap '' TERM\nsleep 300\n");
        submit(&scheduler, &tmp, 1, 1, 128, sh);

        scheduler.tick().unwrap(); // admit
        scheduler.store.mark_cancel_requested(1).unwrap();
        scheduler.tick().unwrap(); // sends SIGTERM, which this script ignores

        // Still alive right after the graceful signal: not yet force-killed.
        let (dir, _) = scheduler.store.find(1).unwrap();
        assert_eq!(dir, Dir::Running);

        // Backdate the recorded termination time so the next tick sees the
        // grace period as already elapsed, without actually sleeping in the
        // test.
        scheduler.terminate_requested_at.insert(1, now().saturating_sub(T_KILL_GRACE_SEC + 1));
        scheduler.tick().unwrap(); // escalates to SIGKILL and reaps

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let (dir, record) = scheduler.store.find(1).unwrap();
            if dir == Dir::Finished {
                assert_eq!(record.state, JobState::Cancelled);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "job never reaped after force-kill");
            std::thread::sleep(Duration::from_millis(20));
            scheduler.tick().unwrap();
        }
    }

    #[test]
    fn corrupt_queue_record_is_quarantined_without_affecting_others() {
        let (tmp, mut scheduler) = new_scheduler();
        let sh = script(&tmp, "a.sh", "#!/bin/sh\nexit 0\n");
        submit(&scheduler, &tmp, 1, 1, 256, sh);

        let corrupt_path = scheduler
            .store
            .paths
            .queue_dir()
            .join(crate::record::job_filename(2));
        std::fs::write(&corrupt_path, "garbage, not key=value").unwrap();

        scheduler.tick().unwrap();

        assert!(!corrupt_path.exists());
        let (dir, record) = scheduler.store.find(2).unwrap();
        assert_eq!(dir, Dir::Finished);
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.reason.as_deref(), Some("CorruptRecord"));

        // Job 1 still proceeds normally despite job 2's corrupt record.
        let (dir1, _) = scheduler.store.find(1).unwrap();
        assert_eq!(dir1, Dir::Running);
    }

    #[test]
    fn time_limit_exceeded_cancels_running_job() {
        let (tmp, mut scheduler) = new_scheduler();
        let sh = script(&tmp, "a.sh", "#!/bin/sh\nsleep 30\n");
        let mut record = JobRecord {
            jobid: 1,
            name: "a".to_string(),
            script_path: sh,
            workdir: tmp.path().to_string_lossy().into_owned(),
            cores: 1,
            mem_mb: 128,
            stdout_path: tmp.path().join("out").to_string_lossy().into_owned(),
            stderr_path: tmp.path().join("err").to_string_lossy().into_owned(),
            time_limit_sec: Some(0),
            state: JobState::Queued,
            submit_time: Some(now()),
            start_time: None,
            end_time: None,
            supervisor_handle: None,
            exit_code: None,
            cancel_requested: false,
            reason: None,
        };
        record.time_limit_sec = Some(0);
        scheduler.store.enqueue(&record).unwrap();

        scheduler.tick().unwrap(); // admit
        std::thread::sleep(std::time::Duration::from_millis(1100));
        scheduler.tick().unwrap(); // time limit exceeded -> cancel_requested
        let (_, record) = scheduler.store.find(1).unwrap();
        assert!(record.cancel_requested);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(15);
        loop {
            scheduler.tick().unwrap();
            let (dir, record) = scheduler.store.find(1).unwrap();
            if dir == Dir::Finished {
                assert_eq!(record.state, JobState::Cancelled);
                assert_eq!(record.reason.as_deref(), Some("TimeLimitExceeded"));
                break;
            }
            assert!(std::time::Instant::now() < deadline, "job never cancelled");
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
    }
}
