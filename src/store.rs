//! State store (C5): atomic moves between `queue/`, `running/`,
//! `finished/`, and job lookup by id.

use anyhow::{Context, Result, bail};
use std::path::PathBuf;

use crate::error::JqsError;
use crate::paths::{FileLock, Paths, atomic_write, clean_stale_tmp};
use crate::record::{JobRecord, JobState, job_filename};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Queue,
    Running,
    Finished,
}

impl Dir {
    fn path(self, paths: &Paths) -> PathBuf {
        match self {
            Dir::Queue => paths.queue_dir(),
            Dir::Running => paths.running_dir(),
            Dir::Finished => paths.finished_dir(),
        }
    }

    /// Crash-recovery priority: a record present in more than one directory
    /// is kept in whichever of these appears latest in lifecycle order —
    /// `finished` is authoritative over `running`, which is authoritative
    /// over `queue` (spec §9: "prefers the destination over the source if
    /// both exist", generalized since recovery doesn't know which move was
    /// in flight).
    fn recovery_priority(self) -> u8 {
        match self {
            Dir::Queue => 0,
            Dir::Running => 1,
            Dir::Finished => 2,
        }
    }
}

pub struct Store {
    pub paths: Paths,
}

impl Store {
    pub fn new(paths: Paths) -> Self {
        Store { paths }
    }

    /// Allocate the next monotonically increasing jobid (spec invariant 4).
    pub fn new_jobid(&self) -> Result<u64> {
        let _lock = FileLock::acquire(&self.paths.jobid_lock_path())?;
        let path = self.paths.jobid_counter_path();
        let current: u64 = match std::fs::read_to_string(&path) {
            Ok(s) => s.trim().parse().unwrap_or(0),
            Err(_) => 0,
        };
        let next = current + 1;
        atomic_write(&path, next.to_string().as_bytes())?;
        Ok(next)
    }

    /// Write a new record into `queue/` via temp+rename (spec §4.5).
    pub fn enqueue(&self, record: &JobRecord) -> Result<()> {
        let path = self.paths.queue_dir().join(job_filename(record.jobid));
        atomic_write(&path, record.encode().as_bytes())
    }

    /// List records in `dir`, in filename (i.e. jobid) order. Records that
    /// fail to decode are reported alongside their path rather than
    /// silently dropped, so callers (the scheduler) can quarantine them
    /// (spec §4.6: corrupt record -> `FAILED(CorruptRecord)`).
    pub fn list_raw(&self, dir: Dir) -> Result<Vec<(PathBuf, Result<JobRecord>)>> {
        let dir_path = dir.path(&self.paths);
        if !dir_path.exists() {
            return Ok(vec![]);
        }
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir_path)
            .with_context(|| format!("read dir {}", dir_path.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("job"))
            .collect();
        entries.sort();

        Ok(entries
            .into_iter()
            .map(|path| {
                let decoded = std::fs::read_to_string(&path)
                    .with_context(|| format!("read {}", path.display()))
                    .and_then(|s| JobRecord::decode(&s));
                (path, decoded)
            })
            .collect())
    }

    /// List successfully decoded records in `dir`, in jobid order.
    pub fn list(&self, dir: Dir) -> Result<Vec<JobRecord>> {
        Ok(self
            .list_raw(dir)?
            .into_iter()
            .filter_map(|(_, r)| r.ok())
            .collect())
    }

    /// Find a job by id, scanning `running`, `queue`, `finished` in that
    /// order (spec §4.5).
    pub fn find(&self, jobid: u64) -> Result<(Dir, JobRecord)> {
        for dir in [Dir::Running, Dir::Queue, Dir::Finished] {
            let path = dir.path(&self.paths).join(job_filename(jobid));
            if let Ok(text) = std::fs::read_to_string(&path) {
                let record = JobRecord::decode(&text)
                    .with_context(|| format!("decode {}", path.display()))?;
                return Ok((dir, record));
            }
        }
        Err(JqsError::NotFound { job_id: jobid }.into())
    }

    /// Move a job's record from `from` to `to`, applying `mutate` to it
    /// first. Not atomic across directories (no such primitive on POSIX);
    /// the destination is always written (temp+rename) before the source
    /// is unlinked, so a crash mid-move leaves the record recoverable by
    /// [`Store::recover_startup`].
    pub fn move_job(
        &self,
        jobid: u64,
        from: Dir,
        to: Dir,
        mutate: impl FnOnce(JobRecord) -> JobRecord,
    ) -> Result<JobRecord> {
        let src_path = from.path(&self.paths).join(job_filename(jobid));
        let text = std::fs::read_to_string(&src_path)
            .with_context(|| format!("read {}", src_path.display()))?;
        let record = JobRecord::decode(&text)?;
        let record = mutate(record);

        let dst_path = to.path(&self.paths).join(job_filename(jobid));
        atomic_write(&dst_path, record.encode().as_bytes())?;
        std::fs::remove_file(&src_path).ok();

        Ok(record)
    }

    /// Rewrite a record in place (same directory), e.g. setting
    /// `cancel_requested` or `supervisor_handle`, via temp+rename.
    pub fn rewrite_in_place(
        &self,
        dir: Dir,
        jobid: u64,
        mutate: impl FnOnce(JobRecord) -> JobRecord,
    ) -> Result<JobRecord> {
        let path = dir.path(&self.paths).join(job_filename(jobid));
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        let record = JobRecord::decode(&text)?;
        let record = mutate(record);
        atomic_write(&path, record.encode().as_bytes())?;
        Ok(record)
    }

    /// Set `cancel_requested=true` on a job. Valid in `QUEUED` or
    /// `RUNNING`; returns `AlreadyTerminal` if the job is in `finished/`.
    pub fn mark_cancel_requested(&self, jobid: u64) -> Result<()> {
        let (dir, record) = self.find(jobid)?;
        if record.state.is_terminal() {
            bail!(JqsError::AlreadyTerminal { job_id: jobid });
        }
        self.rewrite_in_place(dir, jobid, |mut r| {
            r.cancel_requested = true;
            r
        })?;
        Ok(())
    }

    /// Quarantine a `.job` file that failed to decode: synthesize a
    /// minimal `FAILED(CorruptRecord)` record from the jobid recoverable
    /// out of its filename and move it to `finished/`, so one unreadable
    /// record never blocks the rest of the directory from being scanned
    /// (spec §4.6 failure semantics / §8 "corrupt record file").
    pub fn quarantine_corrupt(&self, path: &std::path::Path, now: u64) -> Result<u64> {
        let jobid: u64 = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let record = JobRecord {
            jobid,
            name: format!("corrupt-{jobid}"),
            script_path: String::new(),
            workdir: String::new(),
            cores: 0,
            mem_mb: 0,
            stdout_path: String::new(),
            stderr_path: String::new(),
            time_limit_sec: None,
            state: JobState::Failed,
            submit_time: None,
            start_time: None,
            end_time: Some(now),
            supervisor_handle: None,
            exit_code: None,
            cancel_requested: false,
            reason: Some("CorruptRecord".to_string()),
        };

        let dst = self.paths.finished_dir().join(job_filename(jobid));
        atomic_write(&dst, record.encode().as_bytes())?;
        std::fs::remove_file(path).ok();
        tracing::warn!(jobid, path = %path.display(), "quarantined unreadable job record");
        Ok(jobid)
    }

    /// Crash-recovery sweep (spec §9 / §4.6 step 1, store half): delete
    /// stale `*.tmp.*` files in all three directories, and for any jobid
    /// present in more than one directory, keep only the copy in the
    /// highest-priority directory.
    pub fn recover_startup(&self) -> Result<()> {
        for dir in [Dir::Queue, Dir::Running, Dir::Finished] {
            clean_stale_tmp(&dir.path(&self.paths))?;
        }

        use std::collections::HashMap;
        let mut by_jobid: HashMap<u64, Vec<Dir>> = HashMap::new();
        for dir in [Dir::Queue, Dir::Running, Dir::Finished] {
            for (_, decoded) in self.list_raw(dir)? {
                if let Ok(record) = decoded {
                    by_jobid.entry(record.jobid).or_default().push(dir);
                }
            }
        }

        for (jobid, dirs) in by_jobid {
            if dirs.len() <= 1 {
                continue;
            }
            let winner = *dirs.iter().max_by_key(|d| d.recovery_priority()).unwrap();
            for dir in dirs {
                if dir != winner {
                    let path = dir.path(&self.paths).join(job_filename(jobid));
                    tracing::warn!(
                        jobid,
                        dropped_from = ?dir,
                        kept_in = ?winner,
                        "duplicate job record across directories at startup; removing stale copy"
                    );
                    std::fs::remove_file(path).ok();
                }
            }
        }

        Ok(())
    }
}
