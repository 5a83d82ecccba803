//! Path layout and advisory locking (C1).
//!
//! Resolution order for the root directory:
//!   1. `--root` CLI flag
//!   2. `JQS_ROOT` environment variable
//!   3. `$HOME/jqs`
//!
//! Two whole-file exclusive locks guard composite read-modify-write
//! sections: `resources.lock` for `usage.json`, `jobid.lock` for
//! `jobid_counter`. Both are blocking and released on process exit (OS
//! guarantee); we additionally unlock explicitly on drop.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Resolve the jobs root directory following the priority chain in spec §6.
pub fn resolve_root(cli_root: Option<&str>) -> PathBuf {
    if let Some(root) = cli_root {
        return PathBuf::from(root);
    }

    if let Ok(root) = std::env::var("JQS_ROOT") {
        if !root.is_empty() {
            return PathBuf::from(root);
        }
    }

    if let Some(base_dirs) = directories::BaseDirs::new() {
        return base_dirs.home_dir().join("jqs");
    }

    PathBuf::from("~/jqs")
}

/// Handle to the on-disk layout rooted at `root`.
#[derive(Debug, Clone)]
pub struct Paths {
    pub root: PathBuf,
}

impl Paths {
    pub fn new(root: PathBuf) -> Self {
        Paths { root }
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.root.join("queue")
    }
    pub fn running_dir(&self) -> PathBuf {
        self.root.join("running")
    }
    pub fn finished_dir(&self) -> PathBuf {
        self.root.join("finished")
    }
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }
    pub fn limits_path(&self) -> PathBuf {
        self.root.join("limits.json")
    }
    pub fn usage_path(&self) -> PathBuf {
        self.root.join("usage.json")
    }
    pub fn jobid_counter_path(&self) -> PathBuf {
        self.root.join("jobid_counter")
    }
    pub fn resources_lock_path(&self) -> PathBuf {
        self.locks_dir().join("resources.lock")
    }
    pub fn jobid_lock_path(&self) -> PathBuf {
        self.locks_dir().join("jobid.lock")
    }

    /// Create the directory tree and seed `limits.json`/`usage.json`/
    /// `jobid_counter` if they don't already exist. Never overwrites an
    /// existing `limits.json` (spec §A.3).
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.queue_dir(),
            self.running_dir(),
            self.finished_dir(),
            self.locks_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
        }

        if !self.limits_path().exists() {
            let cores_total = std::thread::available_parallelism()
                .map(|n| n.get() as u64)
                .unwrap_or(1);
            let default_limits = format!(
                "{{\n  \"cores_total\": {cores_total},\n  \"mem_mb_total\": 1024\n}}\n"
            );
            atomic_write(&self.limits_path(), default_limits.as_bytes())
                .context("seed limits.json")?;
        }

        if !self.usage_path().exists() {
            atomic_write(
                &self.usage_path(),
                b"{\n  \"cores_used\": 0,\n  \"mem_mb_used\": 0\n}\n",
            )
            .context("seed usage.json")?;
        }

        if !self.jobid_counter_path().exists() {
            atomic_write(&self.jobid_counter_path(), b"0").context("seed jobid_counter")?;
        }

        Ok(())
    }
}

/// Write `contents` to `path` via write-temp-then-rename so readers never
/// observe a truncated file (spec invariant 5 / §4.3).
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let tmp_name = format!(
        "{}.tmp.{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        std::process::id()
    );
    let tmp_path = dir.join(tmp_name);

    {
        use std::io::Write;
        let mut f = File::create(&tmp_path)
            .with_context(|| format!("create temp file {}", tmp_path.display()))?;
        f.write_all(contents)
            .with_context(|| format!("write temp file {}", tmp_path.display()))?;
        f.flush().context("flush temp file")?;
        f.sync_all().context("fsync temp file")?;
    }

    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("rename {} -> {}", tmp_path.display(), path.display()))?;
    Ok(())
}

/// Delete any stale `*.tmp.*` files in `dir` (crash-recovery sweep, spec §9).
pub fn clean_stale_tmp(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.contains(".tmp.") {
            let _ = std::fs::remove_file(entry.path());
        }
    }
    Ok(())
}

/// A whole-file exclusive advisory lock, held for the lifetime of the guard.
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Acquire the lock at `path`, blocking until available. Creates the
    /// lock file if it does not exist.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open lock file {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("acquire lock {}", path.display()))?;
        Ok(FileLock { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_root_cli_flag_wins() {
        let root = resolve_root(Some("/tmp/jqs-root"));
        assert_eq!(root, PathBuf::from("/tmp/jqs-root"));
    }

    #[test]
    fn resolve_root_env_var() {
        // SAFETY: test-only; not run in parallel with other env-mutating tests.
        unsafe {
            std::env::set_var("JQS_ROOT", "/tmp/jqs-env-root");
        }
        let root = resolve_root(None);
        unsafe {
            std::env::remove_var("JQS_ROOT");
        }
        assert_eq!(root, PathBuf::from("/tmp/jqs-env-root"));
    }

    #[test]
    fn ensure_layout_creates_tree_and_seeds_files() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path().join("root"));
        paths.ensure_layout().unwrap();
        assert!(paths.queue_dir().is_dir());
        assert!(paths.running_dir().is_dir());
        assert!(paths.finished_dir().is_dir());
        assert!(paths.locks_dir().is_dir());
        assert!(paths.limits_path().is_file());
        assert!(paths.usage_path().is_file());
        assert!(paths.jobid_counter_path().is_file());
    }

    #[test]
    fn ensure_layout_never_overwrites_existing_limits() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path().join("root"));
        paths.ensure_layout().unwrap();
        atomic_write(
            &paths.limits_path(),
            b"{\n  \"cores_total\": 2,\n  \"mem_mb_total\": 256\n}\n",
        )
        .unwrap();
        paths.ensure_layout().unwrap();
        let contents = std::fs::read_to_string(paths.limits_path()).unwrap();
        assert!(contents.contains("\"cores_total\": 2"));
    }

    #[test]
    fn atomic_write_leaves_no_tmp_file_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f.txt");
        atomic_write(&path, b"hello").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn file_lock_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x.lock");
        let lock = FileLock::acquire(&path).unwrap();
        drop(lock);
        // Re-acquiring after drop must not block.
        let _lock2 = FileLock::acquire(&path).unwrap();
    }
}
