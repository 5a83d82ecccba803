//! Job record codec (C3).
//!
//! A job record is a flat `key=value` text file, one field per line, order
//! independent. String values are always double-quoted with `\"`/`\\`
//! escaping; integers and booleans are bare; absent optional fields are
//! written as the bare token `null`. Decoding tolerates unknown keys
//! (forward compatibility, spec §4.3) and ignores blank lines and `#`
//! comments.

use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Finished,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Finished => "FINISHED",
            JobState::Cancelled => "CANCELLED",
            JobState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Cancelled | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "QUEUED" => JobState::Queued,
            "RUNNING" => JobState::Running,
            "FINISHED" => JobState::Finished,
            "CANCELLED" => JobState::Cancelled,
            "FAILED" => JobState::Failed,
            other => bail!("unknown job state: {other}"),
        })
    }
}

/// One job's full metadata, per spec §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub jobid: u64,
    pub name: String,
    pub script_path: String,
    pub workdir: String,
    pub cores: u32,
    pub mem_mb: u32,
    pub stdout_path: String,
    pub stderr_path: String,
    pub time_limit_sec: Option<u64>,
    pub state: JobState,
    pub submit_time: Option<u64>,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub supervisor_handle: Option<String>,
    pub exit_code: Option<i32>,
    pub cancel_requested: bool,
    /// Failure/cancellation reason, e.g. `OversizedRequest`, `LaunchError`,
    /// `OrphanedOnRestart`, `CorruptRecord`, `TimeLimitExceeded` (spec §7).
    /// Not part of the minimal spec table; carried as a supplemental field
    /// so the reason spec §7 requires recording is actually surfaceable.
    pub reason: Option<String>,
}

/// Zero-padded filename stem width; large enough that lexical order equals
/// numeric order up to ~10 billion submitted jobs.
const JOBID_WIDTH: usize = 10;

pub fn job_filename(jobid: u64) -> String {
    format!("{jobid:0width$}.job", width = JOBID_WIDTH)
}

impl JobRecord {
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let mut line = |k: &str, v: String| {
            out.push_str(k);
            out.push('=');
            out.push_str(&v);
            out.push('\n');
        };

        line("jobid", self.jobid.to_string());
        line("name", quote(&self.name));
        line("script_path", quote(&self.script_path));
        line("workdir", quote(&self.workdir));
        line("cores", self.cores.to_string());
        line("mem_mb", self.mem_mb.to_string());
        line("stdout_path", quote(&self.stdout_path));
        line("stderr_path", quote(&self.stderr_path));
        line("time_limit_sec", opt_u64(self.time_limit_sec));
        line("state", self.state.as_str().to_string());
        line("submit_time", opt_u64(self.submit_time));
        line("start_time", opt_u64(self.start_time));
        line("end_time", opt_u64(self.end_time));
        line(
            "supervisor_handle",
            self.supervisor_handle
                .as_deref()
                .map(quote)
                .unwrap_or_else(|| "null".to_string()),
        );
        line(
            "exit_code",
            self.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "null".to_string()),
        );
        line("cancel_requested", self.cancel_requested.to_string());
        line(
            "reason",
            self.reason
                .as_deref()
                .map(quote)
                .unwrap_or_else(|| "null".to_string()),
        );
        out
    }

    pub fn decode(text: &str) -> Result<JobRecord> {
        let mut fields: HashMap<String, String> = HashMap::new();
        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, raw_value) = line
                .split_once('=')
                .with_context(|| format!("malformed record line {}: {raw_line:?}", lineno + 1))?;
            let value = unquote(raw_value.trim())
                .with_context(|| format!("malformed value at line {}: {raw_value:?}", lineno + 1))?;
            fields.insert(key.trim().to_string(), value);
        }

        let get = |k: &str| -> Result<String> {
            fields
                .get(k)
                .cloned()
                .with_context(|| format!("missing required field '{k}'"))
        };
        let get_opt_u64 = |k: &str| -> Result<Option<u64>> {
            match fields.get(k).map(String::as_str) {
                None | Some("null") => Ok(None),
                Some(v) => Ok(Some(
                    v.parse().with_context(|| format!("field '{k}' is not a u64: {v:?}"))?,
                )),
            }
        };
        let get_opt_string = |k: &str| -> Option<String> {
            match fields.get(k).map(String::as_str) {
                None | Some("null") => None,
                Some(v) => Some(v.to_string()),
            }
        };

        let jobid: u64 = get("jobid")?
            .parse()
            .context("field 'jobid' is not a u64")?;
        let cores: u32 = get("cores")?.parse().context("field 'cores' is not a u32")?;
        let mem_mb: u32 = get("mem_mb")?
            .parse()
            .context("field 'mem_mb' is not a u32")?;
        let state: JobState = get("state")?.parse()?;
        let exit_code: Option<i32> = match fields.get("exit_code").map(String::as_str) {
            None | Some("null") => None,
            Some(v) => Some(v.parse().context("field 'exit_code' is not an i32")?),
        };
        let cancel_requested: bool = match fields.get("cancel_requested").map(String::as_str) {
            None => false,
            Some(v) => v.parse().context("field 'cancel_requested' is not a bool")?,
        };

        Ok(JobRecord {
            jobid,
            name: get("name")?,
            script_path: get("script_path")?,
            workdir: get("workdir")?,
            cores,
            mem_mb,
            stdout_path: get("stdout_path")?,
            stderr_path: get("stderr_path")?,
            time_limit_sec: get_opt_u64("time_limit_sec")?,
            state,
            submit_time: get_opt_u64("submit_time")?,
            start_time: get_opt_u64("start_time")?,
            end_time: get_opt_u64("end_time")?,
            supervisor_handle: get_opt_string("supervisor_handle"),
            exit_code,
            cancel_requested,
            reason: get_opt_string("reason"),
        })
    }
}

fn opt_u64(v: Option<u64>) -> String {
    v.map(|n| n.to_string()).unwrap_or_else(|| "null".to_string())
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

fn unquote(s: &str) -> Result<String> {
    if s == "null" {
        return Ok("null".to_string());
    }
    if !s.starts_with('"') {
        // Bare token: numbers, bools, state names.
        return Ok(s.to_string());
    }
    let bytes: Vec<char> = s.chars().collect();
    if bytes.len() < 2 || bytes[bytes.len() - 1] != '"' {
        bail!("unterminated quoted value: {s:?}");
    }
    let mut out = String::new();
    let mut i = 1;
    while i < bytes.len() - 1 {
        match bytes[i] {
            '\\' if i + 1 < bytes.len() - 1 && (bytes[i + 1] == '"' || bytes[i + 1] == '\\') => {
                out.push(bytes[i + 1]);
                i += 2;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> JobRecord {
        JobRecord {
            jobid: 42,
            name: "build job".to_string(),
            script_path: "/home/u/build.sh".to_string(),
            workdir: "/home/u".to_string(),
            cores: 2,
            mem_mb: 1024,
            stdout_path: "/home/u/build.out".to_string(),
            stderr_path: "/home/u/build.err".to_string(),
            time_limit_sec: Some(3600),
            state: JobState::Queued,
            submit_time: Some(1_700_000_000),
            start_time: None,
            end_time: None,
            supervisor_handle: None,
            exit_code: None,
            cancel_requested: false,
            reason: None,
        }
    }

    #[test]
    fn round_trip_identity() {
        let rec = sample();
        let decoded = JobRecord::decode(&rec.encode()).unwrap();
        assert_eq!(rec, decoded);
    }

    #[test]
    fn round_trip_with_quotes_in_strings() {
        let mut rec = sample();
        rec.name = "a \"quoted\" \\name".to_string();
        let decoded = JobRecord::decode(&rec.encode()).unwrap();
        assert_eq!(rec.name, decoded.name);
    }

    #[test]
    fn decode_tolerates_unknown_keys_and_comments() {
        let mut text = sample().encode();
        text.push_str("# a comment\n");
        text.push_str("future_field=\"something\"\n");
        text.push('\n');
        let decoded = JobRecord::decode(&text).unwrap();
        assert_eq!(decoded.jobid, 42);
    }

    #[test]
    fn decode_missing_required_field_fails() {
        let text = "jobid=1\n";
        assert!(JobRecord::decode(text).is_err());
    }

    #[test]
    fn job_filename_is_zero_padded_for_lexical_order() {
        assert!(job_filename(2) < job_filename(10));
        assert_eq!(job_filename(7), "0000000007.job");
    }
}
