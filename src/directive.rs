//! `#JS` directive parser (C2).
//!
//! Reads the submitted script's first contiguous block of lines beginning
//! `#!` or `#JS` (plus blanks). Each `#JS` line is tokenized into
//! space-separated `key=value` pairs, where `value` is either a bare token
//! or a double-quoted string with `\"` and `\\` escapes. Unknown keys warn
//! and are ignored; any syntactic error fails the whole parse with
//! `BadDirective(line, reason)` — no partial request is ever produced.

use crate::error::JqsError;

/// A parsed resource request, before defaults for `script_path`/`workdir`
/// (filled in by the caller, which knows the submitted script's path and
/// CWD) are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub name: Option<String>,
    pub cores: u32,
    pub mem_mb: u32,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub workdir: Option<String>,
    pub time_limit_sec: Option<u64>,
}

impl Default for JobRequest {
    fn default() -> Self {
        JobRequest {
            name: None,
            cores: 1,
            mem_mb: 512,
            stdout: None,
            stderr: None,
            workdir: None,
            time_limit_sec: None,
        }
    }
}

const RECOGNIZED_KEYS: &[&str] = &[
    "name",
    "cores",
    "mem_mb",
    "stdout",
    "stderr",
    "workdir",
    "time_limit",
];

/// Parse the `#JS` directive header of `script` into a [`JobRequest`].
pub fn parse_directives(script: &str) -> Result<JobRequest, JqsError> {
    let mut req = JobRequest::default();

    for (idx, line) in script.lines().enumerate() {
        let lineno = idx + 1;
        let trimmed = line.trim_start();

        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with("#!") {
            continue;
        }
        if !trimmed.starts_with("#JS") {
            // First line that is neither blank, a shebang, nor a directive
            // ends the header block.
            break;
        }

        // A `#JS` line: everything after `#JS` and following whitespace is
        // the token stream. Per spec §4.2/§6, `#JS` must be followed by
        // whitespace (bare `#JSfoo` is not a directive line and ends the
        // header, same as any other non-matching line).
        let rest = &trimmed[3..];
        if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
            break;
        }

        let tokens = tokenize(rest.trim_start(), lineno)?;
        for (key, value) in tokens {
            apply_directive(&mut req, &key, &value, lineno)?;
        }
    }

    Ok(req)
}

/// Split a `#JS` line's body into `key=value` tokens, honoring quoting.
fn tokenize(body: &str, lineno: usize) -> Result<Vec<(String, String)>, JqsError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = body.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        // Skip runs of whitespace between tokens.
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }

        let start = i;
        while i < chars.len() && chars[i] != '=' && !chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() || chars[i] != '=' {
            return Err(JqsError::BadDirective {
                line: lineno,
                reason: format!(
                    "expected key=value token, found {:?}",
                    chars[start..i].iter().collect::<String>()
                ),
            });
        }
        let key: String = chars[start..i].iter().collect();
        i += 1; // consume '='

        let value = if i < chars.len() && chars[i] == '"' {
            i += 1;
            let mut value = String::new();
            let mut closed = false;
            while i < chars.len() {
                match chars[i] {
                    '\\' if i + 1 < chars.len() && (chars[i + 1] == '"' || chars[i + 1] == '\\') => {
                        value.push(chars[i + 1]);
                        i += 2;
                    }
                    '"' => {
                        closed = true;
                        i += 1;
                        break;
                    }
                    c => {
                        value.push(c);
                        i += 1;
                    }
                }
            }
            if !closed {
                return Err(JqsError::BadDirective {
                    line: lineno,
                    reason: format!("unterminated quoted value for key '{key}'"),
                });
            }
            value
        } else {
            let vstart = i;
            while i < chars.len() && !chars[i].is_whitespace() {
                i += 1;
            }
            chars[vstart..i].iter().collect()
        };

        tokens.push((key, value));
    }

    Ok(tokens)
}

fn apply_directive(
    req: &mut JobRequest,
    key: &str,
    value: &str,
    lineno: usize,
) -> Result<(), JqsError> {
    if !RECOGNIZED_KEYS.contains(&key) {
        tracing::warn!(line = lineno, key, "unrecognized #JS directive key, ignoring");
        return Ok(());
    }

    match key {
        "name" => req.name = Some(value.to_string()),
        "stdout" => req.stdout = Some(value.to_string()),
        "stderr" => req.stderr = Some(value.to_string()),
        "workdir" => req.workdir = Some(value.to_string()),
        "cores" => req.cores = parse_positive_int(value, lineno, "cores")? as u32,
        "mem_mb" => req.mem_mb = parse_positive_int(value, lineno, "mem_mb")? as u32,
        "time_limit" => req.time_limit_sec = Some(parse_time_limit(value, lineno)?),
        _ => unreachable!("RECOGNIZED_KEYS exhaustively matched above"),
    }
    Ok(())
}

fn parse_positive_int(value: &str, lineno: usize, key: &str) -> Result<u64, JqsError> {
    let n: u64 = value.parse().map_err(|_| JqsError::BadDirective {
        line: lineno,
        reason: format!("{key} must be a positive integer, got '{value}'"),
    })?;
    if n == 0 {
        return Err(JqsError::BadDirective {
            line: lineno,
            reason: format!("{key} must be >= 1, got '{value}'"),
        });
    }
    Ok(n)
}

/// Parse `HH:MM:SS` into total seconds. `HH` is unbounded; `MM`/`SS` must be < 60.
fn parse_time_limit(value: &str, lineno: usize) -> Result<u64, JqsError> {
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 3 {
        return Err(JqsError::BadDirective {
            line: lineno,
            reason: format!("time_limit must be HH:MM:SS, got '{value}'"),
        });
    }
    let bad = |reason: String| JqsError::BadDirective { line: lineno, reason };

    let hh: u64 = parts[0]
        .parse()
        .map_err(|_| bad(format!("invalid hours component in '{value}'")))?;
    let mm: u64 = parts[1]
        .parse()
        .map_err(|_| bad(format!("invalid minutes component in '{value}'")))?;
    let ss: u64 = parts[2]
        .parse()
        .map_err(|_| bad(format!("invalid seconds component in '{value}'")))?;

    if mm >= 60 {
        return Err(bad(format!("minutes component must be < 60, got {mm}")));
    }
    if ss >= 60 {
        return Err(bad(format!("seconds component must be < 60, got {ss}")));
    }

    Ok(hh * 3600 + mm * 60 + ss)
}
