//! Invokes a module as a child process under the CLI contract in the design's
//! `ModuleRunner` section: `--check` / `--version` / no flags, a structured status
//! envelope on stdout, and a soft timeout enforced by `wait-timeout`.
//!
//! The only internal concurrency in the whole crate lives here: two reader threads
//! per child (stdout, stderr), joined before the child is reaped, so a module that
//! fills one pipe's buffer can never deadlock the orchestrator.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use wait_timeout::ChildExt;

use crate::error::runner::RunnerError;
use crate::version::Version;

/// Environment variable names the child never inherits.
const SCRUBBED_ENV_PREFIXES: &[&str] = &["FLEET_", "FLEETD_"];

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InvokeMode {
    Check,
    Version,
    Update,
}

impl InvokeMode {
    fn flag(self) -> Option<&'static str> {
        match self {
            InvokeMode::Check => Some("--check"),
            InvokeMode::Version => Some("--version"),
            InvokeMode::Update => None,
        }
    }
}

/// The module's response, parsed from its last well-formed JSON line on stdout.
/// Absent or malformed envelopes are `ModuleFailure`, not silently treated as
/// success.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusEnvelope {
    pub success: bool,
    #[serde(default)]
    pub updated: Option<bool>,
    #[serde(default)]
    pub old_version: Option<Version>,
    #[serde(default)]
    pub new_version: Option<Version>,
    #[serde(default)]
    pub restart_required: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StatusEnvelope {
    pub fn restart_required(&self) -> bool {
        self.restart_required.unwrap_or(false)
    }
}

pub struct ModuleRunner {
    default_timeout: Duration,
}

impl ModuleRunner {
    pub fn new(default_timeout_secs: u64) -> Self {
        Self {
            default_timeout: Duration::from_secs(default_timeout_secs),
        }
    }

    /// Runs `entry_point` with `module_dir` as its working directory, in `mode`.
    /// `timeout_override` is the module manifest's `config.timeout_seconds`, if set.
    pub fn invoke(
        &self,
        module: &str,
        module_dir: &Path,
        entry_point: &Path,
        mode: InvokeMode,
        timeout_override: Option<u64>,
    ) -> Result<StatusEnvelope, RunnerError> {
        let timeout = timeout_override
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let mut command = Command::new(entry_point);
        command.current_dir(module_dir);
        if let Some(flag) = mode.flag() {
            command.arg(flag);
        }
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        scrub_env(&mut command);

        let mut child = command.spawn().map_err(|source| RunnerError::Spawn {
            module: module.to_string(),
            source,
        })?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let out_module = module.to_string();
        let stdout_reader = thread::spawn(move || collect_lines(stdout, &out_module, false));
        let err_module = module.to_string();
        let stderr_reader = thread::spawn(move || collect_lines(stderr, &err_module, true));

        let status = wait_with_timeout(&mut child, timeout, module)?;

        let stdout_lines = stdout_reader.join().unwrap_or_default();
        let _ = stderr_reader.join();

        let status = match status {
            Some(status) => status,
            None => {
                return Err(RunnerError::TimedOut {
                    module: module.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }
        };

        let envelope = parse_envelope(module, &stdout_lines)?;

        if !status.success() {
            return Err(RunnerError::ModuleFailure {
                module: module.to_string(),
                code: status.code(),
                message: envelope
                    .error
                    .clone()
                    .unwrap_or_else(|| "module exited non-zero with no error message".to_string()),
            });
        }

        if !envelope.success {
            return Err(RunnerError::ModuleFailure {
                module: module.to_string(),
                code: status.code(),
                message: envelope
                    .error
                    .clone()
                    .unwrap_or_else(|| "module reported success:false".to_string()),
            });
        }

        Ok(envelope)
    }
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
    module: &str,
) -> Result<Option<std::process::ExitStatus>, RunnerError> {
    match child.wait_timeout(timeout).map_err(|source| RunnerError::Spawn {
        module: module.to_string(),
        source,
    })? {
        Some(status) => Ok(Some(status)),
        None => {
            // Soft timeout: ask politely first, then insist.
            #[cfg(unix)]
            {
                let pid = nix::unistd::Pid::from_raw(child.id() as i32);
                let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
                if child
                    .wait_timeout(Duration::from_secs(5))
                    .ok()
                    .flatten()
                    .is_some()
                {
                    return Ok(None);
                }
            }
            let _ = child.kill();
            let _ = child.wait();
            Ok(None)
        }
    }
}

fn collect_lines<R: std::io::Read>(reader: R, module: &str, is_stderr: bool) -> Vec<String> {
    let mut lines = Vec::new();
    for line in BufReader::new(reader).lines().map_while(Result::ok) {
        if is_stderr {
            tracing::warn!(module, "{line}");
        } else {
            tracing::info!(module, "{line}");
        }
        lines.push(line);
    }
    lines
}

fn parse_envelope(module: &str, stdout_lines: &[String]) -> Result<StatusEnvelope, RunnerError> {
    stdout_lines
        .iter()
        .rev()
        .find_map(|line| serde_json::from_str::<StatusEnvelope>(line.trim()).ok())
        .ok_or_else(|| RunnerError::UnparseableEnvelope {
            module: module.to_string(),
            reason: "no line on stdout parsed as a status envelope".to_string(),
        })
}

fn scrub_env(command: &mut Command) {
    for (key, _) in std::env::vars() {
        if SCRUBBED_ENV_PREFIXES.iter().any(|prefix| key.starts_with(prefix)) {
            command.env_remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_envelope_picks_the_last_well_formed_json_line() {
        let lines = vec![
            "starting up".to_string(),
            "{\"not\":\"an envelope\"}".to_string(),
            "{\"success\":true,\"updated\":true}".to_string(),
        ];
        let envelope = parse_envelope("m", &lines).unwrap();
        assert!(envelope.success);
        assert_eq!(envelope.updated, Some(true));
    }

    #[test]
    fn parse_envelope_errors_when_nothing_parses() {
        let lines = vec!["just text".to_string()];
        let result = parse_envelope("m", &lines);
        assert!(matches!(result, Err(RunnerError::UnparseableEnvelope { .. })));
    }

    #[test]
    fn invoke_mode_flags_match_the_module_cli_contract() {
        assert_eq!(InvokeMode::Check.flag(), Some("--check"));
        assert_eq!(InvokeMode::Version.flag(), Some("--version"));
        assert_eq!(InvokeMode::Update.flag(), None);
    }
}
