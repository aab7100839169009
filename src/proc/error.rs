use std::path::PathBuf;
use std::time::Duration;

use crate::fsutil;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection to {host} is closed")]
    Closed { host: String },
    #[error("failed to spawn `{cmd}` on {host}: {source}")]
    Spawn {
        cmd: String,
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "command `{cmd}` on {host} did not finish within {timeout:?}{}",
        format_output(.stdout, .stderr)
    )]
    Timeout {
        cmd: String,
        host: String,
        timeout: Duration,
        stdout: String,
        stderr: String,
    },
    #[error(
        "command `{cmd}` on {host} failed with {}{}",
        format_exit_code(*.exit_code),
        format_output(.stdout, .stderr)
    )]
    Failure {
        cmd: String,
        host: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("failed to read the PID of `{cmd}` on {host}: {reason}")]
    Pid {
        cmd: String,
        host: String,
        reason: String,
    },
    #[error("failed to access `{path}` on {host}: {source}")]
    Io {
        path: PathBuf,
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    FileRead(#[from] fsutil::FileReadError),
}

pub type Result<T> = std::result::Result<T, Error>;

fn format_exit_code(exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) if code < 0 => format!("signal {}", -code),
        Some(code) => format!("exit code {code}"),
        None => "an unknown exit status".to_owned(),
    }
}

/// Renders captured output for inclusion in an error message; empty streams are omitted.
pub(crate) fn format_output(stdout: &str, stderr: &str) -> String {
    let mut out = String::new();
    for (label, text) in [("stdout", stdout), ("stderr", stderr)] {
        let text = text.trim_end();
        if !text.is_empty() {
            out.push_str(&format!("\n{label}:\n{text}"));
        }
    }
    out
}
