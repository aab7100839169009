//! The `sysinfo` statistic: raw system information captured on the SUT by the controller
//! before and after collection, without involving an agent.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::proc::Connection;

/// Sub-directory of the output directory holding the snapshots.
pub const SUBDIR: &str = "sysinfo";

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Commands captured by default, as `(name, command)`.
const DEFAULT_COMMANDS: &[(&str, &str)] = &[
    ("proc_cpuinfo", "cat /proc/cpuinfo"),
    ("proc_meminfo", "cat /proc/meminfo"),
    ("proc_cmdline", "cat /proc/cmdline"),
    ("uname", "uname -a"),
    ("lscpu", "lscpu"),
    ("lsmod", "lsmod"),
    ("dmesg", "dmesg"),
    ("cpupower", "cpupower frequency-info"),
    ("cpuidle", "grep -r . /sys/devices/system/cpu/cpu0/cpuidle"),
    ("sysctl", "sysctl -a"),
];

pub fn default_commands() -> Vec<(String, String)> {
    DEFAULT_COMMANDS
        .iter()
        .map(|(name, cmd)| ((*name).to_owned(), (*cmd).to_owned()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum When {
    Before,
    After,
}

impl fmt::Display for When {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            When::Before => "before",
            When::After => "after",
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to write sysinfo snapshot `{path}`: {source}")]
pub struct Error {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Runs every command in `commands` on `sut` and stores its standard output in
/// `<outdir>/sysinfo/<name>.<when>.raw.txt` on the controller.
///
/// Commands that fail are logged and skipped: a missing tool must not spoil a session.
/// Returns the files written.
///
/// # Errors
///
/// Only failures to write on the controller are errors.
pub async fn snapshot(
    sut: &Connection,
    outdir: &Path,
    when: When,
    commands: &[(String, String)],
) -> Result<Vec<PathBuf>, Error> {
    let dir = outdir.join(SUBDIR);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|source| Error {
            path: dir.clone(),
            source,
        })?;

    let mut written = Vec::new();
    for (name, cmd) in commands {
        let output = match sut.run_verify(cmd, Some(COMMAND_TIMEOUT)).await {
            Ok(output) => output,
            Err(err) => {
                log::debug!("skipping sysinfo '{}' on {}: {}", name, sut.hostname(), err);
                continue;
            }
        };
        let path = dir.join(format!("{name}.{when}.raw.txt"));
        tokio::fs::write(&path, output.stdout)
            .await
            .map_err(|source| Error {
                path: path.clone(),
                source,
            })?;
        written.push(path);
    }
    log::info!(
        "captured {} sysinfo file(s) {} collection on {}",
        written.len(),
        when,
        sut.hostname()
    );
    Ok(written)
}
