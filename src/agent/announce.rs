//! The agent's startup announcement in its own log file.

use std::path::PathBuf;

/// Prefix of the log line carrying the agent's Unix socket path.
pub const ANNOUNCEMENT: &str = "Listening on Unix socket ";

/// Returns the socket path from the last announcement line in `log`, if any.
pub fn find_socket_path(log: &str) -> Option<PathBuf> {
    log.lines()
        .rev()
        .filter_map(|line| {
            let start = line.find(ANNOUNCEMENT)?;
            let path = line[start + ANNOUNCEMENT.len()..].trim();
            (!path.is_empty()).then(|| PathBuf::from(path))
        })
        .next()
}
