use std::path::PathBuf;
use std::time::Duration;

use crate::{proc, supervisor};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{agent}: failed to connect to `{endpoint}`: {source}")]
    Connect {
        agent: String,
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{agent}: connection closed by the agent")]
    ConnectionClosed { agent: String },
    #[error(
        "{agent}: ssh tunnel to `{socket}` was not up within {timeout:?}: {reason}"
    )]
    Tunnel {
        agent: String,
        socket: PathBuf,
        timeout: Duration,
        reason: String,
    },
    #[error(
        "{agent}: command `{cmd}` failed, the agent replied `{response}`\nCheck the agent log `{logpath}` for details"
    )]
    Protocol {
        agent: String,
        cmd: String,
        response: String,
        logpath: PathBuf,
    },
    #[error(
        "{agent}: no response to `{cmd}` within {timeout:?} ({} bytes received: `{partial}`)",
        .partial.len()
    )]
    Timeout {
        agent: String,
        cmd: String,
        timeout: Duration,
        partial: String,
    },
    #[error("{agent}: response to `{cmd}` is not valid UTF-8: {source}")]
    Decode {
        agent: String,
        cmd: String,
        #[source]
        source: std::string::FromUtf8Error,
    },
    #[error(
        "{agent}: failed to discover the agent socket: {reason}\nAgent log `{logpath}`:\n{log}"
    )]
    SocketDiscovery {
        agent: String,
        logpath: PathBuf,
        reason: String,
        log: String,
    },
    #[error("failed to find the agent executable `{name}` on {host} (searched {searched})")]
    NotFound {
        name: String,
        host: String,
        searched: String,
    },
    #[error("{agent}: failed to send `{cmd}`: {source}")]
    Command {
        agent: String,
        cmd: String,
        #[source]
        source: Box<Error>,
    },
    #[error("{agent}: I/O error: {source}")]
    Io {
        agent: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{agent}: not connected")]
    NotConnected { agent: String },
    #[error(transparent)]
    Proc(#[from] proc::Error),
    #[error(transparent)]
    Supervisor(#[from] supervisor::Error),
}

impl Error {
    /// Whether the error came from talking to the agent (as opposed to spawning or
    /// locating it). Discovery treats these as "nothing learned".
    pub fn is_protocol_level(&self) -> bool {
        match self {
            Error::ConnectionClosed { .. }
            | Error::Protocol { .. }
            | Error::Timeout { .. }
            | Error::Decode { .. }
            | Error::Io { .. } => true,
            Error::Command { source, .. } => source.is_protocol_level(),
            _ => false,
        }
    }

    /// Whether the agent was spawned but could not be reached: its socket was never
    /// announced, refused the connection or the tunnel to it did not come up.
    pub fn is_transport_level(&self) -> bool {
        matches!(
            self,
            Error::Connect { .. } | Error::Tunnel { .. } | Error::SocketDiscovery { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
