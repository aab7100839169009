//! The agent control protocol.
//!
//! Requests and responses are UTF-8 text frames terminated by [`DELIMITER`]. A request is
//! `<verb>` or `<verb> <args>`; a response is `OK`, `OK <data>` or anything else, which is
//! an error reply carrying the raw text. Exactly one response follows every request.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Error, Result};

/// Frame terminator.
pub const DELIMITER: &[u8] = b"--\n";

/// Default time to wait for a response.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// A byte stream to the agent: a Unix socket, a TCP tunnel or an in-memory pipe in tests.
pub trait AgentStream: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug {}

impl<T> AgentStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug {}

/// Renders a request frame.
pub fn frame(cmd: &str, arg: Option<&str>) -> Vec<u8> {
    let mut msg = Vec::with_capacity(cmd.len() + DELIMITER.len() + arg.map_or(0, |a| a.len() + 1));
    msg.extend_from_slice(cmd.as_bytes());
    if let Some(arg) = arg {
        msg.push(b' ');
        msg.extend_from_slice(arg.as_bytes());
    }
    msg.extend_from_slice(DELIMITER);
    msg
}

/// Interprets a response: `Ok(None)` for `OK`, `Ok(Some(data))` for `OK <data>`, and
/// `Err(response)` for anything else.
pub fn parse_response(response: &str) -> std::result::Result<Option<&str>, &str> {
    if response == "OK" {
        Ok(None)
    } else if let Some(data) = response.strip_prefix("OK ") {
        Ok(Some(data))
    } else {
        Err(response)
    }
}

/// Request/response client over one agent connection.
///
/// Commands serialize naturally through `&mut self`; sharing one client between tasks
/// needs outside locking.
#[derive(Debug)]
pub struct Client {
    stream: Box<dyn AgentStream>,
    agent: String,
    logpath: PathBuf,
    receive_timeout: Duration,
}

impl Client {
    /// Wraps a connected stream. `agent` names the agent in errors, `logpath` is the agent
    /// log file that error messages point to.
    pub fn new(stream: Box<dyn AgentStream>, agent: impl Into<String>, logpath: PathBuf) -> Self {
        Self {
            stream,
            agent: agent.into(),
            logpath,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Writes one request frame.
    pub async fn send(&mut self, cmd: &str, arg: Option<&str>) -> Result<()> {
        let msg = frame(cmd, arg);
        match self.stream.write_all(&msg).await {
            Ok(()) => {}
            Err(err) if is_closed(&err) => {
                return Err(Error::ConnectionClosed {
                    agent: self.agent.clone(),
                });
            }
            Err(source) => {
                return Err(Error::Io {
                    agent: self.agent.clone(),
                    source,
                });
            }
        }
        self.stream.flush().await.map_err(|source| Error::Io {
            agent: self.agent.clone(),
            source,
        })
    }

    /// Reads one response frame and returns it without the delimiter.
    ///
    /// `cmd` is the request being answered and only appears in errors.
    pub async fn receive(&mut self, cmd: &str) -> Result<String> {
        let mut buf = Vec::with_capacity(64);
        let timeout = self.receive_timeout;
        let read = async {
            let mut byte = [0u8; 1];
            while !buf.ends_with(DELIMITER) {
                match self.stream.read(&mut byte).await {
                    Ok(0) => {
                        return Err(Error::ConnectionClosed {
                            agent: self.agent.clone(),
                        });
                    }
                    Ok(_) => buf.push(byte[0]),
                    Err(err) if is_closed(&err) => {
                        return Err(Error::ConnectionClosed {
                            agent: self.agent.clone(),
                        });
                    }
                    Err(source) => {
                        return Err(Error::Io {
                            agent: self.agent.clone(),
                            source,
                        });
                    }
                }
            }
            Ok(())
        };

        match tokio::time::timeout(timeout, read).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Timeout {
                    agent: self.agent.clone(),
                    cmd: cmd.to_owned(),
                    timeout,
                    partial: String::from_utf8_lossy(&buf).into_owned(),
                });
            }
        }

        buf.truncate(buf.len() - DELIMITER.len());
        String::from_utf8(buf).map_err(|source| Error::Decode {
            agent: self.agent.clone(),
            cmd: cmd.to_owned(),
            source,
        })
    }

    /// Sends a request and waits for its response.
    ///
    /// Returns the payload of an `OK <data>` response, `None` for a bare `OK`.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] if the agent replies with anything but `OK`.
    /// - [`Error::Timeout`] if no response arrives within the receive timeout.
    /// - [`Error::Command`] wrapping transport failures with the command name.
    pub async fn send_command(&mut self, cmd: &str, arg: Option<&str>) -> Result<Option<String>> {
        let display = match arg {
            Some(arg) => format!("{cmd} {arg}"),
            None => cmd.to_owned(),
        };
        log::debug!("{}: sending `{}`", self.agent, display);

        let response = match self.send(cmd, arg).await {
            Ok(()) => self.receive(cmd).await,
            Err(err) => Err(err),
        };
        let response = response.map_err(|err| match err {
            Error::Timeout { .. } => err,
            other => Error::Command {
                agent: self.agent.clone(),
                cmd: display.clone(),
                source: Box::new(other),
            },
        })?;
        log::debug!("{}: `{}` returned `{}`", self.agent, cmd, response);

        match parse_response(&response) {
            Ok(data) => Ok(data.map(str::to_owned)),
            Err(_) => Err(Error::Protocol {
                agent: self.agent.clone(),
                cmd: display,
                response,
                logpath: self.logpath.clone(),
            }),
        }
    }

    /// Shuts the write side down and drops the stream.
    pub async fn shutdown(mut self) {
        if let Err(err) = self.stream.shutdown().await {
            log::debug!("{}: failed to shut the socket down: {}", self.agent, err);
        }
    }
}

fn is_closed(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WriteZero
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::UnexpectedEof
    )
}
