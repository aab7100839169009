//! Connection establishment towards an agent's Unix socket, directly or through an `ssh`
//! port forward.

use std::path::Path;
use std::time::Duration;

use nix::sys::signal::Signal;

use super::protocol::AgentStream;
use super::{Error, Result};
use crate::proc::{CommandHandle, Connection, RunOptions};
use crate::supervisor::{self, KillOptions};

/// Lower bound for the time given to an `ssh` tunnel to come up.
pub const MIN_TUNNEL_TIMEOUT: Duration = Duration::from_secs(5);
const TUNNEL_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unconnected,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug)]
struct Tunnel {
    port: u16,
    pattern: String,
    handle: CommandHandle,
}

/// Connects to an agent socket on the controller or, for remote agents, through an
/// `ssh -L` tunnel spawned on the controller.
///
/// A transport connects once; after [`Transport::disconnect`] it stays disconnected.
#[derive(Debug)]
pub struct Transport {
    agent: String,
    state: State,
    tunnel: Option<Tunnel>,
}

impl Transport {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            state: State::Unconnected,
            tunnel: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The local end of the tunnel, if one is used.
    pub fn tunnel_port(&self) -> Option<u16> {
        self.tunnel.as_ref().map(|t| t.port)
    }

    /// Connects to `socket`, which lives on `sut`'s host.
    ///
    /// When `sut` is remote a tunnel is spawned through `local` first and polled until it
    /// accepts connections, for at most `timeout` (but never less than [`MIN_TUNNEL_TIMEOUT`]).
    pub async fn connect(
        &mut self,
        sut: &Connection,
        local: &Connection,
        socket: &Path,
        timeout: Duration,
    ) -> Result<Box<dyn AgentStream>> {
        if self.state != State::Unconnected {
            return Err(Error::NotConnected {
                agent: self.agent.clone(),
            });
        }
        self.state = State::Connecting;

        let result = match sut.remote_target() {
            None => self.connect_unix(socket).await,
            Some(_) => self.connect_tunnel(sut, local, socket, timeout).await,
        };
        match &result {
            Ok(_) => self.state = State::Connected,
            Err(_) => self.state = State::Unconnected,
        }
        result
    }

    async fn connect_unix(&self, socket: &Path) -> Result<Box<dyn AgentStream>> {
        log::debug!("{}: connecting to `{}`", self.agent, socket.display());
        let stream = tokio::net::UnixStream::connect(socket)
            .await
            .map_err(|source| Error::Connect {
                agent: self.agent.clone(),
                endpoint: socket.display().to_string(),
                source,
            })?;
        Ok(Box::new(stream))
    }

    async fn connect_tunnel(
        &mut self,
        sut: &Connection,
        local: &Connection,
        socket: &Path,
        timeout: Duration,
    ) -> Result<Box<dyn AgentStream>> {
        let target = sut.remote_target().ok_or_else(|| Error::NotConnected {
            agent: self.agent.clone(),
        })?;
        let timeout = timeout.max(MIN_TUNNEL_TIMEOUT);
        let port = free_local_port().await.map_err(|source| Error::Io {
            agent: self.agent.clone(),
            source,
        })?;

        let cmd = target.tunnel_command(port, socket, sut.timeout());
        log::debug!("{}: starting ssh tunnel: {}", self.agent, cmd);
        let handle = local.run_async(&cmd, &RunOptions::no_pid()).await?;
        let mut tunnel = Tunnel {
            port,
            pattern: tunnel_pattern(port, socket, &target.host),
            handle,
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let (mut stdout, mut stderr) = (String::new(), String::new());
        loop {
            if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                break;
            }
            let output = tunnel.handle.wait(Some(Duration::ZERO), true).await;
            stdout.push_str(&output.stdout);
            stderr.push_str(&output.stderr);
            if let Some(code) = output.exit_code {
                return Err(Error::Tunnel {
                    agent: self.agent.clone(),
                    socket: socket.to_path_buf(),
                    timeout,
                    reason: format!(
                        "ssh exited with code {code}{}",
                        crate::proc::format_output(&stdout, &stderr)
                    ),
                });
            }
            if tokio::time::Instant::now() >= deadline {
                tunnel.handle.kill().await;
                return Err(Error::Tunnel {
                    agent: self.agent.clone(),
                    socket: socket.to_path_buf(),
                    timeout,
                    reason: "local port never accepted connections".to_owned(),
                });
            }
            tokio::time::sleep(TUNNEL_POLL_INTERVAL).await;
        }

        log::debug!(
            "{}: tunnel localhost:{} -> {}:{} is up",
            self.agent,
            port,
            target.host,
            socket.display()
        );
        let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|source| Error::Connect {
                agent: self.agent.clone(),
                endpoint: format!("localhost:{port}"),
                source,
            })?;
        self.tunnel = Some(tunnel);
        Ok(Box::new(stream))
    }

    /// Marks the transport as disconnected. The stream itself is owned and closed by the
    /// client; a tunnel stays up until [`Transport::close_tunnel`].
    pub fn disconnect(&mut self) {
        self.state = State::Disconnected;
    }

    /// Kills the tunnel, if any, by handle and by command line.
    pub async fn close_tunnel(&mut self, local: &Connection) -> Result<()> {
        self.disconnect();
        let Some(mut tunnel) = self.tunnel.take() else {
            return Ok(());
        };
        log::debug!("{}: closing the tunnel on port {}", self.agent, tunnel.port);
        tunnel.handle.kill().await;
        supervisor::kill_by_pattern(local, &tunnel.pattern, Signal::SIGTERM, KillOptions::default())
            .await?;
        Ok(())
    }
}

/// Regex matching the controller-side `ssh` forwarding `port` to `socket` on `host`.
pub fn tunnel_pattern(port: u16, socket: &Path, host: &str) -> String {
    format!(
        r"ssh .*-L {}:{} -N .*{}$",
        port,
        regex::escape(&socket.to_string_lossy()),
        regex::escape(host)
    )
}

/// Regex matching any tunnel this crate would have opened to `host`.
pub fn stale_tunnel_pattern(host: &str) -> String {
    format!(r"ssh .*-L \d+:\S+ -N .*BatchMode=yes.* {}$", regex::escape(host))
}

/// Picks a currently unused TCP port on the loopback interface.
async fn free_local_port() -> std::io::Result<u16> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fake_ssh;
    use regex::Regex;

    #[test]
    fn test_tunnel_patterns_match_tunnel_command() {
        let target = crate::proc::RemoteTarget::new("sut1.example.com");
        let socket = Path::new("/tmp/stc-agent.sock");
        let cmd = target.tunnel_command(40000, socket, Duration::from_secs(5));

        let exact = Regex::new(&tunnel_pattern(40000, socket, "sut1.example.com")).unwrap();
        assert!(exact.is_match(&cmd), "{cmd}");
        let other_port = Regex::new(&tunnel_pattern(40001, socket, "sut1.example.com")).unwrap();
        assert!(!other_port.is_match(&cmd), "{cmd}");

        let stale = Regex::new(&stale_tunnel_pattern("sut1.example.com")).unwrap();
        assert!(stale.is_match(&cmd), "{cmd}");
        let other_host = Regex::new(&stale_tunnel_pattern("sut2")).unwrap();
        assert!(!other_host.is_match(&cmd), "{cmd}");
    }

    #[tokio::test]
    async fn test_free_local_port() {
        let port = free_local_port().await.unwrap();
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn test_connect_local_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let _listener = tokio::net::UnixListener::bind(&path).unwrap();

        let conn = Connection::local();
        let mut transport = Transport::new("test agent");
        transport
            .connect(&conn, &conn, &path, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(transport.state(), State::Connected);
        assert_eq!(transport.tunnel_port(), None);

        transport.disconnect();
        assert_eq!(transport.state(), State::Disconnected);
        transport.close_tunnel(&conn).await.unwrap();
        assert!(
            transport
                .connect(&conn, &conn, &path, Duration::from_secs(1))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_connect_through_tunnel() {
        let dir = tempfile::tempdir().unwrap();
        let port_file = dir.path().join("port");
        // Reports the forwarded port, then stays up like a real tunnel.
        let body = format!(
            "while [ $# -gt 0 ]; do\n  if [ \"$1\" = -L ]; then echo \"${{2%%:*}}\" > {tmp} && mv {tmp} {port}; fi\n  shift\ndone\nexec sleep 60\n",
            tmp = crate::proc::quote_path(&dir.path().join("port.tmp")),
            port = crate::proc::quote_path(&port_file),
        );
        let sut = Connection::remote(fake_ssh(dir.path(), &body));
        let local = Connection::local();

        let forward = tokio::spawn(async move {
            loop {
                if let Ok(text) = tokio::fs::read_to_string(&port_file).await {
                    let port: u16 = text.trim().parse().unwrap();
                    return tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        let mut transport = Transport::new("test agent");
        let stream = transport
            .connect(&sut, &local, Path::new("/run/stc/agent.sock"), Duration::from_secs(5))
            .await
            .unwrap();
        let listener = forward.await.unwrap();
        assert_eq!(transport.state(), State::Connected);
        assert_eq!(
            transport.tunnel_port(),
            Some(listener.local_addr().unwrap().port())
        );

        drop(stream);
        transport.disconnect();
        assert!(transport.tunnel_port().is_some());
        transport.close_tunnel(&local).await.unwrap();
        assert_eq!(transport.tunnel_port(), None);
        assert_eq!(transport.state(), State::Disconnected);
    }

    #[tokio::test]
    async fn test_tunnel_failing_early() {
        let dir = tempfile::tempdir().unwrap();
        let body = "echo 'connect to host sut1 port 22: Connection refused' >&2\nexit 255\n";
        let sut = Connection::remote(fake_ssh(dir.path(), body));
        let local = Connection::local();

        let mut transport = Transport::new("test agent");
        let started = std::time::Instant::now();
        let err = transport
            .connect(&sut, &local, Path::new("/run/stc/agent.sock"), Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        match &err {
            Error::Tunnel { reason, .. } => {
                assert!(reason.contains("255"), "{reason}");
                assert!(reason.contains("Connection refused"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(transport.state(), State::Unconnected);
        assert_eq!(transport.tunnel_port(), None);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::local();
        let mut transport = Transport::new("test agent");
        let err = transport
            .connect(&conn, &conn, &dir.path().join("missing.sock"), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Connect { .. }), "{err}");
        assert_eq!(transport.state(), State::Unconnected);
    }
}
