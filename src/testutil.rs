//! Stand-ins for tests: agent scripts announcing a socket that a task in the test process
//! serves, and an `ssh` replacement running "remote" commands on this host.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

use crate::agent::protocol::DELIMITER;
use crate::proc::RemoteTarget;

/// `ssh` stand-in body running the remote command, its last argument, on this host.
pub(crate) const LOOPBACK_SSH: &str = "for last; do :; done\nexec sh -c \"$last\"\n";

/// Writes an executable `sh` script with `body` to `path`.
pub(crate) fn write_script(path: &Path, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Writes an `ssh` stand-in with `body` into `dir` and returns a target using it.
pub(crate) fn fake_ssh(dir: &Path, body: &str) -> RemoteTarget {
    let ssh = dir.join("ssh");
    write_script(&ssh, body);
    RemoteTarget {
        ssh,
        ..RemoteTarget::new("sut1")
    }
}

/// Writes an agent stand-in into `dir` that announces `socket` and then idles.
pub(crate) fn announcing_agent(dir: &Path, socket: &Path) -> PathBuf {
    let exe = dir.join("fake-agent");
    write_script(
        &exe,
        &format!(
            "echo 'Listening on Unix socket {}'\nexec sleep 60\n",
            socket.display()
        ),
    );
    exe
}

#[derive(Debug, Clone)]
pub(crate) struct Received {
    pub cmd: String,
    pub at: std::time::Instant,
}

pub(crate) struct FakeAgent {
    pub exe: PathBuf,
    pub received: Arc<Mutex<Vec<Received>>>,
    server: JoinHandle<()>,
}

impl FakeAgent {
    /// Writes the script into `dir` and starts serving. The agent answers `OK` to
    /// everything, reports `failed` from `get-failed-collectors` and rejects `set-stats`
    /// naming `bogus`.
    pub fn start(dir: &Path, failed: &'static str) -> Self {
        let socket = dir.join("agent.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let server = tokio::spawn(serve(listener, failed, Arc::clone(&received)));

        let exe = announcing_agent(dir, &socket);
        Self {
            exe,
            received,
            server,
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.cmd.clone())
            .collect()
    }

    /// Waits for the agent to receive `exit` or lose its connection.
    pub async fn finished(self) -> Vec<Received> {
        self.server.await.unwrap();
        self.received.lock().unwrap().clone()
    }
}

async fn serve(listener: UnixListener, failed: &'static str, log: Arc<Mutex<Vec<Received>>>) {
    let Ok((mut stream, _)) = listener.accept().await else {
        return;
    };
    while let Some(cmd) = read_request(&mut stream).await {
        log.lock().unwrap().push(Received {
            cmd: cmd.clone(),
            at: std::time::Instant::now(),
        });
        let reply = if cmd == "get-failed-collectors" {
            format!("OK {failed}--\n")
        } else if cmd.starts_with("set-stats") && cmd.contains("bogus") {
            "collector 'bogus' does not exist--\n".to_owned()
        } else {
            "OK--\n".to_owned()
        };
        if stream.write_all(reply.as_bytes()).await.is_err() || cmd == "exit" {
            return;
        }
    }
}

async fn read_request(stream: &mut UnixStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(DELIMITER) {
        stream.read_exact(&mut byte).await.ok()?;
        buf.push(byte[0]);
    }
    buf.truncate(buf.len() - DELIMITER.len());
    String::from_utf8(buf).ok()
}
