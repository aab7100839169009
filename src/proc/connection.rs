use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use super::handle::{CmdOutput, CommandHandle, DEFAULT_WAIT_TIMEOUT, Registry};
use super::quote::{quote, quote_path};
use super::remote::RemoteTarget;
use super::{Error, Result};
use crate::fsutil;

/// Default timeout for connection-level operations such as `ssh` connects and helper commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Options for [`Connection::run_async`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Working directory on the target host.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Deliver output in whole lines only.
    pub by_line: bool,
    /// Learn the remote PID before returning. Local processes always report their PID.
    pub want_pid: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            env: Vec::new(),
            by_line: false,
            want_pid: true,
        }
    }
}

impl RunOptions {
    /// Options for commands whose PID nobody needs; skips the remote PID round-trip.
    pub fn no_pid() -> Self {
        Self {
            want_pid: false,
            ..Self::default()
        }
    }
}

/// Host-transparent command execution, either on this host or over `ssh`.
///
/// Cloning is cheap and yields a handle to the same connection.
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    host: Arc<str>,
    remote: Option<RemoteTarget>,
    timeout: Duration,
    closed: AtomicBool,
    next_id: AtomicU64,
    live: Registry,
}

impl Connection {
    /// A connection executing commands on the controller itself.
    pub fn local() -> Self {
        Self::build("local".into(), None, DEFAULT_TIMEOUT)
    }

    /// A connection executing commands on `target` over `ssh`.
    pub fn remote(target: RemoteTarget) -> Self {
        Self::build(target.host.as_str().into(), Some(target), DEFAULT_TIMEOUT)
    }

    /// Returns a connection to the same host with a different default timeout.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self::build(
            Arc::clone(&self.inner.host),
            self.inner.remote.clone(),
            timeout,
        )
    }

    fn build(host: Arc<str>, remote: Option<RemoteTarget>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                host,
                remote,
                timeout,
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                live: Arc::new(DashMap::new()),
            }),
        }
    }

    /// The host name, or `local` for the controller.
    pub fn hostname(&self) -> &str {
        &self.inner.host
    }

    pub fn is_remote(&self) -> bool {
        self.inner.remote.is_some()
    }

    pub fn remote_target(&self) -> Option<&RemoteTarget> {
        self.inner.remote.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Number of spawned processes that have not been reaped yet.
    pub fn live_processes(&self) -> usize {
        self.inner.live.len()
    }

    /// Spawns `cmd` through `sh -c` on the target host.
    ///
    /// Returns once the process exists. For remote hosts with `want_pid` set this also
    /// waits for the wrapper to print the remote PID.
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] after [`Connection::close`].
    /// - [`Error::Spawn`] if the process (or the local `ssh` client) cannot be started.
    /// - [`Error::Pid`] if the remote PID is not announced within the connection timeout.
    pub async fn run_async(&self, cmd: &str, opts: &RunOptions) -> Result<CommandHandle> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed {
                host: self.hostname().to_owned(),
            });
        }
        log::debug!("running on {}: {}", self.hostname(), cmd);

        let mut command = match &self.inner.remote {
            None => {
                let mut command = tokio::process::Command::new("sh");
                command.arg("-c").arg(cmd);
                if let Some(cwd) = &opts.cwd {
                    command.current_dir(cwd);
                }
                command.envs(opts.env.iter().map(|(k, v)| (k, v)));
                command
            }
            Some(target) => {
                let wrapped = wrap_remote(cmd, opts);
                target.command(&wrapped, self.inner.timeout)
            }
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| Error::Spawn {
            cmd: cmd.to_owned(),
            host: self.hostname().to_owned(),
            source,
        })?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handle = CommandHandle::new(
            id,
            cmd.to_owned(),
            Arc::clone(&self.inner.host),
            child,
            opts.by_line,
            Arc::clone(&self.inner.live),
        );

        if self.is_remote() {
            if opts.want_pid {
                let pid = handle.read_remote_pid(self.inner.timeout).await?;
                log::trace!("`{}` runs as PID {} on {}", cmd, pid, self.hostname());
            } else {
                handle.clear_pid();
            }
        }
        Ok(handle)
    }

    /// Runs `cmd` to completion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`], carrying the output seen so far, if the command does not
    /// exit within `timeout` (the connection timeout when `None`). The command is killed.
    pub async fn run(&self, cmd: &str, timeout: Option<Duration>) -> Result<CmdOutput> {
        let timeout = timeout.unwrap_or(self.inner.timeout);
        let mut handle = self.run_async(cmd, &RunOptions::no_pid()).await?;
        let output = handle.wait(Some(timeout), true).await;
        if output.exit_code.is_none() {
            handle.kill().await;
            return Err(Error::Timeout {
                cmd: cmd.to_owned(),
                host: self.hostname().to_owned(),
                timeout,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    /// Like [`Connection::run`], but a non-zero exit code is an [`Error::Failure`].
    pub async fn run_verify(&self, cmd: &str, timeout: Option<Duration>) -> Result<CmdOutput> {
        let output = self.run(cmd, timeout).await?;
        if !output.success() {
            return Err(Error::Failure {
                cmd: cmd.to_owned(),
                host: self.hostname().to_owned(),
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    /// Creates `path` and any missing parents.
    pub async fn mkdir(&self, path: &Path) -> Result<()> {
        if self.is_remote() {
            self.run_verify(&format!("mkdir -p -- {}", quote_path(path)), None)
                .await?;
            return Ok(());
        }
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|source| self.io_error(path, source))
    }

    /// Creates a fresh temporary directory on the target host.
    pub async fn mkdtemp(&self, prefix: &str) -> Result<PathBuf> {
        let cmd = format!("mktemp -d -t {}", quote(&format!("{prefix}.XXXXXXXXXX")));
        let output = self.run_verify(&cmd, None).await?;
        Ok(PathBuf::from(output.stdout.trim()))
    }

    /// Removes `path` recursively; a missing path is not an error.
    pub async fn rmtree(&self, path: &Path) -> Result<()> {
        if self.is_remote() {
            self.run_verify(&format!("rm -rf -- {}", quote_path(path)), None)
                .await?;
            return Ok(());
        }
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.io_error(path, source)),
        }
    }

    pub async fn read_file(&self, path: &Path) -> Result<String> {
        if self.is_remote() {
            let output = self
                .run_verify(&format!("cat -- {}", quote_path(path)), None)
                .await?;
            return Ok(output.stdout);
        }
        Ok(fsutil::read_to_string(path).await?)
    }

    pub async fn exists(&self, path: &Path) -> Result<bool> {
        if self.is_remote() {
            let output = self
                .run(&format!("test -e {}", quote_path(path)), None)
                .await?;
            return Ok(output.success());
        }
        Ok(tokio::fs::try_exists(path).await.unwrap_or(false))
    }

    /// Returns `true` if `path` is a Unix domain socket on the target host.
    pub async fn is_socket(&self, path: &Path) -> Result<bool> {
        if self.is_remote() {
            let output = self
                .run(&format!("test -S {}", quote_path(path)), None)
                .await?;
            return Ok(output.success());
        }
        Ok(fsutil::is_socket(path))
    }

    /// Looks `name` up in `dirs` first and then in the target host's `PATH`.
    pub async fn which(&self, name: &str, dirs: &[PathBuf]) -> Result<Option<PathBuf>> {
        if !self.is_remote() {
            let path_dirs: Vec<PathBuf> = std::env::var_os("PATH")
                .map(|p| std::env::split_paths(&p).collect())
                .unwrap_or_default();
            return Ok(fsutil::search_executable(
                name,
                dirs.iter().chain(path_dirs.iter()).map(PathBuf::as_path),
            ));
        }

        let mut script = String::new();
        for dir in dirs {
            let candidate = quote_path(&dir.join(name));
            script.push_str(&format!(
                "if test -f {candidate} && test -x {candidate}; then echo {candidate}; exit 0; fi; "
            ));
        }
        script.push_str(&format!("command -v {}", quote(name)));
        let output = self.run(&script, None).await?;
        let found = output.stdout.lines().next().map(str::trim).unwrap_or("");
        if output.success() && found.starts_with('/') {
            Ok(Some(PathBuf::from(found)))
        } else {
            Ok(None)
        }
    }

    /// Copies the contents of the directory `src` on the target host into the controller
    /// directory `dst`, which is created if missing.
    pub async fn fetch_dir(&self, src: &Path, dst: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dst)
            .await
            .map_err(|source| Error::Io {
                path: dst.to_path_buf(),
                host: "local".to_owned(),
                source,
            })?;
        let timeout = Some(DEFAULT_WAIT_TIMEOUT);
        match &self.inner.remote {
            None => {
                let cmd = format!("cp -pR -- {}/. {}", quote_path(src), quote_path(dst));
                self.run_verify(&cmd, timeout).await?;
            }
            Some(target) => {
                let pack = format!("tar -C {} -cf - .", quote_path(src));
                let cmd = format!(
                    "{} | tar -C {} -xf -",
                    target.shell_command(&pack, self.inner.timeout),
                    quote_path(dst)
                );
                log::debug!("copying {}:{} to {}", self.hostname(), src.display(), dst.display());
                Connection::local().run_verify(&cmd, timeout).await?;
            }
        }
        Ok(())
    }

    /// Returns `true` if commands on the target host run as the superuser.
    pub async fn is_superuser(&self) -> Result<bool> {
        if !self.is_remote() {
            return Ok(nix::unistd::geteuid().is_root());
        }
        let output = self.run_verify("id -u", None).await?;
        Ok(output.stdout.trim() == "0")
    }

    /// Closes the connection: refuses new commands and kills every process it spawned
    /// that has not been reaped yet. Safe to call more than once.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("closing connection to {}", self.hostname());
        for entry in self.inner.live.iter() {
            let pid = nix::unistd::Pid::from_raw(*entry.value() as i32);
            if let Err(err) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL) {
                log::debug!("failed to kill PID {}: {}", entry.value(), err);
            }
        }
        self.inner.live.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> Error {
        Error::Io {
            path: path.to_path_buf(),
            host: self.hostname().to_owned(),
            source,
        }
    }
}

/// Wraps `cmd` for the remote login shell. With `want_pid` the wrapper prints its shell PID
/// first; the command is exec'd so that it keeps that PID.
fn wrap_remote(cmd: &str, opts: &RunOptions) -> String {
    let mut inner = String::new();
    if opts.want_pid {
        inner.push_str("echo $$; ");
    }
    if let Some(cwd) = &opts.cwd {
        inner.push_str(&format!("cd {} || exit 1; ", quote_path(cwd)));
    }
    for (key, value) in &opts.env {
        inner.push_str(&format!("export {}={}; ", key, quote(value)));
    }
    inner.push_str(&format!("exec sh -c {}", quote(cmd)));
    format!("sh -c {}", quote(&inner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{LOOPBACK_SSH, fake_ssh};

    #[test]
    fn test_wrap_remote_prints_pid_first() {
        let wrapped = wrap_remote("sleep 5; echo done", &RunOptions::default());
        assert_eq!(
            wrapped,
            r#"sh -c 'echo $$; exec sh -c '\''sleep 5; echo done'\'''"#
        );
    }

    #[test]
    fn test_wrap_remote_cwd_and_env() {
        let opts = RunOptions {
            cwd: Some(PathBuf::from("/tmp")),
            env: vec![("FOO".to_owned(), "a b".to_owned())],
            ..RunOptions::default()
        };
        let wrapped = wrap_remote("ls", &opts);
        assert!(wrapped.contains("cd /tmp || exit 1;"), "{wrapped}");
        assert!(wrapped.contains("export FOO="), "{wrapped}");
    }

    #[test]
    fn test_wrap_remote_without_pid() {
        let wrapped = wrap_remote("uptime", &RunOptions::no_pid());
        assert_eq!(wrapped, r#"sh -c 'exec sh -c uptime'"#);
    }

    #[tokio::test]
    async fn test_remote_pid_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::remote(fake_ssh(dir.path(), LOOPBACK_SSH));
        assert!(conn.is_remote());

        let mut handle = conn
            .run_async("sleep 1; echo hi", &RunOptions::default())
            .await
            .unwrap();
        let pid = handle.pid().unwrap();
        let signalled = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None);
        assert!(signalled.is_ok(), "PID {pid} is not running");

        let output = handle.wait(Some(Duration::from_secs(10)), true).await;
        assert_eq!(output.stdout, "hi\n");
        assert_eq!(output.exit_code, Some(0));

        let output = conn
            .run_verify("echo $((1 + 2))", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(output.stdout, "3\n");
    }

    #[tokio::test]
    async fn test_remote_pid_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::remote(fake_ssh(dir.path(), "echo 'Welcome to sut1'\nsleep 1\n"));
        let err = conn
            .run_async("true", &RunOptions::default())
            .await
            .err()
            .unwrap();
        match err {
            Error::Pid { reason, host, .. } => {
                assert_eq!(host, "sut1");
                assert!(reason.contains("Welcome to sut1"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_remote_pid_missing() {
        let dir = tempfile::tempdir().unwrap();
        let body = "echo 'Permission denied (publickey)' >&2\nexit 255\n";
        let conn = Connection::remote(fake_ssh(dir.path(), body));
        let err = conn
            .run_async("true", &RunOptions::default())
            .await
            .err()
            .unwrap();
        match err {
            Error::Pid { reason, .. } => assert!(reason.contains("stdout closed"), "{reason}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let conn = Connection::local();
        let output = conn
            .run("echo out; echo err >&2; exit 3", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_run_verify_failure_carries_output() {
        let conn = Connection::local();
        let err = conn
            .run_verify("echo broken >&2; exit 2", Some(Duration::from_secs(10)))
            .await
            .unwrap_err();
        match err {
            Error::Failure {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, Some(2));
                assert_eq!(stderr, "broken\n");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let conn = Connection::local();
        let err = conn
            .run("echo started; sleep 10", Some(Duration::from_millis(300)))
            .await
            .unwrap_err();
        match err {
            Error::Timeout { stdout, .. } => assert_eq!(stdout, "started\n"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_wait_continues_after_timeout() {
        let conn = Connection::local();
        let mut handle = conn
            .run_async("echo a; sleep 2; echo b", &RunOptions::default())
            .await
            .unwrap();
        assert!(handle.pid().is_some());

        let first = handle.wait(Some(Duration::from_millis(500)), true).await;
        assert_eq!(first.stdout, "a\n");
        assert_eq!(first.exit_code, None);
        assert!(handle.is_running());

        let second = handle.wait(Some(Duration::from_secs(10)), true).await;
        assert_eq!(second.stdout, "b\n");
        assert_eq!(second.exit_code, Some(0));
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_wait_sleeping_command() {
        let conn = Connection::local();
        let mut handle = conn
            .run_async("exec sleep 5", &RunOptions::default())
            .await
            .unwrap();
        let first = handle.wait(Some(Duration::from_secs(1)), true).await;
        assert_eq!(first.exit_code, None);
        let second = handle.wait(Some(Duration::from_secs(10)), true).await;
        assert_eq!(second.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_zero_timeout_polls() {
        let conn = Connection::local();
        let mut handle = conn
            .run_async("sleep 3", &RunOptions::default())
            .await
            .unwrap();
        let started = std::time::Instant::now();
        let output = handle.wait(Some(Duration::ZERO), true).await;
        assert_eq!(output.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_large_output_does_not_block() {
        let conn = Connection::local();
        let mut handle = conn
            .run_async(
                "head -c 1000000 /dev/zero | tr '\\0' x; head -c 1000000 /dev/zero | tr '\\0' y >&2",
                &RunOptions::default(),
            )
            .await
            .unwrap();
        let output = handle.wait(Some(Duration::from_secs(20)), false).await;
        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::local();
        let opts = RunOptions {
            cwd: Some(dir.path().to_path_buf()),
            env: vec![("STATS_TEST".to_owned(), "42".to_owned())],
            ..RunOptions::default()
        };
        let mut handle = conn.run_async("pwd; echo $STATS_TEST", &opts).await.unwrap();
        let output = handle.wait(Some(Duration::from_secs(10)), true).await;
        let canonical = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(output.stdout, format!("{}\n42\n", canonical.display()));
    }

    #[tokio::test]
    async fn test_closed_connection_refuses_commands() {
        let conn = Connection::local();
        let mut handle = conn
            .run_async("exec sleep 30", &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(conn.live_processes(), 1);
        conn.close();
        conn.close();
        assert_eq!(conn.live_processes(), 0);

        let output = handle.wait(Some(Duration::from_secs(5)), true).await;
        assert_eq!(output.exit_code, Some(-9));
        assert!(matches!(
            conn.run("true", None).await,
            Err(Error::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_file_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::local();
        let nested = dir.path().join("a/b");
        conn.mkdir(&nested).await.unwrap();
        assert!(conn.exists(&nested).await.unwrap());

        std::fs::write(nested.join("f.txt"), "data").unwrap();
        assert_eq!(conn.read_file(&nested.join("f.txt")).await.unwrap(), "data");
        assert!(!conn.is_socket(&nested.join("f.txt")).await.unwrap());

        conn.rmtree(&dir.path().join("a")).await.unwrap();
        assert!(!conn.exists(&nested).await.unwrap());
        conn.rmtree(&dir.path().join("a")).await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_dir_local() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("logs")).unwrap();
        std::fs::write(src.path().join("logs/agent.log.txt"), "hello").unwrap();
        std::fs::write(src.path().join("turbostat.raw.txt"), "1 2 3").unwrap();

        let target = dst.path().join("copy");
        Connection::local().fetch_dir(src.path(), &target).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(target.join("logs/agent.log.txt")).unwrap(),
            "hello"
        );
        assert_eq!(
            std::fs::read_to_string(target.join("turbostat.raw.txt")).unwrap(),
            "1 2 3"
        );
    }

    #[tokio::test]
    async fn test_mkdtemp() {
        let conn = Connection::local();
        let tmp = conn.mkdtemp("stats-collect-test").await.unwrap();
        assert!(tmp.is_dir());
        conn.rmtree(&tmp).await.unwrap();
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn test_which_prefers_given_dirs() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("sh");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let conn = Connection::local();
        let found = conn.which("sh", &[dir.path().to_path_buf()]).await.unwrap();
        assert_eq!(found, Some(tool));
        assert!(conn.which("sh", &[]).await.unwrap().is_some());
        assert_eq!(
            conn.which("definitely-not-a-tool-xyz", &[]).await.unwrap(),
            None
        );
    }
}
