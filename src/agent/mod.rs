//! Supervised measurement agents.
//!
//! An [`Agent`] owns one agent process on one host: it locates the executable, cleans up
//! stale instances, spawns the agent with its output sent to a per-host log file, learns
//! the agent's Unix socket from that log, connects (through an `ssh` tunnel when the host
//! is remote) and then drives collection with the line protocol from [`protocol`].

mod announce;
mod error;
pub mod protocol;
mod transport;

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::time::Instant;

pub use announce::{ANNOUNCEMENT, find_socket_path};
pub use error::{Error, Result};
pub use protocol::Client;
pub use transport::{MIN_TUNNEL_TIMEOUT, State, Transport, stale_tunnel_pattern, tunnel_pattern};

use crate::catalog::StatDescriptor;
use crate::error::ResultOkLogExt;
use crate::proc::{CommandHandle, Connection, RunOptions, quote, quote_path};
use crate::supervisor::{self, KillOptions};

/// Default agent executable name.
pub const DEFAULT_EXE_NAME: &str = "stc-agent";

/// Minimum collection time whenever a slow collector is enabled.
pub const SLOW_COLLECTOR_FLOOR: Duration = Duration::from_secs(10);

/// Sub-directory of the logs directory receiving discovery output.
pub const DISCOVERY_SUBDIR: &str = "discovery-stats";

const SOCKET_DISCOVERY_ATTEMPTS: u32 = 5;
const SOCKET_DISCOVERY_INTERVAL: Duration = Duration::from_secs(1);

/// How to run one agent.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Agent type used in the log file name and messages, e.g. `inband`.
    pub kind: String,
    /// Name of the SUT, passed to the agent with `--sut-name`.
    pub sut_name: String,
    /// Explicit agent executable; searched in `search_paths` and `PATH` when `None`.
    pub path: Option<PathBuf>,
    pub exe_name: String,
    pub search_paths: Vec<PathBuf>,
    /// Directory for the agent log, on the host the agent runs on.
    pub logsdir: PathBuf,
    /// Run the agent with `-d`.
    pub debug: bool,
    /// Isolate the agent in a PID namespace and raise its priority when running as root.
    pub harden: bool,
    /// Bound for establishing an `ssh` tunnel, the connection timeout when `None`.
    pub connect_timeout: Option<Duration>,
    pub receive_timeout: Duration,
}

impl AgentOptions {
    pub fn new(kind: impl Into<String>, sut_name: impl Into<String>, logsdir: PathBuf) -> Self {
        Self {
            kind: kind.into(),
            sut_name: sut_name.into(),
            path: None,
            exe_name: DEFAULT_EXE_NAME.to_owned(),
            search_paths: Vec::new(),
            logsdir,
            debug: log::log_enabled!(log::Level::Debug),
            harden: true,
            connect_timeout: None,
            receive_timeout: protocol::DEFAULT_RECEIVE_TIMEOUT,
        }
    }
}

/// One agent process and its control connection.
#[derive(Debug)]
pub struct Agent {
    opts: AgentOptions,
    name: String,
    /// The host the agent runs on.
    conn: Connection,
    /// The controller, where tunnels run.
    local: Connection,
    exe: Option<PathBuf>,
    logpath: PathBuf,
    socket: Option<PathBuf>,
    handle: Option<CommandHandle>,
    transport: Transport,
    client: Option<Client>,
    min_collection: Duration,
    started_at: Option<Instant>,
    closed: bool,
}

impl Agent {
    /// Describes an agent running on `conn`'s host. Nothing is spawned until
    /// [`Agent::ensure_started`].
    pub fn new(conn: Connection, local: Connection, opts: AgentOptions) -> Self {
        let name = format!("{} agent on {}", opts.kind, conn.hostname());
        let logpath = opts
            .logsdir
            .join(format!("{}-agent-{}.log.txt", opts.kind, conn.hostname()));
        Self {
            transport: Transport::new(name.clone()),
            name,
            conn,
            local,
            exe: None,
            logpath,
            socket: None,
            handle: None,
            client: None,
            min_collection: Duration::ZERO,
            started_at: None,
            closed: false,
            opts,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The agent log file on the agent's host.
    pub fn logpath(&self) -> &Path {
        &self.logpath
    }

    /// The agent's Unix socket, once discovered.
    pub fn socket_path(&self) -> Option<&Path> {
        self.socket.as_deref()
    }

    /// PID of the agent on its host.
    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(CommandHandle::pid)
    }

    pub fn tunnel_port(&self) -> Option<u16> {
        self.transport.tunnel_port()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Whether a measurement window is open.
    pub fn is_collecting(&self) -> bool {
        self.started_at.is_some()
    }

    /// The time `stop` waits for after `start` with the current configuration.
    pub fn min_collection_time(&self) -> Duration {
        self.min_collection
    }

    /// Time given to an `ssh` tunnel to come up, never less than [`MIN_TUNNEL_TIMEOUT`].
    pub fn tunnel_timeout(&self) -> Duration {
        self.opts
            .connect_timeout
            .unwrap_or_else(|| self.conn.timeout())
            .max(MIN_TUNNEL_TIMEOUT)
    }

    /// Spawns and connects to the agent unless this already happened.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the executable cannot be located.
    /// - [`Error::SocketDiscovery`] if the agent never announces a usable socket; the
    ///   error carries the agent log.
    /// - Transport errors from [`Transport::connect`].
    pub async fn ensure_started(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::NotConnected {
                agent: self.name.clone(),
            });
        }
        if self.client.is_some() {
            return Ok(());
        }
        if self.handle.is_none() {
            self.spawn().await?;
        }
        let socket = match &self.socket {
            Some(socket) => socket.clone(),
            None => {
                let socket = self.discover_socket().await?;
                self.socket = Some(socket.clone());
                socket
            }
        };

        let stream = self
            .transport
            .connect(&self.conn, &self.local, &socket, self.tunnel_timeout())
            .await?;
        self.client = Some(
            Client::new(stream, self.name.clone(), self.logpath.clone())
                .with_receive_timeout(self.opts.receive_timeout),
        );
        log::info!("{}: connected", self.name);
        Ok(())
    }

    async fn resolve_exe(&mut self) -> Result<PathBuf> {
        if let Some(exe) = &self.exe {
            return Ok(exe.clone());
        }
        let exe = match &self.opts.path {
            Some(path) => path.clone(),
            None => self
                .conn
                .which(&self.opts.exe_name, &self.opts.search_paths)
                .await?
                .ok_or_else(|| Error::NotFound {
                    name: self.opts.exe_name.clone(),
                    host: self.conn.hostname().to_owned(),
                    searched: searched_dirs(&self.opts.search_paths),
                })?,
        };
        self.exe = Some(exe.clone());
        Ok(exe)
    }

    fn process_pattern(&self, exe: &Path) -> String {
        process_pattern(exe, &self.opts.sut_name)
    }

    async fn spawn(&mut self) -> Result<()> {
        let exe = self.resolve_exe().await?;

        let stale = supervisor::kill_by_pattern(
            &self.conn,
            &self.process_pattern(&exe),
            Signal::SIGTERM,
            KillOptions {
                kill_children: true,
                must_die: false,
            },
        )
        .await?;
        if !stale.is_empty() {
            log::warn!(
                "{}: killed {} stale agent process(es)",
                self.name,
                stale.len()
            );
        }
        if let Some(target) = self.conn.remote_target() {
            supervisor::kill_by_pattern(
                &self.local,
                &stale_tunnel_pattern(&target.host),
                Signal::SIGTERM,
                KillOptions::default(),
            )
            .await?;
        }

        let prefix = if self.opts.harden {
            self.hardening_prefix().await?
        } else {
            String::new()
        };
        self.conn.mkdir(&self.opts.logsdir).await?;
        let mut cmd = format!(
            "{prefix}{} --sut-name {}",
            quote_path(&exe),
            quote(&self.opts.sut_name)
        );
        if self.opts.debug {
            cmd.push_str(" -d");
        }
        cmd.push_str(&format!(" > {} 2>&1", quote_path(&self.logpath)));

        log::info!("{}: starting `{}`", self.name, cmd);
        let handle = self.conn.run_async(&cmd, &RunOptions::default()).await?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Builds the `unshare`/`nice` prefix. Missing helpers and lack of privilege only
    /// degrade to a plain spawn.
    async fn hardening_prefix(&self) -> Result<String> {
        if !self.conn.is_superuser().await? {
            log::debug!(
                "{}: not running as superuser, skipping agent isolation",
                self.name
            );
            return Ok(String::new());
        }

        let mut prefix = String::new();
        match self.conn.which("unshare", &[]).await? {
            Some(unshare) => {
                prefix.push_str(&format!("{} --fork --pid ", quote_path(&unshare)));
            }
            None => log::warn!(
                "{}: 'unshare' is not available on {}, the agent runs in the global PID namespace",
                self.name,
                self.conn.hostname()
            ),
        }
        match self.conn.which("nice", &[]).await? {
            Some(nice) => prefix.push_str(&format!("{} -n -20 ", quote_path(&nice))),
            None => log::warn!(
                "{}: 'nice' is not available on {}, the agent runs with default priority",
                self.name,
                self.conn.hostname()
            ),
        }
        Ok(prefix)
    }

    /// Polls the agent log for the socket announcement.
    async fn discover_socket(&mut self) -> Result<PathBuf> {
        let mut log = String::new();
        for attempt in 1..=SOCKET_DISCOVERY_ATTEMPTS {
            log = self.read_log().await;
            if let Some(path) = find_socket_path(&log) {
                if self.conn.is_socket(&path).await? {
                    log::debug!("{}: listening on `{}`", self.name, path.display());
                    return Ok(path);
                }
                return Err(self.discovery_error(
                    format!("`{}` is not a Unix socket", path.display()),
                    log,
                ));
            }

            if let Some(handle) = self.handle.as_mut() {
                let output = handle.wait(Some(Duration::ZERO), true).await;
                if let Some(code) = output.exit_code {
                    let log = self.read_log().await;
                    return Err(self.discovery_error(
                        format!("the agent exited with code {code} before announcing its socket"),
                        log,
                    ));
                }
            }
            if attempt < SOCKET_DISCOVERY_ATTEMPTS {
                tokio::time::sleep(SOCKET_DISCOVERY_INTERVAL).await;
            }
        }
        Err(self.discovery_error(
            format!(
                "no `{}` line after {} attempts",
                ANNOUNCEMENT.trim_end(),
                SOCKET_DISCOVERY_ATTEMPTS
            ),
            log,
        ))
    }

    async fn read_log(&self) -> String {
        match self.conn.read_file(&self.logpath).await {
            Ok(log) => log,
            Err(err) => {
                log::debug!("{}: agent log not readable yet: {}", self.name, err);
                String::new()
            }
        }
    }

    fn discovery_error(&self, reason: String, log: String) -> Error {
        Error::SocketDiscovery {
            agent: self.name.clone(),
            logpath: self.logpath.clone(),
            reason,
            log,
        }
    }

    fn client(&mut self) -> Result<&mut Client> {
        self.client.as_mut().ok_or_else(|| Error::NotConnected {
            agent: self.name.clone(),
        })
    }

    /// Sends the collection setup for `stats` and commits it with `configure`.
    ///
    /// Collectors write into `outdir`. With `for_discovery` every collector is made fallible
    /// and output goes to the [`DISCOVERY_SUBDIR`] of the logs directory instead.
    pub async fn configure(
        &mut self,
        stats: &[StatDescriptor],
        outdir: &Path,
        for_discovery: bool,
    ) -> Result<()> {
        self.ensure_started().await?;

        let (outdir, logdir) = if for_discovery {
            let dir = self.opts.logsdir.join(DISCOVERY_SUBDIR);
            (dir.clone(), dir)
        } else {
            (outdir.to_path_buf(), outdir.join("logs"))
        };
        self.conn.mkdir(&outdir).await?;
        self.conn.mkdir(&logdir).await?;

        let names: Vec<&str> = stats.iter().map(|s| s.name.as_str()).collect();
        let outdir = outdir.to_string_lossy().into_owned();
        let logdir = logdir.to_string_lossy().into_owned();
        let client = self.client()?;
        client.send_command("set-stats", Some(&names.join(","))).await?;

        for stat in stats {
            let fallible = for_discovery || stat.fallible;
            let mut props = vec![
                ("outdir", outdir.clone()),
                ("logdir", logdir.clone()),
                (
                    "toolpath",
                    stat.toolpath
                        .as_ref()
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                ),
                (
                    "interval",
                    stat.interval.map(|i| i.to_string()).unwrap_or_default(),
                ),
                ("fallible", fallible.to_string()),
            ];
            props.extend(stat.props.iter().map(|(k, v)| (k.as_str(), v.clone())));

            for (prop, value) in props {
                if value.is_empty() {
                    continue;
                }
                client
                    .send_command(
                        "set-collector-property",
                        Some(&format!("{} {} {}", stat.name, prop, value)),
                    )
                    .await?;
            }
        }
        client.send_command("configure", None).await?;
        self.min_collection = min_collection_time(stats);
        Ok(())
    }

    /// Starts collection and opens the measurement window.
    pub async fn start(&mut self) -> Result<()> {
        self.client()?.send_command("start", None).await?;
        self.started_at = Some(Instant::now());
        Ok(())
    }

    /// Stops collection, first waiting out the minimum collection time.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(started_at) = self.started_at {
            let deadline = started_at + self.min_collection;
            if Instant::now() < deadline {
                log::debug!(
                    "{}: waiting {:?} for every collector to take a sample",
                    self.name,
                    deadline - Instant::now()
                );
                tokio::time::sleep_until(deadline).await;
            }
        }
        self.started_at = None;
        self.client()?.send_command("stop", None).await?;
        Ok(())
    }

    /// Names of collectors that failed since `configure`.
    pub async fn get_failed_collectors(&mut self) -> Result<Vec<String>> {
        let data = self
            .client()?
            .send_command("get-failed-collectors", None)
            .await?;
        Ok(split_names(data.as_deref().unwrap_or("")))
    }

    /// Asks which of `stats` this agent can collect.
    ///
    /// Runs a short collection with every collector fallible and returns the names that
    /// did not fail. An agent that cannot be reached or talked to means nothing was
    /// learned and yields an empty list; failures to locate or spawn the agent are
    /// returned.
    pub async fn discover(&mut self, stats: &[StatDescriptor]) -> Result<Vec<String>> {
        if stats.is_empty() {
            return Ok(Vec::new());
        }
        match self.discovery_cycle(stats).await {
            Ok(failed) => {
                for name in &failed {
                    log::info!("{}: statistic '{}' is not available", self.name, name);
                }
                Ok(stats
                    .iter()
                    .filter(|s| !failed.contains(&s.name))
                    .map(|s| s.name.clone())
                    .collect())
            }
            Err(err) if err.is_protocol_level() || err.is_transport_level() => {
                log::warn!("{}: discovery failed: {}", self.name, err);
                self.started_at = None;
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    async fn discovery_cycle(&mut self, stats: &[StatDescriptor]) -> Result<Vec<String>> {
        let logsdir = self.opts.logsdir.clone();
        self.configure(stats, &logsdir, true).await?;
        self.start().await?;
        self.stop().await?;
        self.get_failed_collectors().await
    }

    /// Tears the agent down. Every step is best-effort and the method can be called again.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.started_at.is_some() {
            self.stop().await.ok_log(&format!("{}: failed to stop collection", self.name));
        }
        if let Some(mut client) = self.client.take() {
            client
                .send_command("exit", None)
                .await
                .ok_log(&format!("{}: failed to ask the agent to exit", self.name));
            client.shutdown().await;
        }
        self.transport.disconnect();

        let kill_opts = KillOptions {
            kill_children: true,
            must_die: false,
        };
        if let Some(pid) = self.pid() {
            supervisor::kill(&self.conn, &[pid], Signal::SIGTERM, kill_opts)
                .await
                .ok_log(&format!("{}: failed to kill PID {}", self.name, pid));
        }
        if let Some(exe) = self.exe.clone() {
            supervisor::kill_by_pattern(
                &self.conn,
                &self.process_pattern(&exe),
                Signal::SIGTERM,
                kill_opts,
            )
            .await
            .ok_log(&format!("{}: failed to kill the agent", self.name));
        }
        if let Some(mut handle) = self.handle.take() {
            handle.kill().await;
        }
        self.transport
            .close_tunnel(&self.local)
            .await
            .ok_log(&format!("{}: failed to close the tunnel", self.name));
    }
}

/// Regex matching the command line of the agent `exe` started for `sut_name`, also under
/// `unshare` or `nice`.
pub fn process_pattern(exe: &Path, sut_name: &str) -> String {
    format!(
        r"{}(\s|$)",
        regex::escape(&format!("{} --sut-name {}", exe.to_string_lossy(), sut_name))
    )
}

/// `I + 1` seconds for the longest interval `I`, and at least [`SLOW_COLLECTOR_FLOOR`] with
/// a slow collector enabled.
pub fn min_collection_time(stats: &[StatDescriptor]) -> Duration {
    let mut min = stats
        .iter()
        .filter_map(|s| s.interval)
        .fold(None, |max: Option<f64>, i| Some(max.map_or(i, |m| m.max(i))))
        .map_or(Duration::ZERO, |i| Duration::from_secs_f64(i + 1.0));
    if stats.iter().any(|s| s.slow) {
        min = min.max(SLOW_COLLECTOR_FLOOR);
    }
    min
}

fn split_names(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn searched_dirs(dirs: &[PathBuf]) -> String {
    let mut searched: Vec<String> = dirs.iter().map(|d| d.display().to_string()).collect();
    searched.push("PATH".to_owned());
    searched.join(", ")
}
