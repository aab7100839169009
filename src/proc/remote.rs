use std::path::PathBuf;
use std::time::Duration;

use super::quote::{quote, quote_path};

/// Where and how to reach a remote SUT over `ssh`.
///
/// Authentication is left entirely to the `ssh` client (agent, keys, `~/.ssh/config`);
/// connections always run in batch mode so a missing credential fails instead of prompting.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct RemoteTarget {
    /// Host name or address of the SUT.
    pub host: String,
    /// Remote user name, `ssh` decides when absent.
    #[serde(default)]
    pub user: Option<String>,
    /// Remote `sshd` port, `ssh` decides when absent.
    #[serde(default)]
    pub port: Option<u16>,
    /// Private key file passed with `-i`.
    #[serde(default)]
    pub privkey: Option<PathBuf>,
    /// Extra `-o` options, e.g. `StrictHostKeyChecking=no`.
    #[serde(default)]
    pub options: Vec<String>,
    /// The `ssh` client binary.
    #[serde(default = "default_ssh")]
    pub ssh: PathBuf,
}

fn default_ssh() -> PathBuf {
    PathBuf::from("ssh")
}

impl RemoteTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            privkey: None,
            options: Vec::new(),
            ssh: default_ssh(),
        }
    }

    /// Returns the `ssh` options shared by command execution and tunnels, host excluded.
    pub fn ssh_options(&self, connect_timeout: Duration) -> Vec<String> {
        let mut opts = vec![
            "-o".to_owned(),
            "BatchMode=yes".to_owned(),
            "-o".to_owned(),
            format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        ];
        if let Some(port) = self.port {
            opts.push("-p".to_owned());
            opts.push(port.to_string());
        }
        if let Some(user) = &self.user {
            opts.push("-l".to_owned());
            opts.push(user.clone());
        }
        if let Some(key) = &self.privkey {
            opts.push("-i".to_owned());
            opts.push(key.to_string_lossy().into_owned());
        }
        for opt in &self.options {
            opts.push("-o".to_owned());
            opts.push(opt.clone());
        }
        opts
    }

    /// Builds the controller-side command that runs `remote_cmd` on the SUT.
    pub fn command(&self, remote_cmd: &str, connect_timeout: Duration) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.ssh);
        cmd.args(self.ssh_options(connect_timeout))
            .arg("-T")
            .arg(&self.host)
            .arg(remote_cmd);
        cmd
    }

    fn quoted_options(&self, connect_timeout: Duration) -> String {
        self.ssh_options(connect_timeout)
            .iter()
            .map(|o| quote(o))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Renders the `ssh` invocation forwarding `local_port` to the remote Unix socket
    /// `socket`, as a shell command line for the controller.
    pub fn tunnel_command(
        &self,
        local_port: u16,
        socket: &std::path::Path,
        connect_timeout: Duration,
    ) -> String {
        format!(
            "{} -L {}:{} -N {} {}",
            quote_path(&self.ssh),
            local_port,
            quote_path(socket),
            self.quoted_options(connect_timeout),
            quote(&self.host)
        )
    }

    /// Renders [`RemoteTarget::command`] as a shell command line for the controller, e.g. to
    /// pipe remote output into a local command.
    pub fn shell_command(&self, remote_cmd: &str, connect_timeout: Duration) -> String {
        format!(
            "{} {} -T {} {}",
            quote_path(&self.ssh),
            self.quoted_options(connect_timeout),
            quote(&self.host),
            quote(remote_cmd)
        )
    }
}
