//! Configuration of the `stats-collect` binary, read from `STATS_COLLECT_*` environment
//! variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::catalog::DEFAULT;
use crate::proc::{Connection, DEFAULT_TIMEOUT, RemoteTarget};
use crate::router;

const PREFIX: &str = "STATS_COLLECT_";
const DEFAULT_OUTDIR: &str = "stats-collect-output";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid value `{value}` for {var}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
    #[error("{var} is not valid UTF-8")]
    NotUnicode { var: String },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// `None` for a local SUT.
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub privkey: Option<PathBuf>,
    pub sut_name: Option<String>,
    pub stats: Vec<String>,
    pub exclude: Vec<String>,
    pub intervals: Vec<(String, f64)>,
    pub outdir: PathBuf,
    pub agent_path: Option<PathBuf>,
    pub remote_agent_path: Option<PathBuf>,
    /// JSON catalog replacing the built-in one.
    pub catalog: Option<PathBuf>,
    /// Default timeout of commands run on the SUT.
    pub timeout: Duration,
    /// How long to collect when no workload command is given.
    pub duration: Option<Duration>,
    /// Workload command run on the SUT while collecting.
    pub command: Vec<String>,
}

impl Config {
    /// Reads the process environment; `args` is the workload command.
    pub fn from_env(args: Vec<String>) -> Result<Self> {
        Self::from_lookup(
            |key| match std::env::var(key) {
                Ok(value) => Ok(Some(value)),
                Err(std::env::VarError::NotPresent) => Ok(None),
                Err(std::env::VarError::NotUnicode(_)) => Err(Error::NotUnicode {
                    var: key.to_owned(),
                }),
            },
            args,
        )
    }

    /// Builds a configuration from `lookup`, which receives full variable names.
    pub fn from_lookup<F>(lookup: F, args: Vec<String>) -> Result<Self>
    where
        F: Fn(&str) -> Result<Option<String>>,
    {
        let var = |name: &str| -> Result<Option<(String, String)>> {
            let key = format!("{PREFIX}{name}");
            Ok(lookup(&key)?
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
                .map(|v| (key, v)))
        };
        let string = |name: &str| -> Result<Option<String>> { Ok(var(name)?.map(|(_, v)| v)) };
        let path = |name: &str| -> Result<Option<PathBuf>> { Ok(string(name)?.map(PathBuf::from)) };
        let seconds = |name: &str| -> Result<Option<Duration>> {
            var(name)?
                .map(|(key, value)| parse_seconds(&key, &value).map(Duration::from_secs_f64))
                .transpose()
        };

        let host = string("HOST")?.filter(|h| h != "localhost");
        let port = var("PORT")?
            .map(|(key, value)| {
                value.parse::<u16>().map_err(|err| Error::Invalid {
                    var: key,
                    value,
                    reason: err.to_string(),
                })
            })
            .transpose()?;
        let intervals = match var("INTERVALS")? {
            Some((key, value)) => parse_intervals(&key, &value)?,
            None => Vec::new(),
        };

        Ok(Self {
            host,
            user: string("USER")?,
            port,
            privkey: path("PRIVKEY")?,
            sut_name: string("SUT_NAME")?,
            stats: string("STATS")?.map_or_else(|| vec![DEFAULT.to_owned()], |v| split_list(&v)),
            exclude: string("EXCLUDE")?.map_or_else(Vec::new, |v| split_list(&v)),
            intervals,
            outdir: path("OUTDIR")?.unwrap_or_else(|| PathBuf::from(DEFAULT_OUTDIR)),
            agent_path: path("AGENT_PATH")?,
            remote_agent_path: path("REMOTE_AGENT_PATH")?,
            catalog: path("CATALOG")?,
            timeout: seconds("TIMEOUT")?.unwrap_or(DEFAULT_TIMEOUT),
            duration: seconds("DURATION")?,
            command: args,
        })
    }

    pub fn remote_target(&self) -> Option<RemoteTarget> {
        let host = self.host.as_ref()?;
        Some(RemoteTarget {
            user: self.user.clone(),
            port: self.port,
            privkey: self.privkey.clone(),
            ..RemoteTarget::new(host.clone())
        })
    }

    /// The connection to the SUT.
    pub fn connection(&self) -> Connection {
        match self.remote_target() {
            Some(target) => Connection::remote(target),
            None => Connection::local(),
        }
        .with_timeout(self.timeout)
    }

    pub fn router_options(&self) -> router::Options {
        router::Options {
            sut_name: self.sut_name.clone(),
            outdir: Some(self.outdir.clone()),
            local_agent_path: self.agent_path.clone(),
            remote_agent_path: self.remote_agent_path.clone(),
            ..router::Options::default()
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_seconds(var: &str, value: &str) -> Result<f64> {
    match value.parse::<f64>() {
        Ok(secs) if secs > 0.0 && secs.is_finite() => Ok(secs),
        _ => Err(Error::Invalid {
            var: var.to_owned(),
            value: value.to_owned(),
            reason: "expected a positive number of seconds".to_owned(),
        }),
    }
}

/// Parses `name:secs,name:secs`.
fn parse_intervals(var: &str, value: &str) -> Result<Vec<(String, f64)>> {
    split_list(value)
        .into_iter()
        .map(|item| {
            let Some((name, secs)) = item.split_once(':') else {
                return Err(Error::Invalid {
                    var: var.to_owned(),
                    value: item,
                    reason: "expected `name:seconds`".to_owned(),
                });
            };
            Ok((name.trim().to_owned(), parse_seconds(var, secs.trim())?))
        })
        .collect()
}
