//! In-band and out-of-band collectors.
//!
//! A [`Collector`] owns the catalog rows that run in one place (on the SUT, or on the
//! controller observing the SUT) and the single [`Agent`] collecting them. The agent is
//! created on first use.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::agent::{Agent, AgentOptions, Error, Result};
use crate::catalog::{Catalog, SYSINFO, StatDescriptor};
use crate::error::ResultOkLogExt;
use crate::proc::Connection;

const TMPDIR_PREFIX: &str = "stats-collect";

/// Where a statistic is collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Placement {
    /// On the SUT.
    InBand,
    /// On the controller, observing the SUT from outside.
    OutOfBand,
}

impl Placement {
    pub fn of(stat: &StatDescriptor) -> Self {
        if stat.inband {
            Placement::InBand
        } else {
            Placement::OutOfBand
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Placement::InBand => "inband",
            Placement::OutOfBand => "outofband",
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct Collector {
    placement: Placement,
    /// Where the agent runs.
    conn: Connection,
    local: Connection,
    stats: Vec<StatDescriptor>,
    agent_opts: AgentOptions,
    /// Output directory requested by the caller, on the agent's host.
    outdir: Option<PathBuf>,
    workdir: Option<PathBuf>,
    owns_workdir: bool,
    agent: Option<Agent>,
    configured: bool,
}

impl Collector {
    /// Creates a collector for the `placement` rows of `catalog`, running its agent on
    /// `conn`'s host.
    ///
    /// Without `outdir` a temporary directory is created on that host when needed and
    /// removed by [`Collector::close`].
    pub fn new(
        placement: Placement,
        conn: Connection,
        local: Connection,
        catalog: &Catalog,
        agent_opts: AgentOptions,
        outdir: Option<PathBuf>,
    ) -> Self {
        let stats = catalog
            .stats()
            .iter()
            .filter(|s| Placement::of(s) == placement)
            .cloned()
            .collect();
        Self {
            placement,
            conn,
            local,
            stats,
            agent_opts,
            outdir,
            workdir: None,
            owns_workdir: false,
            agent: None,
            configured: false,
        }
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn stats(&self) -> &[StatDescriptor] {
        &self.stats
    }

    pub fn get(&self, name: &str) -> Option<&StatDescriptor> {
        self.stats.iter().find(|s| s.name == name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut StatDescriptor> {
        self.stats.iter_mut().find(|s| s.name == name)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &StatDescriptor> {
        self.stats.iter().filter(|s| s.enabled)
    }

    /// Enabled statistics driven through the agent.
    pub fn agent_stats(&self) -> Vec<StatDescriptor> {
        self.enabled()
            .filter(|s| s.name != SYSINFO)
            .cloned()
            .collect()
    }

    /// The directory the agent writes to, once created.
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    /// Whether the workdir is a temporary directory owned by this collector.
    pub fn owns_workdir(&self) -> bool {
        self.owns_workdir
    }

    pub fn agent(&self) -> Option<&Agent> {
        self.agent.as_ref()
    }

    async fn ensure_workdir(&mut self) -> Result<PathBuf> {
        if let Some(workdir) = &self.workdir {
            return Ok(workdir.clone());
        }
        let workdir = match &self.outdir {
            Some(outdir) => {
                self.conn.mkdir(outdir).await?;
                outdir.clone()
            }
            None => {
                let tmp = self.conn.mkdtemp(TMPDIR_PREFIX).await?;
                log::debug!(
                    "{} collector: created `{}` on {}",
                    self.placement,
                    tmp.display(),
                    self.conn.hostname()
                );
                self.owns_workdir = true;
                tmp
            }
        };
        self.workdir = Some(workdir.clone());
        Ok(workdir)
    }

    async fn ensure_agent(&mut self) -> Result<&mut Agent> {
        let agent = match self.agent.take() {
            Some(agent) => agent,
            None => {
                let workdir = self.ensure_workdir().await?;
                let opts = AgentOptions {
                    kind: self.placement.as_str().to_owned(),
                    logsdir: workdir.join("logs"),
                    ..self.agent_opts.clone()
                };
                Agent::new(self.conn.clone(), self.local.clone(), opts)
            }
        };
        Ok(self.agent.insert(agent))
    }

    /// Checks which of `names` can be collected here. Unknown names and `sysinfo` are
    /// ignored; the enabled flags are not consulted nor changed.
    pub async fn discover(&mut self, names: &[&str]) -> Result<Vec<String>> {
        let stats: Vec<StatDescriptor> = self
            .stats
            .iter()
            .filter(|s| s.name != SYSINFO && names.contains(&s.name.as_str()))
            .cloned()
            .collect();
        if stats.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_agent().await?.discover(&stats).await
    }

    /// Configures the agent for the enabled statistics. Does nothing when none is enabled.
    pub async fn configure(&mut self) -> Result<()> {
        let stats = self.agent_stats();
        self.configured = false;
        if stats.is_empty() {
            log::debug!("{} collector: nothing to collect", self.placement);
            return Ok(());
        }
        let workdir = self.ensure_workdir().await?;
        self.ensure_agent()
            .await?
            .configure(&stats, &workdir, false)
            .await?;
        self.configured = true;
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub async fn start(&mut self) -> Result<()> {
        if !self.configured {
            return Ok(());
        }
        self.configured_agent()?.start().await
    }

    /// Stops collection and returns the collectors that failed.
    pub async fn stop(&mut self) -> Result<Vec<String>> {
        if !self.configured {
            return Ok(Vec::new());
        }
        let agent = self.configured_agent()?;
        agent.stop().await?;
        agent.get_failed_collectors().await
    }

    fn configured_agent(&mut self) -> Result<&mut Agent> {
        let placement = self.placement;
        self.agent.as_mut().ok_or_else(|| Error::NotConnected {
            agent: format!("{placement} agent"),
        })
    }

    /// Copies the workdir into `dest` on the controller.
    pub async fn fetch(&self, dest: &Path) -> Result<()> {
        let Some(workdir) = &self.workdir else {
            return Ok(());
        };
        self.conn.fetch_dir(workdir, dest).await?;
        Ok(())
    }

    /// Shuts the agent down and removes the temporary workdir, best-effort.
    pub async fn close(&mut self) {
        if let Some(agent) = self.agent.as_mut() {
            agent.close().await;
        }
        if self.owns_workdir {
            if let Some(workdir) = self.workdir.take() {
                self.conn
                    .rmtree(&workdir)
                    .await
                    .ok_log(&format!("failed to remove `{}`", workdir.display()));
            }
            self.owns_workdir = false;
        }
        self.configured = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector(placement: Placement, outdir: Option<PathBuf>) -> Collector {
        let conn = Connection::local();
        let catalog = Catalog::builtin().unwrap();
        let opts = AgentOptions::new(placement.as_str(), "sut", PathBuf::from("/unused"));
        Collector::new(placement, conn.clone(), conn, &catalog, opts, outdir)
    }

    #[test]
    fn test_rows_split_by_placement() {
        let inband = collector(Placement::InBand, None);
        let names: Vec<&str> = inband.stats().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["sysinfo", "turbostat", "interrupts", "ipmi-inband"]);

        let oob = collector(Placement::OutOfBand, None);
        let names: Vec<&str> = oob.stats().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["acpower", "ipmi-oob"]);
    }

    #[test]
    fn test_agent_stats_exclude_sysinfo() {
        let mut inband = collector(Placement::InBand, None);
        assert!(inband.get(SYSINFO).unwrap().enabled);
        let names: Vec<String> = inband.agent_stats().into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["turbostat", "interrupts"]);

        inband.get_mut("turbostat").unwrap().enabled = false;
        let names: Vec<String> = inband.agent_stats().into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["interrupts"]);
    }

    #[tokio::test]
    async fn test_nothing_enabled_is_a_no_op() {
        let mut oob = collector(Placement::OutOfBand, None);
        oob.configure().await.unwrap();
        assert!(!oob.is_configured());
        oob.start().await.unwrap();
        assert!(oob.stop().await.unwrap().is_empty());
        assert!(oob.agent().is_none());
        assert!(oob.workdir().is_none());
        assert!(oob.discover(&["sysinfo", "nope"]).await.unwrap().is_empty());
        oob.close().await;
    }

    #[tokio::test]
    async fn test_temporary_workdir_removed_on_close() {
        let mut inband = collector(Placement::InBand, None);
        let workdir = inband.ensure_workdir().await.unwrap();
        assert!(workdir.is_dir());
        assert!(inband.owns_workdir());

        let dest = tempfile::tempdir().unwrap();
        std::fs::write(workdir.join("data.txt"), "x").unwrap();
        inband.fetch(dest.path()).await.unwrap();
        assert!(dest.path().join("data.txt").is_file());

        inband.close().await;
        assert!(!workdir.exists());
        inband.close().await;
    }

    #[tokio::test]
    async fn test_given_outdir_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let outdir = dir.path().join("out");
        let mut inband = collector(Placement::InBand, Some(outdir.clone()));
        assert_eq!(inband.ensure_workdir().await.unwrap(), outdir);
        assert!(!inband.owns_workdir());
        inband.close().await;
        assert!(outdir.is_dir());
    }
}
