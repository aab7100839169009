//! Statistics routing and the collection session.
//!
//! [`StatsCollect`] owns one in-band collector (agent on the SUT) and, for remote SUTs
//! only, one out-of-band collector (agent on the controller). Statistic names are routed to
//! the collector owning their catalog row; aggregate names are resolved to the first
//! available candidate and mutually exclusive pairs are settled in favor of the preferred
//! member.

mod aggregate;
mod error;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use aggregate::conflicting_pairs;
pub use error::{Error, Result};

use aggregate::Availability;

use crate::agent::{self, AgentOptions};
use crate::catalog::{ALL, Catalog, DEFAULT, SYSINFO, StatDescriptor};
use crate::collector::{Collector, Placement};
use crate::error::ResultOkLogExt;
use crate::proc::Connection;
use crate::sysinfo::{self, When};

const TMPDIR_PREFIX: &str = "stats-collect-out";

/// Which connection a collector uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The controller.
    Local,
    /// The remote SUT.
    Remote,
}

/// Fixed routing table: in-band statistics go wherever the SUT is, out-of-band ones are
/// always collected on the controller.
pub fn route(placement: Placement, sut_is_remote: bool) -> Route {
    match (placement, sut_is_remote) {
        (Placement::InBand, true) => Route::Remote,
        (Placement::InBand, false) | (Placement::OutOfBand, _) => Route::Local,
    }
}

/// Whether a session has a collector for `placement`. A local SUT cannot be observed from
/// outside, so it never gets an out-of-band collector.
pub fn has_collector(placement: Placement, sut_is_remote: bool) -> bool {
    placement == Placement::InBand || sut_is_remote
}

#[derive(Debug, Clone)]
pub struct Options {
    /// Name passed to agents, the SUT host name by default.
    pub sut_name: Option<String>,
    /// Result directory on the controller; a temporary one (removed on close) when `None`.
    pub outdir: Option<PathBuf>,
    /// Agent executable on the controller.
    pub local_agent_path: Option<PathBuf>,
    /// Agent executable on a remote SUT.
    pub remote_agent_path: Option<PathBuf>,
    pub search_paths: Vec<PathBuf>,
    pub debug: bool,
    pub harden: bool,
    /// Bound for `ssh` tunnels to remote agents, the SUT connection timeout when `None`.
    pub tunnel_timeout: Option<Duration>,
    pub receive_timeout: Duration,
    /// `(name, command)` pairs captured for `sysinfo`.
    pub sysinfo_commands: Vec<(String, String)>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sut_name: None,
            outdir: None,
            local_agent_path: None,
            remote_agent_path: None,
            search_paths: Vec::new(),
            debug: log::log_enabled!(log::Level::Debug),
            harden: true,
            tunnel_timeout: None,
            receive_timeout: agent::protocol::DEFAULT_RECEIVE_TIMEOUT,
            sysinfo_commands: sysinfo::default_commands(),
        }
    }
}

/// One statistics collection session against one SUT.
#[derive(Debug)]
pub struct StatsCollect {
    catalog: Catalog,
    sut: Connection,
    local: Connection,
    inband: Collector,
    oob: Option<Collector>,
    /// Enabled aggregate names waiting for resolution.
    aggregates: BTreeSet<String>,
    outdir: PathBuf,
    owns_outdir: bool,
    sysinfo_commands: Vec<(String, String)>,
    collecting: bool,
    closed: bool,
}

impl StatsCollect {
    /// Sets up the collectors for `sut`. No agent is started yet.
    ///
    /// # Errors
    ///
    /// Fails if the result directory cannot be created.
    pub async fn new(sut: Connection, catalog: Catalog, opts: Options) -> Result<Self> {
        let remote = sut.is_remote();
        let local = if remote {
            Connection::local().with_timeout(sut.timeout())
        } else {
            sut.clone()
        };

        let (outdir, owns_outdir) = match &opts.outdir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|source| Error::Io {
                        path: dir.clone(),
                        source,
                    })?;
                (dir.clone(), false)
            }
            None => (local.mkdtemp(TMPDIR_PREFIX).await?, true),
        };

        let sut_name = opts
            .sut_name
            .clone()
            .unwrap_or_else(|| sut.hostname().to_owned());
        let template = AgentOptions {
            search_paths: opts.search_paths.clone(),
            debug: opts.debug,
            harden: opts.harden,
            connect_timeout: opts.tunnel_timeout,
            receive_timeout: opts.receive_timeout,
            ..AgentOptions::new(Placement::InBand.as_str(), sut_name, outdir.join("logs"))
        };

        let conn_for = |placement| match route(placement, remote) {
            Route::Local => local.clone(),
            Route::Remote => sut.clone(),
        };
        let inband = Collector::new(
            Placement::InBand,
            conn_for(Placement::InBand),
            local.clone(),
            &catalog,
            AgentOptions {
                path: if remote {
                    opts.remote_agent_path.clone()
                } else {
                    opts.local_agent_path.clone()
                },
                ..template.clone()
            },
            (!remote).then(|| outdir.clone()),
        );
        let oob = has_collector(Placement::OutOfBand, remote).then(|| {
            Collector::new(
                Placement::OutOfBand,
                conn_for(Placement::OutOfBand),
                local.clone(),
                &catalog,
                AgentOptions {
                    path: opts.local_agent_path.clone(),
                    ..template
                },
                Some(outdir.clone()),
            )
        });
        log::info!(
            "collecting statistics for {} into `{}`",
            sut.hostname(),
            outdir.display()
        );

        Ok(Self {
            catalog,
            sut,
            local,
            inband,
            oob,
            aggregates: BTreeSet::new(),
            outdir,
            owns_outdir,
            sysinfo_commands: opts.sysinfo_commands,
            collecting: false,
            closed: false,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn sut(&self) -> &Connection {
        &self.sut
    }

    /// The result directory on the controller.
    pub fn outdir(&self) -> &Path {
        &self.outdir
    }

    pub fn collector(&self, placement: Placement) -> Option<&Collector> {
        match placement {
            Placement::InBand => Some(&self.inband),
            Placement::OutOfBand => self.oob.as_ref(),
        }
    }

    fn collector_mut(&mut self, placement: Placement) -> Option<&mut Collector> {
        match placement {
            Placement::InBand => Some(&mut self.inband),
            Placement::OutOfBand => self.oob.as_mut(),
        }
    }

    fn collectors_mut(&mut self) -> impl Iterator<Item = &mut Collector> {
        std::iter::once(&mut self.inband).chain(self.oob.as_mut())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed {
                host: self.sut.hostname().to_owned(),
            });
        }
        Ok(())
    }

    fn unknown(&self, name: &str) -> Error {
        Error::UnknownStat {
            name: name.to_owned(),
            known: self.catalog.known_names(),
        }
    }

    /// The session's copy of the row for `name`, if a collector owns it.
    fn descriptor(&self, name: &str) -> Option<&StatDescriptor> {
        let placement = Placement::of(self.catalog.get(name)?);
        self.collector(placement)?.get(name)
    }

    fn descriptor_mut(&mut self, name: &str) -> Option<&mut StatDescriptor> {
        let placement = Placement::of(self.catalog.get(name)?);
        self.collector_mut(placement)?.get_mut(name)
    }

    fn is_enabled(&self, name: &str) -> bool {
        self.descriptor(name).is_some_and(|s| s.enabled)
    }

    fn set_enabled(&mut self, name: &str, enabled: bool) {
        if let Some(stat) = self.descriptor_mut(name) {
            stat.enabled = enabled;
        }
    }

    /// Checks that a concrete statistic exists and has a collector in this session.
    fn owned(&self, name: &str) -> Result<()> {
        let stat = self.catalog.get(name).ok_or_else(|| self.unknown(name))?;
        let placement = Placement::of(stat);
        if self.collector(placement).is_none() {
            return Err(Error::NoCollector {
                name: name.to_owned(),
                placement: placement.to_string(),
                host: self.sut.hostname().to_owned(),
            });
        }
        Ok(())
    }

    /// Candidates of an aggregate that this session can collect.
    fn collectable_candidates(&self, aggregate: &str) -> Vec<String> {
        self.catalog
            .aggregate(aggregate)
            .unwrap_or_default()
            .iter()
            .filter(|c| self.descriptor(c).is_some())
            .cloned()
            .collect()
    }

    /// Splits `names` into concrete statistics and aggregates, expanding `all` to every
    /// statistic this session can collect.
    fn expand(&self, names: &[&str]) -> Result<(Vec<String>, Vec<String>)> {
        let mut stats = Vec::new();
        let mut aggregates = Vec::new();
        for name in names {
            if *name == ALL {
                stats.extend(
                    self.catalog
                        .names()
                        .filter(|n| self.descriptor(n).is_some())
                        .map(str::to_owned),
                );
            } else if self.catalog.aggregate(name).is_some() {
                aggregates.push((*name).to_owned());
            } else {
                self.owned(name)?;
                stats.push((*name).to_owned());
            }
        }
        Ok((stats, aggregates))
    }

    /// Concrete statistics addressed by `name`: itself, or the collectable candidates of an
    /// aggregate.
    fn targets(&self, name: &str) -> Result<Vec<String>> {
        if self.catalog.aggregate(name).is_some() {
            return Ok(self.collectable_candidates(name));
        }
        self.owned(name)?;
        Ok(vec![name.to_owned()])
    }

    /// Enables statistics by name. Aggregate names stay pending until
    /// [`StatsCollect::resolve_aggregates`]. Nothing changes if any name is invalid.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownStat`] for names missing from the catalog.
    /// - [`Error::NoCollector`] for statistics this session cannot collect, e.g.
    ///   out-of-band ones on a local SUT.
    pub fn enable(&mut self, names: &[&str]) -> Result<()> {
        let (stats, aggregates) = self.expand(names)?;
        for name in &stats {
            self.set_enabled(name, true);
        }
        self.aggregates.extend(aggregates);
        Ok(())
    }

    /// Disables statistics by name; disabling an aggregate disables all its candidates.
    /// Nothing changes if any name is invalid.
    pub fn disable(&mut self, names: &[&str]) -> Result<()> {
        let (stats, aggregates) = self.expand(names)?;
        for name in &stats {
            self.set_enabled(name, false);
        }
        for aggregate in &aggregates {
            self.aggregates.remove(aggregate);
            for candidate in self.collectable_candidates(aggregate) {
                self.set_enabled(&candidate, false);
            }
        }
        Ok(())
    }

    /// Applies an include list and an exclude list in one go. [`DEFAULT`] in `include`
    /// keeps the catalog defaults.
    ///
    /// # Errors
    ///
    /// [`Error::Conflict`] if a name is both included and excluded, besides the lookup
    /// errors of [`StatsCollect::enable`]. Nothing changes on error.
    pub fn select(&mut self, include: &[&str], exclude: &[&str]) -> Result<()> {
        if let Some(name) = include.iter().find(|n| **n != DEFAULT && exclude.contains(*n)) {
            return Err(Error::Conflict {
                name: (*name).to_owned(),
            });
        }
        let include: Vec<&str> = include.iter().copied().filter(|n| *n != DEFAULT).collect();
        self.expand(&include)?;
        self.expand(exclude)?;
        self.enable(&include)?;
        self.disable(exclude)
    }

    /// Concrete candidates of an aggregate name, most preferred first.
    pub fn candidates(&self, aggregate: &str) -> Result<Vec<String>> {
        self.catalog
            .aggregate(aggregate)
            .map(<[String]>::to_vec)
            .ok_or_else(|| Error::UnknownAggregate {
                name: aggregate.to_owned(),
            })
    }

    /// Enabled statistics in catalog order.
    pub fn get_enabled(&self) -> Vec<String> {
        self.catalog
            .names()
            .filter(|n| self.is_enabled(n))
            .map(str::to_owned)
            .collect()
    }

    /// Collectable but disabled statistics in catalog order.
    pub fn get_disabled(&self) -> Vec<String> {
        self.catalog
            .names()
            .filter(|n| self.descriptor(n).is_some_and(|s| !s.enabled))
            .map(str::to_owned)
            .collect()
    }

    /// Enabled aggregate names not resolved yet.
    pub fn pending_aggregates(&self) -> Vec<String> {
        self.aggregates.iter().cloned().collect()
    }

    /// Sets sampling intervals in seconds. Aggregate names apply to all their candidates.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInterval`] and [`Error::NotPeriodic`] besides the name lookup
    /// errors of [`StatsCollect::enable`]. Nothing changes on error.
    pub fn set_intervals(&mut self, intervals: &[(String, f64)]) -> Result<()> {
        let mut updates = Vec::new();
        for (name, interval) in intervals {
            if !(*interval > 0.0 && interval.is_finite()) {
                return Err(Error::InvalidInterval {
                    name: name.clone(),
                    interval: *interval,
                });
            }
            for target in self.targets(name)? {
                if !self.descriptor(&target).is_some_and(StatDescriptor::is_periodic) {
                    return Err(Error::NotPeriodic { name: target });
                }
                updates.push((target, *interval));
            }
        }
        for (name, interval) in updates {
            if let Some(stat) = self.descriptor_mut(&name) {
                stat.interval = Some(interval);
            }
        }
        Ok(())
    }

    /// The longest interval among enabled statistics.
    pub fn get_max_interval(&self) -> Option<f64> {
        self.catalog
            .names()
            .filter_map(|n| self.descriptor(n))
            .filter(|s| s.enabled)
            .filter_map(|s| s.interval)
            .reduce(f64::max)
    }

    /// Sets the tool a statistic's collector runs.
    pub fn set_toolpath(&mut self, name: &str, path: PathBuf) -> Result<()> {
        for target in self.targets(name)? {
            if let Some(stat) = self.descriptor_mut(&target) {
                stat.toolpath = Some(path.clone());
            }
        }
        Ok(())
    }

    /// Sets a collector property the statistic declares.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownProperty`] if the statistic has no property `prop`.
    pub fn set_prop(&mut self, name: &str, prop: &str, value: &str) -> Result<()> {
        let targets = self.targets(name)?;
        for target in &targets {
            let Some(stat) = self.descriptor(target) else {
                continue;
            };
            if !stat.props.contains_key(prop) {
                let known: Vec<&str> = stat.props.keys().map(String::as_str).collect();
                return Err(Error::UnknownProperty {
                    stat: target.clone(),
                    prop: prop.to_owned(),
                    known: if known.is_empty() {
                        "nothing".to_owned()
                    } else {
                        known.join(", ")
                    },
                });
            }
        }
        for target in &targets {
            if let Some(stat) = self.descriptor_mut(target) {
                stat.props.insert(prop.to_owned(), value.to_owned());
            }
        }
        Ok(())
    }

    /// Replaces every pending aggregate by its first available candidate, then settles
    /// mutually exclusive pairs.
    ///
    /// # Errors
    ///
    /// [`Error::Unresolvable`] if no candidate of an aggregate is available.
    pub async fn resolve_aggregates(&mut self) -> Result<()> {
        self.check_open()?;
        let pending: Vec<String> = self.aggregates.iter().cloned().collect();
        for name in pending {
            let candidates = self.collectable_candidates(&name);
            let host = self.sut.hostname().to_owned();
            let mut avail = AvailabilityCheck {
                catalog: &self.catalog,
                inband: &mut self.inband,
                oob: self.oob.as_mut(),
            };
            let chosen = aggregate::resolve(&name, &candidates, &host, &mut avail).await?;
            self.set_enabled(&chosen, true);
            self.aggregates.remove(&name);
        }
        self.resolve_exclusive();
        Ok(())
    }

    /// Disables the non-preferred member of every fully enabled mutually exclusive pair.
    pub fn resolve_exclusive(&mut self) {
        let enabled: BTreeSet<String> = self.get_enabled().into_iter().collect();
        let conflicts: Vec<(String, String)> =
            conflicting_pairs(&enabled, self.catalog.exclusive_pairs())
                .into_iter()
                .cloned()
                .collect();
        for (preferred, other) in conflicts {
            log::info!(
                "'{other}' and '{preferred}' measure the same thing, disabling '{other}' in favor of '{preferred}'"
            );
            self.set_enabled(&other, false);
        }
    }

    /// Checks which enabled statistics can actually be collected. The enabled set is left
    /// unchanged.
    pub async fn discover(&mut self) -> Result<Vec<String>> {
        self.check_open()?;
        let mut available = BTreeSet::new();
        for collector in self.collectors_mut() {
            let names: Vec<String> = collector.agent_stats().into_iter().map(|s| s.name).collect();
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            available.extend(collector.discover(&names).await?);
        }
        if self.is_enabled(SYSINFO) {
            available.insert(SYSINFO.to_owned());
        }
        Ok(self
            .catalog
            .names()
            .filter(|n| available.contains(*n))
            .map(str::to_owned)
            .collect())
    }

    /// Resolves what is still pending and configures the agents.
    pub async fn configure(&mut self) -> Result<()> {
        self.check_open()?;
        if !self.aggregates.is_empty() {
            self.resolve_aggregates().await?;
        }
        self.resolve_exclusive();
        log::info!("enabled statistics: {}", self.get_enabled().join(", "));
        for collector in self.collectors_mut() {
            collector.configure().await?;
        }
        Ok(())
    }

    /// Takes the `sysinfo` "before" snapshot and starts every agent.
    pub async fn start(&mut self) -> Result<()> {
        self.check_open()?;
        if self.is_enabled(SYSINFO) {
            sysinfo::snapshot(&self.sut, &self.outdir, When::Before, &self.sysinfo_commands)
                .await?;
        }
        self.collecting = true;
        for collector in self.collectors_mut() {
            collector.start().await?;
        }
        Ok(())
    }

    /// Stops every agent, takes the `sysinfo` "after" snapshot and brings remote results to
    /// the result directory. Returns the collectors that failed.
    pub async fn stop(&mut self) -> Result<Vec<String>> {
        self.check_open()?;
        if !self.collecting {
            return Ok(Vec::new());
        }
        self.collecting = false;

        let mut failed = Vec::new();
        let mut first_err = None;
        for collector in self.collectors_mut() {
            match collector.stop().await {
                Ok(names) => failed.extend(names),
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err.into());
        }
        for name in &failed {
            log::warn!("collector '{}' failed on {}", name, self.sut.hostname());
        }

        if self.is_enabled(SYSINFO) {
            sysinfo::snapshot(&self.sut, &self.outdir, When::After, &self.sysinfo_commands)
                .await?;
        }
        if self.inband.owns_workdir() {
            self.inband.fetch(&self.outdir).await?;
        }
        Ok(failed)
    }

    /// Ends the session: stops collection if needed, shuts the agents down and removes
    /// temporary directories. Failures are logged, and calling it again does nothing.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        if self.collecting {
            self.stop().await.ok_log("failed to stop collection");
        }
        self.closed = true;
        for collector in self.collectors_mut() {
            collector.close().await;
        }
        if self.owns_outdir {
            self.local
                .rmtree(&self.outdir)
                .await
                .ok_log(&format!("failed to remove `{}`", self.outdir.display()));
        }
    }
}

/// Checks candidates through the collector owning them.
struct AvailabilityCheck<'a> {
    catalog: &'a Catalog,
    inband: &'a mut Collector,
    oob: Option<&'a mut Collector>,
}

impl Availability for AvailabilityCheck<'_> {
    async fn is_available(&mut self, name: &str) -> Result<bool> {
        let Some(stat) = self.catalog.get(name) else {
            return Ok(false);
        };
        let collector = match Placement::of(stat) {
            Placement::InBand => Some(&mut *self.inband),
            Placement::OutOfBand => self.oob.as_deref_mut(),
        };
        let Some(collector) = collector else {
            return Ok(false);
        };
        let available = collector.discover(&[name]).await?;
        Ok(available.iter().any(|n| n == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::RemoteTarget;
    use crate::testutil::{FakeAgent, announcing_agent};

    const TEST_CATALOG: &str = r#"{
        "stats": [
            {"name": "sysinfo", "inband": true, "enabled": true},
            {"name": "cstates", "inband": true, "interval": 1, "enabled": true},
            {"name": "power-oob", "inband": false, "interval": 1, "props": {"bmchost": ""}},
            {"name": "power-inband", "inband": true, "interval": 1}
        ],
        "aggregates": {"power": ["power-oob", "power-inband"]},
        "exclusive": [["power-oob", "power-inband"]]
    }"#;

    fn options(outdir: &Path) -> Options {
        Options {
            outdir: Some(outdir.to_path_buf()),
            debug: false,
            harden: false,
            receive_timeout: Duration::from_secs(5),
            sysinfo_commands: vec![("greeting".to_owned(), "echo hi".to_owned())],
            ..Options::default()
        }
    }

    async fn local_session(outdir: &Path) -> StatsCollect {
        StatsCollect::new(Connection::local(), Catalog::builtin().unwrap(), options(outdir))
            .await
            .unwrap()
    }

    /// A session against a remote SUT that is never contacted.
    async fn remote_session(outdir: &Path) -> StatsCollect {
        let sut = Connection::remote(RemoteTarget::new("sut1.invalid"));
        StatsCollect::new(sut, Catalog::builtin().unwrap(), options(outdir))
            .await
            .unwrap()
    }

    #[test]
    fn test_route_table() {
        assert_eq!(route(Placement::InBand, false), Route::Local);
        assert_eq!(route(Placement::InBand, true), Route::Remote);
        assert_eq!(route(Placement::OutOfBand, false), Route::Local);
        assert_eq!(route(Placement::OutOfBand, true), Route::Local);
        assert!(!has_collector(Placement::OutOfBand, false));
        assert!(has_collector(Placement::OutOfBand, true));
    }

    #[tokio::test]
    async fn test_local_sut_has_no_out_of_band_collector() {
        let dir = tempfile::tempdir().unwrap();
        let mut sc = local_session(dir.path()).await;
        assert!(sc.collector(Placement::OutOfBand).is_none());
        assert!(sc.collector(Placement::InBand).is_some());

        let err = sc.enable(&["acpower"]).unwrap_err();
        assert!(matches!(err, Error::NoCollector { .. }), "{err}");

        sc.enable(&["all"]).unwrap();
        assert_eq!(
            sc.get_enabled(),
            ["sysinfo", "turbostat", "interrupts", "ipmi-inband"]
        );
        assert!(sc.get_disabled().is_empty());
        sc.close().await;
    }

    #[tokio::test]
    async fn test_remote_sut_has_both_collectors() {
        let dir = tempfile::tempdir().unwrap();
        let mut sc = remote_session(dir.path()).await;
        let inband = sc.collector(Placement::InBand).unwrap();
        assert!(inband.connection().is_remote());
        let oob = sc.collector(Placement::OutOfBand).unwrap();
        assert!(!oob.connection().is_remote());

        sc.enable(&["acpower", "ipmi-oob"]).unwrap();
        assert!(sc.get_enabled().contains(&"acpower".to_owned()));
        sc.close().await;
    }

    #[tokio::test]
    async fn test_unknown_stat_rejected_before_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let mut sc = local_session(dir.path()).await;
        let before = sc.get_enabled();

        let err = sc.disable(&["turbostat", "cpufreq"]).unwrap_err();
        assert!(matches!(err, Error::UnknownStat { .. }), "{err}");
        assert!(err.to_string().contains("interrupts"));
        assert_eq!(sc.get_enabled(), before);

        assert!(sc.enable(&["ipmi-inband", "ipmi-oob"]).is_err());
        assert!(!sc.get_enabled().contains(&"ipmi-inband".to_owned()));
        sc.close().await;
    }

    #[tokio::test]
    async fn test_select_include_and_exclude() {
        let dir = tempfile::tempdir().unwrap();
        let mut sc = local_session(dir.path()).await;

        let err = sc.select(&["turbostat"], &["turbostat"]).unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }), "{err}");
        assert!(sc.select(&["default"], &["nope"]).is_err());
        assert_eq!(sc.get_enabled(), ["sysinfo", "turbostat", "interrupts"]);

        sc.select(&["default", "ipmi"], &["interrupts"]).unwrap();
        assert_eq!(sc.get_enabled(), ["sysinfo", "turbostat"]);
        assert_eq!(sc.pending_aggregates(), ["ipmi"]);

        assert_eq!(sc.candidates("ipmi").unwrap(), ["ipmi-oob", "ipmi-inband"]);
        let err = sc.candidates("turbostat").unwrap_err();
        assert!(matches!(err, Error::UnknownAggregate { .. }), "{err}");
        sc.close().await;
    }

    #[tokio::test]
    async fn test_aggregates_stay_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mut sc = local_session(dir.path()).await;
        sc.enable(&["ipmi"]).unwrap();
        assert_eq!(sc.pending_aggregates(), ["ipmi"]);
        assert!(!sc.get_enabled().iter().any(|n| n.starts_with("ipmi")));

        sc.disable(&["ipmi"]).unwrap();
        assert!(sc.pending_aggregates().is_empty());
        sc.close().await;
    }

    #[tokio::test]
    async fn test_intervals() {
        let dir = tempfile::tempdir().unwrap();
        let mut sc = local_session(dir.path()).await;
        assert_eq!(sc.get_max_interval(), Some(5.0));

        let err = sc.set_intervals(&[("sysinfo".to_owned(), 1.0)]).unwrap_err();
        assert!(matches!(err, Error::NotPeriodic { .. }), "{err}");
        let err = sc.set_intervals(&[("turbostat".to_owned(), -1.0)]).unwrap_err();
        assert!(matches!(err, Error::InvalidInterval { .. }), "{err}");

        sc.set_intervals(&[("turbostat".to_owned(), 2.0), ("interrupts".to_owned(), 0.5)])
            .unwrap();
        assert_eq!(sc.get_max_interval(), Some(2.0));

        sc.set_intervals(&[("ipmi".to_owned(), 30.0)]).unwrap();
        assert_eq!(sc.get_max_interval(), Some(2.0));
        sc.enable(&["ipmi-inband"]).unwrap();
        assert_eq!(sc.get_max_interval(), Some(30.0));

        sc.disable(&["all"]).unwrap();
        assert_eq!(sc.get_max_interval(), None);
        sc.close().await;
    }

    #[tokio::test]
    async fn test_properties_and_toolpath() {
        let dir = tempfile::tempdir().unwrap();
        let mut sc = remote_session(dir.path()).await;
        sc.set_prop("ipmi-oob", "bmchost", "bmc1.example.com").unwrap();
        assert_eq!(
            sc.descriptor("ipmi-oob").unwrap().props["bmchost"],
            "bmc1.example.com"
        );

        let err = sc.set_prop("ipmi-oob", "baudrate", "9600").unwrap_err();
        assert!(matches!(err, Error::UnknownProperty { .. }), "{err}");
        assert!(err.to_string().contains("bmchost"));
        assert!(sc.set_prop("turbostat", "anything", "x").is_err());

        sc.set_toolpath("turbostat", PathBuf::from("/opt/bin/turbostat"))
            .unwrap();
        assert_eq!(
            sc.descriptor("turbostat").unwrap().toolpath,
            Some(PathBuf::from("/opt/bin/turbostat"))
        );
        sc.close().await;
    }

    #[tokio::test]
    async fn test_exclusive_pair_prefers_out_of_band() {
        let dir = tempfile::tempdir().unwrap();
        let mut sc = remote_session(dir.path()).await;
        sc.enable(&["ipmi-oob", "ipmi-inband"]).unwrap();
        sc.resolve_exclusive();
        let enabled = sc.get_enabled();
        assert!(enabled.contains(&"ipmi-oob".to_owned()));
        assert!(!enabled.contains(&"ipmi-inband".to_owned()));
        sc.close().await;
    }

    #[tokio::test]
    async fn test_temporary_outdir_removed_on_close() {
        let sut = Connection::local();
        let opts = Options {
            outdir: None,
            ..options(Path::new("/unused"))
        };
        let mut sc = StatsCollect::new(sut, Catalog::builtin().unwrap(), opts)
            .await
            .unwrap();
        let outdir = sc.outdir().to_path_buf();
        assert!(outdir.is_dir());
        sc.close().await;
        assert!(!outdir.exists());
        sc.close().await;
        assert!(matches!(sc.configure().await, Err(Error::Closed { .. })));
    }

    #[tokio::test]
    async fn test_local_session_with_fake_agent() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeAgent::start(dir.path(), "");
        let outdir = dir.path().join("out");
        let opts = Options {
            local_agent_path: Some(fake.exe.clone()),
            ..options(&outdir)
        };
        let catalog = Catalog::from_json(TEST_CATALOG).unwrap();
        let mut sc = StatsCollect::new(Connection::local(), catalog, opts)
            .await
            .unwrap();

        sc.enable(&["power"]).unwrap();
        sc.configure().await.unwrap();
        assert!(sc.pending_aggregates().is_empty());
        assert_eq!(sc.get_enabled(), ["sysinfo", "cstates", "power-inband"]);

        sc.start().await.unwrap();
        assert!(sc.stop().await.unwrap().is_empty());
        sc.close().await;
        sc.close().await;

        let cmds: Vec<String> = fake
            .finished()
            .await
            .into_iter()
            .map(|r| r.cmd)
            .collect();
        let set_stats: Vec<&String> = cmds.iter().filter(|c| c.starts_with("set-stats")).collect();
        assert_eq!(
            set_stats,
            ["set-stats power-inband", "set-stats cstates,power-inband"]
        );
        assert!(!cmds.iter().any(|c| c.contains(SYSINFO)));
        assert_eq!(cmds.last().map(String::as_str), Some("exit"));

        assert!(outdir.join("sysinfo/greeting.before.raw.txt").is_file());
        assert!(outdir.join("sysinfo/greeting.after.raw.txt").is_file());
        assert!(outdir.join("logs/inband-agent-local.log.txt").is_file());
    }

    #[tokio::test]
    async fn test_discover_with_unreachable_agent() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("dead.sock");
        drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
        let opts = Options {
            local_agent_path: Some(announcing_agent(dir.path(), &socket)),
            ..options(&dir.path().join("out"))
        };
        let catalog = Catalog::from_json(TEST_CATALOG).unwrap();
        let mut sc = StatsCollect::new(Connection::local(), catalog, opts)
            .await
            .unwrap();

        assert_eq!(sc.discover().await.unwrap(), ["sysinfo"]);
        assert_eq!(sc.get_enabled(), ["sysinfo", "cstates"]);

        sc.enable(&["power"]).unwrap();
        let err = sc.resolve_aggregates().await.unwrap_err();
        assert!(matches!(err, Error::Unresolvable { .. }), "{err}");
        sc.close().await;
    }

    #[tokio::test]
    async fn test_unresolvable_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeAgent::start(dir.path(), "power-inband");
        let opts = Options {
            local_agent_path: Some(fake.exe.clone()),
            ..options(&dir.path().join("out"))
        };
        let catalog = Catalog::from_json(TEST_CATALOG).unwrap();
        let mut sc = StatsCollect::new(Connection::local(), catalog, opts)
            .await
            .unwrap();

        sc.enable(&["power"]).unwrap();
        let err = sc.configure().await.unwrap_err();
        assert!(matches!(err, Error::Unresolvable { .. }), "{err}");
        assert!(!sc.get_enabled().contains(&"power-inband".to_owned()));
        sc.close().await;
        fake.finished().await;
    }
}
