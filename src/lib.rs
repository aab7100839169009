//! Stats Collect: collects statistics on a system under test (SUT) while a workload runs.
//!
//! Measurement agents are started on the SUT (in-band) and, for remote SUTs, on the
//! controller (out-of-band). They are supervised over a local or `ssh` command channel and
//! driven through a small line protocol on a Unix socket, tunnelled over `ssh` when the
//! agent is remote. [`router::StatsCollect`] is the entry point of the library.
pub mod agent;
pub mod catalog;
pub mod collector;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod proc;
pub mod router;
pub mod supervisor;
pub mod sysinfo;

#[cfg(test)]
mod testutil;

use std::time::Duration;

use catalog::Catalog;
use config::Config;
use proc::{Connection, RunOptions, quote};
use router::StatsCollect;

const WORKLOAD_POLL: Duration = Duration::from_secs(1);

/// Runs one collection session configured from the environment.
///
/// The command line arguments form the workload run on the SUT while collecting; without
/// them the session lasts `STATS_COLLECT_DURATION` seconds.
///
/// # Errors
///
/// Possible errors include:
/// - Invalid `STATS_COLLECT_*` variables or an unreadable catalog.
/// - Unknown or conflicting statistic names.
/// - Agents that cannot be started, reached or configured.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = Config::from_env(std::env::args().skip(1).collect())?;
    if cfg.command.is_empty() && cfg.duration.is_none() {
        return Err("nothing to do: give a workload command or set STATS_COLLECT_DURATION".into());
    }
    let catalog = match &cfg.catalog {
        Some(path) => Catalog::load(path).await?,
        None => Catalog::builtin()?,
    };

    let sut = cfg.connection();
    let mut session = StatsCollect::new(sut.clone(), catalog, cfg.router_options()).await?;
    let result = collect(&mut session, &sut, &cfg).await;
    session.close().await;
    sut.close();

    let failed = result?;
    if !failed.is_empty() {
        log::warn!("failed collectors: {}", failed.join(", "));
    }
    println!("{}", session.outdir().display());
    Ok(())
}

async fn collect(
    session: &mut StatsCollect,
    sut: &Connection,
    cfg: &Config,
) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let include: Vec<&str> = cfg.stats.iter().map(String::as_str).collect();
    let exclude: Vec<&str> = cfg.exclude.iter().map(String::as_str).collect();
    session.select(&include, &exclude)?;
    session.set_intervals(&cfg.intervals)?;
    session.resolve_aggregates().await?;

    let available = session.discover().await?;
    let unavailable: Vec<String> = session
        .get_enabled()
        .into_iter()
        .filter(|name| !available.contains(name))
        .collect();
    if !unavailable.is_empty() {
        log::warn!(
            "not available on {}, skipping: {}",
            sut.hostname(),
            unavailable.join(", ")
        );
        let unavailable: Vec<&str> = unavailable.iter().map(String::as_str).collect();
        session.disable(&unavailable)?;
    }

    session.configure().await?;
    session.start().await?;
    let workload = run_workload(sut, cfg).await;
    let failed = session.stop().await?;
    workload?;
    Ok(failed)
}

/// Runs the workload on the SUT, relaying its output, or just waits.
async fn run_workload(sut: &Connection, cfg: &Config) -> Result<(), proc::Error> {
    if cfg.command.is_empty() {
        let duration = cfg.duration.unwrap_or_default();
        log::info!("collecting for {duration:?}");
        tokio::time::sleep(duration).await;
        return Ok(());
    }

    let cmd: Vec<String> = cfg.command.iter().map(|arg| quote(arg)).collect();
    let cmd = cmd.join(" ");
    log::info!("running workload `{}` on {}", cmd, sut.hostname());
    let mut handle = sut.run_async(&cmd, &RunOptions::no_pid()).await?;
    let code = loop {
        let output = handle.wait(Some(WORKLOAD_POLL), true).await;
        print!("{}", output.stdout);
        eprint!("{}", output.stderr);
        if let Some(code) = output.exit_code {
            break code;
        }
    };
    if code != 0 {
        log::warn!("workload exited with code {code}");
    }
    Ok(())
}
