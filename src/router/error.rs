use std::path::PathBuf;

use crate::{agent, catalog, proc, sysinfo};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown statistic `{name}`, use one of: {known}")]
    UnknownStat { name: String, known: String },
    #[error("statistic `{stat}` has no property `{prop}`, it supports: {known}")]
    UnknownProperty {
        stat: String,
        prop: String,
        known: String,
    },
    #[error("statistic `{name}` is not collected periodically, it has no interval")]
    NotPeriodic { name: String },
    #[error("invalid interval {interval} for `{name}`, expected a positive number of seconds")]
    InvalidInterval { name: String, interval: f64 },
    #[error("`{name}` is not an aggregate statistic name")]
    UnknownAggregate { name: String },
    #[error("none of {candidates} is available on {host}, cannot collect `{name}`")]
    Unresolvable {
        name: String,
        candidates: String,
        host: String,
    },
    #[error("statistic `{name}` is both included and excluded")]
    Conflict { name: String },
    #[error("{placement} statistic `{name}` cannot be collected on {host}")]
    NoCollector {
        name: String,
        placement: String,
        host: String,
    },
    #[error("the statistics collection session on {host} is closed")]
    Closed { host: String },
    #[error("failed to create `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Catalog(#[from] catalog::Error),
    #[error(transparent)]
    Agent(#[from] agent::Error),
    #[error(transparent)]
    Proc(#[from] proc::Error),
    #[error(transparent)]
    Sysinfo(#[from] sysinfo::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
