//! The statistics catalog: which statistics exist, how they are collected and how aggregate
//! names map onto them.
//!
//! A [`Catalog`] is an immutable value validated once at construction and handed to the
//! orchestrator; per-session changes (enabling, intervals, properties) are made on copies
//! of its [`StatDescriptor`]s.

mod error;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

pub use error::{Error, Result};

use crate::fsutil;

/// Name of the statistic captured by the controller itself rather than by an agent.
pub const SYSINFO: &str = "sysinfo";

/// Keyword selecting every statistic in enable/disable lists.
pub const ALL: &str = "all";

/// Keyword keeping the statistics enabled by default.
pub const DEFAULT: &str = "default";

const BUILTIN: &str = include_str!("builtin.json");

/// One statistic.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct StatDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Sampling interval in seconds, `None` for statistics that are not periodic.
    #[serde(default)]
    pub interval: Option<f64>,
    /// Tool the collector runs, resolved by the agent when relative.
    #[serde(default)]
    pub toolpath: Option<PathBuf>,
    /// A failing collector is reported instead of aborting the agent.
    #[serde(default)]
    pub fallible: bool,
    /// Collected on the SUT rather than observed from the controller.
    pub inband: bool,
    #[serde(default)]
    pub enabled: bool,
    /// The collector needs a longer minimum collection time (e.g. IPMI polling).
    #[serde(default)]
    pub slow: bool,
    /// Collector-specific properties. Only declared properties can be set.
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

impl StatDescriptor {
    pub fn is_periodic(&self) -> bool {
        self.interval.is_some()
    }
}

#[derive(Debug, serde::Deserialize)]
struct CatalogFile {
    stats: Vec<StatDescriptor>,
    #[serde(default)]
    aggregates: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    exclusive: Vec<(String, String)>,
}

/// Ordered table of statistics plus aggregate names and mutually exclusive pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct Catalog {
    stats: Vec<StatDescriptor>,
    aggregates: BTreeMap<String, Vec<String>>,
    exclusive: Vec<(String, String)>,
}

impl Catalog {
    /// Builds and validates a catalog.
    ///
    /// `aggregates` maps an aggregate name to its candidates in order of preference;
    /// `exclusive` lists `(preferred, other)` pairs of statistics measuring the same signal.
    ///
    /// # Errors
    ///
    /// - [`Error::Duplicate`] for names defined twice.
    /// - [`Error::Invalid`] for reserved or empty names, non-positive intervals, aggregates
    ///   shadowing statistics, and references to unknown statistics.
    pub fn new(
        stats: Vec<StatDescriptor>,
        aggregates: BTreeMap<String, Vec<String>>,
        exclusive: Vec<(String, String)>,
    ) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for stat in &stats {
            let reserved = stat.name == ALL || stat.name == DEFAULT;
            if reserved || stat.name.is_empty() || stat.name.contains([',', ' ']) {
                return Err(Error::Invalid {
                    name: stat.name.clone(),
                    reason: "reserved or malformed name".to_owned(),
                });
            }
            if !seen.insert(stat.name.as_str()) {
                return Err(Error::Duplicate {
                    name: stat.name.clone(),
                });
            }
            if let Some(interval) = stat.interval {
                if !(interval > 0.0 && interval.is_finite()) {
                    return Err(Error::Invalid {
                        name: stat.name.clone(),
                        reason: format!("interval must be a positive number of seconds, got {interval}"),
                    });
                }
            }
        }

        for (name, candidates) in &aggregates {
            if seen.contains(name.as_str()) || name == ALL || name == DEFAULT {
                return Err(Error::Invalid {
                    name: name.clone(),
                    reason: "aggregate name clashes with a statistic".to_owned(),
                });
            }
            if candidates.is_empty() {
                return Err(Error::Invalid {
                    name: name.clone(),
                    reason: "aggregate has no candidates".to_owned(),
                });
            }
            if let Some(unknown) = candidates.iter().find(|c| !seen.contains(c.as_str())) {
                return Err(Error::Invalid {
                    name: name.clone(),
                    reason: format!("aggregate refers to unknown statistic `{unknown}`"),
                });
            }
        }

        for (preferred, other) in &exclusive {
            for name in [preferred, other] {
                if !seen.contains(name.as_str()) {
                    return Err(Error::Invalid {
                        name: name.clone(),
                        reason: "mutually exclusive pair refers to an unknown statistic".to_owned(),
                    });
                }
            }
        }

        Ok(Self {
            stats,
            aggregates,
            exclusive,
        })
    }

    /// The catalog shipped with the crate.
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(json)?;
        Self::new(file.stats, file.aggregates, file.exclusive)
    }

    /// Loads a catalog from a JSON file on the controller.
    pub async fn load(path: &Path) -> Result<Self> {
        let json = fsutil::read_to_string(path).await?;
        Self::from_json(&json)
    }

    pub fn stats(&self) -> &[StatDescriptor] {
        &self.stats
    }

    pub fn get(&self, name: &str) -> Option<&StatDescriptor> {
        self.stats.iter().find(|s| s.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stats.iter().map(|s| s.name.as_str())
    }

    /// Candidates of an aggregate name in order of preference, `None` if `name` is not an
    /// aggregate.
    pub fn aggregate(&self, name: &str) -> Option<&[String]> {
        self.aggregates.get(name).map(Vec::as_slice)
    }

    pub fn aggregates(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.aggregates
            .iter()
            .map(|(name, candidates)| (name.as_str(), candidates.as_slice()))
    }

    /// Mutually exclusive `(preferred, other)` pairs.
    pub fn exclusive_pairs(&self) -> &[(String, String)] {
        &self.exclusive
    }

    /// Comma-separated statistic and aggregate names, for error messages.
    pub fn known_names(&self) -> String {
        self.names()
            .chain(self.aggregates.keys().map(String::as_str))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
