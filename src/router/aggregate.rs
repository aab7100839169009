//! Resolution of aggregate statistic names and of mutually exclusive pairs.

use std::collections::BTreeSet;

use super::{Error, Result};

/// Answers whether one concrete statistic can be collected.
pub(crate) trait Availability {
    async fn is_available(&mut self, name: &str) -> Result<bool>;
}

/// Picks the first available candidate of `aggregate`, probing them in order of
/// preference and stopping at the first hit.
///
/// # Errors
///
/// [`Error::Unresolvable`] if no candidate is available.
pub(crate) async fn resolve<A: Availability>(
    aggregate: &str,
    candidates: &[String],
    host: &str,
    avail: &mut A,
) -> Result<String> {
    for candidate in candidates {
        if avail.is_available(candidate).await? {
            log::info!("'{aggregate}' resolved to '{candidate}'");
            return Ok(candidate.clone());
        }
        log::info!("'{candidate}' is not available, cannot use it for '{aggregate}'");
    }
    Err(Error::Unresolvable {
        name: aggregate.to_owned(),
        candidates: candidates.join(", "),
        host: host.to_owned(),
    })
}

/// Returns the `(preferred, other)` pairs enabled in full. Resolving them means disabling
/// `other`.
pub fn conflicting_pairs<'a>(
    enabled: &BTreeSet<String>,
    pairs: &'a [(String, String)],
) -> Vec<&'a (String, String)> {
    pairs
        .iter()
        .filter(|(preferred, other)| enabled.contains(preferred) && enabled.contains(other))
        .collect()
}
