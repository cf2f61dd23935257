//! Site and cloud directory.
//!
//! A read-only snapshot of the grid topology: clouds (regional groupings
//! anchored by a Tier-1), their member sites, policy flags, and storage
//! endpoints. The snapshot must stay consistent for the duration of one
//! brokerage decision; implementations may refresh between decisions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Status string treated as schedulable.
const STATUS_ONLINE: &str = "online";

/// A regional cloud: a Tier-1 data custodian plus its Tier-2 satellites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSpec {
    /// Cloud identifier (e.g. `"US"`).
    pub name: String,
    /// Operational status; only `"online"` clouds take new tasks.
    pub status: String,
    /// Whether validation tasks may run here.
    #[serde(default)]
    pub validation: bool,
    /// Whether fast-track (high-priority) tasks may run here.
    #[serde(default)]
    pub fasttrack: bool,
    /// Proportional policy weight for Monte-Carlo generation tasks.
    pub mcshare: f64,
    /// Name of the Tier-1 site.
    pub source: String,
    /// Member site names, Tier-1 included.
    pub sites: Vec<String>,
    /// Tier-1 storage-endpoint identifiers.
    #[serde(default)]
    pub tier1_se: Vec<String>,
}

impl CloudSpec {
    /// Returns `true` when the cloud accepts new tasks.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.status == STATUS_ONLINE
    }
}

/// A compute/storage site within a cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteSpec {
    /// Site identifier.
    pub name: String,
    /// Operational status.
    pub status: String,
    /// Maximum per-job input size in GB; 0 means unbounded.
    #[serde(default)]
    pub max_input_size_gb: u32,
    /// Free storage at this site in GB.
    #[serde(default)]
    pub space_gb: f64,
    /// Replica-catalogue host, when the site runs its own LFC.
    #[serde(default)]
    pub lfc_host: Option<String>,
    /// Comma-separated storage-endpoint URIs (`scheme://host[:port]/…`).
    #[serde(default)]
    pub se: Option<String>,
    /// DDM endpoint identifier for subscriptions.
    pub ddm: String,
    /// Base DDM catalogue URL, used when no LFC host is configured.
    #[serde(default)]
    pub dq2_url: Option<String>,
}

impl SiteSpec {
    /// Returns `true` when the site accepts work.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.status == STATUS_ONLINE
    }

    /// Returns `true` when the site can stage `disk_count_gb` of input per
    /// job. An unset limit satisfies any requirement.
    #[must_use]
    pub const fn fits_input(&self, disk_count_gb: u32) -> bool {
        self.max_input_size_gb == 0 || self.max_input_size_gb >= disk_count_gb
    }
}

/// Read-only topology lookup.
///
/// Results are a consistent snapshot for one brokerage decision; nothing
/// here mutates mid-decision.
pub trait SiteDirectory: Send + Sync {
    /// Names of all known clouds.
    fn cloud_list(&self) -> Vec<String>;

    /// Looks up a cloud by name.
    fn cloud(&self, name: &str) -> Option<&CloudSpec>;

    /// Looks up a site by name.
    fn site(&self, name: &str) -> Option<&SiteSpec>;
}

/// In-memory [`SiteDirectory`] built from spec lists.
#[derive(Debug, Clone, Default)]
pub struct InMemorySiteDirectory {
    clouds: HashMap<String, CloudSpec>,
    sites: HashMap<String, SiteSpec>,
    cloud_order: Vec<String>,
}

impl InMemorySiteDirectory {
    /// Builds a directory from cloud and site specs.
    ///
    /// Cloud iteration order follows the input order, which keeps decisions
    /// reproducible under a fixed random seed.
    #[must_use]
    pub fn new(clouds: Vec<CloudSpec>, sites: Vec<SiteSpec>) -> Self {
        let cloud_order = clouds.iter().map(|c| c.name.clone()).collect();
        Self {
            clouds: clouds.into_iter().map(|c| (c.name.clone(), c)).collect(),
            sites: sites.into_iter().map(|s| (s.name.clone(), s)).collect(),
            cloud_order,
        }
    }
}

impl SiteDirectory for InMemorySiteDirectory {
    fn cloud_list(&self) -> Vec<String> {
        self.cloud_order.clone()
    }

    fn cloud(&self, name: &str) -> Option<&CloudSpec> {
        self.clouds.get(name)
    }

    fn site(&self, name: &str) -> Option<&SiteSpec> {
        self.sites.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud(name: &str) -> CloudSpec {
        CloudSpec {
            name: name.to_string(),
            status: "online".to_string(),
            validation: false,
            fasttrack: false,
            mcshare: 1.0,
            source: format!("{name}-T1"),
            sites: vec![format!("{name}-T1")],
            tier1_se: vec![format!("{name}_DATADISK")],
        }
    }

    fn site(name: &str) -> SiteSpec {
        SiteSpec {
            name: name.to_string(),
            status: "online".to_string(),
            max_input_size_gb: 0,
            space_gb: 5_000.0,
            lfc_host: None,
            se: None,
            ddm: format!("{name}_DATADISK"),
            dq2_url: None,
        }
    }

    #[test]
    fn test_lookup_and_order() {
        let dir = InMemorySiteDirectory::new(
            vec![cloud("US"), cloud("DE")],
            vec![site("US-T1"), site("DE-T1")],
        );
        assert_eq!(dir.cloud_list(), vec!["US", "DE"]);
        assert!(dir.cloud("US").is_some());
        assert!(dir.cloud("FR").is_none());
        assert_eq!(dir.site("DE-T1").map(|s| s.ddm.as_str()), Some("DE-T1_DATADISK"));
    }

    #[test]
    fn test_fits_input_unbounded() {
        let mut s = site("X");
        assert!(s.fits_input(10_000));
        s.max_input_size_gb = 200;
        assert!(s.fits_input(200));
        assert!(!s.fits_input(201));
    }

    #[test]
    fn test_is_online() {
        let mut c = cloud("US");
        assert!(c.is_online());
        c.status = "brokeroff".to_string();
        assert!(!c.is_online());
    }
}
