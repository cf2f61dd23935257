//! Storage-endpoint extraction and catalogue URL building.

use std::sync::LazyLock;

use regex::Regex;

use crate::directory::SiteSpec;

#[allow(clippy::unwrap_used)]
static SE_HOST: LazyLock<Regex> = LazyLock::new(|| Regex::new(r".+://([^:/]+):*\d*/*").unwrap());

/// Extracts the host components from a comma-separated list of
/// storage-endpoint URIs (`scheme://host[:port]/…`).
///
/// Entries that do not look like a URI are skipped.
#[must_use]
pub fn se_hosts(se: &str) -> Vec<String> {
    se.split(',')
        .filter_map(|uri| {
            SE_HOST
                .captures(uri)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        })
        .collect()
}

/// Builds the catalogue URL for a site-local LFC host.
#[must_use]
pub fn lfc_url(lfc_host: &str) -> String {
    format!("lfc://{lfc_host}:/grid/atlas/")
}

/// A replica catalogue together with the storage hosts to match against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogueEndpoint {
    /// Catalogue URL to query.
    pub url: String,
    /// Storage hosts restricting the match; empty means any endpoint.
    pub storage_hosts: Vec<String>,
}

impl CatalogueEndpoint {
    /// Builds the Tier-1 catalogue endpoint for a site.
    ///
    /// Sites with an LFC host use `lfc://<host>:/grid/atlas/` restricted to
    /// the hosts extracted from the site's `se` list; sites without one use
    /// the cloud's base DDM URL with no host restriction.
    #[must_use]
    pub fn for_tier1(site: &SiteSpec) -> Self {
        match site.lfc_host.as_deref() {
            Some(lfc) if !lfc.is_empty() => Self {
                url: lfc_url(lfc),
                storage_hosts: site.se.as_deref().map(se_hosts).unwrap_or_default(),
            },
            _ => Self {
                url: site.dq2_url.clone().unwrap_or_default(),
                storage_hosts: Vec::new(),
            },
        }
    }

    /// Adds the storage hosts of another site sharing Tier-1 duty.
    pub fn add_split_site(&mut self, site: &SiteSpec) {
        if let Some(se) = site.se.as_deref() {
            self.storage_hosts.extend(se_hosts(se));
        }
    }
}
