//! Caller identity seam and distinguished-name canonicalisation.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::error::BrokerError;

#[allow(clippy::unwrap_used)]
static PROXY_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(/CN=proxy)+$").unwrap());

#[allow(clippy::unwrap_used)]
static LIMITED_PROXY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/CN=limited proxy").unwrap());

/// Strips proxy decorations from a distinguished name.
///
/// Removes the trailing run of `/CN=proxy` components first, then every
/// `/CN=limited proxy` component, in that order: a limited proxy delegated
/// from a regular proxy ends in `/CN=limited proxy`, so the trailing-proxy
/// pass is a no-op there and the interior `/CN=proxy` survives. Subscription
/// owner matching requires every canonicaliser to agree on exactly this
/// output.
#[must_use]
pub fn strip_proxy_suffixes(dn: &str) -> String {
    let dn = PROXY_SUFFIX.replace(dn, "");
    LIMITED_PROXY.replace_all(&dn, "").into_owned()
}

/// Access to the caller's grid identity.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Returns the caller's certificate subject DN.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::External`] when no proxy identity is
    /// available.
    async fn subject_dn(&self) -> Result<String, BrokerError>;

    /// Canonicalises a DN into the form the data management layer records
    /// as subscription owner.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::External`] when the DN cannot be parsed.
    async fn parse_dn(&self, dn: &str) -> Result<String, BrokerError>;
}
