//! Broker configuration with builder pattern and environment variable support.
//!
//! Configuration is resolved in order: explicit values → environment variables
//! → defaults. The defaults are the normative policy constants of the
//! brokerage contract and must not drift silently.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::BrokerError;

/// RW threshold below which a candidate cloud is promoted to infinite weight.
pub const RW_LOW: f64 = 400.0;
/// RW threshold (scaled by MC share) above which a cloud takes no new tasks.
pub const RW_HIGH: f64 = 8_000.0;
/// RW normalisation used when ranking subscription destinations.
pub const RW_SUB: f64 = 600.0;
/// Minimum free Tier-1 storage (GB) required to accept a task.
pub const SPACE_LOW_GB: f64 = 1_024.0;
/// Storage consumed per committed RW unit (GB).
pub const SPACE_PER_RW: f64 = 0.2;
/// Files per replica-catalogue probe batch.
pub const BATCH_SIZE: usize = 200;
/// Maximum probed batches per decision; beyond this a random subset is sampled.
pub const MAX_BATCHES: usize = 100;
/// Priority at which evgen tasks require a fast-track cloud.
pub const EVGEN_FASTTRACK_PRIO: i64 = 700;
/// Priority at which simul tasks require a fast-track cloud.
pub const SIMUL_FASTTRACK_PRIO: i64 = 800;

/// Default retry attempts for replica-catalogue probes.
const DEFAULT_LOCATOR_RETRIES: u32 = 3;
/// Default backoff between replica-catalogue retries.
const DEFAULT_LOCATOR_BACKOFF_SECS: u64 = 60;
/// Default retry attempts for DDM calls.
const DEFAULT_DDM_RETRIES: u32 = 3;
/// Default backoff between DDM retries.
const DEFAULT_DDM_BACKOFF_SECS: u64 = 30;
/// Default hard deadline for a replica refresh.
const DEFAULT_REFRESH_DEADLINE_SECS: u64 = 300;
/// Default throttle after issuing a subscription or DDM listing.
const DEFAULT_THROTTLE_SECS: u64 = 1;

/// Configuration for the task assigner.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// RW threshold for the infinite-weight promotion, scaled by MC share.
    pub rw_low: f64,
    /// RW ceiling for candidate clouds, scaled by MC share.
    pub rw_high: f64,
    /// RW normalisation for subscription destination ranking.
    pub rw_sub: f64,
    /// Minimum available Tier-1 space in GB.
    pub space_low_gb: f64,
    /// GB of Tier-1 storage consumed per RW unit.
    pub space_per_rw: f64,
    /// Files per catalogue probe batch.
    pub batch_size: usize,
    /// Maximum probed batches; excess batches are randomly sampled down.
    pub max_batches: usize,
    /// Fast-track priority cutoff for evgen tasks.
    pub evgen_fasttrack_prio: i64,
    /// Fast-track priority cutoff for simul tasks.
    pub simul_fasttrack_prio: i64,
    /// Task types weighted by MC share instead of pilot/RW ratio.
    pub mc_share_task_types: Vec<String>,
    /// Task types eligible for fallback dataset subscriptions.
    pub subscription_task_types: Vec<String>,
    /// Retry attempts per catalogue probe batch.
    pub locator_retries: u32,
    /// Backoff between catalogue probe retries.
    pub locator_backoff: Duration,
    /// Retry attempts per DDM call.
    pub ddm_retries: u32,
    /// Backoff between DDM retries.
    pub ddm_backoff: Duration,
    /// Hard deadline for a fire-and-forget replica refresh.
    pub refresh_deadline: Duration,
    /// Throttle after each DDM listing or registered subscription.
    pub throttle: Duration,
    /// Additional sites whose storage endpoints count as Tier-1 for a cloud.
    ///
    /// Covers split Tier-1 deployments where a second site shares custodial
    /// duty with the nominal Tier-1.
    pub extra_tier1_endpoint_sites: HashMap<String, Vec<String>>,
}

impl BrokerConfig {
    /// Creates a new builder for `BrokerConfig`.
    #[must_use]
    pub fn builder() -> BrokerConfigBuilder {
        BrokerConfigBuilder::default()
    }

    /// Creates configuration from environment variables with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidConfig`] if a resolved value fails
    /// validation.
    pub fn from_env() -> Result<Self, BrokerError> {
        Self::builder().from_env().build()
    }

    /// Returns `true` when `task_type` is weighted by MC share.
    #[must_use]
    pub fn uses_mc_share(&self, task_type: &str) -> bool {
        self.mc_share_task_types.iter().any(|t| t == task_type)
    }

    /// Returns `true` when `task_type` may trigger fallback subscriptions.
    #[must_use]
    pub fn subscribes(&self, task_type: &str) -> bool {
        self.subscription_task_types.iter().any(|t| t == task_type)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            rw_low: RW_LOW,
            rw_high: RW_HIGH,
            rw_sub: RW_SUB,
            space_low_gb: SPACE_LOW_GB,
            space_per_rw: SPACE_PER_RW,
            batch_size: BATCH_SIZE,
            max_batches: MAX_BATCHES,
            evgen_fasttrack_prio: EVGEN_FASTTRACK_PRIO,
            simul_fasttrack_prio: SIMUL_FASTTRACK_PRIO,
            mc_share_task_types: vec!["evgen".to_string()],
            subscription_task_types: vec!["simul".to_string()],
            locator_retries: DEFAULT_LOCATOR_RETRIES,
            locator_backoff: Duration::from_secs(DEFAULT_LOCATOR_BACKOFF_SECS),
            ddm_retries: DEFAULT_DDM_RETRIES,
            ddm_backoff: Duration::from_secs(DEFAULT_DDM_BACKOFF_SECS),
            refresh_deadline: Duration::from_secs(DEFAULT_REFRESH_DEADLINE_SECS),
            throttle: Duration::from_secs(DEFAULT_THROTTLE_SECS),
            extra_tier1_endpoint_sites: HashMap::from([(
                "NL".to_string(),
                vec!["NIKHEF-ELPROD".to_string()],
            )]),
        }
    }
}

/// Builder for [`BrokerConfig`].
#[derive(Debug, Clone, Default)]
pub struct BrokerConfigBuilder {
    batch_size: Option<usize>,
    max_batches: Option<usize>,
    locator_retries: Option<u32>,
    locator_backoff: Option<Duration>,
    ddm_retries: Option<u32>,
    ddm_backoff: Option<Duration>,
    refresh_deadline: Option<Duration>,
    throttle: Option<Duration>,
    mc_share_task_types: Option<Vec<String>>,
    subscription_task_types: Option<Vec<String>>,
    extra_tier1_endpoint_sites: Option<HashMap<String, Vec<String>>>,
}

impl BrokerConfigBuilder {
    /// Populates unset fields from environment variables.
    #[must_use]
    pub fn from_env(mut self) -> Self {
        if self.batch_size.is_none() {
            self.batch_size = std::env::var("TASKBROKER_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.max_batches.is_none() {
            self.max_batches = std::env::var("TASKBROKER_MAX_BATCHES")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.locator_retries.is_none() {
            self.locator_retries = std::env::var("TASKBROKER_LOCATOR_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.ddm_retries.is_none() {
            self.ddm_retries = std::env::var("TASKBROKER_DDM_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        self
    }

    /// Sets the probe batch size.
    #[must_use]
    pub const fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = Some(n);
        self
    }

    /// Sets the maximum number of probed batches.
    #[must_use]
    pub const fn max_batches(mut self, n: usize) -> Self {
        self.max_batches = Some(n);
        self
    }

    /// Sets the catalogue probe retry count.
    #[must_use]
    pub const fn locator_retries(mut self, n: u32) -> Self {
        self.locator_retries = Some(n);
        self
    }

    /// Sets the backoff between catalogue probe retries.
    #[must_use]
    pub const fn locator_backoff(mut self, d: Duration) -> Self {
        self.locator_backoff = Some(d);
        self
    }

    /// Sets the DDM retry count.
    #[must_use]
    pub const fn ddm_retries(mut self, n: u32) -> Self {
        self.ddm_retries = Some(n);
        self
    }

    /// Sets the backoff between DDM retries.
    #[must_use]
    pub const fn ddm_backoff(mut self, d: Duration) -> Self {
        self.ddm_backoff = Some(d);
        self
    }

    /// Sets the replica refresh deadline.
    #[must_use]
    pub const fn refresh_deadline(mut self, d: Duration) -> Self {
        self.refresh_deadline = Some(d);
        self
    }

    /// Sets the post-call throttle.
    #[must_use]
    pub const fn throttle(mut self, d: Duration) -> Self {
        self.throttle = Some(d);
        self
    }

    /// Sets the task types weighted by MC share.
    #[must_use]
    pub fn mc_share_task_types(mut self, types: Vec<String>) -> Self {
        self.mc_share_task_types = Some(types);
        self
    }

    /// Sets the task types eligible for fallback subscriptions.
    #[must_use]
    pub fn subscription_task_types(mut self, types: Vec<String>) -> Self {
        self.subscription_task_types = Some(types);
        self
    }

    /// Sets the split Tier-1 endpoint map.
    #[must_use]
    pub fn extra_tier1_endpoint_sites(mut self, map: HashMap<String, Vec<String>>) -> Self {
        self.extra_tier1_endpoint_sites = Some(map);
        self
    }

    /// Builds the [`BrokerConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidConfig`] when `batch_size`,
    /// `max_batches`, or a retry count is zero.
    pub fn build(self) -> Result<BrokerConfig, BrokerError> {
        let mut config = BrokerConfig::default();
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.max_batches {
            config.max_batches = v;
        }
        if let Some(v) = self.locator_retries {
            config.locator_retries = v;
        }
        if let Some(v) = self.locator_backoff {
            config.locator_backoff = v;
        }
        if let Some(v) = self.ddm_retries {
            config.ddm_retries = v;
        }
        if let Some(v) = self.ddm_backoff {
            config.ddm_backoff = v;
        }
        if let Some(v) = self.refresh_deadline {
            config.refresh_deadline = v;
        }
        if let Some(v) = self.throttle {
            config.throttle = v;
        }
        if let Some(v) = self.mc_share_task_types {
            config.mc_share_task_types = v;
        }
        if let Some(v) = self.subscription_task_types {
            config.subscription_task_types = v;
        }
        if let Some(v) = self.extra_tier1_endpoint_sites {
            config.extra_tier1_endpoint_sites = v;
        }
        if config.batch_size == 0 {
            return Err(BrokerError::InvalidConfig {
                message: "batch_size must be positive".to_string(),
            });
        }
        if config.max_batches == 0 {
            return Err(BrokerError::InvalidConfig {
                message: "max_batches must be positive".to_string(),
            });
        }
        if config.locator_retries == 0 || config.ddm_retries == 0 {
            return Err(BrokerError::InvalidConfig {
                message: "retry counts must be positive".to_string(),
            });
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_policy_constants() {
        let config = BrokerConfig::default();
        assert!((config.rw_low - 400.0).abs() < f64::EPSILON);
        assert!((config.rw_high - 8_000.0).abs() < f64::EPSILON);
        assert!((config.rw_sub - 600.0).abs() < f64::EPSILON);
        assert!((config.space_low_gb - 1_024.0).abs() < f64::EPSILON);
        assert!((config.space_per_rw - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.max_batches, 100);
        assert_eq!(config.evgen_fasttrack_prio, 700);
        assert_eq!(config.simul_fasttrack_prio, 800);
    }

    #[test]
    fn test_default_split_tier1() {
        let config = BrokerConfig::default();
        let extra = config
            .extra_tier1_endpoint_sites
            .get("NL")
            .map(Vec::as_slice);
        assert_eq!(extra, Some(&["NIKHEF-ELPROD".to_string()][..]));
    }

    #[test]
    fn test_builder_overrides() {
        let config = BrokerConfig::builder()
            .batch_size(50)
            .max_batches(10)
            .locator_backoff(Duration::from_millis(5))
            .build()
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_batches, 10);
        assert_eq!(config.locator_backoff, Duration::from_millis(5));
        assert_eq!(config.locator_retries, 3);
    }

    #[test]
    fn test_builder_rejects_zero_batch() {
        let result = BrokerConfig::builder().batch_size(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_task_type_policy_sets() {
        let config = BrokerConfig::default();
        assert!(config.uses_mc_share("evgen"));
        assert!(!config.uses_mc_share("simul"));
        assert!(config.subscribes("simul"));
        assert!(!config.subscribes("evgen"));
    }
}
