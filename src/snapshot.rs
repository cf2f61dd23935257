//! Offline world snapshots.
//!
//! A [`WorldSnapshot`] captures everything one brokerage decision reads:
//! topology, claim rows, peer assignments, pilot counters, replica
//! placement, dataset contents, in-flight subscriptions, and the caller
//! identity. The offline collaborators replay it in memory, which powers
//! both the dry-run CLI and the end-to-end tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::broker::task::{CloudTask, TaskSpec};
use crate::broker::{Collaborators, TaskAssigner};
use crate::config::BrokerConfig;
use crate::directory::{CloudSpec, InMemorySiteDirectory, SiteSpec};
use crate::error::BrokerError;
use crate::external::{
    DatasetFile, DdmClient, IdentityProvider, PilotCounts, ReplicaCatalogue, SubscribeOutcome,
    SubscriptionInfo, SubscriptionOptions, TaskStore,
};

/// An existing subscription recorded in the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    /// Destination endpoint.
    pub endpoint: String,
    /// Canonical owner identity.
    pub owner: String,
}

/// Serialisable capture of the world one decision runs against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldSnapshot {
    /// Cloud topology.
    pub clouds: Vec<CloudSpec>,
    /// Site topology.
    pub sites: Vec<SiteSpec>,
    /// Claim rows, keyed by the rows' own task ids.
    #[serde(default)]
    pub claims: Vec<CloudTask>,
    /// Peer task assignments (task id → cloud).
    #[serde(default)]
    pub peer_clouds: HashMap<u64, String>,
    /// Pilot counters per site.
    #[serde(default)]
    pub pilot_counts: HashMap<String, PilotCounts>,
    /// Replica placement: storage host (or catalogue URL) → lfns present.
    #[serde(default)]
    pub replicas: HashMap<String, Vec<String>>,
    /// Dataset contents for subscription sizing.
    #[serde(default)]
    pub dataset_files: HashMap<String, Vec<DatasetFile>>,
    /// In-flight subscriptions per dataset.
    #[serde(default)]
    pub subscriptions: HashMap<String, Vec<SubscriptionRecord>>,
    /// Caller certificate subject.
    #[serde(default)]
    pub caller_dn: String,
    /// The task to broker.
    pub task: TaskSpec,
    /// Raw metadata payload for the decision.
    pub metadata: String,
}

impl WorldSnapshot {
    /// Loads a snapshot from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Snapshot`] when the file cannot be read or
    /// decoded.
    pub fn load(path: &Path) -> Result<Self, BrokerError> {
        let raw = std::fs::read_to_string(path).map_err(|err| BrokerError::Snapshot {
            message: format!("{}: {err}", path.display()),
        })?;
        serde_json::from_str(&raw).map_err(|err| BrokerError::Snapshot {
            message: format!("{}: {err}", path.display()),
        })
    }

    /// Builds the offline collaborator set over this snapshot.
    ///
    /// The returned handles share the snapshot's mutable claim and
    /// subscription state, so a committed decision is observable through
    /// [`OfflineState`].
    #[must_use]
    pub fn collaborators(&self) -> (Collaborators, OfflineState) {
        let directory = Arc::new(InMemorySiteDirectory::new(
            self.clouds.clone(),
            self.sites.clone(),
        ));
        let store = Arc::new(OfflineStore {
            claims: Mutex::new(
                self.claims
                    .iter()
                    .map(|row| (row.task_id, row.clone()))
                    .collect(),
            ),
            peer_clouds: self.peer_clouds.clone(),
            pilot_counts: self.pilot_counts.clone(),
        });
        let catalogue = Arc::new(OfflineCatalogue {
            replicas: self.replicas.clone(),
            refreshes: Mutex::new(Vec::new()),
        });
        let ddm = Arc::new(OfflineDdm {
            subscriptions: Mutex::new(self.subscriptions.clone()),
            dataset_files: self.dataset_files.clone(),
            owner: self.caller_dn.clone(),
            registered: Mutex::new(Vec::new()),
        });
        let identity = Arc::new(OfflineIdentity {
            dn: self.caller_dn.clone(),
        });
        let state = OfflineState {
            store: Arc::clone(&store),
            catalogue: Arc::clone(&catalogue),
            ddm: Arc::clone(&ddm),
        };
        (
            Collaborators {
                directory,
                store,
                catalogue,
                ddm,
                identity,
            },
            state,
        )
    }

    /// Builds a ready-to-run assigner over this snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] when the configuration fails validation.
    pub fn assigner(&self, seed: u64) -> Result<(TaskAssigner, OfflineState), BrokerError> {
        use rand::SeedableRng;
        let (collab, state) = self.collaborators();
        let config = BrokerConfig::builder()
            .locator_backoff(std::time::Duration::from_millis(1))
            .ddm_backoff(std::time::Duration::from_millis(1))
            .throttle(std::time::Duration::from_millis(1))
            .build()?;
        let assigner = TaskAssigner::new(
            collab,
            config,
            self.task.clone(),
            rand::rngs::StdRng::seed_from_u64(seed),
        );
        Ok((assigner, state))
    }
}

/// Handles onto the mutable offline state for post-decision inspection.
#[derive(Clone)]
pub struct OfflineState {
    store: Arc<OfflineStore>,
    catalogue: Arc<OfflineCatalogue>,
    ddm: Arc<OfflineDdm>,
}

impl OfflineState {
    /// The claim row for a task, as stored now.
    #[must_use]
    pub fn claim(&self, task_id: u64) -> Option<CloudTask> {
        self.store
            .claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&task_id)
            .cloned()
    }

    /// Subscriptions registered during the decision, in order.
    #[must_use]
    pub fn registered_subscriptions(&self) -> Vec<(String, String)> {
        self.ddm
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replica refreshes fired during the decision, in order.
    #[must_use]
    pub fn refreshes(&self) -> Vec<(String, Vec<String>)> {
        self.catalogue
            .refreshes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for OfflineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineState").finish_non_exhaustive()
    }
}

/// Claim table and pilot counters over snapshot data.
struct OfflineStore {
    claims: Mutex<HashMap<u64, CloudTask>>,
    peer_clouds: HashMap<u64, String>,
    pilot_counts: HashMap<String, PilotCounts>,
}

#[async_trait]
impl TaskStore for OfflineStore {
    async fn get_cloud_task(&self, task_id: u64) -> Result<Option<CloudTask>, BrokerError> {
        Ok(self
            .claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&task_id)
            .cloned())
    }

    async fn set_cloud_task(&self, row: CloudTask) -> Result<CloudTask, BrokerError> {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(row.task_id, row.clone());
        Ok(row)
    }

    async fn see_cloud_task(&self, task_id: u64) -> Result<String, BrokerError> {
        Ok(self.peer_clouds.get(&task_id).cloned().unwrap_or_default())
    }

    async fn current_site_data(&self) -> Result<HashMap<String, PilotCounts>, BrokerError> {
        Ok(self.pilot_counts.clone())
    }
}

/// Replica catalogue over snapshot placement data.
struct OfflineCatalogue {
    replicas: HashMap<String, Vec<String>>,
    refreshes: Mutex<Vec<(String, Vec<String>)>>,
}

#[async_trait]
impl ReplicaCatalogue for OfflineCatalogue {
    async fn files_present(
        &self,
        lfns: &[String],
        _guids: &[String],
        catalogue_url: &str,
        storage_hosts: &[String],
    ) -> Result<Vec<String>, BrokerError> {
        let keys: Vec<&str> = if storage_hosts.is_empty() {
            vec![catalogue_url]
        } else {
            storage_hosts.iter().map(String::as_str).collect()
        };
        Ok(lfns
            .iter()
            .filter(|lfn| {
                keys.iter().any(|key| {
                    self.replicas
                        .get(*key)
                        .is_some_and(|present| present.contains(lfn))
                })
            })
            .cloned()
            .collect())
    }

    async fn refresh_replicas(&self, dataset: &str, sites: &[String]) -> Result<(), BrokerError> {
        self.refreshes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((dataset.to_string(), sites.to_vec()));
        Ok(())
    }
}

/// Subscription and dataset listings over snapshot data.
struct OfflineDdm {
    subscriptions: Mutex<HashMap<String, Vec<SubscriptionRecord>>>,
    dataset_files: HashMap<String, Vec<DatasetFile>>,
    owner: String,
    registered: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl DdmClient for OfflineDdm {
    async fn list_subscriptions(&self, dataset: &str) -> Result<Vec<String>, BrokerError> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(dataset)
            .map(|records| records.iter().map(|r| r.endpoint.clone()).collect())
            .unwrap_or_default())
    }

    async fn list_subscription_info(
        &self,
        dataset: &str,
        endpoint: &str,
    ) -> Result<SubscriptionInfo, BrokerError> {
        let owners = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(dataset)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.endpoint == endpoint)
                    .map(|r| r.owner.clone())
                    .collect()
            })
            .unwrap_or_default();
        Ok(SubscriptionInfo::Owners(owners))
    }

    async fn list_files_in_dataset(&self, dataset: &str) -> Result<Vec<DatasetFile>, BrokerError> {
        Ok(self.dataset_files.get(dataset).cloned().unwrap_or_default())
    }

    async fn register_subscription(
        &self,
        dataset: &str,
        endpoint: &str,
        _options: &SubscriptionOptions,
    ) -> Result<SubscribeOutcome, BrokerError> {
        let mut subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let records = subs.entry(dataset.to_string()).or_default();
        if records.iter().any(|r| r.endpoint == endpoint) {
            return Ok(SubscribeOutcome::AlreadyExists);
        }
        records.push(SubscriptionRecord {
            endpoint: endpoint.to_string(),
            owner: self.owner.clone(),
        });
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((dataset.to_string(), endpoint.to_string()));
        Ok(SubscribeOutcome::Registered)
    }
}

/// Fixed identity from the snapshot.
struct OfflineIdentity {
    dn: String,
}

#[async_trait]
impl IdentityProvider for OfflineIdentity {
    async fn subject_dn(&self) -> Result<String, BrokerError> {
        if self.dn.is_empty() {
            return Err(BrokerError::External {
                call: "subject_dn",
                message: "no caller identity in snapshot".to_string(),
            });
        }
        Ok(self.dn.clone())
    }

    async fn parse_dn(&self, dn: &str) -> Result<String, BrokerError> {
        Ok(dn.to_string())
    }
}
