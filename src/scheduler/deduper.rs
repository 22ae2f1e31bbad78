//! Duplicate-job suppression.
//!
//! The queue query keeps returning a job until something picks it up, so the
//! same descriptor arrives on every poll tick. The authoritative record of
//! what is already running lives in the cluster; this set is a cache of it,
//! seeded from a labelled job list at startup and kept current by the
//! supervisor's workload watch.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, ListParams};
use kube::ResourceExt;
use tracing::debug;

use super::builder::JOB_UUID_LABEL;

#[derive(Debug, Clone, Default)]
pub struct Deduper {
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Deduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate the set from the jobs already present in the namespace.
    /// Returns how many were found.
    pub async fn seed(&self, jobs: &Api<Job>) -> Result<usize, kube::Error> {
        let params = ListParams::default().labels(JOB_UUID_LABEL);
        let list = jobs.list(&params).await?;
        let mut set = self.lock();
        for job in &list.items {
            if let Some(uuid) = job.labels().get(JOB_UUID_LABEL) {
                set.insert(uuid.clone());
            }
        }
        Ok(set.len())
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.lock().contains(uuid)
    }

    /// Returns `false` when the uuid was already in flight.
    pub fn insert(&self, uuid: String) -> bool {
        let inserted = self.lock().insert(uuid.clone());
        if inserted {
            debug!(job = %uuid, "job marked in flight");
        }
        inserted
    }

    /// Returns `true` when the uuid was present, i.e. the caller observed
    /// the end of a job this controller was tracking.
    pub fn remove(&self, uuid: &str) -> bool {
        let removed = self.lock().remove(uuid);
        if removed {
            debug!(job = %uuid, "job no longer in flight");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
