//! Watches workloads, releases admission slots, and resolves stuck states.
//!
//! Two loops share one [`Supervisor`]. The workload watch keeps the deduper
//! current (add on create) and, exactly once per job, releases the limiter
//! slot when a workload finishes or disappears. The image-pull scan catches
//! the pathological case the cluster never resolves on its own: a pod whose
//! image cannot be pulled backs off forever, so after a grace period the job
//! is cancelled on the Buildkite side, a failure message is posted, and the
//! workload is deleted.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::TryStreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams};
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use kube::ResourceExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buildkite;
use crate::scheduler::builder::{job_name, JOB_UUID_LABEL};
use crate::scheduler::deduper::Deduper;
use crate::scheduler::limiter::Limiter;

pub struct Supervisor {
    jobs: Api<Job>,
    pods: Api<Pod>,
    buildkite: buildkite::Client,
    deduper: Deduper,
    limiter: Limiter,
    grace_period: Duration,
    notified: Mutex<HashSet<String>>,
}

impl Supervisor {
    pub fn new(
        jobs: Api<Job>,
        pods: Api<Pod>,
        buildkite: buildkite::Client,
        deduper: Deduper,
        limiter: Limiter,
        grace_period: Duration,
    ) -> Self {
        Self {
            jobs,
            pods,
            buildkite,
            deduper,
            limiter,
            grace_period,
            notified: Mutex::new(HashSet::new()),
        }
    }

    /// Watch labelled workloads until shutdown. Creation events feed the
    /// deduper; completion and deletion events release the admission slot.
    pub async fn watch_jobs(&self, shutdown: &CancellationToken) {
        let config = watcher::Config::default().labels(JOB_UUID_LABEL);
        let stream = watcher(self.jobs.clone(), config);
        futures::pin_mut!(stream);

        info!("supervisor watching workloads");
        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => break,
                event = stream.try_next() => event,
            };
            match event {
                Ok(Some(Event::Apply(job) | Event::InitApply(job))) => {
                    let Some(uuid) = job.labels().get(JOB_UUID_LABEL).cloned() else {
                        continue;
                    };
                    if job_finished(&job) {
                        self.observe_done(&uuid);
                    } else {
                        self.deduper.insert(uuid);
                    }
                }
                Ok(Some(Event::Delete(job))) => {
                    if let Some(uuid) = job.labels().get(JOB_UUID_LABEL) {
                        self.observe_done(uuid);
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) => {
                    // the watcher restarts itself, errors are transient
                    warn!(error = %err, "workload watch error");
                }
            }
        }
        info!("supervisor watch stopping");
    }

    /// Periodically look for pods stuck pulling their image.
    pub async fn scan_image_pull_backoff(
        &self,
        interval: Duration,
        shutdown: &CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.scan_once().await {
                warn!(error = %err, "image pull scan failed");
            }
        }
    }

    async fn scan_once(&self) -> Result<(), kube::Error> {
        let params = ListParams::default().labels(JOB_UUID_LABEL);
        let pods = self.pods.list(&params).await?;
        for pod in &pods.items {
            self.inspect_pod(pod).await;
        }
        Ok(())
    }

    async fn inspect_pod(&self, pod: &Pod) {
        let Some(uuid) = pod.labels().get(JOB_UUID_LABEL).cloned() else {
            return;
        };
        if self.already_notified(&uuid) {
            return;
        }
        // give transient registry errors time to clear
        if !pod_older_than(pod, self.grace_period) {
            return;
        }
        let Some(image) = stuck_image(pod) else {
            return;
        };

        warn!(job = %uuid, image = %image, "image pull backing off past the grace period, cancelling job");
        self.mark_notified(uuid.clone());

        if let Err(err) = self.buildkite.cancel_job(&uuid).await {
            warn!(job = %uuid, error = %err, "failed cancelling the job");
        }
        let message = format!("the image {image:?} for this job could not be pulled");
        if let Err(err) = self.buildkite.fail_job(&uuid, &message).await {
            warn!(job = %uuid, error = %err, "failed posting the failure message");
        }
        match self
            .jobs
            .delete(&job_name(&uuid), &DeleteParams::background())
            .await
        {
            Ok(_) => debug!(job = %uuid, "deleted stuck workload"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(err) => warn!(job = %uuid, error = %err, "failed deleting the stuck workload"),
        }
    }

    /// Exactly-once bookkeeping for a finished workload: the deduper entry
    /// gates the limiter release.
    fn observe_done(&self, uuid: &str) {
        if self.deduper.remove(uuid) {
            self.limiter.release();
            self.notified_lock().remove(uuid);
            debug!(job = %uuid, "workload finished, released in-flight slot");
        }
    }

    fn already_notified(&self, uuid: &str) -> bool {
        self.notified_lock().contains(uuid)
    }

    fn mark_notified(&self, uuid: String) {
        self.notified_lock().insert(uuid);
    }

    fn notified_lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.notified.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A workload is finished once any pod succeeded or failed, or a terminal
/// condition is set.
fn job_finished(job: &Job) -> bool {
    let Some(status) = &job.status else {
        return false;
    };
    if status.succeeded.unwrap_or(0) > 0 || status.failed.unwrap_or(0) > 0 {
        return true;
    }
    status.conditions.as_ref().is_some_and(|conditions| {
        conditions
            .iter()
            .any(|c| (c.type_ == "Complete" || c.type_ == "Failed") && c.status == "True")
    })
}

/// The image of the first init or primary container waiting on a pull
/// failure, if any.
fn stuck_image(pod: &Pod) -> Option<String> {
    let status = pod.status.as_ref()?;
    status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten())
        .find(|cs| {
            cs.state
                .as_ref()
                .and_then(|s| s.waiting.as_ref())
                .and_then(|w| w.reason.as_deref())
                .is_some_and(|reason| {
                    reason == "ImagePullBackOff" || reason == "ErrImagePull"
                })
        })
        .map(|cs| cs.image.clone())
}

fn pod_older_than(pod: &Pod, age: Duration) -> bool {
    let Some(created) = &pod.metadata.creation_timestamp else {
        return false;
    };
    (Utc::now() - created.0)
        .to_std()
        .is_ok_and(|elapsed| elapsed >= age)
}
