//! Submits built jobs to the cluster.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, PostParams};
use tracing::{debug, info, warn};

use super::builder::JobBuilder;
use crate::buildkite::{self, CommandJob};
use crate::config::Config;

const MAX_CREATE_ATTEMPTS: u32 = 3;
const INITIAL_CREATE_BACKOFF: Duration = Duration::from_millis(500);

/// What happened to an admitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A workload (possibly a failure workload) was created.
    Submitted,
    /// A workload already existed; nothing was created.
    Dropped,
    /// Nothing was created; the failure was reported to Buildkite instead.
    Failed,
}

#[derive(Clone)]
pub struct Worker {
    jobs: Api<Job>,
    buildkite: buildkite::Client,
    cfg: Arc<Config>,
}

impl Worker {
    pub fn new(jobs: Api<Job>, buildkite: buildkite::Client, cfg: Arc<Config>) -> Self {
        Self {
            jobs,
            buildkite,
            cfg,
        }
    }

    /// Build and submit a workload for `job`. Every path ends in a workload
    /// on the cluster or a visible failure on the Buildkite side; per-job
    /// problems never propagate.
    pub async fn create(&self, job: &CommandJob) -> Dispatch {
        info!(job = %job.uuid, "creating job");
        let builder = JobBuilder::new(job, &self.cfg).parse_plugins();

        let kjob = match builder.build(false) {
            Ok(kjob) => kjob,
            Err(err) => {
                warn!(job = %job.uuid, error = %err, "building the job failed, submitting a failure job");
                match builder.build_failure_job(&err.to_string()) {
                    Ok(kjob) => kjob,
                    Err(err) => {
                        return self.report_failure(job, &err.to_string()).await;
                    }
                }
            }
        };

        match self.submit(&kjob).await {
            Ok(()) => Dispatch::Submitted,
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(job = %job.uuid, "job already exists, dropping");
                Dispatch::Dropped
            }
            Err(kube::Error::Api(ae)) if ae.code == 422 => {
                warn!(job = %job.uuid, message = %ae.message, "job rejected as invalid, submitting a failure job");
                let failure = match builder.build_failure_job(&ae.message) {
                    Ok(failure) => failure,
                    Err(err) => return self.report_failure(job, &err.to_string()).await,
                };
                match self.submit(&failure).await {
                    Ok(()) => Dispatch::Submitted,
                    Err(kube::Error::Api(ae)) if ae.code == 409 => {
                        debug!(job = %job.uuid, "failure job already exists, dropping");
                        Dispatch::Dropped
                    }
                    Err(err) => self.report_failure(job, &err.to_string()).await,
                }
            }
            Err(err) => self.report_failure(job, &err.to_string()).await,
        }
    }

    /// Create the Job, retrying transient errors with exponential backoff.
    /// Structural rejections (409, 422) are returned immediately.
    async fn submit(&self, kjob: &Job) -> Result<(), kube::Error> {
        let mut backoff = INITIAL_CREATE_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.jobs.create(&PostParams::default(), kjob).await {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 409 || ae.code == 422 => {
                    return Err(kube::Error::Api(ae));
                }
                Err(err) if attempt < MAX_CREATE_ATTEMPTS => {
                    warn!(error = %err, attempt, "transient error creating job, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Last resort: no workload could be created, so make the reason visible
    /// on the Buildkite side instead.
    async fn report_failure(&self, job: &CommandJob, message: &str) -> Dispatch {
        warn!(job = %job.uuid, message, "could not create a workload for the job");
        if let Err(err) = self
            .buildkite
            .fail_job(&job.uuid, &format!("agent stack could not schedule this job: {message}"))
            .await
        {
            warn!(job = %job.uuid, error = %err, "failed reporting the job failure to buildkite");
        }
        Dispatch::Failed
    }
}
