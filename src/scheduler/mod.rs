//! Job-to-workload pipeline.
//!
//! Wires the stages together: the monitor feeds a channel, the admission
//! loop dedupes and rate-limits, workers build and submit workloads, and the
//! supervisor observes them until completion. For a single job id the stages
//! are strictly serial; across job ids dispatch runs concurrently.

pub mod builder;
pub mod deduper;
pub mod limiter;
pub mod patch;
pub mod worker;

use std::sync::Arc;

use anyhow::Context as _;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buildkite::{self, CommandJob};
use crate::config::Config;
use crate::monitor;
use crate::supervisor::Supervisor;

pub use builder::{job_name, job_uuid_from_name, BuildError, JobBuilder, JOB_UUID_LABEL};
pub use deduper::Deduper;
pub use limiter::Limiter;
pub use worker::{Dispatch, Worker};

const JOB_CHANNEL_CAPACITY: usize = 100;

/// Run the controller pipeline until shutdown or a fatal error.
pub async fn run(
    kube: kube::Client,
    buildkite: buildkite::Client,
    cfg: Arc<Config>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let jobs: Api<Job> = Api::namespaced(kube.clone(), &cfg.namespace);
    let pods: Api<Pod> = Api::namespaced(kube, &cfg.namespace);

    let deduper = Deduper::new();
    let seeded = deduper
        .seed(&jobs)
        .await
        .context("failed listing existing workloads")?;
    info!(in_flight = seeded, namespace = %cfg.namespace, "seeded deduper from cluster state");

    let limiter = Limiter::new(cfg.max_in_flight);
    // workloads that survived a restart occupy slots too
    for _ in 0..seeded {
        if !limiter.try_acquire() {
            break;
        }
    }

    let worker = Worker::new(jobs.clone(), buildkite.clone(), cfg.clone());
    let supervisor = Arc::new(Supervisor::new(
        jobs,
        pods,
        buildkite.clone(),
        deduper.clone(),
        limiter.clone(),
        cfg.image_pull_backoff_grace_period,
    ));

    let (tx, mut rx) = mpsc::channel::<CommandJob>(JOB_CHANNEL_CAPACITY);

    let monitor_handle = tokio::spawn(monitor::run(
        buildkite,
        cfg.clone(),
        tx,
        shutdown.clone(),
    ));
    let watch_handle = tokio::spawn({
        let supervisor = supervisor.clone();
        let shutdown = shutdown.clone();
        async move { supervisor.watch_jobs(&shutdown).await }
    });
    let scan_handle = tokio::spawn({
        let supervisor = supervisor.clone();
        let shutdown = shutdown.clone();
        let interval = cfg.poll_interval;
        async move { supervisor.scan_image_pull_backoff(interval, &shutdown).await }
    });

    // admission loop: dedupe, then block on a slot, then dispatch
    loop {
        let job = tokio::select! {
            () = shutdown.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        if deduper.contains(&job.uuid) {
            debug!(job = %job.uuid, "job already in flight, dropping");
            continue;
        }
        if !limiter.acquire(&shutdown).await {
            break;
        }
        if !deduper.insert(job.uuid.clone()) {
            debug!(job = %job.uuid, "job became in flight while waiting, dropping");
            limiter.release();
            continue;
        }

        tokio::spawn({
            let worker = worker.clone();
            let deduper = deduper.clone();
            let limiter = limiter.clone();
            async move {
                if worker.create(&job).await == Dispatch::Failed {
                    // nothing was created, undo the admission
                    if deduper.remove(&job.uuid) {
                        limiter.release();
                    }
                }
            }
        });
    }

    shutdown.cancel();
    let monitor_result = monitor_handle.await;
    if let Err(err) = watch_handle.await {
        warn!(error = %err, "supervisor watch task ended abnormally");
    }
    if let Err(err) = scan_handle.await {
        warn!(error = %err, "supervisor scan task ended abnormally");
    }

    match monitor_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err).context("monitor failed"),
        Err(err) => Err(anyhow::anyhow!("monitor task panicked: {err}")),
    }
}
