//! Periodic pull loop against the Buildkite job queue.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buildkite::{Client, ClientError, CommandJob};
use crate::config::Config;

/// Poll the scheduled-job queue every `poll-interval` and forward each
/// descriptor, in service order, onto the channel. Duplicates across ticks
/// are expected; downstream stages drop them. Transport errors are retried
/// at the next tick. A rejected token is fatal and ends the loop with an
/// error.
pub async fn run(
    client: Client,
    cfg: Arc<Config>,
    tx: mpsc::Sender<CommandJob>,
    shutdown: CancellationToken,
) -> Result<(), ClientError> {
    let mut ticker = tokio::time::interval(cfg.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(org = %cfg.org, interval = ?cfg.poll_interval, "monitor started");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("monitor stopping");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        let jobs = match client
            .get_scheduled_jobs(&cfg.org, cfg.cluster_uuid(), &cfg.tags)
            .await
        {
            Ok(jobs) => jobs,
            Err(ClientError::Unauthorized) => {
                error!("buildkite rejected the configured token");
                return Err(ClientError::Unauthorized);
            }
            Err(err) => {
                warn!(error = %err, "failed fetching scheduled jobs, retrying next tick");
                continue;
            }
        };

        for job in jobs {
            debug!(job = %job.uuid, "observed scheduled job");
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                sent = tx.send(job) => {
                    if sent.is_err() {
                        // receiver gone, nothing left to feed
                        return Ok(());
                    }
                }
            }
        }
    }
}
