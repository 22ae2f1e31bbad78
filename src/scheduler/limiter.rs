//! Bounded-concurrency admission gate.
//!
//! A counting semaphore sized `max-in-flight` (0 = unbounded). Unlike a
//! scoped permit, a slot here is held for the whole life of a workload: it
//! is taken when a job is admitted and given back only when the supervisor
//! observes the workload finish or disappear, which happens on a different
//! task. Acquired permits are therefore forgotten and returned explicitly.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Limiter {
    semaphore: Option<Arc<Semaphore>>,
    max_in_flight: usize,
}

impl Limiter {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            semaphore: (max_in_flight > 0).then(|| Arc::new(Semaphore::new(max_in_flight))),
            max_in_flight,
        }
    }

    /// Block until a slot is free. Returns `false` if shutdown was requested
    /// while waiting; no permit is held in that case.
    pub async fn acquire(&self, shutdown: &CancellationToken) -> bool {
        let Some(semaphore) = &self.semaphore else {
            return true;
        };
        tokio::select! {
            permit = semaphore.acquire() => match permit {
                Ok(permit) => {
                    permit.forget();
                    true
                }
                Err(_) => false,
            },
            () = shutdown.cancelled() => false,
        }
    }

    /// Take a slot only if one is immediately free. Used to account for
    /// workloads discovered at startup.
    pub fn try_acquire(&self) -> bool {
        let Some(semaphore) = &self.semaphore else {
            return true;
        };
        match semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Return a slot. Called when a workload is observed complete.
    pub fn release(&self) {
        if let Some(semaphore) = &self.semaphore {
            if semaphore.available_permits() < self.max_in_flight {
                semaphore.add_permits(1);
            }
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.semaphore.is_some()
    }

    pub fn available(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }
}
