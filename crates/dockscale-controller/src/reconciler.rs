//! Replica reconciliation.
//!
//! `reconcile` runs entirely under the service lock:
//!
//! ```text
//! validate ─► lock(service) ─► resolve (running, oldest first)
//!                                  │
//!            C > desired ──────────┼──────────── C < desired
//!   stop the C - desired oldest    │     start desired - C, one at a time
//!                               C == desired
//!                                 no-op
//! ```
//!
//! Scale-in stops instances but leaves them in place; they drop out of the
//! running set and are never counted as capacity again. A failed engine call
//! ends the pass and is returned as `PartialReconciliation` with exact counts of
//! what already happened. Nothing is rolled back or retried.

use crate::lifecycle::Lifecycle;
use crate::locks::ServiceLocks;
use crate::membership::MembershipResolver;
use crate::{ControlError, Progress, Result};
use serde::Serialize;
use std::cmp::Ordering;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub service: String,
    pub desired: usize,
    /// Running instances found before acting.
    pub previous: usize,
    pub started: usize,
    pub stopped: usize,
    /// Selected for scale-in but already removed by someone else.
    pub already_gone: usize,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        self.started == 0 && self.stopped == 0 && self.already_gone == 0
    }
}

#[derive(Clone)]
pub struct Reconciler {
    resolver: MembershipResolver,
    lifecycle: Lifecycle,
    locks: ServiceLocks,
    max_replicas: u32,
}

impl Reconciler {
    pub(crate) fn new(
        resolver: MembershipResolver,
        lifecycle: Lifecycle,
        locks: ServiceLocks,
        max_replicas: u32,
    ) -> Self {
        Self {
            resolver,
            lifecycle,
            locks,
            max_replicas,
        }
    }

    fn validate(&self, desired: i64) -> Result<usize> {
        if desired < 0 {
            return Err(ControlError::InvalidReplicaCount {
                requested: desired,
                reason: "replica count must not be negative".to_string(),
            });
        }
        if desired > i64::from(self.max_replicas) {
            return Err(ControlError::InvalidReplicaCount {
                requested: desired,
                reason: format!("replica count exceeds the limit of {}", self.max_replicas),
            });
        }
        Ok(desired as usize)
    }

    #[instrument(skip(self))]
    pub async fn reconcile(&self, service: &str, desired: i64) -> Result<ReconcileOutcome> {
        let def = self.resolver.lookup(service)?.clone();
        let desired = self.validate(desired)?;

        let _guard = self.locks.acquire(service).await;
        let current = self.resolver.resolve(service).await?;

        let mut outcome = ReconcileOutcome {
            service: service.to_string(),
            desired,
            previous: current.len(),
            started: 0,
            stopped: 0,
            already_gone: 0,
        };

        match current.len().cmp(&desired) {
            Ordering::Greater => {
                let excess = current.len() - desired;
                info!(%service, current = current.len(), desired, excess, "Scaling in");
                for instance in current.iter().take(excess) {
                    match self.lifecycle.stop_one(instance).await {
                        Ok(()) => outcome.stopped += 1,
                        Err(ControlError::InstanceNotFound(_)) => {
                            debug!(instance_id = %instance.id, "Instance vanished before stop");
                            outcome.already_gone += 1;
                        }
                        Err(e) => return Err(self.truncated(&outcome, e)),
                    }
                }
            }
            Ordering::Less => {
                let missing = desired - current.len();
                info!(%service, current = current.len(), desired, missing, "Scaling out");
                for _ in 0..missing {
                    match self.lifecycle.launch(&def).await {
                        Ok(_) => outcome.started += 1,
                        Err(e) => return Err(self.truncated(&outcome, e)),
                    }
                }
            }
            Ordering::Equal => {
                debug!(%service, desired, "Desired number of instances already running");
            }
        }

        info!(
            %service,
            desired,
            started = outcome.started,
            stopped = outcome.stopped,
            already_gone = outcome.already_gone,
            "Reconciled"
        );
        Ok(outcome)
    }

    fn truncated(&self, outcome: &ReconcileOutcome, cause: ControlError) -> ControlError {
        warn!(
            service = %outcome.service,
            started = outcome.started,
            stopped = outcome.stopped,
            error = %cause,
            "Reconciliation aborted"
        );
        ControlError::partial(
            Progress {
                started: outcome.started,
                stopped: outcome.stopped,
                removed: 0,
            },
            cause,
        )
    }
}
