// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

// Periodic update checks

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::download::Progress;
use crate::error::Error;
use crate::orchestrator::{Install, Orchestrator, Outcome};

/// Triggers an update cycle at a fixed interval.
///
/// The orchestrator is shared, so manual triggers may run alongside the
/// driver; overlapping cycles are refused by the orchestrator itself.
#[derive(Debug)]
pub struct Driver<I, P> {
    orchestrator: Arc<Orchestrator<I, P>>,
    interval: Duration,
}

impl<I: Install, P: Progress> Driver<I, P> {
    /// Create a driver checking every `interval`.
    pub fn new(orchestrator: Arc<Orchestrator<I, P>>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// The driven orchestrator.
    pub fn orchestrator(&self) -> &Arc<Orchestrator<I, P>> {
        &self.orchestrator
    }

    /// Run a cycle immediately, then one per interval, until `shutdown` is
    /// cancelled. Returns the number of cycles triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> u64 {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("checking for updates every {:?}", self.interval);

        let mut ticks = 0;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            ticks += 1;
            // Dropping the cycle aborts it and removes any partial download
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.tick() => {}
            }
        }

        info!("update driver stopped after {} checks", ticks);
        ticks
    }

    /// Run one cycle and log its outcome.
    pub async fn tick(&self) -> Result<Outcome, Error> {
        let result = self.orchestrator.check_and_update().await;
        match &result {
            Ok(Outcome::Committed { to, .. }) => info!("firmware {} committed", to),
            Ok(outcome) => debug!("{}", outcome),
            Err(Error::CycleAlreadyRunning) => debug!("skipping tick, a cycle is running"),
            Err(e) if e.is_transient() => info!("update check failed, retrying later: {}", e),
            Err(e) => error!("update failed: {}", e),
        }
        result
    }
}
