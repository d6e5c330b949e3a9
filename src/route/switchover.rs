use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, warn};

use crate::condition::Condition;
use crate::error::{GatewayError, Result};

use super::backend::Backend;
use super::{Route, WeakRoute};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SwitchoverStatus {
    Registered,
    Running,
    Stopped,
    Failed,
    Success,
}

/// Progressive reweighting from one backend of a route to another.
///
/// On a fixed cadence the controller evaluates its conditions against the
/// new backend's trailing window; when every condition has held for its
/// activation duration the weights shift by `weight_change`. Condition
/// misses count toward `allowed_failures` (0 disables the cap), and a failed
/// switchover optionally restores the starting weights.
#[derive(Debug)]
pub struct Switchover {
    pub id: u64,
    pub from: Arc<Backend>,
    pub to: Arc<Backend>,
    route: WeakRoute,
    conditions: StdMutex<Vec<Condition>>,
    pub weight_change: u8,
    pub timeout: Duration,
    pub allowed_failures: u32,
    pub rollback: bool,
    failure_counter: AtomicU32,
    status: StdMutex<SwitchoverStatus>,
    saved_from_weight: AtomicU8,
    saved_to_weight: AtomicU8,
    cancel: watch::Sender<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwitchoverSummary {
    pub id: u64,
    pub from: String,
    pub to: String,
    pub status: SwitchoverStatus,
    pub failure_counter: u32,
    pub weight_change: u8,
    pub from_weight: u8,
    pub to_weight: u8,
}

enum CycleOutcome {
    Failed,
    Warming,
    Advance,
}

impl Switchover {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        from: Arc<Backend>,
        to: Arc<Backend>,
        route: &Route,
        conditions: Vec<Condition>,
        timeout: Duration,
        allowed_failures: u32,
        weight_change: u8,
        rollback: bool,
    ) -> Result<Arc<Self>> {
        if from.id == to.id {
            return Err(GatewayError::ConfigInvalid(
                "switchover endpoints must be different backends".into(),
            ));
        }
        if from.weight() < to.weight() {
            return Err(GatewayError::ConfigInvalid(format!(
                "switchover source weight {} must not be below target weight {}",
                from.weight(),
                to.weight()
            )));
        }
        if weight_change == 0 || weight_change > 100 {
            return Err(GatewayError::ConfigInvalid(format!(
                "weight change {weight_change} must be within [1, 100]"
            )));
        }

        let (cancel, _) = watch::channel(false);
        Ok(Arc::new(Self {
            id,
            from,
            to,
            route: route.downgrade(),
            conditions: StdMutex::new(conditions),
            weight_change,
            timeout,
            allowed_failures,
            rollback,
            failure_counter: AtomicU32::new(0),
            status: StdMutex::new(SwitchoverStatus::Registered),
            saved_from_weight: AtomicU8::new(0),
            saved_to_weight: AtomicU8::new(0),
            cancel,
        }))
    }

    pub fn status(&self) -> SwitchoverStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn failure_counter(&self) -> u32 {
        self.failure_counter.load(Ordering::Acquire)
    }

    pub fn summary(&self) -> SwitchoverSummary {
        SwitchoverSummary {
            id: self.id,
            from: self.from.name.clone(),
            to: self.to.name.clone(),
            status: self.status(),
            failure_counter: self.failure_counter(),
            weight_change: self.weight_change,
            from_weight: self.from.weight(),
            to_weight: self.to.weight(),
        }
    }

    /// Cancel the controller.
    ///
    /// A running switchover becomes `Stopped` and leaves the weights where
    /// they are; stopping an already-terminated switchover is a no-op.
    pub fn stop(&self) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if *status == SwitchoverStatus::Running {
            *status = SwitchoverStatus::Stopped;
            info!(switchover = self.id, "switchover stopped");
        }
        drop(status);
        self.cancel.send_replace(true);
    }

    /// The controller loop; runs on its own task until it terminates.
    pub(crate) async fn run(self: Arc<Self>) {
        self.saved_from_weight
            .store(self.from.weight(), Ordering::Release);
        self.saved_to_weight
            .store(self.to.weight(), Ordering::Release);
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = SwitchoverStatus::Running;
        info!(
            switchover = self.id,
            from = %self.from.name,
            to = %self.to.name,
            "switchover running"
        );

        let mut cancel = self.cancel.subscribe();
        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    debug!(switchover = self.id, "switchover loop cancelled");
                    return;
                }
                _ = time::sleep(self.timeout) => {}
            }

            let Some(route) = self.route.upgrade() else {
                return;
            };

            let now = Utc::now();
            let window = chrono::Duration::from_std(self.timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(10));
            let rates = match route
                .metrics_repo()
                .read_rates_of_backend(self.to.id, now - window, now)
                .await
            {
                Ok(rates) => rates,
                Err(err) => {
                    debug!(switchover = self.id, error = %err, "skipping cycle without rates");
                    continue;
                }
            };

            match self.evaluate_cycle(&rates) {
                CycleOutcome::Failed => {
                    let failures = self.failure_counter.fetch_add(1, Ordering::AcqRel) + 1;
                    debug!(
                        switchover = self.id,
                        failures, "switchover cycle missed its conditions"
                    );
                    if self.allowed_failures > 0 && failures > self.allowed_failures {
                        self.finish(SwitchoverStatus::Failed, &route).await;
                        return;
                    }
                }
                CycleOutcome::Warming => {}
                CycleOutcome::Advance => {
                    self.from
                        .set_weight(self.from.weight().saturating_sub(self.weight_change));
                    self.to
                        .set_weight(self.to.weight().saturating_add(self.weight_change).min(100));
                    route.update_weights().await;
                    info!(
                        switchover = self.id,
                        from_weight = self.from.weight(),
                        to_weight = self.to.weight(),
                        "advanced switchover weights"
                    );

                    if self.from.weight() == 0 || self.to.weight() >= 100 {
                        self.finish(SwitchoverStatus::Success, &route).await;
                        return;
                    }
                }
            }
        }
    }

    /// Walk every condition through trigger/latch bookkeeping and classify
    /// the cycle.
    fn evaluate_cycle(&self, rates: &std::collections::HashMap<String, f64>) -> CycleOutcome {
        let now = Utc::now();
        let to_active = self.to.is_active();
        let mut conditions = self.conditions.lock().unwrap_or_else(|e| e.into_inner());

        for condition in conditions.iter_mut() {
            if condition.is_true(rates) && to_active {
                match condition.trigger_time {
                    None => condition.trigger_time = Some(now),
                    Some(trigger) => {
                        let active_for = chrono::Duration::from_std(condition.active_for)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                        if now >= trigger + active_for {
                            condition.status = true;
                        }
                    }
                }
            } else {
                condition.reset();
            }
        }

        // A condition with no trigger time has genuinely failed this cycle;
        // one with a trigger but no latch is still accumulating activeFor.
        if conditions
            .iter()
            .any(|c| !c.status && c.trigger_time.is_none())
        {
            return CycleOutcome::Failed;
        }
        if conditions.iter().all(|c| c.status) {
            for condition in conditions.iter_mut() {
                condition.reset();
            }
            return CycleOutcome::Advance;
        }
        CycleOutcome::Warming
    }

    async fn finish(&self, terminal: SwitchoverStatus, route: &Route) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = terminal;
        match terminal {
            SwitchoverStatus::Success => {
                info!(
                    switchover = self.id,
                    from = %self.from.name,
                    to = %self.to.name,
                    "switchover succeeded"
                );
            }
            SwitchoverStatus::Failed => {
                warn!(
                    switchover = self.id,
                    failures = self.failure_counter(),
                    "switchover failed"
                );
                if self.rollback {
                    self.from
                        .set_weight(self.saved_from_weight.load(Ordering::Acquire));
                    self.to
                        .set_weight(self.saved_to_weight.load(Ordering::Acquire));
                    route.update_weights().await;
                }
            }
            _ => {}
        }
        self.cancel.send_replace(true);
    }
}
