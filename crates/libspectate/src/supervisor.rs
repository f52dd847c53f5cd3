//! Periodic reconciliation. Every pass re-reads state from the store and
//! only writes through compare-and-swap, so passes are idempotent and safe
//! to run concurrently with requests and with other broker replicas.

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use spectate_protocol::{ReleaseReason, SlotState, WorkerCommand};

use crate::assignment::AssignmentEngine;
use crate::clock::elapsed;
use crate::config::SupervisorConfig;
use crate::context::BrokerContext;
use crate::error::BrokerError;
use crate::keys;
use crate::lease::LeaseManager;
use crate::registry::{Registry, WorkloadRecord};
use crate::slot::{SlotRecord, SlotTable};
use crate::worker::WorkerControl;

/// Summary of one pass, logged when it changed anything.
pub trait PassReport: Debug + Send {
    fn is_quiet(&self) -> bool;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_leases: usize,
    pub draining: usize,
    pub reactivated: usize,
    pub released: usize,
}

impl PassReport for SweepReport {
    fn is_quiet(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub startup_timeouts: usize,
    pub probe_failures: usize,
    pub diverged: usize,
    pub reset: usize,
    pub reset_failures: usize,
    pub pool_restored: usize,
    pub pool_evicted: usize,
}

impl PassReport for HealthReport {
    fn is_quiet(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StalenessReport {
    pub marked_offline: usize,
    pub pairings_released: usize,
    pub leases_purged: usize,
    pub purged: usize,
}

impl PassReport for StalenessReport {
    fn is_quiet(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone)]
pub struct Supervisor {
    ctx: BrokerContext,
    registry: Registry,
    slots: SlotTable,
    leases: LeaseManager,
    assignment: AssignmentEngine,
    worker: Arc<dyn WorkerControl>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(
        ctx: BrokerContext,
        registry: Registry,
        slots: SlotTable,
        leases: LeaseManager,
        assignment: AssignmentEngine,
        worker: Arc<dyn WorkerControl>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            ctx,
            registry,
            slots,
            leases,
            assignment,
            worker,
            config,
        }
    }

    /// Starts the three loops. They stop when `cancel` fires.
    pub fn spawn(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let sweep = self.clone();
        let health = self.clone();
        let staleness = self.clone();
        vec![
            spawn_loop(
                "lease_sweep",
                Duration::from_millis(self.config.lease_sweep_ms),
                cancel.clone(),
                move || {
                    let sup = sweep.clone();
                    async move { sup.run_lease_sweep().await }
                },
            ),
            spawn_loop(
                "health_check",
                Duration::from_millis(self.config.health_check_ms),
                cancel.clone(),
                move || {
                    let sup = health.clone();
                    async move { sup.run_health_check().await }
                },
            ),
            spawn_loop(
                "staleness_monitor",
                Duration::from_millis(self.config.staleness_ms),
                cancel,
                move || {
                    let sup = staleness.clone();
                    async move { sup.run_staleness_monitor().await }
                },
            ),
        ]
    }

    /// Reaps lapsed leases, then moves assigned slots between ACTIVE and
    /// DRAINING by live viewer count and releases slots drained too long.
    pub async fn run_lease_sweep(&self) -> Result<SweepReport, BrokerError> {
        let mut report = SweepReport::default();
        for workload in self.registry.all().await? {
            match self.leases.sweep_workload(&workload.id).await {
                Ok(n) => report.expired_leases += n,
                Err(e) => warn!(workload_id = %workload.id, error = %e, "lease sweep failed"),
            }
        }
        for slot in self.slots.list().await? {
            if let Err(e) = self.sweep_slot(&slot, &mut report).await {
                warn!(slot_id = %slot.id, error = %e, "slot sweep failed");
            }
        }
        Ok(report)
    }

    async fn sweep_slot(&self, slot: &SlotRecord, report: &mut SweepReport) -> Result<(), BrokerError> {
        let Some(workload_id) = slot.assigned_workload_id.as_deref() else {
            return Ok(());
        };
        match slot.state {
            SlotState::Active => {
                if self.leases.live_count_bound(workload_id, &slot.id).await? == 0
                    && self.slots.start_draining(&slot.id, workload_id).await?
                {
                    report.draining += 1;
                }
            }
            SlotState::Draining => {
                if self.leases.live_count_bound(workload_id, &slot.id).await? > 0 {
                    if self.slots.reactivate(&slot.id, workload_id).await?.state == SlotState::Active {
                        report.reactivated += 1;
                    }
                    return Ok(());
                }
                let since = slot.drain_since_ms.unwrap_or(slot.state_since_ms);
                if elapsed(self.ctx.now_ms(), since) >= self.ctx.timeouts.drain_timeout()
                    && self.assignment.release_drained(&slot.id).await?.is_some()
                {
                    report.released += 1;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Times out stuck STARTING slots, probes ACTIVE ones, resets ERROR
    /// ones, repairs diverged pairings and reconciles the idle pool.
    pub async fn run_health_check(&self) -> Result<HealthReport, BrokerError> {
        let mut report = HealthReport::default();
        for slot in self.slots.list().await? {
            if let Err(e) = self.check_slot(&slot, &mut report).await {
                warn!(slot_id = %slot.id, error = %e, "slot health check failed");
            }
        }

        for member in self.ctx.store.set_members(keys::IDLE_POOL).await? {
            let idle = matches!(
                self.slots.get(&member).await?,
                Some(slot) if slot.value.state == SlotState::Idle
            );
            if !idle && self.ctx.store.set_remove(keys::IDLE_POOL, &member).await? {
                warn!(slot_id = %member, "evicted non-idle slot from idle pool");
                report.pool_evicted += 1;
            }
        }
        Ok(report)
    }

    async fn check_slot(&self, slot: &SlotRecord, report: &mut HealthReport) -> Result<(), BrokerError> {
        let now = self.ctx.now_ms();
        let timeouts = &self.ctx.timeouts;
        match slot.state {
            SlotState::Idle => {
                // Re-read so a slot claimed since the listing is not re-pooled.
                let still_idle = matches!(
                    self.slots.get(&slot.id).await?,
                    Some(current) if current.value.state == SlotState::Idle
                );
                if still_idle && self.ctx.store.set_add(keys::IDLE_POOL, &slot.id).await? {
                    info!(slot_id = %slot.id, "idle slot was missing from pool, restored");
                    report.pool_restored += 1;
                }
            }
            SlotState::Starting if elapsed(now, slot.state_since_ms) >= timeouts.startup_timeout() => {
                if self
                    .assignment
                    .fail(&slot.id, "worker did not become ready before the startup timeout")
                    .await?
                    .is_some()
                {
                    report.startup_timeouts += 1;
                }
            }
            SlotState::Starting | SlotState::Active | SlotState::Draining => {
                // A pairing younger than a lock TTL may still be mid-write.
                if elapsed(now, slot.state_since_ms) >= timeouts.lock_ttl() && !self.forward_matches(slot).await? {
                    if self
                        .assignment
                        .force_error(&slot.id, ReleaseReason::Diverged, "slot claims a workload that is not paired with it")
                        .await?
                        .is_some()
                    {
                        report.diverged += 1;
                    }
                    return Ok(());
                }
                if slot.state == SlotState::Active
                    && let Err(e) = self.worker.probe(slot, timeouts.worker_timeout()).await
                {
                    warn!(slot_id = %slot.id, error = %e, "probe failed");
                    if self
                        .assignment
                        .fail(&slot.id, &format!("probe failed: {e}"))
                        .await?
                        .is_some()
                    {
                        report.probe_failures += 1;
                    }
                }
            }
            SlotState::Error => {
                match self
                    .worker
                    .send(slot, &WorkerCommand::Reset, timeouts.worker_timeout())
                    .await
                {
                    Ok(()) => {
                        if self.slots.complete_reset(&slot.id).await? {
                            report.reset += 1;
                        }
                    }
                    Err(e) => {
                        warn!(slot_id = %slot.id, error = %e, "reset failed, will retry");
                        report.reset_failures += 1;
                    }
                }
            }
        }
        Ok(())
    }

    async fn forward_matches(&self, slot: &SlotRecord) -> Result<bool, BrokerError> {
        let Some(workload_id) = slot.assigned_workload_id.as_deref() else {
            return Ok(false);
        };
        let forward = self.ctx.store.get(&keys::pairing(workload_id)).await?;
        Ok(forward.as_deref() == Some(slot.id.as_str()))
    }

    /// Marks silent workloads OFFLINE, releases their pairings and leases,
    /// and purges workloads that have been OFFLINE past the purge window.
    pub async fn run_staleness_monitor(&self) -> Result<StalenessReport, BrokerError> {
        let mut report = StalenessReport::default();
        for workload in self.registry.all().await? {
            if let Err(e) = self.check_workload(&workload, &mut report).await {
                warn!(workload_id = %workload.id, error = %e, "staleness check failed");
            }
        }
        Ok(report)
    }

    async fn check_workload(
        &self,
        workload: &WorkloadRecord,
        report: &mut StalenessReport,
    ) -> Result<(), BrokerError> {
        let now = self.ctx.now_ms();
        if workload.effective_status(now, &self.ctx) == spectate_protocol::WorkloadStatus::Online {
            return Ok(());
        }
        let id = &workload.id;
        if self.registry.mark_offline(id).await? {
            report.marked_offline += 1;
        }

        let forward = keys::pairing(id);
        if let Some(slot_id) = self.ctx.store.get(&forward).await?
            && self.assignment.release_for_offline(&slot_id, id).await?.is_some()
        {
            report.pairings_released += 1;
        }
        report.leases_purged += self.leases.purge_workload(id).await?;

        let Some(current) = self.registry.get(id).await? else {
            return Ok(());
        };
        let expired = current
            .value
            .offline_since_ms
            .is_some_and(|since| elapsed(now, since) >= self.ctx.timeouts.purge_after());
        if current.value.status == spectate_protocol::WorkloadStatus::Offline
            && expired
            && self.ctx.store.get(&forward).await?.is_none()
            && self.registry.purge(&current).await?
        {
            report.purged += 1;
        }
        Ok(())
    }
}

fn spawn_loop<F, Fut, R>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    pass: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<R, BrokerError>> + Send + 'static,
    R: PassReport + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => match pass().await {
                    Ok(report) if report.is_quiet() => trace!(pass = name, "supervisor pass: no changes"),
                    Ok(report) => debug!(pass = name, ?report, "supervisor pass complete"),
                    Err(e) => warn!(pass = name, error = %e, "supervisor pass failed"),
                },
            }
        }
        debug!(pass = name, "supervisor loop stopped");
    })
}
