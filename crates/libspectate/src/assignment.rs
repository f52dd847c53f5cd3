//! Pairing of workloads with slots. This is the only module that creates or
//! destroys a pairing.
//!
//! A pairing is written in two places: the forward mapping
//! `pairing:workload:{id} -> slot id` and the slot record's
//! `assigned_workload_id`. Both are only written while holding the
//! workload's lock, and every write is conditioned on the value observed
//! under that lock.

use std::sync::Arc;

use tracing::{debug, info, warn};

use spectate_protocol::{
    BrokerEvent, ReleaseReason, SlotState, WatchResponse, WatchStatus, WorkerCommand, WorkloadId,
};

use crate::context::BrokerContext;
use crate::error::BrokerError;
use crate::keys;
use crate::lease::{LeaseManager, LeaseRecord};
use crate::lock::LockScope;
use crate::registry::{Registry, WorkloadRecord};
use crate::slot::{MAX_CAS_ATTEMPTS, SlotRecord, SlotTable, contended};
use crate::worker::WorkerControl;

/// How often a watch request re-runs when its pairing is torn down between
/// allocation and lease creation.
const MAX_WATCH_ATTEMPTS: usize = 3;

/// A granted watch: the viewer's lease and the slot serving it.
#[derive(Debug, Clone)]
pub struct WatchTicket {
    pub lease: LeaseRecord,
    pub slot: SlotRecord,
}

impl WatchTicket {
    pub fn status(&self) -> WatchStatus {
        if self.slot.state == SlotState::Active {
            WatchStatus::Ready
        } else {
            WatchStatus::Starting
        }
    }

    pub fn to_response(&self, lease_ttl_ms: u64) -> WatchResponse {
        WatchResponse {
            status: self.status(),
            lease_id: Some(self.lease.id.clone()),
            slot_id: Some(self.slot.id.clone()),
            stream_endpoint: Some(self.slot.stream_endpoint.clone()),
            lease_ttl_ms: Some(lease_ttl_ms),
        }
    }
}

struct Pairing {
    slot: SlotRecord,
    /// Allocated by this call, so the worker still has to be told to attach.
    fresh: bool,
}

struct Teardown<'a> {
    slot_id: &'a str,
    /// Only tear down if the slot is paired with this workload.
    workload_id: Option<&'a str>,
    from: &'a [SlotState],
    to: SlotState,
    reason: ReleaseReason,
    detail: Option<String>,
    /// Re-check under the lock that no live lease is bound to the slot.
    only_if_unwatched: bool,
}

#[derive(Clone)]
pub struct AssignmentEngine {
    ctx: BrokerContext,
    registry: Registry,
    slots: SlotTable,
    leases: LeaseManager,
    worker: Arc<dyn WorkerControl>,
}

impl AssignmentEngine {
    pub fn new(
        ctx: BrokerContext,
        registry: Registry,
        slots: SlotTable,
        leases: LeaseManager,
        worker: Arc<dyn WorkerControl>,
    ) -> Self {
        Self {
            ctx,
            registry,
            slots,
            leases,
            worker,
        }
    }

    /// Grants a viewer access to `workload_id`, reusing its pairing or
    /// allocating an idle slot.
    pub async fn request_watch(
        &self,
        workload_id: &str,
        client_hint: Option<String>,
    ) -> Result<WatchTicket, BrokerError> {
        for attempt in 0..MAX_WATCH_ATTEMPTS {
            let workload = self.registry.require_online(workload_id).await?;
            let pairing = self.pair(&workload).await?;
            if pairing.fresh {
                self.attach(&pairing.slot, &workload).await?;
            }

            let lease = self
                .leases
                .create(workload_id, &pairing.slot.id, client_hint.clone())
                .await?;

            // The lock was released before the worker call, so the pairing
            // may have been reclaimed before the lease landed, or a drain
            // that counted no viewers may commit before the reactivation.
            let slot = match self.slots.get(&pairing.slot.id).await? {
                Some(slot) if slot.value.state == SlotState::Draining => {
                    Some(self.slots.reactivate(&slot.value.id, workload_id).await?)
                }
                slot => slot.map(|v| v.value),
            };
            let slot = match slot {
                Some(slot) if slot.is_assigned_to(workload_id) => slot,
                _ => {
                    self.leases.release(&lease.id).await?;
                    debug!(%workload_id, attempt, "pairing reclaimed before lease was created, retrying");
                    continue;
                }
            };

            let ticket = WatchTicket { lease, slot };
            info!(
                %workload_id,
                slot_id = %ticket.slot.id,
                lease_id = %ticket.lease.id,
                status = ?ticket.status(),
                "watch granted"
            );
            return Ok(ticket);
        }
        Err(BrokerError::Conflict(format!(
            "pairing for {workload_id} kept changing, retry shortly"
        )))
    }

    /// The slot paired with `workload_id`, if the forward mapping and the
    /// slot record agree. Read-only.
    pub async fn pairing_of(&self, workload_id: &str) -> Result<Option<SlotRecord>, BrokerError> {
        let Some(slot_id) = self.ctx.store.get(&keys::pairing(workload_id)).await? else {
            return Ok(None);
        };
        Ok(self
            .slots
            .get(&slot_id)
            .await?
            .map(|v| v.value)
            .filter(|slot| slot.is_assigned_to(workload_id)))
    }

    /// Tears down a DRAINING pairing that still has no live viewers.
    pub async fn release_drained(&self, slot_id: &str) -> Result<Option<WorkloadId>, BrokerError> {
        self.teardown(Teardown {
            slot_id,
            workload_id: None,
            from: &[SlotState::Draining],
            to: SlotState::Idle,
            reason: ReleaseReason::Drained,
            detail: None,
            only_if_unwatched: true,
        })
        .await
    }

    /// Tears down whatever pairing `workload_id` holds on `slot_id` because
    /// the workload went away.
    pub async fn release_for_offline(
        &self,
        slot_id: &str,
        workload_id: &str,
    ) -> Result<Option<WorkloadId>, BrokerError> {
        self.teardown(Teardown {
            slot_id,
            workload_id: Some(workload_id),
            from: &SlotState::ASSIGNED,
            to: SlotState::Idle,
            reason: ReleaseReason::WorkloadOffline,
            detail: None,
            only_if_unwatched: false,
        })
        .await
    }

    /// Forces an assigned slot into ERROR, tearing its pairing down. A slot
    /// that is already IDLE or ERROR is left alone.
    pub async fn fail(&self, slot_id: &str, detail: &str) -> Result<Option<WorkloadId>, BrokerError> {
        self.force_error(slot_id, ReleaseReason::SlotError, detail).await
    }

    pub(crate) async fn force_error(
        &self,
        slot_id: &str,
        reason: ReleaseReason,
        detail: &str,
    ) -> Result<Option<WorkloadId>, BrokerError> {
        self.teardown(Teardown {
            slot_id,
            workload_id: None,
            from: &SlotState::ASSIGNED,
            to: SlotState::Error,
            reason,
            detail: Some(detail.to_string()),
            only_if_unwatched: false,
        })
        .await
    }

    async fn pair(&self, workload: &WorkloadRecord) -> Result<Pairing, BrokerError> {
        let guard = self
            .ctx
            .locks
            .acquire(LockScope::Workload, &workload.id)
            .await?;
        let result = self.pair_locked(workload).await;
        guard.release().await;
        result
    }

    async fn pair_locked(&self, workload: &WorkloadRecord) -> Result<Pairing, BrokerError> {
        if let Some(slot) = self.resolve_locked(&workload.id).await? {
            return Ok(Pairing { slot, fresh: false });
        }

        loop {
            let Some(slot_id) = self.ctx.store.set_pop(keys::IDLE_POOL).await? else {
                debug!(workload_id = %workload.id, "idle pool empty");
                return Err(BrokerError::NoCapacity);
            };
            let Some(current) = self.slots.get(&slot_id).await? else {
                warn!(%slot_id, "idle pool held an unknown slot, discarding");
                continue;
            };
            if current.value.state != SlotState::Idle {
                warn!(%slot_id, state = %current.value.state, "idle pool held a busy slot, discarding");
                continue;
            }

            let next = current.value.transitioned(
                SlotState::Starting,
                Some(workload.id.clone()),
                self.ctx.now_ms(),
            )?;
            if !self.slots.commit(&current, &next).await? {
                self.requeue_if_idle(&slot_id).await?;
                continue;
            }

            let forward = keys::pairing(&workload.id);
            if !self.ctx.store.put_if_absent(&forward, &slot_id, None).await? {
                // Our lock lapsed and another holder paired this workload first.
                warn!(workload_id = %workload.id, %slot_id, "workload paired concurrently, returning slot");
                self.unclaim(&slot_id, &workload.id).await?;
                return match self.resolve_locked(&workload.id).await? {
                    Some(slot) => Ok(Pairing { slot, fresh: false }),
                    None => Err(contended(&workload.id)),
                };
            }

            info!(workload_id = %workload.id, %slot_id, "pairing created");
            self.ctx.publish(BrokerEvent::PairingCreated {
                workload_id: workload.id.clone(),
                slot_id: slot_id.clone(),
            });
            return Ok(Pairing {
                slot: next,
                fresh: true,
            });
        }
    }

    /// Follows the forward mapping. A mapping the slot record does not
    /// mirror is dropped so the workload can be paired again.
    async fn resolve_locked(&self, workload_id: &str) -> Result<Option<SlotRecord>, BrokerError> {
        let forward = keys::pairing(workload_id);
        let Some(slot_id) = self.ctx.store.get(&forward).await? else {
            return Ok(None);
        };
        if let Some(slot) = self.slots.get(&slot_id).await?
            && slot.value.is_assigned_to(workload_id)
        {
            return Ok(Some(slot.value));
        }

        warn!(%workload_id, %slot_id, "forward pairing not mirrored by slot, dropping it");
        if self
            .ctx
            .store
            .compare_and_swap(&forward, Some(&slot_id), None, None)
            .await?
        {
            self.ctx.publish(BrokerEvent::PairingReleased {
                workload_id: workload_id.to_string(),
                slot_id,
                reason: ReleaseReason::Diverged,
            });
        }
        Ok(None)
    }

    async fn requeue_if_idle(&self, slot_id: &str) -> Result<(), BrokerError> {
        if let Some(slot) = self.slots.get(slot_id).await?
            && slot.value.state == SlotState::Idle
        {
            self.ctx.store.set_add(keys::IDLE_POOL, slot_id).await?;
        }
        Ok(())
    }

    /// Undoes a STARTING claim that never got its forward mapping.
    async fn unclaim(&self, slot_id: &str, workload_id: &str) -> Result<(), BrokerError> {
        let (_, changed) = self
            .slots
            .update(slot_id, |slot, now| {
                if slot.state != SlotState::Starting || !slot.is_assigned_to(workload_id) {
                    return Ok(None);
                }
                Ok(Some(slot.transitioned(SlotState::Idle, None, now)?))
            })
            .await?;
        if changed {
            self.ctx.store.set_add(keys::IDLE_POOL, slot_id).await?;
        }
        Ok(())
    }

    /// Tells a freshly allocated worker to attach. On failure the pairing is
    /// unwound and the slot returned to the idle pool.
    async fn attach(&self, slot: &SlotRecord, workload: &WorkloadRecord) -> Result<(), BrokerError> {
        let command = WorkerCommand::Attach {
            workload_id: workload.id.clone(),
            address: workload.address.clone(),
        };
        let timeout = self.ctx.timeouts.attach_timeout();
        let err = match self.worker.send(slot, &command, timeout).await {
            Ok(()) => {
                debug!(slot_id = %slot.id, workload_id = %workload.id, "attach sent");
                return Ok(());
            }
            Err(err) => err,
        };

        warn!(slot_id = %slot.id, workload_id = %workload.id, error = %err, "attach failed, unwinding pairing");
        let unwound = self
            .teardown(Teardown {
                slot_id: &slot.id,
                workload_id: Some(&workload.id),
                from: &[SlotState::Starting],
                to: SlotState::Idle,
                reason: ReleaseReason::AttachFailed,
                detail: Some(err.to_string()),
                only_if_unwatched: false,
            })
            .await;
        match unwound {
            Ok(Some(_)) => {}
            Ok(None) => {
                // The worker reported ready even though the attach call failed.
                if let Some(current) = self.slots.get(&slot.id).await?
                    && current.value.is_assigned_to(&workload.id)
                    && current.value.state != SlotState::Starting
                {
                    warn!(slot_id = %slot.id, "attach call failed but worker confirmed ready, keeping pairing");
                    return Ok(());
                }
            }
            Err(unwind_err) => {
                warn!(
                    slot_id = %slot.id,
                    error = %unwind_err,
                    "could not unwind pairing, health check will repair it"
                );
            }
        }
        Err(BrokerError::AttachFailed {
            slot_id: slot.id.clone(),
            reason: err.to_string(),
        })
    }

    async fn teardown(&self, req: Teardown<'_>) -> Result<Option<WorkloadId>, BrokerError> {
        let observed = self.slots.require(req.slot_id).await?.value;
        if !req.from.contains(&observed.state) {
            return Ok(None);
        }
        let Some(workload_id) = observed.assigned_workload_id.clone() else {
            return Ok(None);
        };
        if req.workload_id.is_some_and(|w| w != workload_id) {
            return Ok(None);
        }

        let guard = self
            .ctx
            .locks
            .acquire(LockScope::Workload, &workload_id)
            .await?;
        let result = self.teardown_locked(&req, &workload_id).await;
        guard.release().await;
        let Some(released) = result? else {
            return Ok(None);
        };

        if req.to == SlotState::Idle && req.reason != ReleaseReason::AttachFailed {
            let command = WorkerCommand::Detach {
                workload_id: workload_id.clone(),
            };
            if let Err(err) = self
                .worker
                .send(&released, &command, self.ctx.timeouts.worker_timeout())
                .await
            {
                warn!(slot_id = %released.id, %workload_id, error = %err, "detach failed");
            }
        }
        Ok(Some(workload_id))
    }

    /// Returns the slot as it was before the teardown, if this call did it.
    async fn teardown_locked(
        &self,
        req: &Teardown<'_>,
        workload_id: &str,
    ) -> Result<Option<SlotRecord>, BrokerError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.slots.require(req.slot_id).await?;
            if !req.from.contains(&current.value.state) || !current.value.is_assigned_to(workload_id) {
                return Ok(None);
            }
            if req.only_if_unwatched
                && self
                    .leases
                    .live_count_bound(workload_id, req.slot_id)
                    .await?
                    > 0
            {
                return Ok(None);
            }

            let mut next = current
                .value
                .transitioned(req.to, None, self.ctx.now_ms())?;
            if req.to == SlotState::Error {
                next.last_error = req.detail.clone();
            }
            if !self.slots.commit(&current, &next).await? {
                continue;
            }

            self.ctx
                .store
                .compare_and_swap(&keys::pairing(workload_id), Some(req.slot_id), None, None)
                .await?;
            if req.to == SlotState::Idle {
                self.ctx.store.set_add(keys::IDLE_POOL, req.slot_id).await?;
            }
            let purged = self.leases.purge_slot(workload_id, req.slot_id).await?;

            info!(
                slot_id = %req.slot_id,
                %workload_id,
                reason = ?req.reason,
                to = %req.to,
                purged_leases = purged,
                detail = req.detail.as_deref().unwrap_or(""),
                "pairing released"
            );
            self.ctx.publish(BrokerEvent::PairingReleased {
                workload_id: workload_id.to_string(),
                slot_id: req.slot_id.to_string(),
                reason: req.reason,
            });
            return Ok(Some(current.value));
        }
        Err(contended(req.slot_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;

    #[tokio::test]
    async fn first_watch_allocates_and_attaches() {
        let h = Harness::with_slots(2).await;
        h.online("w1").await;
        let ticket = h.broker.assignment().request_watch("w1", None).await.expect("watch");

        assert_eq!(ticket.status(), WatchStatus::Starting);
        assert_eq!(ticket.slot.state, SlotState::Starting);
        assert_eq!(
            h.store().get(&keys::pairing("w1")).await.expect("get").as_deref(),
            Some(ticket.slot.id.as_str())
        );
        assert_eq!(h.store().set_len(keys::IDLE_POOL).await.expect("len"), 1);
        assert_eq!(
            h.worker.commands_for(&ticket.slot.id),
            vec![WorkerCommand::Attach {
                workload_id: "w1".to_string(),
                address: "sim-w1:9000".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn empty_pool_is_no_capacity_without_partial_writes() {
        let h = Harness::with_slots(0).await;
        h.online("w1").await;
        let err = h
            .broker
            .assignment()
            .request_watch("w1", None)
            .await
            .err()
            .expect("no capacity");
        assert!(matches!(err, BrokerError::NoCapacity));
        assert!(h.store().get(&keys::pairing("w1")).await.expect("get").is_none());
        assert!(
            h.store()
                .set_members(&keys::workload_leases("w1"))
                .await
                .expect("leases")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn offline_or_unknown_workload_is_rejected() {
        let h = Harness::with_slots(1).await;
        let err = h
            .broker
            .assignment()
            .request_watch("ghost", None)
            .await
            .err()
            .expect("unknown");
        assert!(matches!(err, BrokerError::WorkloadNotFound(_)));

        h.online("w1").await;
        h.clock
            .advance(std::time::Duration::from_millis(h.timeouts().staleness_window_ms + 1));
        let err = h
            .broker
            .assignment()
            .request_watch("w1", None)
            .await
            .err()
            .expect("offline");
        assert!(matches!(err, BrokerError::WorkloadOffline(_)));
        assert_eq!(h.store().set_len(keys::IDLE_POOL).await.expect("len"), 1);
    }

    #[tokio::test]
    async fn attach_failure_unwinds_to_idle() {
        let h = Harness::with_slots(1).await;
        h.online("w1").await;
        h.worker.fail_attach(true);

        let err = h
            .broker
            .assignment()
            .request_watch("w1", None)
            .await
            .err()
            .expect("attach failure");
        assert!(matches!(err, BrokerError::AttachFailed { .. }));

        let slot = h.broker.slots().require("slot-0").await.expect("slot").value;
        assert_eq!(slot.state, SlotState::Idle);
        assert_eq!(slot.assigned_workload_id, None);
        assert!(h.store().get(&keys::pairing("w1")).await.expect("get").is_none());
        assert_eq!(
            h.store().set_members(keys::IDLE_POOL).await.expect("pool"),
            vec!["slot-0"]
        );
        // No detach is sent to a worker that never attached.
        assert_eq!(h.worker.commands_for("slot-0").len(), 1);

        h.worker.fail_attach(false);
        h.broker
            .assignment()
            .request_watch("w1", None)
            .await
            .expect("retry succeeds");
    }

    #[tokio::test]
    async fn stale_pool_member_is_skipped() {
        let h = Harness::with_slots(2).await;
        h.online("w1").await;
        h.online("w2").await;
        let first = h.broker.assignment().request_watch("w1", None).await.expect("w1");
        // Corrupt the pool: put the busy slot back.
        h.store().set_add(keys::IDLE_POOL, &first.slot.id).await.expect("add");

        let second = h.broker.assignment().request_watch("w2", None).await.expect("w2");
        assert_ne!(second.slot.id, first.slot.id);
        assert_eq!(h.store().set_len(keys::IDLE_POOL).await.expect("len"), 0);
    }

    #[tokio::test]
    async fn diverged_forward_mapping_is_repaired_on_watch() {
        let h = Harness::with_slots(2).await;
        h.online("w1").await;
        // Forward mapping pointing at a slot that does not mirror it.
        h.store()
            .put(&keys::pairing("w1"), "slot-1", None)
            .await
            .expect("put");

        let ticket = h.broker.assignment().request_watch("w1", None).await.expect("watch");
        assert!(ticket.slot.is_assigned_to("w1"));
        assert_eq!(
            h.store().get(&keys::pairing("w1")).await.expect("get").as_deref(),
            Some(ticket.slot.id.as_str())
        );
    }

    #[tokio::test]
    async fn fail_moves_to_error_and_clears_pairing() {
        let h = Harness::with_slots(1).await;
        h.online("w1").await;
        let ticket = h.broker.assignment().request_watch("w1", None).await.expect("watch");

        let released = h
            .broker
            .assignment()
            .fail(&ticket.slot.id, "gpu lost")
            .await
            .expect("fail");
        assert_eq!(released.as_deref(), Some("w1"));

        let slot = h.broker.slots().require(&ticket.slot.id).await.expect("slot").value;
        assert_eq!(slot.state, SlotState::Error);
        assert_eq!(slot.assigned_workload_id, None);
        assert_eq!(slot.last_error.as_deref(), Some("gpu lost"));
        assert!(h.broker.leases().get(&ticket.lease.id).await.expect("get").is_none());
        assert_eq!(h.store().set_len(keys::IDLE_POOL).await.expect("len"), 0);

        // Failing again is a no-op.
        assert_eq!(
            h.broker.assignment().fail(&ticket.slot.id, "again").await.expect("fail"),
            None
        );
    }

    #[tokio::test]
    async fn drain_committed_before_reactivation_reallocates() {
        let (h, store) = Harness::interposed(1, &keys::slot("slot-0")).await;
        h.online("w1").await;
        let first = h.broker.assignment().request_watch("w1", None).await.expect("watch");
        h.broker.slots().mark_ready("slot-0").await.expect("ready");
        h.broker.leases().release(&first.lease.id).await.expect("release");
        assert!(h.broker.slots().start_draining("slot-0", "w1").await.expect("drain"));

        // A drain that already counted zero viewers commits right after the
        // next watch re-reads the slot as DRAINING.
        let engine = h.broker.assignment().clone();
        store.arm(move || async move {
            let released = engine
                .teardown(Teardown {
                    slot_id: "slot-0",
                    workload_id: Some("w1"),
                    from: &[SlotState::Draining],
                    to: SlotState::Idle,
                    reason: ReleaseReason::Drained,
                    detail: None,
                    only_if_unwatched: false,
                })
                .await
                .expect("drain commits");
            assert_eq!(released.as_deref(), Some("w1"));
        });

        let ticket = h.broker.assignment().request_watch("w1", None).await.expect("watch");
        assert!(!store.armed());
        assert!(ticket.slot.is_assigned_to("w1"));
        assert_eq!(ticket.status(), WatchStatus::Starting);
        assert_eq!(h.slot_state("slot-0").await, SlotState::Starting);
        assert!(h.broker.leases().get(&ticket.lease.id).await.expect("get").is_some());
        let attaches = h
            .worker
            .commands_for("slot-0")
            .into_iter()
            .filter(|c| matches!(c, WorkerCommand::Attach { .. }))
            .count();
        assert_eq!(attaches, 2);
    }
}
