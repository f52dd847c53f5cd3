use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use spectate_protocol::{BrokerEvent, LeaseId, SlotId, WorkloadId};

use crate::clock::elapsed;
use crate::context::BrokerContext;
use crate::error::BrokerError;
use crate::keys;
use crate::slot::{MAX_CAS_ATTEMPTS, contended};
use crate::store::{self, Versioned};

/// Lease records outlive their freshness by this factor so an abandoned
/// record is eventually dropped by the store even if no sweep runs.
const RECORD_TTL_FACTOR: u32 = 4;

/// One viewer's claim on a workload's stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub id: LeaseId,
    pub workload_id: WorkloadId,
    pub slot_id: SlotId,
    pub created_at_ms: u64,
    pub last_seen_ms: u64,
    #[serde(default)]
    pub client_hint: Option<String>,
}

impl LeaseRecord {
    /// Fresh while the last heartbeat is less than one TTL old.
    pub fn is_live(&self, now_ms: u64, ttl: Duration) -> bool {
        elapsed(now_ms, self.last_seen_ms) < ttl
    }

    pub fn expires_at_ms(&self, ttl: Duration) -> u64 {
        self.last_seen_ms + ttl.as_millis() as u64
    }
}

/// What to count live viewers of.
#[derive(Debug, Clone, Copy)]
pub enum LeaseTarget<'a> {
    Workload(&'a str),
    Slot(&'a str),
}

/// Viewer leases. Counts are always derived from lease freshness, never stored.
#[derive(Clone)]
pub struct LeaseManager {
    ctx: BrokerContext,
}

impl LeaseManager {
    pub fn new(ctx: BrokerContext) -> Self {
        Self { ctx }
    }

    fn ttl(&self) -> Duration {
        self.ctx.timeouts.lease_ttl()
    }

    fn record_ttl(&self) -> Duration {
        self.ttl() * RECORD_TTL_FACTOR
    }

    pub(crate) async fn create(
        &self,
        workload_id: &str,
        slot_id: &str,
        client_hint: Option<String>,
    ) -> Result<LeaseRecord, BrokerError> {
        let now = self.ctx.now_ms();
        let lease = LeaseRecord {
            id: Uuid::new_v4().to_string(),
            workload_id: workload_id.to_string(),
            slot_id: slot_id.to_string(),
            created_at_ms: now,
            last_seen_ms: now,
            client_hint,
        };
        self.ctx
            .store
            .set_add(&keys::workload_leases(workload_id), &lease.id)
            .await?;
        let raw = store::encode(&keys::lease(&lease.id), &lease)?;
        self.ctx
            .store
            .put(&keys::lease(&lease.id), &raw, Some(self.record_ttl()))
            .await?;
        debug!(lease_id = %lease.id, %workload_id, %slot_id, "lease created");
        self.ctx.publish(BrokerEvent::LeaseCreated {
            lease_id: lease.id.clone(),
            workload_id: workload_id.to_string(),
            slot_id: slot_id.to_string(),
        });
        Ok(lease)
    }

    pub async fn get(&self, id: &str) -> Result<Option<LeaseRecord>, BrokerError> {
        Ok(store::load::<LeaseRecord>(self.ctx.store.as_ref(), &keys::lease(id))
            .await?
            .map(|v| v.value))
    }

    /// Refreshes a lease. A lapsed lease is reaped on the spot and reported
    /// as expired; a reaped one is not found.
    pub async fn heartbeat(&self, id: &str) -> Result<LeaseRecord, BrokerError> {
        let key = keys::lease(id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.ctx.now_ms();
            let Some(current) = store::load::<LeaseRecord>(self.ctx.store.as_ref(), &key).await?
            else {
                return Err(BrokerError::LeaseNotFound(id.to_string()));
            };
            if !current.value.is_live(now, self.ttl()) {
                self.expire(&current).await?;
                return Err(BrokerError::LeaseExpired(id.to_string()));
            }
            let mut next = current.value.clone();
            next.last_seen_ms = now;
            if store::swap(self.ctx.store.as_ref(), &key, &current, &next, Some(self.record_ttl()))
                .await?
            {
                return Ok(next);
            }
        }
        Err(contended(id))
    }

    /// Best-effort removal. Releasing an unknown lease is not an error.
    pub async fn release(&self, id: &str) -> Result<Option<LeaseRecord>, BrokerError> {
        let Some(lease) = self.get(id).await? else {
            return Ok(None);
        };
        self.drop_lease(&lease).await?;
        debug!(lease_id = %id, workload_id = %lease.workload_id, "lease released");
        self.ctx.publish(BrokerEvent::LeaseReleased {
            lease_id: lease.id.clone(),
            workload_id: lease.workload_id.clone(),
        });
        Ok(Some(lease))
    }

    /// Leases whose freshness has not lapsed, whether or not a sweep has run.
    pub async fn live_count(&self, target: LeaseTarget<'_>) -> Result<usize, BrokerError> {
        match target {
            LeaseTarget::Workload(workload_id) => {
                let now = self.ctx.now_ms();
                Ok(self
                    .leases_for(workload_id)
                    .await?
                    .iter()
                    .filter(|l| l.value.is_live(now, self.ttl()))
                    .count())
            }
            LeaseTarget::Slot(slot_id) => {
                let slot = store::load::<crate::slot::SlotRecord>(
                    self.ctx.store.as_ref(),
                    &keys::slot(slot_id),
                )
                .await?;
                match slot.and_then(|s| s.value.assigned_workload_id) {
                    Some(workload_id) => self.live_count_bound(&workload_id, slot_id).await,
                    None => Ok(0),
                }
            }
        }
    }

    /// Live leases of `workload_id` that are bound to `slot_id`.
    pub(crate) async fn live_count_bound(
        &self,
        workload_id: &str,
        slot_id: &str,
    ) -> Result<usize, BrokerError> {
        let now = self.ctx.now_ms();
        Ok(self
            .leases_for(workload_id)
            .await?
            .iter()
            .filter(|l| l.value.slot_id == slot_id && l.value.is_live(now, self.ttl()))
            .count())
    }

    /// All lease records indexed under a workload. Index entries whose record
    /// is already gone are cleaned up along the way.
    async fn leases_for(
        &self,
        workload_id: &str,
    ) -> Result<Vec<Versioned<LeaseRecord>>, BrokerError> {
        let index = keys::workload_leases(workload_id);
        let mut leases = Vec::new();
        for id in self.ctx.store.set_members(&index).await? {
            match store::load::<LeaseRecord>(self.ctx.store.as_ref(), &keys::lease(&id)).await? {
                Some(lease) => leases.push(lease),
                None => {
                    self.ctx.store.set_remove(&index, &id).await?;
                }
            }
        }
        Ok(leases)
    }

    /// Deletes this workload's lapsed leases. Returns how many were reaped.
    pub async fn sweep_workload(&self, workload_id: &str) -> Result<usize, BrokerError> {
        let now = self.ctx.now_ms();
        let mut reaped = 0;
        for lease in self.leases_for(workload_id).await? {
            if !lease.value.is_live(now, self.ttl()) && self.expire(&lease).await? {
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// Drops the leases bound to a slot whose pairing was torn down.
    pub async fn purge_slot(&self, workload_id: &str, slot_id: &str) -> Result<usize, BrokerError> {
        let mut purged = 0;
        for lease in self.leases_for(workload_id).await? {
            if lease.value.slot_id == slot_id {
                self.drop_lease(&lease.value).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Drops every lease of a workload.
    pub async fn purge_workload(&self, workload_id: &str) -> Result<usize, BrokerError> {
        let mut purged = 0;
        for lease in self.leases_for(workload_id).await? {
            self.drop_lease(&lease.value).await?;
            purged += 1;
        }
        Ok(purged)
    }

    async fn expire(&self, lease: &Versioned<LeaseRecord>) -> Result<bool, BrokerError> {
        let removed =
            store::remove(self.ctx.store.as_ref(), &keys::lease(&lease.value.id), lease).await?;
        self.ctx
            .store
            .set_remove(&keys::workload_leases(&lease.value.workload_id), &lease.value.id)
            .await?;
        if removed {
            debug!(lease_id = %lease.value.id, workload_id = %lease.value.workload_id, "lease expired");
            self.ctx.publish(BrokerEvent::LeaseExpired {
                lease_id: lease.value.id.clone(),
                workload_id: lease.value.workload_id.clone(),
            });
        }
        Ok(removed)
    }

    async fn drop_lease(&self, lease: &LeaseRecord) -> Result<(), BrokerError> {
        self.ctx.store.delete(&keys::lease(&lease.id)).await?;
        self.ctx
            .store
            .set_remove(&keys::workload_leases(&lease.workload_id), &lease.id)
            .await?;
        Ok(())
    }
}
