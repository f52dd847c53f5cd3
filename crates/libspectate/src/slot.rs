use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use spectate_protocol::{BrokerEvent, SlotId, SlotState, SlotView, WorkloadId};

use crate::context::BrokerContext;
use crate::error::BrokerError;
use crate::keys;
use crate::store::{self, Versioned};

/// Bound on optimistic read-modify-write retries before reporting a conflict.
pub(crate) const MAX_CAS_ATTEMPTS: usize = 8;

const SCAN_PAGE: usize = 500;

/// A render/streaming worker as stored. `assigned_workload_id` is the
/// reverse half of a pairing and is set exactly when the state is assigned.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SlotRecord {
    pub id: SlotId,
    pub state: SlotState,
    #[serde(default)]
    pub assigned_workload_id: Option<WorkloadId>,
    pub control_url: String,
    pub stream_endpoint: String,
    pub registered_at_ms: u64,
    pub state_since_ms: u64,
    #[serde(default)]
    pub drain_since_ms: Option<u64>,
    pub last_status_ms: u64,
    #[serde(default)]
    pub last_status_detail: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SlotRecord {
    pub fn new(id: &str, control_url: &str, stream_endpoint: &str, now_ms: u64) -> Self {
        Self {
            id: id.to_string(),
            state: SlotState::Idle,
            assigned_workload_id: None,
            control_url: control_url.to_string(),
            stream_endpoint: stream_endpoint.to_string(),
            registered_at_ms: now_ms,
            state_since_ms: now_ms,
            drain_since_ms: None,
            last_status_ms: now_ms,
            last_status_detail: None,
            last_error: None,
        }
    }

    /// This record moved to `next`, checked against the transition table and
    /// the assignment invariant.
    pub fn transitioned(
        &self,
        next: SlotState,
        workload_id: Option<WorkloadId>,
        now_ms: u64,
    ) -> Result<SlotRecord, BrokerError> {
        if !self.state.can_transition_to(next) {
            return Err(BrokerError::IllegalTransition {
                slot_id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        if next.is_assigned() != workload_id.is_some() {
            return Err(BrokerError::Conflict(format!(
                "slot {} in state {next} must {}have an assigned workload",
                self.id,
                if next.is_assigned() { "" } else { "not " }
            )));
        }
        let mut rec = self.clone();
        rec.state = next;
        rec.assigned_workload_id = workload_id;
        rec.state_since_ms = now_ms;
        rec.drain_since_ms = (next == SlotState::Draining).then_some(now_ms);
        Ok(rec)
    }

    pub fn is_assigned_to(&self, workload_id: &str) -> bool {
        self.state.is_assigned() && self.assigned_workload_id.as_deref() == Some(workload_id)
    }

    pub fn to_view(&self, viewer_count: usize) -> SlotView {
        SlotView {
            id: self.id.clone(),
            state: self.state,
            assigned_workload_id: self.assigned_workload_id.clone(),
            control_url: self.control_url.clone(),
            stream_endpoint: self.stream_endpoint.clone(),
            state_since_ms: self.state_since_ms,
            last_status_ms: self.last_status_ms,
            last_status_detail: self.last_status_detail.clone(),
            last_error: self.last_error.clone(),
            viewer_count,
        }
    }
}

/// Slot records in the store. Every write is a compare-and-swap against the
/// record as read, so concurrent or duplicated writers cannot interleave.
#[derive(Clone)]
pub struct SlotTable {
    ctx: BrokerContext,
}

impl SlotTable {
    pub fn new(ctx: BrokerContext) -> Self {
        Self { ctx }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Versioned<SlotRecord>>, BrokerError> {
        Ok(store::load(self.ctx.store.as_ref(), &keys::slot(id)).await?)
    }

    pub async fn require(&self, id: &str) -> Result<Versioned<SlotRecord>, BrokerError> {
        self.get(id)
            .await?
            .ok_or_else(|| BrokerError::SlotNotFound(id.to_string()))
    }

    /// Every slot, in id order. Undecodable records are logged and skipped.
    pub async fn list(&self) -> Result<Vec<SlotRecord>, BrokerError> {
        let mut slots = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = self
                .ctx
                .store
                .scan(keys::SLOT_PREFIX, after.as_deref(), SCAN_PAGE)
                .await?;
            let done = page.len() < SCAN_PAGE;
            after = page.last().map(|(k, _)| k.clone());
            for (key, raw) in page {
                match store::decode::<SlotRecord>(&key, raw) {
                    Ok(v) => slots.push(v.value),
                    Err(e) => warn!(key = %key, error = %e, "skipping undecodable slot record"),
                }
            }
            if done {
                return Ok(slots);
            }
        }
    }

    /// Announces a worker. New slots start IDLE in the idle pool; a known
    /// slot only has its endpoints refreshed.
    pub async fn register(
        &self,
        id: &str,
        control_url: &str,
        stream_endpoint: &str,
    ) -> Result<SlotRecord, BrokerError> {
        validate_id("slot", id)?;
        if control_url.is_empty() || stream_endpoint.is_empty() {
            return Err(BrokerError::InvalidRequest(
                "control_url and stream_endpoint are required".to_string(),
            ));
        }
        let key = keys::slot(id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.ctx.now_ms();
            match self.get(id).await? {
                None => {
                    let rec = SlotRecord::new(id, control_url, stream_endpoint, now);
                    if store::insert_new(self.ctx.store.as_ref(), &key, &rec, None).await? {
                        self.ctx.store.set_add(keys::IDLE_POOL, id).await?;
                        info!(slot_id = %id, %stream_endpoint, "slot registered");
                        self.ctx.publish(BrokerEvent::SlotRegistered {
                            slot_id: id.to_string(),
                        });
                        return Ok(rec);
                    }
                }
                Some(current) => {
                    let mut next = current.value.clone();
                    next.control_url = control_url.to_string();
                    next.stream_endpoint = stream_endpoint.to_string();
                    next.last_status_ms = now;
                    if store::swap(self.ctx.store.as_ref(), &key, &current, &next, None).await? {
                        debug!(slot_id = %id, "slot re-announced");
                        return Ok(next);
                    }
                }
            }
        }
        Err(contended(id))
    }

    /// Conditionally writes `next` over `current`, publishing a transition
    /// event when the state changed. Returns false if the record moved on.
    pub(crate) async fn commit(
        &self,
        current: &Versioned<SlotRecord>,
        next: &SlotRecord,
    ) -> Result<bool, BrokerError> {
        let key = keys::slot(&next.id);
        if !store::swap(self.ctx.store.as_ref(), &key, current, next, None).await? {
            return Ok(false);
        }
        let from = current.value.state;
        if from != next.state {
            debug!(slot_id = %next.id, %from, to = %next.state, "slot transition");
            self.ctx.publish(BrokerEvent::SlotTransition {
                slot_id: next.id.clone(),
                from,
                to: next.state,
                workload_id: next
                    .assigned_workload_id
                    .clone()
                    .or_else(|| current.value.assigned_workload_id.clone()),
            });
        }
        Ok(true)
    }

    /// Read-modify-write loop. `decide` returns the record to write, or
    /// `None` to leave the slot alone. Yields the resulting record and
    /// whether this call changed it.
    pub(crate) async fn update<F>(
        &self,
        id: &str,
        mut decide: F,
    ) -> Result<(SlotRecord, bool), BrokerError>
    where
        F: FnMut(&SlotRecord, u64) -> Result<Option<SlotRecord>, BrokerError>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.require(id).await?;
            let Some(next) = decide(&current.value, self.ctx.now_ms())? else {
                return Ok((current.value, false));
            };
            if self.commit(&current, &next).await? {
                return Ok((next, true));
            }
        }
        Err(contended(id))
    }

    /// Worker confirmed it is streaming. STARTING becomes ACTIVE; repeating
    /// the confirmation on an ACTIVE or DRAINING slot is a no-op.
    pub async fn mark_ready(&self, id: &str) -> Result<SlotRecord, BrokerError> {
        let (rec, changed) = self
            .update(id, |slot, now| match slot.state {
                SlotState::Starting => Ok(Some(slot.transitioned(
                    SlotState::Active,
                    slot.assigned_workload_id.clone(),
                    now,
                )?)),
                SlotState::Active | SlotState::Draining => Ok(None),
                from => Err(BrokerError::IllegalTransition {
                    slot_id: slot.id.clone(),
                    from,
                    to: SlotState::Active,
                }),
            })
            .await?;
        if changed {
            info!(slot_id = %id, workload_id = ?rec.assigned_workload_id, "slot ready");
        }
        Ok(rec)
    }

    /// ACTIVE to DRAINING, only while still paired with `workload_id`.
    pub async fn start_draining(&self, id: &str, workload_id: &str) -> Result<bool, BrokerError> {
        let (_, changed) = self
            .update(id, |slot, now| {
                if slot.state != SlotState::Active || !slot.is_assigned_to(workload_id) {
                    return Ok(None);
                }
                Ok(Some(slot.transitioned(
                    SlotState::Draining,
                    slot.assigned_workload_id.clone(),
                    now,
                )?))
            })
            .await?;
        if changed {
            debug!(slot_id = %id, %workload_id, "no live viewers, slot draining");
        }
        Ok(changed)
    }

    /// DRAINING back to ACTIVE after a viewer of `workload_id` showed up
    /// again. Returns the current record either way; callers must check it is
    /// still paired with `workload_id`.
    pub async fn reactivate(&self, id: &str, workload_id: &str) -> Result<SlotRecord, BrokerError> {
        let (rec, changed) = self
            .update(id, |slot, now| {
                if slot.state != SlotState::Draining || !slot.is_assigned_to(workload_id) {
                    return Ok(None);
                }
                Ok(Some(slot.transitioned(
                    SlotState::Active,
                    slot.assigned_workload_id.clone(),
                    now,
                )?))
            })
            .await?;
        if changed {
            debug!(slot_id = %id, "viewer returned, slot active again");
        }
        Ok(rec)
    }

    /// Refreshes the last-status timestamp and detail without touching state.
    pub async fn record_status(
        &self,
        id: &str,
        detail: Option<&str>,
    ) -> Result<SlotRecord, BrokerError> {
        let (rec, _) = self
            .update(id, |slot, now| {
                let mut next = slot.clone();
                next.last_status_ms = now;
                next.last_status_detail = detail.map(str::to_string);
                Ok(Some(next))
            })
            .await?;
        Ok(rec)
    }

    /// ERROR to IDLE after the worker confirmed a reset. The slot rejoins the
    /// idle pool only if this call made the transition, so a confirmation
    /// that arrives twice cannot insert it twice.
    pub async fn complete_reset(&self, id: &str) -> Result<bool, BrokerError> {
        let (_, changed) = self
            .update(id, |slot, now| {
                if slot.state != SlotState::Error {
                    return Ok(None);
                }
                Ok(Some(slot.transitioned(SlotState::Idle, None, now)?))
            })
            .await?;
        if changed {
            self.ctx.store.set_add(keys::IDLE_POOL, id).await?;
            info!(slot_id = %id, "slot reset, back in idle pool");
        }
        Ok(changed)
    }
}

pub(crate) fn contended(id: &str) -> BrokerError {
    BrokerError::Conflict(format!("{id} is being modified concurrently, retry shortly"))
}

pub(crate) fn validate_id(kind: &str, id: &str) -> Result<(), BrokerError> {
    if id.is_empty() || id.len() > 128 || id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(BrokerError::InvalidRequest(format!(
            "{kind} id must be 1-128 characters without whitespace"
        )));
    }
    Ok(())
}
