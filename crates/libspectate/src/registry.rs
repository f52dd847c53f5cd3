use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use spectate_protocol::{BrokerEvent, WorkloadId, WorkloadStatus};

use crate::clock::elapsed;
use crate::config::MAX_PAGE_SIZE;
use crate::context::BrokerContext;
use crate::error::BrokerError;
use crate::keys;
use crate::slot::{MAX_CAS_ATTEMPTS, contended, validate_id};
use crate::store::{self, Versioned};

/// A simulation instance as stored.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkloadRecord {
    pub id: WorkloadId,
    pub address: String,
    /// Declared status. Readers use [`WorkloadRecord::effective_status`].
    pub status: WorkloadStatus,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub registered_at_ms: u64,
    pub last_heartbeat_ms: u64,
    #[serde(default)]
    pub last_tick: Option<u64>,
    #[serde(default)]
    pub offline_since_ms: Option<u64>,
}

impl WorkloadRecord {
    /// ONLINE only if declared so and heard from within the staleness window,
    /// whether or not the staleness monitor has run yet.
    pub fn effective_status(&self, now_ms: u64, ctx: &BrokerContext) -> WorkloadStatus {
        if self.status == WorkloadStatus::Online
            && elapsed(now_ms, self.last_heartbeat_ms) <= ctx.timeouts.staleness_window()
        {
            WorkloadStatus::Online
        } else {
            WorkloadStatus::Offline
        }
    }
}

/// Authoritative record of workloads.
#[derive(Clone)]
pub struct Registry {
    ctx: BrokerContext,
}

impl Registry {
    pub fn new(ctx: BrokerContext) -> Self {
        Self { ctx }
    }

    /// Creates or refreshes a workload. Last write wins on address and
    /// metadata, and registering counts as a heartbeat.
    pub async fn register(
        &self,
        id: &str,
        address: &str,
        metadata: serde_json::Value,
    ) -> Result<WorkloadRecord, BrokerError> {
        validate_id("workload", id)?;
        if address.is_empty() {
            return Err(BrokerError::InvalidRequest("address is required".to_string()));
        }
        let key = keys::workload(id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.ctx.now_ms();
            match self.get(id).await? {
                None => {
                    let rec = WorkloadRecord {
                        id: id.to_string(),
                        address: address.to_string(),
                        status: WorkloadStatus::Online,
                        metadata: metadata.clone(),
                        registered_at_ms: now,
                        last_heartbeat_ms: now,
                        last_tick: None,
                        offline_since_ms: None,
                    };
                    if store::insert_new(self.ctx.store.as_ref(), &key, &rec, None).await? {
                        info!(workload_id = %id, %address, "workload registered");
                        self.ctx.publish(BrokerEvent::WorkloadRegistered {
                            workload_id: id.to_string(),
                        });
                        return Ok(rec);
                    }
                }
                Some(current) => {
                    let was_online = current.value.effective_status(now, &self.ctx);
                    let mut next = current.value.clone();
                    next.address = address.to_string();
                    next.metadata = metadata.clone();
                    next.status = WorkloadStatus::Online;
                    next.last_heartbeat_ms = now;
                    next.offline_since_ms = None;
                    if store::swap(self.ctx.store.as_ref(), &key, &current, &next, None).await? {
                        debug!(workload_id = %id, "workload re-registered");
                        if was_online == WorkloadStatus::Offline {
                            self.ctx.publish(BrokerEvent::WorkloadOnline {
                                workload_id: id.to_string(),
                            });
                        }
                        return Ok(next);
                    }
                }
            }
        }
        Err(contended(id))
    }

    /// Refreshes liveness. A workload that had gone OFFLINE comes back ONLINE.
    pub async fn heartbeat(&self, id: &str, tick: Option<u64>) -> Result<WorkloadRecord, BrokerError> {
        let key = keys::workload(id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.ctx.now_ms();
            let current = self.require(id).await?;
            let was = current.value.effective_status(now, &self.ctx);
            let mut next = current.value.clone();
            next.status = WorkloadStatus::Online;
            next.last_heartbeat_ms = now;
            next.offline_since_ms = None;
            if tick.is_some() {
                next.last_tick = tick;
            }
            if store::swap(self.ctx.store.as_ref(), &key, &current, &next, None).await? {
                if was == WorkloadStatus::Offline {
                    info!(workload_id = %id, "workload back online");
                    self.ctx.publish(BrokerEvent::WorkloadOnline {
                        workload_id: id.to_string(),
                    });
                }
                return Ok(next);
            }
        }
        Err(contended(id))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Versioned<WorkloadRecord>>, BrokerError> {
        Ok(store::load(self.ctx.store.as_ref(), &keys::workload(id)).await?)
    }

    pub async fn require(&self, id: &str) -> Result<Versioned<WorkloadRecord>, BrokerError> {
        self.get(id)
            .await?
            .ok_or_else(|| BrokerError::WorkloadNotFound(id.to_string()))
    }

    /// The workload, provided it is effectively ONLINE right now.
    pub async fn require_online(&self, id: &str) -> Result<WorkloadRecord, BrokerError> {
        let rec = self.require(id).await?.value;
        match rec.effective_status(self.ctx.now_ms(), &self.ctx) {
            WorkloadStatus::Online => Ok(rec),
            WorkloadStatus::Offline => Err(BrokerError::WorkloadOffline(id.to_string())),
        }
    }

    /// One page of workloads in id order, starting after `cursor`. Returns
    /// the page and the cursor for the next one.
    pub async fn page(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<WorkloadRecord>, Option<String>), BrokerError> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let after = cursor.map(keys::workload);
        let mut rows = self
            .ctx
            .store
            .scan(keys::WORKLOAD_PREFIX, after.as_deref(), limit + 1)
            .await?;
        let more = rows.len() > limit;
        rows.truncate(limit);

        let mut items = Vec::with_capacity(rows.len());
        for (key, raw) in rows {
            match store::decode::<WorkloadRecord>(&key, raw) {
                Ok(v) => items.push(v.value),
                Err(e) => warn!(key = %key, error = %e, "skipping undecodable workload record"),
            }
        }
        let next = if more {
            items.last().map(|w| w.id.clone())
        } else {
            None
        };
        Ok((items, next))
    }

    /// Every workload, walking all pages.
    pub async fn all(&self) -> Result<Vec<WorkloadRecord>, BrokerError> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let (items, next) = self.page(cursor.as_deref(), MAX_PAGE_SIZE).await?;
            all.extend(items);
            match next {
                Some(next) => cursor = Some(next),
                None => return Ok(all),
            }
        }
    }

    /// Declares a workload OFFLINE if it still looks stale when written.
    /// Returns whether this call made the change.
    pub(crate) async fn mark_offline(&self, id: &str) -> Result<bool, BrokerError> {
        let key = keys::workload(id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.ctx.now_ms();
            let Some(current) = self.get(id).await? else {
                return Ok(false);
            };
            if current.value.status == WorkloadStatus::Offline
                || current.value.effective_status(now, &self.ctx) == WorkloadStatus::Online
            {
                return Ok(false);
            }
            let mut next = current.value.clone();
            next.status = WorkloadStatus::Offline;
            next.offline_since_ms = Some(now);
            if store::swap(self.ctx.store.as_ref(), &key, &current, &next, None).await? {
                info!(
                    workload_id = %id,
                    silent_ms = now.saturating_sub(current.value.last_heartbeat_ms),
                    "workload marked offline"
                );
                self.ctx.publish(BrokerEvent::WorkloadOffline {
                    workload_id: id.to_string(),
                });
                return Ok(true);
            }
        }
        Err(contended(id))
    }

    /// Deletes a workload that is still exactly the record the caller judged
    /// purgeable.
    pub(crate) async fn purge(&self, current: &Versioned<WorkloadRecord>) -> Result<bool, BrokerError> {
        let id = &current.value.id;
        let removed = store::remove(self.ctx.store.as_ref(), &keys::workload(id), current).await?;
        if removed {
            info!(workload_id = %id, "workload purged");
            self.ctx.publish(BrokerEvent::WorkloadPurged {
                workload_id: id.clone(),
            });
        }
        Ok(removed)
    }
}
