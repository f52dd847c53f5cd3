//! The broker's public operations, wired over one shared store.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use spectate_protocol::{
    Ack, BrokerEvent, HealthResponse, LeaseHeartbeatResponse, RegisterSlotRequest,
    RegisterWorkloadRequest, SlotState, SlotStatusReportRequest, SlotView, StatusResponse,
    WatchResponse, WorkerReportedState, WorkloadPage, WorkloadStatus, WorkloadView,
};

use crate::assignment::AssignmentEngine;
use crate::clock::{SharedClock, SystemClock};
use crate::config::BrokerConfig;
use crate::context::BrokerContext;
use crate::error::BrokerError;
use crate::events::EventBroker;
use crate::keys;
use crate::lease::{LeaseManager, LeaseTarget};
use crate::registry::{Registry, WorkloadRecord};
use crate::slot::{SlotRecord, SlotTable};
use crate::store::{self, SharedStore};
use crate::supervisor::Supervisor;
use crate::worker::{HttpWorkerControl, WorkerControl};

#[derive(Clone)]
pub struct Broker {
    ctx: BrokerContext,
    registry: Registry,
    slots: SlotTable,
    leases: LeaseManager,
    assignment: AssignmentEngine,
    supervisor: Supervisor,
    config: Arc<BrokerConfig>,
}

impl Broker {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        worker: Arc<dyn WorkerControl>,
        config: &BrokerConfig,
    ) -> Self {
        let events = EventBroker::new(config.event_capacity);
        let ctx = BrokerContext::new(store, clock, config.timeouts.clone(), events);
        let registry = Registry::new(ctx.clone());
        let slots = SlotTable::new(ctx.clone());
        let leases = LeaseManager::new(ctx.clone());
        let assignment = AssignmentEngine::new(
            ctx.clone(),
            registry.clone(),
            slots.clone(),
            leases.clone(),
            worker.clone(),
        );
        let supervisor = Supervisor::new(
            ctx.clone(),
            registry.clone(),
            slots.clone(),
            leases.clone(),
            assignment.clone(),
            worker,
            config.supervisor.clone(),
        );
        Self {
            ctx,
            registry,
            slots,
            leases,
            assignment,
            supervisor,
            config: Arc::new(config.clone()),
        }
    }

    /// A broker on the configured store, the system clock and HTTP workers.
    pub fn open(config: &BrokerConfig) -> Result<Self, BrokerError> {
        config.validate()?;
        let clock: SharedClock = Arc::new(SystemClock);
        let store = store::open(&config.store, clock.clone())?;
        Ok(Self::new(
            store,
            clock,
            Arc::new(HttpWorkerControl::new()),
            config,
        ))
    }

    /// Registers every configured slot. Slots already known keep their
    /// state and pairing.
    pub async fn seed_slots(&self) -> Result<usize, BrokerError> {
        let seeds = self.config.slot_seeds();
        for seed in &seeds {
            self.slots
                .register(&seed.id, &seed.control_url, &seed.stream_endpoint)
                .await?;
        }
        if !seeds.is_empty() {
            info!(count = seeds.len(), "configured slots registered");
        }
        Ok(seeds.len())
    }

    pub fn context(&self) -> &BrokerContext {
        &self.ctx
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn assignment(&self) -> &AssignmentEngine {
        &self.assignment
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn events(&self) -> &EventBroker {
        &self.ctx.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.ctx.events.subscribe()
    }

    // -- workloads --

    pub async fn register_workload(&self, req: RegisterWorkloadRequest) -> Result<Ack, BrokerError> {
        self.registry
            .register(&req.id, &req.address, req.metadata)
            .await?;
        Ok(Ack::ok())
    }

    pub async fn workload_heartbeat(&self, id: &str, tick: Option<u64>) -> Result<Ack, BrokerError> {
        self.registry.heartbeat(id, tick).await?;
        Ok(Ack::ok())
    }

    pub async fn get_workload(&self, id: &str) -> Result<WorkloadView, BrokerError> {
        let rec = self.registry.require(id).await?.value;
        self.workload_view(&rec).await
    }

    pub async fn list_workloads(
        &self,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<WorkloadPage, BrokerError> {
        let limit = limit.unwrap_or(self.config.page_size);
        let (records, next_cursor) = self.registry.page(cursor, limit).await?;
        let mut items = Vec::with_capacity(records.len());
        for rec in &records {
            items.push(self.workload_view(rec).await?);
        }
        Ok(WorkloadPage { items, next_cursor })
    }

    async fn workload_view(&self, rec: &WorkloadRecord) -> Result<WorkloadView, BrokerError> {
        let slot = self.assignment.pairing_of(&rec.id).await?;
        let viewer_count = self.leases.live_count(LeaseTarget::Workload(&rec.id)).await?;
        Ok(WorkloadView {
            id: rec.id.clone(),
            address: rec.address.clone(),
            status: rec.effective_status(self.ctx.now_ms(), &self.ctx),
            metadata: rec.metadata.clone(),
            last_heartbeat_ms: rec.last_heartbeat_ms,
            last_tick: rec.last_tick,
            has_slot: slot.is_some(),
            slot_id: slot.map(|s| s.id),
            viewer_count,
        })
    }

    // -- viewers --

    /// Running out of idle slots is a normal answer, not an error.
    pub async fn request_watch(
        &self,
        workload_id: &str,
        client_hint: Option<String>,
    ) -> Result<WatchResponse, BrokerError> {
        match self.assignment.request_watch(workload_id, client_hint).await {
            Ok(ticket) => Ok(ticket.to_response(self.ctx.timeouts.lease_ttl_ms)),
            Err(BrokerError::NoCapacity) => {
                info!(%workload_id, "watch refused, no idle slot");
                Ok(WatchResponse::no_capacity())
            }
            Err(e) => Err(e),
        }
    }

    /// Refreshes a viewer lease. A lease whose slot has since been
    /// reassigned or reset is released and reported stale.
    pub async fn viewer_heartbeat(&self, lease_id: &str) -> Result<LeaseHeartbeatResponse, BrokerError> {
        let lease = self.leases.heartbeat(lease_id).await?;
        let slot = match self.slots.get(&lease.slot_id).await? {
            Some(slot) if slot.value.state == SlotState::Draining => {
                Some(self.slots.reactivate(&slot.value.id, &lease.workload_id).await?)
            }
            slot => slot.map(|v| v.value),
        };
        let slot = match slot {
            Some(slot) if slot.is_assigned_to(&lease.workload_id) => slot,
            _ => {
                warn!(%lease_id, slot_id = %lease.slot_id, "lease outlived its pairing");
                self.leases.release(lease_id).await?;
                return Err(BrokerError::LeaseStale(lease_id.to_string()));
            }
        };
        Ok(LeaseHeartbeatResponse {
            lease_id: lease.id.clone(),
            slot_id: slot.id,
            slot_state: slot.state,
            expires_at_ms: lease.expires_at_ms(self.ctx.timeouts.lease_ttl()),
        })
    }

    pub async fn release_lease(&self, lease_id: &str) -> Result<Ack, BrokerError> {
        self.leases.release(lease_id).await?;
        Ok(Ack::ok())
    }

    // -- slots --

    pub async fn register_slot(&self, req: RegisterSlotRequest) -> Result<SlotView, BrokerError> {
        let slot = self
            .slots
            .register(&req.id, &req.control_url, &req.stream_endpoint)
            .await?;
        self.slot_view(&slot).await
    }

    pub async fn get_slot(&self, id: &str) -> Result<SlotView, BrokerError> {
        let slot = self.slots.require(id).await?.value;
        self.slot_view(&slot).await
    }

    pub async fn list_slots(&self) -> Result<Vec<SlotView>, BrokerError> {
        let mut views = Vec::new();
        for slot in self.slots.list().await? {
            views.push(self.slot_view(&slot).await?);
        }
        Ok(views)
    }

    async fn slot_view(&self, slot: &SlotRecord) -> Result<SlotView, BrokerError> {
        let viewers = match slot.assigned_workload_id.as_deref() {
            Some(workload_id) => self.leases.live_count_bound(workload_id, &slot.id).await?,
            None => 0,
        };
        Ok(slot.to_view(viewers))
    }

    /// The worker's own view of itself. Always refreshes the slot's status
    /// timestamp; `streaming` confirms a STARTING slot, `failed` errors an
    /// assigned one and `idle` confirms a pending reset.
    pub async fn slot_status_report(
        &self,
        id: &str,
        req: SlotStatusReportRequest,
    ) -> Result<SlotView, BrokerError> {
        let slot = self.slots.record_status(id, req.detail.as_deref()).await?;
        let slot = match (req.state, slot.state) {
            (WorkerReportedState::Streaming, SlotState::Starting) => self.slots.mark_ready(id).await?,
            (WorkerReportedState::Failed, state) if state.is_assigned() => {
                let detail = req.detail.as_deref().unwrap_or("worker reported failure");
                self.assignment.fail(id, detail).await?;
                self.slots.require(id).await?.value
            }
            (WorkerReportedState::Idle, SlotState::Error) => {
                self.slots.complete_reset(id).await?;
                self.slots.require(id).await?.value
            }
            _ => slot,
        };
        self.slot_view(&slot).await
    }

    pub async fn slot_ready(&self, id: &str) -> Result<SlotView, BrokerError> {
        let slot = self.slots.mark_ready(id).await?;
        self.slot_view(&slot).await
    }

    /// Worker-reported failure. Tears the pairing down into ERROR; repeating
    /// it on an ERROR slot is a no-op and an IDLE slot has nothing to fail.
    pub async fn slot_error(&self, id: &str, reason: &str) -> Result<SlotView, BrokerError> {
        let slot = self.slots.require(id).await?.value;
        match slot.state {
            SlotState::Error => {}
            SlotState::Idle => {
                return Err(BrokerError::IllegalTransition {
                    slot_id: id.to_string(),
                    from: SlotState::Idle,
                    to: SlotState::Error,
                });
            }
            _ => {
                self.assignment.fail(id, reason).await?;
            }
        }
        let slot = self.slots.require(id).await?.value;
        self.slot_view(&slot).await
    }

    // -- operator --

    pub async fn status(&self) -> Result<StatusResponse, BrokerError> {
        let mut status = StatusResponse {
            idle_pool: self.ctx.store.set_len(keys::IDLE_POOL).await?,
            ..Default::default()
        };
        for slot in self.slots.list().await? {
            status.total_slots += 1;
            match slot.state {
                SlotState::Idle => status.idle += 1,
                SlotState::Starting => status.starting += 1,
                SlotState::Active => status.active += 1,
                SlotState::Draining => status.draining += 1,
                SlotState::Error => status.error += 1,
            }
        }
        let now = self.ctx.now_ms();
        for workload in self.registry.all().await? {
            match workload.effective_status(now, &self.ctx) {
                WorkloadStatus::Online => status.workloads_online += 1,
                WorkloadStatus::Offline => status.workloads_offline += 1,
            }
        }
        Ok(status)
    }

    pub async fn health(&self) -> HealthResponse {
        match self.ctx.store.ping().await {
            Ok(()) => HealthResponse {
                status: "ok".to_string(),
                store: true,
            },
            Err(e) => {
                warn!(error = %e, "store ping failed");
                HealthResponse {
                    status: "degraded".to_string(),
                    store: false,
                }
            }
        }
    }
}
