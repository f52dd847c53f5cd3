pub mod paths;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a running simulation instance.
pub type WorkloadId = String;
/// Opaque identifier of a render/streaming worker.
pub type SlotId = String;
/// Opaque viewer capability token.
pub type LeaseId = String;

/// Declared liveness of a workload.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadStatus {
    Online,
    Offline,
}

/// Lifecycle state of a slot.
///
/// `Idle -> Starting -> Active -> Draining -> Idle` is the happy path.
/// `Error` is entered from any assigned state and only leaves through a reset.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Idle,
    Starting,
    Active,
    Draining,
    Error,
}

impl SlotState {
    /// States in which a slot holds a workload.
    pub const ASSIGNED: [SlotState; 3] = [SlotState::Starting, SlotState::Active, SlotState::Draining];

    pub fn is_assigned(self) -> bool {
        Self::ASSIGNED.contains(&self)
    }

    /// The full transition table. Every slot write is checked against it.
    ///
    /// Assigned states may also fall straight back to `Idle`: that is the
    /// pairing teardown path (attach failure, workload gone offline).
    pub fn can_transition_to(self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Active)
                | (Active, Draining)
                | (Draining, Active)
                | (Starting, Idle)
                | (Active, Idle)
                | (Draining, Idle)
                | (Starting, Error)
                | (Active, Error)
                | (Draining, Error)
                | (Error, Idle)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SlotState::Idle => "idle",
            SlotState::Starting => "starting",
            SlotState::Active => "active",
            SlotState::Draining => "draining",
            SlotState::Error => "error",
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a watch request as seen by the viewer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WatchStatus {
    Ready,
    Starting,
    NoCapacity,
}

/// A worker's own view of what it is doing, sent with status reports.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerReportedState {
    Idle,
    Attaching,
    Streaming,
    Failed,
}

/// Why a pairing was torn down.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Drained,
    WorkloadOffline,
    SlotError,
    AttachFailed,
    Diverged,
}

/// Commands the broker sends to a worker's control endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkerCommand {
    Attach {
        workload_id: WorkloadId,
        address: String,
    },
    Detach {
        workload_id: WorkloadId,
    },
    Reset,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RegisterWorkloadRequest {
    pub id: WorkloadId,
    pub address: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct WorkloadHeartbeatRequest {
    #[serde(default)]
    pub tick: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RequestWatchRequest {
    #[serde(default)]
    pub client_hint: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RegisterSlotRequest {
    pub id: SlotId,
    pub control_url: String,
    pub stream_endpoint: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SlotStatusReportRequest {
    pub state: WorkerReportedState,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SlotErrorRequest {
    pub reason: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ListWorkloadsQuery {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

/// Workload as returned by list/get, with computed pairing and viewer fields.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkloadView {
    pub id: WorkloadId,
    pub address: String,
    pub status: WorkloadStatus,
    pub metadata: serde_json::Value,
    pub last_heartbeat_ms: u64,
    #[serde(default)]
    pub last_tick: Option<u64>,
    pub has_slot: bool,
    #[serde(default)]
    pub slot_id: Option<SlotId>,
    pub viewer_count: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkloadPage {
    pub items: Vec<WorkloadView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SlotView {
    pub id: SlotId,
    pub state: SlotState,
    #[serde(default)]
    pub assigned_workload_id: Option<WorkloadId>,
    pub control_url: String,
    pub stream_endpoint: String,
    pub state_since_ms: u64,
    pub last_status_ms: u64,
    #[serde(default)]
    pub last_status_detail: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub viewer_count: usize,
}

/// Result of a watch request. Only `status` is present for `no_capacity`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WatchResponse {
    pub status: WatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<LeaseId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_id: Option<SlotId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_ttl_ms: Option<u64>,
}

impl WatchResponse {
    pub fn no_capacity() -> Self {
        Self {
            status: WatchStatus::NoCapacity,
            lease_id: None,
            slot_id: None,
            stream_endpoint: None,
            lease_ttl_ms: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LeaseHeartbeatResponse {
    pub lease_id: LeaseId,
    pub slot_id: SlotId,
    pub slot_state: SlotState,
    pub expires_at_ms: u64,
}

/// Pool and population counters.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusResponse {
    pub total_slots: usize,
    pub idle_pool: usize,
    pub idle: usize,
    pub starting: usize,
    pub active: usize,
    pub draining: usize,
    pub error: usize,
    pub workloads_online: usize,
    pub workloads_offline: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthResponse {
    pub status: String,
    pub store: bool,
}

/// JSON error body returned with every non-2xx response.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorBody {
    pub error: String,
    pub code: ErrorCode,
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Conflict,
    NoCapacity,
    AttachFailed,
    Expired,
    Stale,
    InvalidRequest,
    Internal,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// State changes published by the broker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BrokerEvent {
    WorkloadRegistered {
        workload_id: WorkloadId,
    },
    WorkloadOnline {
        workload_id: WorkloadId,
    },
    WorkloadOffline {
        workload_id: WorkloadId,
    },
    WorkloadPurged {
        workload_id: WorkloadId,
    },
    SlotRegistered {
        slot_id: SlotId,
    },
    SlotTransition {
        slot_id: SlotId,
        from: SlotState,
        to: SlotState,
        #[serde(default)]
        workload_id: Option<WorkloadId>,
    },
    PairingCreated {
        workload_id: WorkloadId,
        slot_id: SlotId,
    },
    PairingReleased {
        workload_id: WorkloadId,
        slot_id: SlotId,
        reason: ReleaseReason,
    },
    LeaseCreated {
        lease_id: LeaseId,
        workload_id: WorkloadId,
        slot_id: SlotId,
    },
    LeaseReleased {
        lease_id: LeaseId,
        workload_id: WorkloadId,
    },
    LeaseExpired {
        lease_id: LeaseId,
        workload_id: WorkloadId,
    },
}

impl BrokerEvent {
    /// The workload an event concerns, if any. Used for subscriber filtering.
    pub fn workload_id(&self) -> Option<&str> {
        match self {
            BrokerEvent::WorkloadRegistered { workload_id }
            | BrokerEvent::WorkloadOnline { workload_id }
            | BrokerEvent::WorkloadOffline { workload_id }
            | BrokerEvent::WorkloadPurged { workload_id }
            | BrokerEvent::PairingCreated { workload_id, .. }
            | BrokerEvent::PairingReleased { workload_id, .. }
            | BrokerEvent::LeaseCreated { workload_id, .. }
            | BrokerEvent::LeaseReleased { workload_id, .. }
            | BrokerEvent::LeaseExpired { workload_id, .. } => Some(workload_id),
            BrokerEvent::SlotTransition { workload_id, .. } => workload_id.as_deref(),
            BrokerEvent::SlotRegistered { .. } => None,
        }
    }
}

/// Frames sent on the `/ws/events` stream.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventStreamMessage {
    Subscribed {
        #[serde(default)]
        workload: Option<WorkloadId>,
    },
    Event(BrokerEvent),
    Lagged {
        skipped: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_transition_table() {
        use SlotState::*;
        assert!(Idle.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Active));
        assert!(Active.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Active));
        assert!(Draining.can_transition_to(Idle));
        assert!(Error.can_transition_to(Idle));

        assert!(!Idle.can_transition_to(Active));
        assert!(!Idle.can_transition_to(Error));
        assert!(!Error.can_transition_to(Active));
        assert!(!Error.can_transition_to(Starting));
        assert!(!Active.can_transition_to(Starting));
    }

    #[test]
    fn assigned_states() {
        assert!(!SlotState::Idle.is_assigned());
        assert!(!SlotState::Error.is_assigned());
        assert!(SlotState::Starting.is_assigned());
        assert!(SlotState::Active.is_assigned());
        assert!(SlotState::Draining.is_assigned());
    }

    #[test]
    fn worker_command_tag_format() {
        let cmd = WorkerCommand::Attach {
            workload_id: "w1".to_string(),
            address: "10.0.0.5:7000".to_string(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(
            json,
            r#"{"command":"attach","workload_id":"w1","address":"10.0.0.5:7000"}"#
        );
        assert_eq!(
            serde_json::to_string(&WorkerCommand::Reset).unwrap(),
            r#"{"command":"reset"}"#
        );
    }

    #[test]
    fn no_capacity_serializes_bare_status() {
        let json = serde_json::to_string(&WatchResponse::no_capacity()).unwrap();
        assert_eq!(json, r#"{"status":"no_capacity"}"#);
    }

    #[test]
    fn event_stream_message_flattens_event() {
        let msg = EventStreamMessage::Event(BrokerEvent::PairingCreated {
            workload_id: "w1".to_string(),
            slot_id: "s1".to_string(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"event""#));
        assert!(json.contains(r#""event":"pairing_created""#));
        let parsed: EventStreamMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            EventStreamMessage::Event(BrokerEvent::PairingCreated { slot_id, .. }) => {
                assert_eq!(slot_id, "s1");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn event_workload_filter_key() {
        let evt = BrokerEvent::SlotTransition {
            slot_id: "s1".to_string(),
            from: SlotState::Idle,
            to: SlotState::Starting,
            workload_id: Some("w1".to_string()),
        };
        assert_eq!(evt.workload_id(), Some("w1"));
        let evt = BrokerEvent::SlotRegistered {
            slot_id: "s1".to_string(),
        };
        assert_eq!(evt.workload_id(), None);
    }

    #[test]
    fn request_defaults() {
        let req: RegisterWorkloadRequest =
            serde_json::from_str(r#"{"id":"w1","address":"sim-1:9000"}"#).unwrap();
        assert!(req.metadata.is_null());
        let hb: WorkloadHeartbeatRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(hb.tick, None);
    }

    #[test]
    fn all_error_codes_roundtrip() {
        let codes = vec![
            ErrorCode::NotFound,
            ErrorCode::Conflict,
            ErrorCode::NoCapacity,
            ErrorCode::AttachFailed,
            ErrorCode::Expired,
            ErrorCode::Stale,
            ErrorCode::InvalidRequest,
            ErrorCode::Internal,
        ];
        for code in codes {
            let json = serde_json::to_string(&code).unwrap();
            let parsed: ErrorCode = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, code);
        }
    }
}
