use std::time::Duration;

use spectate_protocol::{ErrorCode, LeaseId, SlotId, SlotState, WorkloadId};
use thiserror::Error;

/// Failures of the state store itself.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("store task failed: {0}")]
    Task(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Failures talking to a worker's control endpoint.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker unreachable: {0}")]
    Transport(String),

    #[error("worker rejected command with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("worker did not answer within {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("workload not found: {0}")]
    WorkloadNotFound(WorkloadId),

    #[error("workload is offline: {0}")]
    WorkloadOffline(WorkloadId),

    #[error("slot not found: {0}")]
    SlotNotFound(SlotId),

    #[error("lease not found: {0}")]
    LeaseNotFound(LeaseId),

    #[error("lease expired: {0}")]
    LeaseExpired(LeaseId),

    #[error("lease {0} is no longer bound to a live pairing")]
    LeaseStale(LeaseId),

    #[error("illegal transition for slot {slot_id}: {from} -> {to}")]
    IllegalTransition {
        slot_id: SlotId,
        from: SlotState,
        to: SlotState,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no idle slot available")]
    NoCapacity,

    #[error("worker attach failed for slot {slot_id}: {reason}")]
    AttachFailed { slot_id: SlotId, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl BrokerError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            BrokerError::WorkloadNotFound(_)
            | BrokerError::WorkloadOffline(_)
            | BrokerError::SlotNotFound(_)
            | BrokerError::LeaseNotFound(_) => (ErrorCode::NotFound, self.to_string()),
            BrokerError::LeaseExpired(_) => (ErrorCode::Expired, self.to_string()),
            BrokerError::LeaseStale(_) => (ErrorCode::Stale, self.to_string()),
            BrokerError::IllegalTransition { .. } | BrokerError::Conflict(_) => {
                (ErrorCode::Conflict, self.to_string())
            }
            BrokerError::NoCapacity => (ErrorCode::NoCapacity, self.to_string()),
            BrokerError::AttachFailed { .. } => (ErrorCode::AttachFailed, self.to_string()),
            BrokerError::InvalidRequest(_) => (ErrorCode::InvalidRequest, self.to_string()),
            BrokerError::Store(_) => (ErrorCode::Internal, "internal store error".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_sanitized() {
        let err = BrokerError::from(StoreError::Backend("disk I/O error at /var/x".to_string()));
        let (code, message) = err.to_error_code();
        assert_eq!(code, ErrorCode::Internal);
        assert!(!message.contains("/var/x"));
    }

    #[test]
    fn offline_workload_reads_as_not_found() {
        let (code, _) = BrokerError::WorkloadOffline("w1".to_string()).to_error_code();
        assert_eq!(code, ErrorCode::NotFound);
    }
}
