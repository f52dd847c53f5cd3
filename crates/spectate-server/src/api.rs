use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::de::DeserializeOwned;

use libspectate::BrokerError;
use spectate_protocol::{
    Ack, ErrorBody, ErrorCode, HealthResponse, LeaseHeartbeatResponse, ListWorkloadsQuery,
    RegisterSlotRequest, RegisterWorkloadRequest, RequestWatchRequest, SlotErrorRequest,
    SlotStatusReportRequest, SlotView, StatusResponse, WatchResponse, WorkloadHeartbeatRequest,
    WorkloadPage, WorkloadView,
};

use crate::AppState;

/// A broker error rendered as `{"error", "code"}` with the matching status.
#[derive(Debug)]
pub struct ApiError(pub BrokerError);

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        Self(err)
    }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::NoCapacity => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::AttachFailed => StatusCode::BAD_GATEWAY,
        ErrorCode::Expired | ErrorCode::Stale => StatusCode::GONE,
        ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, error) = self.0.to_error_code();
        let status = status_for(code);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, "request rejected");
        }
        (status, Json(ErrorBody { error, code })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn body<T: DeserializeOwned>(bytes: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(bytes)
        .map_err(|e| ApiError(BrokerError::InvalidRequest(format!("invalid JSON body: {e}"))))
}

/// Like [`body`], but an empty body means all defaults.
fn optional_body<T: DeserializeOwned + Default>(bytes: &Bytes) -> Result<T, ApiError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    body(bytes)
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let health = state.broker.health().await;
    let status = if health.store {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

/// GET /api/status
pub async fn status(State(state): State<Arc<AppState>>) -> ApiResult<StatusResponse> {
    Ok(Json(state.broker.status().await?))
}

/// POST /api/workloads
pub async fn register_workload(State(state): State<Arc<AppState>>, bytes: Bytes) -> ApiResult<Ack> {
    let req: RegisterWorkloadRequest = body(&bytes)?;
    Ok(Json(state.broker.register_workload(req).await?))
}

/// GET /api/workloads?cursor=&limit=
pub async fn list_workloads(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListWorkloadsQuery>,
) -> ApiResult<WorkloadPage> {
    Ok(Json(
        state
            .broker
            .list_workloads(query.cursor.as_deref(), query.limit)
            .await?,
    ))
}

/// GET /api/workloads/{id}
pub async fn get_workload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<WorkloadView> {
    Ok(Json(state.broker.get_workload(&id).await?))
}

/// POST /api/workloads/{id}/heartbeat
pub async fn workload_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    bytes: Bytes,
) -> ApiResult<Ack> {
    let req: WorkloadHeartbeatRequest = optional_body(&bytes)?;
    Ok(Json(state.broker.workload_heartbeat(&id, req.tick).await?))
}

/// POST /api/workloads/{id}/watch
pub async fn request_watch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    bytes: Bytes,
) -> ApiResult<WatchResponse> {
    let req: RequestWatchRequest = optional_body(&bytes)?;
    Ok(Json(state.broker.request_watch(&id, req.client_hint).await?))
}

/// POST /api/leases/{id}/heartbeat
pub async fn lease_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<LeaseHeartbeatResponse> {
    Ok(Json(state.broker.viewer_heartbeat(&id).await?))
}

/// DELETE /api/leases/{id}
pub async fn release_lease(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Ack> {
    Ok(Json(state.broker.release_lease(&id).await?))
}

/// POST /api/slots
pub async fn register_slot(State(state): State<Arc<AppState>>, bytes: Bytes) -> ApiResult<SlotView> {
    let req: RegisterSlotRequest = body(&bytes)?;
    Ok(Json(state.broker.register_slot(req).await?))
}

/// GET /api/slots
pub async fn list_slots(State(state): State<Arc<AppState>>) -> ApiResult<Vec<SlotView>> {
    Ok(Json(state.broker.list_slots().await?))
}

/// GET /api/slots/{id}
pub async fn get_slot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<SlotView> {
    Ok(Json(state.broker.get_slot(&id).await?))
}

/// POST /api/slots/{id}/status
pub async fn slot_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    bytes: Bytes,
) -> ApiResult<SlotView> {
    let req: SlotStatusReportRequest = body(&bytes)?;
    Ok(Json(state.broker.slot_status_report(&id, req).await?))
}

/// POST /api/slots/{id}/ready
pub async fn slot_ready(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<SlotView> {
    Ok(Json(state.broker.slot_ready(&id).await?))
}

/// POST /api/slots/{id}/error
pub async fn slot_error(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    bytes: Bytes,
) -> ApiResult<SlotView> {
    let req: SlotErrorRequest = body(&bytes)?;
    Ok(Json(state.broker.slot_error(&id, &req.reason).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_statuses() {
        assert_eq!(status_for(ErrorCode::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorCode::Expired), StatusCode::GONE);
        assert_eq!(status_for(ErrorCode::Stale), StatusCode::GONE);
        assert_eq!(status_for(ErrorCode::AttachFailed), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(ErrorCode::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn empty_optional_body_is_default() {
        let req: WorkloadHeartbeatRequest = optional_body(&Bytes::from_static(b" \n")).expect("empty");
        assert_eq!(req.tick, None);
        let req: WorkloadHeartbeatRequest =
            optional_body(&Bytes::from_static(br#"{"tick": 7}"#)).expect("tick");
        assert_eq!(req.tick, Some(7));
        assert!(body::<RegisterSlotRequest>(&Bytes::from_static(b"{")).is_err());
    }
}
