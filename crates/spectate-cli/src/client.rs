use anyhow::{Context, Result, bail};
use reqwest::{Method, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;

use spectate_protocol::{
    Ack, ErrorBody, HealthResponse, LeaseHeartbeatResponse, RegisterSlotRequest,
    RegisterWorkloadRequest, RequestWatchRequest, SlotErrorRequest, SlotStatusReportRequest, SlotView,
    StatusResponse, WatchResponse, WorkloadHeartbeatRequest, WorkloadPage, WorkloadView,
};

/// Thin typed wrapper over the broker's HTTP API.
pub struct BrokerClient {
    base: String,
    http: reqwest::Client,
}

impl BrokerClient {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.base);
        tracing::debug!(%method, %url, "broker request");
        self.http.request(method, url)
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = req
            .send()
            .await
            .with_context(|| format!("failed to reach broker at {}", self.base))?;
        let status = resp.status();
        if status.is_success() {
            return resp.json().await.context("invalid response from broker");
        }
        let body = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(err) => bail!("{} ({status})", err.error),
            Err(_) => bail!("broker returned {status}: {body}"),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.request(Method::GET, path)).await
    }

    async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        self.send(self.request(Method::POST, path).json(body)).await
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        self.get("/api/status").await
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        self.get("/health").await
    }

    pub async fn list_workloads(&self, cursor: Option<&str>, limit: Option<usize>) -> Result<WorkloadPage> {
        let mut req = self.request(Method::GET, "/api/workloads");
        if let Some(cursor) = cursor {
            req = req.query(&[("cursor", cursor)]);
        }
        if let Some(limit) = limit {
            req = req.query(&[("limit", limit)]);
        }
        self.send(req).await
    }

    pub async fn get_workload(&self, id: &str) -> Result<WorkloadView> {
        self.get(&format!("/api/workloads/{id}")).await
    }

    pub async fn register_workload(&self, req: &RegisterWorkloadRequest) -> Result<Ack> {
        self.post("/api/workloads", req).await
    }

    pub async fn workload_heartbeat(&self, id: &str, tick: Option<u64>) -> Result<Ack> {
        self.post(
            &format!("/api/workloads/{id}/heartbeat"),
            &WorkloadHeartbeatRequest { tick },
        )
        .await
    }

    pub async fn request_watch(&self, id: &str, client_hint: Option<&str>) -> Result<WatchResponse> {
        self.post(
            &format!("/api/workloads/{id}/watch"),
            &RequestWatchRequest {
                client_hint: client_hint.map(str::to_string),
            },
        )
        .await
    }

    pub async fn lease_heartbeat(&self, lease_id: &str) -> Result<LeaseHeartbeatResponse> {
        self.send(self.request(Method::POST, &format!("/api/leases/{lease_id}/heartbeat")))
            .await
    }

    pub async fn release_lease(&self, lease_id: &str) -> Result<Ack> {
        self.send(self.request(Method::DELETE, &format!("/api/leases/{lease_id}")))
            .await
    }

    pub async fn list_slots(&self) -> Result<Vec<SlotView>> {
        self.get("/api/slots").await
    }

    pub async fn register_slot(&self, req: &RegisterSlotRequest) -> Result<SlotView> {
        self.post("/api/slots", req).await
    }

    pub async fn slot_ready(&self, id: &str) -> Result<SlotView> {
        self.send(self.request(Method::POST, &format!("/api/slots/{id}/ready")))
            .await
    }

    pub async fn slot_error(&self, id: &str, reason: &str) -> Result<SlotView> {
        let body = SlotErrorRequest {
            reason: reason.to_string(),
        };
        self.post(&format!("/api/slots/{id}/error"), &body).await
    }

    pub async fn slot_status(&self, id: &str, req: &SlotStatusReportRequest) -> Result<SlotView> {
        self.post(&format!("/api/slots/{id}/status"), req).await
    }
}
