use std::time::Duration;

use async_trait::async_trait;

use spectate_protocol::WorkerCommand;

use crate::error::WorkerError;
use crate::slot::SlotRecord;

/// How the broker drives render workers. Calls are always made without
/// holding any store lock.
#[async_trait]
pub trait WorkerControl: Send + Sync {
    async fn send(
        &self,
        slot: &SlotRecord,
        command: &WorkerCommand,
        timeout: Duration,
    ) -> Result<(), WorkerError>;

    /// Succeeds if the worker answers its health endpoint.
    async fn probe(&self, slot: &SlotRecord, timeout: Duration) -> Result<(), WorkerError>;
}

/// Posts commands as JSON to `{control_url}/command` and probes
/// `{control_url}/health`.
#[derive(Clone, Default)]
pub struct HttpWorkerControl {
    client: reqwest::Client,
}

impl HttpWorkerControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn url(slot: &SlotRecord, path: &str) -> String {
        format!("{}/{path}", slot.control_url.trim_end_matches('/'))
    }
}

fn map_err(err: reqwest::Error, timeout: Duration) -> WorkerError {
    if err.is_timeout() {
        WorkerError::Timeout(timeout)
    } else {
        WorkerError::Transport(err.to_string())
    }
}

async fn check(resp: reqwest::Response) -> Result<(), WorkerError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(WorkerError::Rejected {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl WorkerControl for HttpWorkerControl {
    async fn send(
        &self,
        slot: &SlotRecord,
        command: &WorkerCommand,
        timeout: Duration,
    ) -> Result<(), WorkerError> {
        let resp = self
            .client
            .post(Self::url(slot, "command"))
            .timeout(timeout)
            .json(command)
            .send()
            .await
            .map_err(|e| map_err(e, timeout))?;
        check(resp).await
    }

    async fn probe(&self, slot: &SlotRecord, timeout: Duration) -> Result<(), WorkerError> {
        let resp = self
            .client
            .get(Self::url(slot, "health"))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_err(e, timeout))?;
        check(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned HTTP response and hands back the raw request.
    async fn one_shot(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 8192];
            let mut request = Vec::new();
            loop {
                let n = sock.read(&mut buf).await.expect("read");
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let body = "nope";
            let resp = format!(
                "HTTP/1.1 {status_line}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(resp.as_bytes()).await.expect("write");
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    fn slot(control_url: &str) -> SlotRecord {
        SlotRecord::new("s1", control_url, "wss://stream:1", 0)
    }

    #[tokio::test]
    async fn attach_posts_tagged_json() {
        let (url, server) = one_shot("200 OK").await;
        let worker = HttpWorkerControl::new();
        let cmd = WorkerCommand::Attach {
            workload_id: "w1".to_string(),
            address: "sim-1:9000".to_string(),
        };
        worker
            .send(&slot(&format!("{url}/")), &cmd, Duration::from_secs(5))
            .await
            .expect("attach");

        let request = server.await.expect("server");
        assert!(request.starts_with("POST /command "));
        assert!(request.contains(r#""command":"attach""#));
        assert!(request.contains(r#""workload_id":"w1""#));
    }

    #[tokio::test]
    async fn non_success_status_is_rejected() {
        let (url, server) = one_shot("503 Service Unavailable").await;
        let err = HttpWorkerControl::new()
            .probe(&slot(&url), Duration::from_secs(5))
            .await
            .err()
            .expect("rejected");
        match err {
            WorkerError::Rejected { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(server.await.expect("server").starts_with("GET /health "));
    }

    #[tokio::test]
    async fn unreachable_worker_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let err = HttpWorkerControl::new()
            .send(
                &slot(&format!("http://{addr}")),
                &WorkerCommand::Reset,
                Duration::from_secs(5),
            )
            .await
            .err()
            .expect("unreachable");
        assert!(matches!(err, WorkerError::Transport(_)));
    }
}
