use anyhow::{Context, Result, bail};
use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::{Value, json};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::thread;
use std::time::Duration;

#[derive(Debug)]
struct Captured {
    method: String,
    path: String,
    body: Value,
}

/// Serves exactly one HTTP request and returns what the CLI sent.
fn spawn_mock_broker(status: u16, reply: Value) -> Result<(SocketAddr, thread::JoinHandle<Result<Captured>>)> {
    let listener = TcpListener::bind("127.0.0.1:0").context("failed to bind mock broker")?;
    let addr = listener.local_addr()?;
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().context("failed to accept client")?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        let mut reader = BufReader::new(stream.try_clone()?);

        let mut request_line = String::new();
        reader.read_line(&mut request_line)?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().context("missing method")?.to_string();
        let path = parts.next().context("missing path")?.to_string();

        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                bail!("client disconnected mid-headers");
            }
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':')
                && name.eq_ignore_ascii_case("content-length")
            {
                content_length = value.trim().parse()?;
            }
        }
        let mut raw = vec![0u8; content_length];
        reader.read_exact(&mut raw)?;
        let body = if raw.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&raw)?
        };

        let payload = serde_json::to_string(&reply)?;
        let mut writer = stream;
        write!(
            writer,
            "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{payload}",
            payload.len()
        )?;
        writer.flush()?;
        Ok(Captured { method, path, body })
    });
    Ok((addr, handle))
}

fn join(handle: thread::JoinHandle<Result<Captured>>) -> Result<Captured> {
    handle
        .join()
        .map_err(|_| anyhow::anyhow!("mock broker panicked"))?
}

#[test]
fn watch_prints_lease_and_sends_hint() -> Result<()> {
    let (addr, handle) = spawn_mock_broker(
        200,
        json!({
            "status": "starting",
            "lease_id": "lease-1",
            "slot_id": "slot-0",
            "stream_endpoint": "wss://stream-0.invalid",
            "lease_ttl_ms": 30000
        }),
    )?;

    let output = cargo_bin_cmd!("spectate")
        .args(["--url", &format!("http://{addr}"), "watch", "w1", "--hint", "tab"])
        .output()?;
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let printed: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(printed["lease_id"], "lease-1");

    let req = join(handle)?;
    assert_eq!(req.method, "POST");
    assert_eq!(req.path, "/api/workloads/w1/watch");
    assert_eq!(req.body["client_hint"], "tab");
    Ok(())
}

#[test]
fn watch_without_capacity_fails() -> Result<()> {
    let (addr, handle) = spawn_mock_broker(200, json!({"status": "no_capacity"}))?;

    let output = cargo_bin_cmd!("spectate")
        .args(["--url", &format!("http://{addr}"), "watch", "w1"])
        .output()?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no render slot available"));
    join(handle)?;
    Ok(())
}

#[test]
fn broker_errors_surface_message() -> Result<()> {
    let (addr, handle) = spawn_mock_broker(
        410,
        json!({"error": "lease lease-9 expired", "code": "expired"}),
    )?;

    let output = cargo_bin_cmd!("spectate")
        .args(["--url", &format!("http://{addr}"), "lease-heartbeat", "lease-9"])
        .output()?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("lease lease-9 expired"), "stderr: {stderr}");

    let req = join(handle)?;
    assert_eq!(req.path, "/api/leases/lease-9/heartbeat");
    Ok(())
}

#[test]
fn slot_status_sends_report() -> Result<()> {
    let (addr, handle) = spawn_mock_broker(
        200,
        json!({
            "id": "slot-0",
            "state": "active",
            "assigned_workload_id": "w1",
            "control_url": "http://worker-0.invalid",
            "stream_endpoint": "wss://stream-0.invalid",
            "state_since_ms": 1,
            "last_status_ms": 2,
            "viewer_count": 1
        }),
    )?;

    let output = cargo_bin_cmd!("spectate")
        .args([
            "--url",
            &format!("http://{addr}/"),
            "slot-status",
            "slot-0",
            "streaming",
            "--detail",
            "60fps",
        ])
        .output()?;
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let req = join(handle)?;
    assert_eq!(req.path, "/api/slots/slot-0/status");
    assert_eq!(req.body, json!({"state": "streaming", "detail": "60fps"}));
    Ok(())
}

#[test]
fn register_rejects_bad_metadata_before_sending() -> Result<()> {
    cargo_bin_cmd!("spectate")
        .args(["--url", "http://127.0.0.1:9", "register", "w1", "sim:1", "--metadata", "{nope"])
        .assert()
        .failure();
    Ok(())
}
