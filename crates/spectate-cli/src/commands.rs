use anyhow::{Context, Result};
use serde::Serialize;

use spectate_protocol::{
    RegisterSlotRequest, RegisterWorkloadRequest, SlotStatusReportRequest, WatchStatus,
    WorkerReportedState,
};

use crate::client::BrokerClient;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_metadata(raw: Option<&str>) -> Result<serde_json::Value> {
    match raw {
        Some(text) => serde_json::from_str(text).context("--metadata must be valid JSON"),
        None => Ok(serde_json::Value::Null),
    }
}

/// Print broker counters as aligned lines.
pub async fn status(client: &BrokerClient) -> Result<()> {
    let s = client.status().await?;
    println!("slots      {} (idle pool {})", s.total_slots, s.idle_pool);
    println!("  idle     {}", s.idle);
    println!("  starting {}", s.starting);
    println!("  active   {}", s.active);
    println!("  draining {}", s.draining);
    println!("  error    {}", s.error);
    println!(
        "workloads  {} online, {} offline",
        s.workloads_online, s.workloads_offline
    );
    Ok(())
}

pub async fn health(client: &BrokerClient) -> Result<()> {
    let h = client.health().await?;
    println!("{} (store reachable: {})", h.status, h.store);
    Ok(())
}

pub async fn workloads(client: &BrokerClient, cursor: Option<&str>, limit: Option<usize>) -> Result<()> {
    print_json(&client.list_workloads(cursor, limit).await?)
}

pub async fn workload(client: &BrokerClient, id: &str) -> Result<()> {
    print_json(&client.get_workload(id).await?)
}

pub async fn register(
    client: &BrokerClient,
    id: String,
    address: String,
    metadata: Option<&str>,
) -> Result<()> {
    let req = RegisterWorkloadRequest {
        id,
        address,
        metadata: parse_metadata(metadata)?,
    };
    client.register_workload(&req).await?;
    println!("registered {}", req.id);
    Ok(())
}

pub async fn heartbeat(client: &BrokerClient, id: &str, tick: Option<u64>) -> Result<()> {
    client.workload_heartbeat(id, tick).await?;
    println!("ok");
    Ok(())
}

/// Request a stream. Exits non-zero when the broker has no free slot.
pub async fn watch(client: &BrokerClient, id: &str, hint: Option<&str>) -> Result<()> {
    let resp = client.request_watch(id, hint).await?;
    print_json(&resp)?;
    if resp.status == WatchStatus::NoCapacity {
        anyhow::bail!("no render slot available for {id}");
    }
    Ok(())
}

pub async fn lease_heartbeat(client: &BrokerClient, lease: &str) -> Result<()> {
    print_json(&client.lease_heartbeat(lease).await?)
}

pub async fn release(client: &BrokerClient, lease: &str) -> Result<()> {
    client.release_lease(lease).await?;
    println!("released {lease}");
    Ok(())
}

pub async fn slots(client: &BrokerClient) -> Result<()> {
    print_json(&client.list_slots().await?)
}

pub async fn register_slot(
    client: &BrokerClient,
    id: String,
    control_url: String,
    stream_endpoint: String,
) -> Result<()> {
    let req = RegisterSlotRequest {
        id,
        control_url,
        stream_endpoint,
    };
    print_json(&client.register_slot(&req).await?)
}

pub async fn slot_ready(client: &BrokerClient, id: &str) -> Result<()> {
    print_json(&client.slot_ready(id).await?)
}

pub async fn slot_error(client: &BrokerClient, id: &str, reason: &str) -> Result<()> {
    print_json(&client.slot_error(id, reason).await?)
}

pub async fn slot_status(
    client: &BrokerClient,
    id: &str,
    state: WorkerReportedState,
    detail: Option<String>,
) -> Result<()> {
    let req = SlotStatusReportRequest { state, detail };
    print_json(&client.slot_status(id, &req).await?)
}
