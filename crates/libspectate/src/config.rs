use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 500;

/// Everything the engine needs to know that is not in the store.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct BrokerConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Slots registered at startup, in addition to `slot_range`.
    #[serde(default)]
    pub slots: Vec<SlotSeed>,
    #[serde(default)]
    pub slot_range: Option<SlotRange>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            timeouts: Timeouts::default(),
            supervisor: SupervisorConfig::default(),
            slots: Vec::new(),
            slot_range: None,
            page_size: default_page_size(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl BrokerConfig {
    /// Explicit `[[slots]]` followed by the expanded `[slot_range]`.
    pub fn slot_seeds(&self) -> Vec<SlotSeed> {
        let mut seeds = self.slots.clone();
        if let Some(range) = &self.slot_range {
            seeds.extend(range.seeds());
        }
        seeds
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        let t = &self.timeouts;
        for (name, value) in [
            ("lock_ttl_ms", t.lock_ttl_ms),
            ("lease_ttl_ms", t.lease_ttl_ms),
            ("drain_timeout_ms", t.drain_timeout_ms),
            ("startup_timeout_ms", t.startup_timeout_ms),
            ("staleness_window_ms", t.staleness_window_ms),
            ("attach_timeout_ms", t.attach_timeout_ms),
            ("worker_timeout_ms", t.worker_timeout_ms),
            ("supervisor.lease_sweep_ms", self.supervisor.lease_sweep_ms),
            ("supervisor.health_check_ms", self.supervisor.health_check_ms),
            ("supervisor.staleness_ms", self.supervisor.staleness_ms),
        ] {
            if value == 0 {
                return Err(BrokerError::InvalidRequest(format!("{name} must be positive")));
            }
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(BrokerError::InvalidRequest(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        let mut seen = HashSet::new();
        for seed in self.slot_seeds() {
            if !seen.insert(seed.id.clone()) {
                return Err(BrokerError::InvalidRequest(format!(
                    "slot {} is configured twice",
                    seed.id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    /// SQLite file; defaults to `state.db` in the config directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Lock, lease and liveness timeouts, all in milliseconds.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Timeouts {
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    /// How long an operation waits for a busy lock before giving up.
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_staleness_window_ms")]
    pub staleness_window_ms: u64,
    /// OFFLINE workloads with no pairing are deleted after this long.
    #[serde(default = "default_purge_after_ms")]
    pub purge_after_ms: u64,
    #[serde(default = "default_attach_timeout_ms")]
    pub attach_timeout_ms: u64,
    /// Bound on detach, reset and probe calls.
    #[serde(default = "default_worker_timeout_ms")]
    pub worker_timeout_ms: u64,
}

impl Timeouts {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_millis(self.staleness_window_ms)
    }

    pub fn purge_after(&self) -> Duration {
        Duration::from_millis(self.purge_after_ms)
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            lock_ttl_ms: default_lock_ttl_ms(),
            lock_wait_ms: default_lock_wait_ms(),
            lease_ttl_ms: default_lease_ttl_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            staleness_window_ms: default_staleness_window_ms(),
            purge_after_ms: default_purge_after_ms(),
            attach_timeout_ms: default_attach_timeout_ms(),
            worker_timeout_ms: default_worker_timeout_ms(),
        }
    }
}

/// Periods of the three reconciliation loops, in milliseconds.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SupervisorConfig {
    #[serde(default = "default_lease_sweep_ms")]
    pub lease_sweep_ms: u64,
    #[serde(default = "default_health_check_ms")]
    pub health_check_ms: u64,
    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            lease_sweep_ms: default_lease_sweep_ms(),
            health_check_ms: default_health_check_ms(),
            staleness_ms: default_staleness_ms(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SlotSeed {
    pub id: String,
    pub control_url: String,
    pub stream_endpoint: String,
}

/// A block of identical workers on consecutive ports: slot `n` is
/// `{id_prefix}{n}` with control port `control_base_port + n` and stream
/// port `stream_base_port + n`.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SlotRange {
    pub count: u16,
    #[serde(default = "default_id_prefix")]
    pub id_prefix: String,
    #[serde(default = "default_control_base_url")]
    pub control_base_url: String,
    pub control_base_port: u16,
    pub stream_base_url: String,
    pub stream_base_port: u16,
}

impl SlotRange {
    pub fn seeds(&self) -> Vec<SlotSeed> {
        (0..self.count)
            .map(|n| SlotSeed {
                id: format!("{}{n}", self.id_prefix),
                control_url: format!(
                    "{}:{}",
                    self.control_base_url.trim_end_matches('/'),
                    self.control_base_port.saturating_add(n)
                ),
                stream_endpoint: format!(
                    "{}:{}",
                    self.stream_base_url.trim_end_matches('/'),
                    self.stream_base_port.saturating_add(n)
                ),
            })
            .collect()
    }
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_event_capacity() -> usize {
    1024
}

fn default_lock_ttl_ms() -> u64 {
    5_000
}

fn default_lock_wait_ms() -> u64 {
    2_000
}

fn default_lease_ttl_ms() -> u64 {
    15_000
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

fn default_startup_timeout_ms() -> u64 {
    60_000
}

fn default_staleness_window_ms() -> u64 {
    30_000
}

fn default_purge_after_ms() -> u64 {
    86_400_000
}

fn default_attach_timeout_ms() -> u64 {
    10_000
}

fn default_worker_timeout_ms() -> u64 {
    5_000
}

fn default_lease_sweep_ms() -> u64 {
    2_000
}

fn default_health_check_ms() -> u64 {
    10_000
}

fn default_staleness_ms() -> u64 {
    15_000
}

fn default_id_prefix() -> String {
    "slot-".to_string()
}

fn default_control_base_url() -> String {
    "http://127.0.0.1".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sections_take_defaults() {
        let config: BrokerConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(config.timeouts.lock_ttl(), Duration::from_secs(5));
        assert_eq!(config.timeouts.lease_ttl_ms, 15_000);
        assert_eq!(config.supervisor.health_check_ms, 10_000);
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.store.kind, StoreKind::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn slot_range_expands_consecutive_ports() {
        let range = SlotRange {
            count: 3,
            id_prefix: "gpu-".to_string(),
            control_base_url: "http://10.0.0.2/".to_string(),
            control_base_port: 9000,
            stream_base_url: "wss://stream.example.net".to_string(),
            stream_base_port: 8443,
        };
        let seeds = range.seeds();
        assert_eq!(seeds.len(), 3);
        assert_eq!(seeds[0].id, "gpu-0");
        assert_eq!(seeds[2].control_url, "http://10.0.0.2:9002");
        assert_eq!(seeds[1].stream_endpoint, "wss://stream.example.net:8444");
    }

    #[test]
    fn duplicate_slot_ids_are_rejected() {
        let seed = SlotSeed {
            id: "slot-0".to_string(),
            control_url: "http://127.0.0.1:9000".to_string(),
            stream_endpoint: "wss://a:1".to_string(),
        };
        let config = BrokerConfig {
            slots: vec![seed],
            slot_range: Some(SlotRange {
                count: 1,
                id_prefix: "slot-".to_string(),
                control_base_url: default_control_base_url(),
                control_base_port: 9100,
                stream_base_url: "wss://b".to_string(),
                stream_base_port: 8000,
            }),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BrokerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let mut config = BrokerConfig::default();
        config.timeouts.drain_timeout_ms = 0;
        assert!(config.validate().is_err());
    }
}
