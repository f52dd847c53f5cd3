//! Store key layout. Every key the broker writes is built here.

pub const WORKLOAD_PREFIX: &str = "workload:";
pub const SLOT_PREFIX: &str = "slot:";
pub const LEASE_PREFIX: &str = "lease:";

/// Set of slot ids currently eligible for allocation.
pub const IDLE_POOL: &str = "pool:idle";

pub fn workload(id: &str) -> String {
    format!("{WORKLOAD_PREFIX}{id}")
}

pub fn slot(id: &str) -> String {
    format!("{SLOT_PREFIX}{id}")
}

/// Forward pairing mapping: workload id to slot id. Authoritative; the
/// slot record's assignment mirrors it.
pub fn pairing(workload_id: &str) -> String {
    format!("pairing:workload:{workload_id}")
}

pub fn lease(id: &str) -> String {
    format!("{LEASE_PREFIX}{id}")
}

/// Set of lease ids issued for a workload.
pub fn workload_leases(workload_id: &str) -> String {
    format!("leases:workload:{workload_id}")
}

pub fn lock(scope: &str, id: &str) -> String {
    format!("lock:{scope}:{id}")
}

/// Strips `prefix` from a scanned key, yielding the entity id.
pub fn id_from<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix)
}
