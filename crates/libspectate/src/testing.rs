//! In-process fakes for driving the broker without real workers or time.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use spectate_protocol::{SlotId, SlotState, WorkerCommand};

use crate::broker::Broker;
use crate::clock::{Clock, ManualClock};
use crate::config::{BrokerConfig, Timeouts};
use crate::error::{StoreError, WorkerError};
use crate::keys;
use crate::slot::SlotRecord;
use crate::store::{MemoryStore, SharedStore, StateStore};
use crate::worker::WorkerControl;

/// Start of every harness clock, an arbitrary fixed instant.
pub const EPOCH_MS: u64 = 1_750_000_000_000;

/// Records every command and fails on request.
#[derive(Debug, Default)]
pub struct ScriptedWorker {
    sent: Mutex<Vec<(SlotId, WorkerCommand)>>,
    failing_probes: Mutex<HashSet<SlotId>>,
    fail_attach: AtomicBool,
    fail_reset: AtomicBool,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedWorker {
    pub fn fail_attach(&self, fail: bool) {
        self.fail_attach.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reset(&self, fail: bool) {
        self.fail_reset.store(fail, Ordering::SeqCst);
    }

    pub fn fail_probe(&self, slot_id: &str, fail: bool) {
        let mut probes = locked(&self.failing_probes);
        if fail {
            probes.insert(slot_id.to_string());
        } else {
            probes.remove(slot_id);
        }
    }

    /// Commands sent to one slot, in order, including ones that failed.
    pub fn commands_for(&self, slot_id: &str) -> Vec<WorkerCommand> {
        locked(&self.sent)
            .iter()
            .filter(|(id, _)| id == slot_id)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    pub fn commands(&self) -> Vec<(SlotId, WorkerCommand)> {
        locked(&self.sent).clone()
    }
}

#[async_trait]
impl WorkerControl for ScriptedWorker {
    async fn send(
        &self,
        slot: &SlotRecord,
        command: &WorkerCommand,
        _timeout: Duration,
    ) -> Result<(), WorkerError> {
        locked(&self.sent).push((slot.id.clone(), command.clone()));
        let fail = match command {
            WorkerCommand::Attach { .. } => self.fail_attach.load(Ordering::SeqCst),
            WorkerCommand::Reset => self.fail_reset.load(Ordering::SeqCst),
            WorkerCommand::Detach { .. } => false,
        };
        if fail {
            return Err(WorkerError::Transport(format!("{} refused", slot.id)));
        }
        Ok(())
    }

    async fn probe(&self, slot: &SlotRecord, _timeout: Duration) -> Result<(), WorkerError> {
        if locked(&self.failing_probes).contains(&slot.id) {
            return Err(WorkerError::Timeout(Duration::from_secs(5)));
        }
        Ok(())
    }
}

type Hook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Passes every call through to `inner`, except that an armed hook runs
/// right after the first read of `watched` that follows a lease write. The
/// reader still gets the value from before the hook ran, which lets a test
/// commit a competing change between a check and the action based on it.
pub struct InterposedStore {
    inner: SharedStore,
    watched: String,
    lease_written: AtomicBool,
    hook: Mutex<Option<Hook>>,
}

impl InterposedStore {
    pub fn new(inner: SharedStore, watched: impl Into<String>) -> Self {
        Self {
            inner,
            watched: watched.into(),
            lease_written: AtomicBool::new(false),
            hook: Mutex::new(None),
        }
    }

    pub fn arm<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.lease_written.store(false, Ordering::SeqCst);
        *locked(&self.hook) = Some(Box::new(move || Box::pin(hook())));
    }

    /// Whether an armed hook is still waiting to run.
    pub fn armed(&self) -> bool {
        locked(&self.hook).is_some()
    }

    fn note_write(&self, key: &str) {
        if keys::id_from(keys::LEASE_PREFIX, key).is_some() {
            self.lease_written.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl StateStore for InterposedStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = self.inner.get(key).await?;
        if key == self.watched && self.lease_written.load(Ordering::SeqCst) {
            let hook = locked(&self.hook).take();
            if let Some(hook) = hook {
                hook().await;
            }
        }
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.inner.put(key, value, ttl).await?;
        self.note_write(key);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let swapped = self.inner.compare_and_swap(key, expected, new, ttl).await?;
        if swapped {
            self.note_write(key);
        }
        Ok(swapped)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }

    async fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, String)>, StoreError> {
        self.inner.scan(prefix, after, limit).await
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.set_add(set, member).await
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.set_remove(set, member).await
    }

    async fn set_pop(&self, set: &str) -> Result<Option<String>, StoreError> {
        self.inner.set_pop(set).await
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, StoreError> {
        self.inner.set_members(set).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
}

/// A broker on a manual clock and a scripted worker fleet.
pub struct Harness {
    pub broker: Broker,
    pub clock: Arc<ManualClock>,
    pub worker: Arc<ScriptedWorker>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_slots(0).await
    }

    /// A memory-backed broker with slots `slot-0 .. slot-{n-1}` registered.
    pub async fn with_slots(n: usize) -> Self {
        let clock = Arc::new(ManualClock::new(EPOCH_MS));
        let store: SharedStore = Arc::new(MemoryStore::new(clock.clone()));
        Self::with_store(store, clock, BrokerConfig::default(), n).await
    }

    /// Like [`Harness::with_slots`], but every store call goes through an
    /// [`InterposedStore`] watching `watched`.
    pub async fn interposed(n: usize, watched: &str) -> (Self, Arc<InterposedStore>) {
        let clock = Arc::new(ManualClock::new(EPOCH_MS));
        let inner: SharedStore = Arc::new(MemoryStore::new(clock.clone()));
        let store = Arc::new(InterposedStore::new(inner, watched));
        let harness = Self::with_store(store.clone(), clock, BrokerConfig::default(), n).await;
        (harness, store)
    }

    pub async fn with_store(
        store: SharedStore,
        clock: Arc<ManualClock>,
        config: BrokerConfig,
        slots: usize,
    ) -> Self {
        let worker = Arc::new(ScriptedWorker::default());
        let broker = Broker::new(store, clock.clone(), worker.clone(), &config);
        for n in 0..slots {
            broker
                .slots()
                .register(
                    &format!("slot-{n}"),
                    &format!("http://worker-{n}.invalid"),
                    &format!("wss://stream-{n}.invalid"),
                )
                .await
                .expect("register harness slot");
        }
        Self {
            broker,
            clock,
            worker,
        }
    }

    /// Registers `id` as an ONLINE workload at `sim-{id}:9000`.
    pub async fn online(&self, id: &str) {
        self.broker
            .registry()
            .register(id, &format!("sim-{id}:9000"), serde_json::json!({}))
            .await
            .expect("register harness workload");
    }

    pub fn store(&self) -> SharedStore {
        self.broker.context().store.clone()
    }

    pub fn clock_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn timeouts(&self) -> Arc<Timeouts> {
        self.broker.context().timeouts.clone()
    }

    pub async fn slot_state(&self, id: &str) -> SlotState {
        self.broker
            .slots()
            .require(id)
            .await
            .expect("harness slot")
            .value
            .state
    }

    /// Idle pool members in id order.
    pub async fn pool(&self) -> Vec<String> {
        let mut members = self
            .store()
            .set_members(keys::IDLE_POOL)
            .await
            .expect("idle pool");
        members.sort();
        members
    }
}
