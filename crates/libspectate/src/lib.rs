pub mod assignment;
pub mod broker;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod keys;
pub mod lease;
pub mod lock;
pub mod registry;
pub mod slot;
pub mod store;
pub mod supervisor;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod worker;

pub use assignment::{AssignmentEngine, WatchTicket};
pub use broker::Broker;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{BrokerConfig, SlotRange, SlotSeed, StoreConfig, StoreKind, SupervisorConfig, Timeouts};
pub use error::{BrokerError, StoreError, WorkerError};
pub use events::EventBroker;
pub use lease::{LeaseManager, LeaseRecord, LeaseTarget};
pub use registry::{Registry, WorkloadRecord};
pub use slot::{SlotRecord, SlotTable};
pub use store::{MemoryStore, SharedStore, SqliteStore, StateStore};
pub use supervisor::{HealthReport, StalenessReport, Supervisor, SweepReport};
pub use worker::{HttpWorkerControl, WorkerControl};
