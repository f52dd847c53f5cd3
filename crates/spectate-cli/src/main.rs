mod client;
mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use spectate_protocol::WorkerReportedState;

use crate::client::BrokerClient;

#[derive(Parser)]
#[command(name = "spectate", about = "Inspect and drive a spectate session broker", version)]
struct Cli {
    /// Broker base URL (defaults to $SPECTATE_URL, then the local listener)
    #[arg(long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show slot and workload counters
    Status,

    /// Check broker and store health
    Health,

    /// List registered workloads
    Workloads {
        /// Resume after this workload ID
        #[arg(long)]
        cursor: Option<String>,

        /// Page size
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Get workload details
    Workload {
        /// Workload ID
        id: String,
    },

    /// Register or refresh a workload
    Register {
        /// Workload ID
        id: String,

        /// Address the render worker attaches to
        address: String,

        /// Opaque JSON metadata
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Send a workload liveness heartbeat
    Heartbeat {
        /// Workload ID
        id: String,

        /// Simulation tick
        #[arg(long)]
        tick: Option<u64>,
    },

    /// Request a stream for a workload and print the lease
    Watch {
        /// Workload ID
        id: String,

        /// Free-form viewer hint
        #[arg(long)]
        hint: Option<String>,
    },

    /// Extend a viewer lease
    LeaseHeartbeat {
        /// Lease ID
        lease: String,
    },

    /// Release a viewer lease
    Release {
        /// Lease ID
        lease: String,
    },

    /// List render slots
    Slots,

    /// Register a render slot
    RegisterSlot {
        /// Slot ID
        id: String,

        /// Worker control URL
        control_url: String,

        /// Public stream endpoint
        stream_endpoint: String,
    },

    /// Report that a slot's stream is live
    SlotReady {
        /// Slot ID
        id: String,
    },

    /// Report that a slot failed
    SlotError {
        /// Slot ID
        id: String,

        /// Failure reason
        reason: String,
    },

    /// Send a worker status report for a slot
    SlotStatus {
        /// Slot ID
        id: String,

        /// Worker-side state
        #[arg(value_enum)]
        state: ReportedState,

        /// Free-form detail
        #[arg(long)]
        detail: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ReportedState {
    Idle,
    Attaching,
    Streaming,
    Failed,
}

impl From<ReportedState> for WorkerReportedState {
    fn from(state: ReportedState) -> Self {
        match state {
            ReportedState::Idle => WorkerReportedState::Idle,
            ReportedState::Attaching => WorkerReportedState::Attaching,
            ReportedState::Streaming => WorkerReportedState::Streaming,
            ReportedState::Failed => WorkerReportedState::Failed,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spectate=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let url = cli
        .url
        .unwrap_or_else(spectate_protocol::paths::default_broker_url);
    let client = BrokerClient::new(&url);

    match cli.command {
        Commands::Status => commands::status(&client).await,
        Commands::Health => commands::health(&client).await,
        Commands::Workloads { cursor, limit } => {
            commands::workloads(&client, cursor.as_deref(), limit).await
        }
        Commands::Workload { id } => commands::workload(&client, &id).await,
        Commands::Register {
            id,
            address,
            metadata,
        } => commands::register(&client, id, address, metadata.as_deref()).await,
        Commands::Heartbeat { id, tick } => commands::heartbeat(&client, &id, tick).await,
        Commands::Watch { id, hint } => commands::watch(&client, &id, hint.as_deref()).await,
        Commands::LeaseHeartbeat { lease } => commands::lease_heartbeat(&client, &lease).await,
        Commands::Release { lease } => commands::release(&client, &lease).await,
        Commands::Slots => commands::slots(&client).await,
        Commands::RegisterSlot {
            id,
            control_url,
            stream_endpoint,
        } => commands::register_slot(&client, id, control_url, stream_endpoint).await,
        Commands::SlotReady { id } => commands::slot_ready(&client, &id).await,
        Commands::SlotError { id, reason } => commands::slot_error(&client, &id, &reason).await,
        Commands::SlotStatus { id, state, detail } => {
            commands::slot_status(&client, &id, state.into(), detail).await
        }
    }
}
