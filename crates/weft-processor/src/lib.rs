//! Workflow definition file processing for weft.
//!
//! Continuously discovers definition files, parses each one in an isolated
//! worker process bounded by strict timeouts, and feeds the extracted
//! workflows and import errors into a [`DefinitionStore`].
//!
//! Components, leaves first:
//!
//! - [`FileDiscovery`] scans source locations for candidate files
//! - [`ProcessingStatsStore`] tracks per-file processing history
//! - [`FileScheduler`] picks and orders the next batch
//! - [`WorkerSupervisor`] runs a bounded pool of worker processes
//! - [`worker`] is the code those processes run
//! - [`ResultCollector`] merges finished workers into stats and the store
//! - [`ProcessorManager`] drives the loop

pub mod collector;
pub mod definition;
pub mod discovery;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod protocol;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use collector::{DrainSummary, ResultCollector};
pub use definition::{DefinitionDocument, DefinitionError, TaskDefinition, WorkflowDefinition};
pub use discovery::{DiscoverySnapshot, FileDiscovery, FileEntry};
pub use error::{DiscoveryError, ProcessorError, Result, StoreError};
pub use manager::{ManagerState, ProcessorConfig, ProcessorManager, RunSummary};
pub use metrics::{MetricsSink, RecordingMetrics, TracingMetrics};
pub use protocol::{ImportError, ImportErrorKind, ParseResult, WorkerMessage, WorkerRequest};
pub use scheduler::{FileScheduler, QueueEntry, host_seed};
pub use stats::{Outcome, ProcessingRecord, ProcessingStatsStore};
pub use store::{DefinitionStore, MemoryStore, SqliteStore, StoredWorkflow, open_store};
pub use supervisor::{
    CompletedWorker, LaunchedWorker, SupervisorConfig, WorkerCommand, WorkerHandle, WorkerOutcome,
    WorkerSupervisor,
};
