//! Muster: an SPMD job dispatcher for small heterogeneous compute clusters.

// Command line arguments and run settings.
pub mod config;
// Error taxonomy and exit codes.
pub mod error;
// Task executor: child process supervision on a worker.
pub mod executor;
// Unfinished-task journal.
pub mod journal;
// Memory admission gate.
pub mod memory;
// Wire protocol messages.
pub mod message;
// Node file parsing.
pub mod node;
// Run report and node-assignment file.
pub mod report;
// Master scheduler.
pub mod scheduler;
// Auxiliary script emitters.
pub mod scripts;
// Task types and work items.
pub mod task;
// Messaging transport.
pub mod transport;
// Worker loop.
pub mod worker;

pub use config::{Cli, Settings};
pub use error::MusterError;
pub use message::{Greeting, Status, TaskResult, Work, WorkerId};
pub use scheduler::{RunSummary, Scheduler};
pub use task::{TaskType, WorkItem};
pub use transport::{Cluster, ProcessCluster};
