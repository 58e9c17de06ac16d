//! Wire protocol between master and workers.
//!
//! One message type per tag. Both sides share these definitions, so the
//! field sequence of every tag is agreed on by construction; a decode
//! failure means the two ends were built from different protocols and is
//! treated as fatal.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::task::TaskType;

/// Dense worker index in `[0, W)`, assigned at spawn time and stable for
/// the whole run.
pub type WorkerId = usize;

/// Task id from the first column of the data file.
pub type TaskId = i32;

/// Sent once to each worker right after it is spawned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Greeting {
    pub worker_id: WorkerId,
    pub task_type: TaskType,
    /// Estimated size of the biggest task in KiB; 0 selects the generic
    /// memory check.
    pub max_task_kib: u64,
    pub create_err: bool,
    pub create_mem: bool,
    /// Overrides the work message's program path when the operator passed
    /// `--custom-process`.
    pub program_override: Option<PathBuf>,
}

/// Master-to-worker work channel. `Stop` quiesces the worker; it replies
/// with nothing and tears down its end of the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Work {
    Task {
        task_number: TaskId,
        program: PathBuf,
        out_dir: PathBuf,
        args_csv: String,
    },
    Stop,
}

/// Terminal status of one task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Child exited with code 0.
    Ok,
    /// The worker could not start a child at all; the worker terminates
    /// after reporting this.
    ForkErr,
    /// The admission gate persistently refused the task.
    MemErr,
    /// Child exited non-zero or was killed by a signal.
    TaskKilled,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

/// Worker-to-master reply for one work message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub worker_id: WorkerId,
    pub task_number: TaskId,
    pub status: Status,
    /// Echo of the work message's argument string, so the master can
    /// journal an unfinished item without re-reading the data file.
    pub args_csv: String,
    /// Child user+system CPU seconds; `None` when the child never ran.
    pub exec_seconds: Option<f64>,
    /// Cumulative exec seconds across every task this worker has run.
    pub total_seconds: f64,
}
