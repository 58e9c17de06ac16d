//! Task types and work items.
//!
//! A work item is one line of the data file; the task type decides how the
//! target program is invoked for it. Each variant owns its argv recipe, so
//! the executor never needs to know which interpreter is in play.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::MusterError;
use crate::message::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    Maple,
    C,
    Python,
    Pari,
    Sage,
    Octave,
}

impl TaskType {
    /// Maps the numeric CLI flag (0..=5) onto a variant.
    pub fn from_flag(flag: u8) -> Result<Self, MusterError> {
        match flag {
            0 => Ok(TaskType::Maple),
            1 => Ok(TaskType::C),
            2 => Ok(TaskType::Python),
            3 => Ok(TaskType::Pari),
            4 => Ok(TaskType::Sage),
            5 => Ok(TaskType::Octave),
            _ => Err(MusterError::WrongTaskType),
        }
    }

    /// Script-driven interpreters need a per-task auxiliary script written
    /// before the work message is sent.
    pub fn needs_aux_script(self) -> bool {
        matches!(self, TaskType::Pari | TaskType::Sage | TaskType::Octave)
    }

    pub fn name(self) -> &'static str {
        match self {
            TaskType::Maple => "Maple",
            TaskType::C => "C",
            TaskType::Python => "Python",
            TaskType::Pari => "Pari",
            TaskType::Sage => "Sage",
            TaskType::Octave => "Octave",
        }
    }

    /// Builds the child argv (argv[0] included) for one task.
    ///
    /// `target` is the file handed to the interpreter: the program itself
    /// for Maple/C/Python, the pre-written auxiliary script for the rest.
    /// The Maple `-tc`/`-c` elements carry their double quotes verbatim;
    /// Maple parses them out of the single argument.
    pub fn argv(self, target: &Path, task_number: TaskId, args_csv: &str) -> Vec<String> {
        let target = target.display().to_string();
        match self {
            TaskType::Maple => vec![
                "maple".to_string(),
                format!("-tc \"taskId:={}\"", task_number),
                format!("-c \"taskArgs:=[{}]\"", args_csv),
                target,
            ],
            TaskType::C => {
                let mut argv = vec![target, task_number.to_string()];
                argv.extend(split_args(args_csv));
                argv
            }
            TaskType::Python => {
                let mut argv = vec!["python".to_string(), target, task_number.to_string()];
                argv.extend(split_args(args_csv));
                argv
            }
            TaskType::Pari => vec!["gp".to_string(), "-q".to_string(), target],
            TaskType::Sage => vec!["sage".to_string(), target],
            TaskType::Octave => vec!["octave".to_string(), "--no-gui".to_string(), target],
        }
    }
}

/// Splits a task argument string into argv fields.
///
/// The comma is the field separator and cannot appear inside a field;
/// empty fields are dropped. Callers that need commas in an argument must
/// move the quoting into the target program.
pub fn split_args(args_csv: &str) -> Vec<String> {
    args_csv
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect()
}

/// One line of the data file: a task id and the verbatim remainder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub task_number: TaskId,
    pub args_csv: String,
}

impl WorkItem {
    /// Parses `<taskNumber>,<args...>`. The args part is kept byte-for-byte;
    /// it travels to the worker and comes back in the result message so the
    /// master can journal failures without re-reading the data file.
    pub fn parse(line: &str) -> Result<Self, MusterError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (first, rest) = match line.split_once(',') {
            Some((first, rest)) => (first, rest),
            None => (line, ""),
        };
        let task_number = first
            .trim()
            .parse()
            .map_err(|_| MusterError::DataFirstColumn {
                line: line.to_string(),
            })?;
        Ok(WorkItem {
            task_number,
            args_csv: rest.to_string(),
        })
    }
}
