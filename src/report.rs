//! Run report.
//!
//! A line-buffered stream of labeled events on stdout (errors on stderr)
//! plus an optional node-assignment file for post-mortem. Both stay
//! grep-able: one event per line, the label first.

use std::fmt::Display;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use colored::Colorize;

use crate::error::MusterError;
use crate::message::{TaskId, WorkerId};
use crate::task::TaskType;

const TAG: &str = "[muster]";

#[derive(Default)]
pub struct Report;

impl Report {
    pub fn info(&self, msg: impl Display) {
        println!("{} {} - {}", TAG, "INFO".cyan(), msg);
    }

    pub fn error(&self, msg: impl Display) {
        eprintln!("{} {} - {}", TAG, "ERROR".red().bold(), msg);
    }

    pub fn created_slave(&self, worker_id: WorkerId, host: &str) {
        println!(
            "{} {} - created slave {:2} on {}",
            TAG,
            "CREATED_SLAVE".green(),
            worker_id,
            host
        );
    }

    pub fn created_script(&self, task_type: TaskType, task_number: TaskId) {
        println!(
            "{} {} - creating auxiliary {} script for task {}",
            TAG,
            "CREATED_SCRIPT".green(),
            task_type.name(),
            task_number
        );
    }

    pub fn task_sent(&self, task_number: TaskId) {
        println!(
            "{} {} - sent task {:4} for execution",
            TAG,
            "TASK_SENT".blue(),
            task_number
        );
    }

    pub fn task_completed(&self, task_number: TaskId, exec_seconds: f64) {
        println!(
            "{} {} - task {:4} completed in {:.9} seconds",
            TAG,
            "TASK_COMPLETED".green().bold(),
            task_number,
            exec_seconds
        );
    }

    pub fn summary(&self, combined_seconds: f64, wall_seconds: f64) {
        println!(
            "\n{} END OF EXECUTION.\nCombined computing time: {:.5} seconds.\nTotal execution time:    {:.5} seconds.",
            TAG, combined_seconds, wall_seconds
        );
    }
}

/// `node_info.txt`: which worker ran on which node, and which task went to
/// which worker. Created only under `--create-slavefile`; every method is a
/// no-op otherwise.
#[derive(Debug)]
pub struct NodeMap {
    file: Option<File>,
}

impl NodeMap {
    pub fn create(out_dir: &Path, enabled: bool) -> Result<Self, MusterError> {
        if !enabled {
            return Ok(Self { file: None });
        }
        let path = out_dir.join("node_info.txt");
        let mut file = File::create(&path).map_err(|source| MusterError::OutDir {
            path: out_dir.to_path_buf(),
            source,
        })?;
        let _ = writeln!(file, "# NODE CODENAMES");
        Ok(Self { file: Some(file) })
    }

    pub fn node(&mut self, worker_id: WorkerId, host: &str) {
        self.line(format_args!("# Node {:2} -> {}", worker_id, host));
    }

    pub fn begin_assignments(&mut self) {
        self.line(format_args!("\nNODE,TASK"));
    }

    pub fn assignment(&mut self, worker_id: WorkerId, task_number: TaskId) {
        self.line(format_args!("{:2},{:4}", worker_id, task_number));
    }

    fn line(&mut self, args: std::fmt::Arguments<'_>) {
        if let Some(file) = self.file.as_mut() {
            let _ = writeln!(file, "{}", args);
            // Keep the file current on disk; it is read mid-run.
            let _ = file.flush();
        }
    }
}
