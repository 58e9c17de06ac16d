//! Master scheduler.
//!
//! A single task drives the whole run: spawn the pool, saturate it with
//! the first batch, then loop on receive-from-anyone. Every result frees
//! exactly one worker, and that worker immediately gets the next data line
//! (or a STOP once the input is drained), so the in-flight count stays
//! pinned at `min(N, W)` until the drain begins. Task-level failures are
//! journaled and never abort the run.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::time::Instant;

use itertools::Itertools;

use crate::config::Settings;
use crate::error::MusterError;
use crate::journal::UnfinishedJournal;
use crate::message::{Status, TaskResult, Work, WorkerId};
use crate::node;
use crate::report::{NodeMap, Report};
use crate::scripts;
use crate::task::{TaskType, WorkItem};
use crate::transport::Cluster;

/// Final accounting for one run; the report's summary and the e2e tests
/// both read from this.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub tasks_total: usize,
    pub workers_spawned: usize,
    pub results_received: usize,
    pub completed: usize,
    pub unfinished: usize,
    pub stops_sent: usize,
    pub dead_workers: usize,
    pub combined_seconds: f64,
    pub wall_seconds: f64,
    pub journal_removed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlaveState {
    /// Greeted, no work sent yet.
    Idle,
    Busy,
    Stopped,
    /// Reported a fork failure and terminated itself; never dispatched to
    /// again.
    Dead,
}

pub struct Scheduler {
    settings: Settings,
    report: Report,
}

impl Scheduler {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            report: Report,
        }
    }

    pub async fn run<C: Cluster>(&self, cluster: &mut C) -> Result<RunSummary, MusterError> {
        let started = Instant::now();
        let s = &self.settings;
        let report = &self.report;

        if s.maple_single_core && s.task_type == TaskType::Maple {
            scripts::maple_single_core(&s.program).map_err(MusterError::MapleRewrite)?;
        }

        let nodes = node::parse_node_file(&s.node_file)?;
        let pool_size = node::total_cores(&nodes);
        let n_tasks = count_data_lines(&s.data_file)?;

        report.info(format!("will use executable {}", s.program.display()));
        report.info(format!("will use datafile {}", s.data_file.display()));
        report.info(format!("will use nodefile {}", s.node_file.display()));
        report.info(format!("results will be stored in {}", s.out_dir.display()));
        report.info(format!(
            "will use nodes {}",
            nodes
                .iter()
                .map(|n| format!("{} ({})", n.hostname, n.cores))
                .join(", ")
        ));
        report.info(format!(
            "will create {} tasks for {} slaves",
            n_tasks, pool_size
        ));

        let mut node_map = NodeMap::create(&s.out_dir, s.create_node_map)?;

        // Spawn phase: one worker per declared core, ids dense in node
        // order, each greeted before the next spawn.
        let mut states = Vec::with_capacity(pool_size);
        for node in &nodes {
            for _ in 0..node.cores {
                let id = cluster.spawn_worker(&node.hostname).await?;
                cluster.greet(id, &s.greeting(id)).await?;
                report.created_slave(id, &node.hostname);
                node_map.node(id, &node.hostname);
                states.push(SlaveState::Idle);
            }
        }
        report.info("all slaves created successfully");
        node_map.begin_assignments();

        // Prime phase: saturate the pool in worker-id order.
        let mut feed = DataFeed::open(&s.data_file)?;
        let mut in_flight = 0usize;
        for id in 0..pool_size {
            match feed.next_item()? {
                Some(item) => {
                    self.dispatch(cluster, &mut node_map, id, item).await?;
                    states[id] = SlaveState::Busy;
                    in_flight += 1;
                }
                None => break,
            }
        }
        if in_flight > 0 {
            report.info("first batch of work sent");
        }

        let mut journal = UnfinishedJournal::create(&s.out_dir).map_err(|source| {
            MusterError::OutDir {
                path: s.out_dir.clone(),
                source,
            }
        })?;

        let mut summary = RunSummary {
            tasks_total: n_tasks,
            workers_spawned: pool_size,
            ..Default::default()
        };

        // Steady and drain phases in one loop: while tasks are in flight,
        // each result frees its worker for the next line or a STOP.
        while in_flight > 0 {
            let result = cluster.recv_result().await?;
            in_flight -= 1;
            summary.results_received += 1;
            self.consume(&mut journal, &mut summary, &result)?;

            let id = result.worker_id;
            if result.status == Status::ForkErr {
                states[id] = SlaveState::Dead;
                summary.dead_workers += 1;
                continue;
            }
            match feed.next_item()? {
                Some(item) => {
                    self.dispatch(cluster, &mut node_map, id, item).await?;
                    in_flight += 1;
                }
                None => {
                    // Input drained: quiesce this worker and bank its time.
                    let _ = cluster.send(id, &Work::Stop).await;
                    states[id] = SlaveState::Stopped;
                    summary.stops_sent += 1;
                    summary.combined_seconds += result.total_seconds;
                    report.info(format!(
                        "shutting down slave {:2} (total computing time: {:.5} seconds)",
                        id, result.total_seconds
                    ));
                }
            }
        }

        // The pool can die before the input does (every worker lost to
        // fork failures). Journal the rest rather than losing it.
        let mut leftovers = 0usize;
        while let Some(item) = feed.next_item()? {
            self.journal_item(&mut journal, item.task_number, &item.args_csv)?;
            summary.unfinished += 1;
            leftovers += 1;
        }
        if leftovers > 0 {
            report.error(format!(
                "no live slaves left; journaled {} remaining tasks",
                leftovers
            ));
        }

        // Workers that never saw work (N < W) still get their STOP.
        for id in 0..pool_size {
            if states[id] == SlaveState::Idle {
                let _ = cluster.send(id, &Work::Stop).await;
                states[id] = SlaveState::Stopped;
                summary.stops_sent += 1;
            }
        }

        // Close-out.
        summary.journal_removed = journal.finish().map_err(|source| MusterError::OutDir {
            path: s.out_dir.clone(),
            source,
        })?;
        if s.task_type.needs_aux_script() {
            if let Err(e) = scripts::remove_aux_scripts(&s.out_dir) {
                report.error(format!("could not clean up auxiliary scripts: {e}"));
            }
        }
        if s.maple_single_core && s.task_type == TaskType::Maple {
            if let Err(e) = scripts::restore_maple_backup(&s.program) {
                report.error(format!("could not restore Maple library backup: {e}"));
            }
        }
        cluster.halt().await?;

        summary.wall_seconds = started.elapsed().as_secs_f64();
        report.summary(summary.combined_seconds, summary.wall_seconds);
        Ok(summary)
    }

    /// Sends one work item to one worker, emitting its auxiliary script
    /// first when the task type needs one.
    async fn dispatch<C: Cluster>(
        &self,
        cluster: &mut C,
        node_map: &mut NodeMap,
        id: WorkerId,
        item: WorkItem,
    ) -> Result<(), MusterError> {
        let s = &self.settings;
        if s.task_type.needs_aux_script() {
            scripts::write_aux_script(
                &s.out_dir,
                s.task_type,
                item.task_number,
                &s.program,
                &item.args_csv,
            )
            .map_err(MusterError::ScriptIo)?;
            self.report.created_script(s.task_type, item.task_number);
        }
        cluster
            .send(
                id,
                &Work::Task {
                    task_number: item.task_number,
                    program: s.program.clone(),
                    out_dir: s.out_dir.clone(),
                    args_csv: item.args_csv,
                },
            )
            .await?;
        self.report.task_sent(item.task_number);
        node_map.assignment(id, item.task_number);
        Ok(())
    }

    /// Journals or logs one result. Task-level failures never abort the
    /// run; that is what makes long batches usable.
    fn consume(
        &self,
        journal: &mut UnfinishedJournal,
        summary: &mut RunSummary,
        result: &TaskResult,
    ) -> Result<(), MusterError> {
        match result.status {
            Status::Ok => {
                summary.completed += 1;
                self.report
                    .task_completed(result.task_number, result.exec_seconds.unwrap_or(0.0));
            }
            Status::MemErr => {
                self.report.error(format!(
                    "could not execute task {} in slave {} (out of memory)",
                    result.task_number, result.worker_id
                ));
                self.journal_item(journal, result.task_number, &result.args_csv)?;
                summary.unfinished += 1;
            }
            Status::ForkErr => {
                self.report.error(format!(
                    "could not fork process for task {} in slave {}",
                    result.task_number, result.worker_id
                ));
                self.journal_item(journal, result.task_number, &result.args_csv)?;
                summary.unfinished += 1;
            }
            Status::TaskKilled => {
                self.report.error(format!(
                    "task {} was stopped or killed",
                    result.task_number
                ));
                self.journal_item(journal, result.task_number, &result.args_csv)?;
                summary.unfinished += 1;
            }
        }
        Ok(())
    }

    fn journal_item(
        &self,
        journal: &mut UnfinishedJournal,
        task_number: i32,
        args_csv: &str,
    ) -> Result<(), MusterError> {
        journal
            .append(task_number, args_csv)
            .map_err(|source| MusterError::OutDir {
                path: self.settings.out_dir.clone(),
                source,
            })
    }
}

/// Lazy reader over the data file; each line becomes one work item.
struct DataFeed {
    lines: Lines<BufReader<File>>,
    path: PathBuf,
}

impl DataFeed {
    fn open(path: &Path) -> Result<Self, MusterError> {
        let file = File::open(path).map_err(|source| MusterError::DataOpen {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            path: path.to_path_buf(),
        })
    }

    fn next_item(&mut self) -> Result<Option<WorkItem>, MusterError> {
        match self.lines.next() {
            None => Ok(None),
            Some(Ok(line)) => WorkItem::parse(&line).map(Some),
            Some(Err(source)) => Err(MusterError::DataOpen {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

fn count_data_lines(path: &Path) -> Result<usize, MusterError> {
    let file = File::open(path).map_err(|source| MusterError::DataOpen {
        path: path.to_path_buf(),
        source,
    })?;
    let mut count = 0;
    for line in BufReader::new(file).lines() {
        line.map_err(|source| MusterError::DataOpen {
            path: path.to_path_buf(),
            source,
        })?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn data_feed_yields_items_in_order() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"1,a\n2,b,c\n3\n").unwrap();
        let mut feed = DataFeed::open(file.path()).unwrap();
        assert_eq!(feed.next_item().unwrap().unwrap().task_number, 1);
        assert_eq!(feed.next_item().unwrap().unwrap().args_csv, "b,c");
        assert_eq!(feed.next_item().unwrap().unwrap().args_csv, "");
        assert!(feed.next_item().unwrap().is_none());
        assert_eq!(count_data_lines(file.path()).unwrap(), 3);
    }

    #[test]
    fn data_feed_rejects_a_bad_first_column() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"1,a\nx,b\n").unwrap();
        let mut feed = DataFeed::open(file.path()).unwrap();
        feed.next_item().unwrap();
        assert!(matches!(
            feed.next_item(),
            Err(MusterError::DataFirstColumn { .. })
        ));
    }
}
