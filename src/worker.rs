//! Worker loop.
//!
//! One long-lived supervisor per allocated core. After the greeting it
//! cycles gate → receive → execute → reply until the master sends STOP or
//! closes the link. The loop is synchronous: its only
//! suspension points are the gate's back-off sleep, the blocking receive,
//! and the wait on the current child.

use std::io::{Read, Write};
use std::time::Duration;

use crate::executor::TaskExecutor;
use crate::memory::{GateMode, MemProbe, MemoryGate};
use crate::message::{Greeting, Status, TaskResult, Work};
use crate::transport::{read_frame, write_frame};

/// Runs the worker protocol over a framed link until quiesced.
///
/// A clean return means the worker was told to stop (STOP message, link
/// EOF, or self-termination after a fork failure); an `Err` is an I/O or
/// protocol fault on the link itself.
pub fn run<R, W, P>(
    reader: &mut R,
    writer: &mut W,
    probe: P,
    backoff: Duration,
    max_refusals: u32,
) -> std::io::Result<()>
where
    R: Read,
    W: Write,
    P: MemProbe,
{
    let greeting: Greeting = match read_frame(reader)? {
        Some(greeting) => greeting,
        None => return Ok(()),
    };
    let worker_id = greeting.worker_id;
    let mut gate = MemoryGate::new(GateMode::from_max_task_kib(greeting.max_task_kib), probe)
        .with_backoff(backoff, max_refusals);
    let executor = TaskExecutor::from_greeting(&greeting);
    let mut total_seconds = 0.0_f64;

    loop {
        // Gate before asking for work: under memory pressure the master
        // sees silence from this worker, not a refusal.
        let admitted = gate.wait_admit();

        let work = match read_frame::<Work, _>(reader)? {
            Some(work) => work,
            // Master hung up; treat like STOP.
            None => return Ok(()),
        };
        let (task_number, program, out_dir, args_csv) = match work {
            Work::Stop => return Ok(()),
            Work::Task {
                task_number,
                program,
                out_dir,
                args_csv,
            } => (task_number, program, out_dir, args_csv),
        };

        if !admitted {
            // Refusal budget exhausted; bounce the pending task instead of
            // sitting on it forever.
            write_frame(
                writer,
                &TaskResult {
                    worker_id,
                    task_number,
                    status: Status::MemErr,
                    args_csv,
                    exec_seconds: None,
                    total_seconds,
                },
            )?;
            continue;
        }

        match executor.execute(task_number, &program, &out_dir, &args_csv) {
            Ok(outcome) => {
                total_seconds += outcome.exec_seconds;
                write_frame(
                    writer,
                    &TaskResult {
                        worker_id,
                        task_number,
                        status: outcome.status,
                        args_csv,
                        exec_seconds: Some(outcome.exec_seconds),
                        total_seconds,
                    },
                )?;
            }
            Err(e) => {
                eprintln!(
                    "worker {worker_id}: could not start a child for task {task_number}: {e}"
                );
                write_frame(
                    writer,
                    &TaskResult {
                        worker_id,
                        task_number,
                        status: Status::ForkErr,
                        args_csv,
                        exec_seconds: None,
                        total_seconds,
                    },
                )?;
                // A supervisor that cannot fork is not trustworthy for the
                // next task either.
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::fs;
    use std::io::Cursor;
    use std::path::{Path, PathBuf};

    use tempfile::tempdir;

    use crate::memory::FakeProbe;
    use crate::task::TaskType;

    use super::*;

    fn greeting() -> Greeting {
        Greeting {
            worker_id: 1,
            task_type: TaskType::C,
            max_task_kib: 0,
            create_err: false,
            create_mem: false,
            program_override: None,
        }
    }

    fn task(task_number: i32, program: &str, out_dir: &Path, args: &str) -> Work {
        Work::Task {
            task_number,
            program: PathBuf::from(program),
            out_dir: out_dir.to_path_buf(),
            args_csv: args.to_string(),
        }
    }

    fn encode(greeting: &Greeting, works: &[Work]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_frame(&mut buf, greeting).unwrap();
        for work in works {
            write_frame(&mut buf, work).unwrap();
        }
        buf
    }

    fn decode_results(buf: &[u8]) -> Vec<TaskResult> {
        let mut cursor = Cursor::new(buf);
        let mut results = Vec::new();
        while let Some(result) = read_frame::<TaskResult, _>(&mut cursor).unwrap() {
            results.push(result);
        }
        results
    }

    fn admitting_probe() -> FakeProbe {
        FakeProbe(VecDeque::from([u64::MAX]))
    }

    #[test]
    fn executes_tasks_until_stop() {
        let dir = tempdir().unwrap();
        let input = encode(
            &greeting(),
            &[
                task(1, "/bin/echo", dir.path(), "a,b"),
                task(2, "/bin/echo", dir.path(), "c"),
                Work::Stop,
            ],
        );
        let mut output = Vec::new();
        run(
            &mut Cursor::new(input),
            &mut output,
            admitting_probe(),
            Duration::ZERO,
            3,
        )
        .unwrap();

        let results = decode_results(&output);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == Status::Ok));
        assert!(results.iter().all(|r| r.worker_id == 1));
        assert_eq!(results[0].args_csv, "a,b");
        assert_eq!(results[1].args_csv, "c");
        // total_seconds accumulates monotonically.
        assert!(results[1].total_seconds >= results[0].total_seconds);
        assert_eq!(
            fs::read_to_string(dir.path().join("1_out.txt")).unwrap(),
            "1 a b\n"
        );
    }

    #[test]
    fn eof_before_greeting_is_a_clean_stop() {
        let mut output = Vec::new();
        run(
            &mut Cursor::new(Vec::new()),
            &mut output,
            admitting_probe(),
            Duration::ZERO,
            3,
        )
        .unwrap();
        assert!(output.is_empty());
    }

    #[test]
    fn eof_after_tasks_is_a_clean_stop() {
        let dir = tempdir().unwrap();
        let input = encode(&greeting(), &[task(1, "/bin/true", dir.path(), "")]);
        let mut output = Vec::new();
        run(
            &mut Cursor::new(input),
            &mut output,
            admitting_probe(),
            Duration::ZERO,
            3,
        )
        .unwrap();
        assert_eq!(decode_results(&output).len(), 1);
    }

    #[test]
    fn exhausted_gate_bounces_the_task_as_mem_err() {
        let dir = tempdir().unwrap();
        let input = encode(
            &greeting(),
            &[task(1, "/bin/true", dir.path(), "x,y"), Work::Stop],
        );
        let mut output = Vec::new();
        // A probe that never sees headroom.
        run(
            &mut Cursor::new(input),
            &mut output,
            FakeProbe(VecDeque::from([0])),
            Duration::ZERO,
            2,
        )
        .unwrap();

        let results = decode_results(&output);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, Status::MemErr);
        assert_eq!(results[0].exec_seconds, None);
        assert_eq!(results[0].args_csv, "x,y");
        assert!(!dir.path().join("1_out.txt").exists());
    }

    #[test]
    fn fork_failure_reports_and_terminates() {
        let dir = tempdir().unwrap();
        let missing_out_dir = dir.path().join("nonexistent");
        // Second task would be runnable, but the worker must be gone by then.
        let input = encode(
            &greeting(),
            &[
                task(1, "/bin/true", &missing_out_dir, "a"),
                task(2, "/bin/true", dir.path(), "b"),
                Work::Stop,
            ],
        );
        let mut output = Vec::new();
        run(
            &mut Cursor::new(input),
            &mut output,
            admitting_probe(),
            Duration::ZERO,
            3,
        )
        .unwrap();

        let results = decode_results(&output);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, Status::ForkErr);
        assert_eq!(results[0].task_number, 1);
        assert_eq!(results[0].args_csv, "a");
    }

    #[test]
    fn killed_child_is_reported_with_exec_time() {
        let dir = tempdir().unwrap();
        let input = encode(
            &greeting(),
            &[task(1, "/bin/false", dir.path(), ""), Work::Stop],
        );
        let mut output = Vec::new();
        run(
            &mut Cursor::new(input),
            &mut output,
            admitting_probe(),
            Duration::ZERO,
            3,
        )
        .unwrap();

        let results = decode_results(&output);
        assert_eq!(results[0].status, Status::TaskKilled);
        assert!(results[0].exec_seconds.is_some());
    }
}
