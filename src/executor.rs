//! Task executor.
//!
//! Runs one work item as a child process with its stdio redirected to the
//! per-task files, waits for it, and derives the terminal status plus a
//! resource-usage record. The worker process runs exactly one child at a
//! time, so the `RUSAGE_CHILDREN` delta around the wait is that child's
//! usage.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::sys::resource::{getrusage, UsageWho};

use crate::message::{Greeting, Status, TaskId};
use crate::scripts;
use crate::task::TaskType;

/// What happened to a child that was actually started.
#[derive(Debug, Clone, Copy)]
pub struct ExecOutcome {
    /// `Ok` or `TaskKilled`; the fork-failure case is the `Err` of
    /// [`TaskExecutor::execute`].
    pub status: Status,
    /// Child user+system CPU seconds.
    pub exec_seconds: f64,
    /// High-water RSS of this worker's children so far, in KiB.
    pub max_rss_kib: i64,
}

pub struct TaskExecutor {
    task_type: TaskType,
    create_err: bool,
    create_mem: bool,
    program_override: Option<PathBuf>,
}

impl TaskExecutor {
    pub fn new(
        task_type: TaskType,
        create_err: bool,
        create_mem: bool,
        program_override: Option<PathBuf>,
    ) -> Self {
        Self {
            task_type,
            create_err,
            create_mem,
            program_override,
        }
    }

    pub fn from_greeting(greeting: &Greeting) -> Self {
        Self::new(
            greeting.task_type,
            greeting.create_err,
            greeting.create_mem,
            greeting.program_override.clone(),
        )
    }

    /// Runs one task to completion.
    ///
    /// `Err` means no child could be started (the fork-failure path, fatal
    /// for the worker). A child that started but could not exec its target
    /// is an ordinary `TaskKilled`, matching what a fork+exec
    /// implementation reports when exec fails after the fork.
    pub fn execute(
        &self,
        task_number: TaskId,
        program: &Path,
        out_dir: &Path,
        args_csv: &str,
    ) -> io::Result<ExecOutcome> {
        let program = self.program_override.as_deref().unwrap_or(program);
        let target = if self.task_type.needs_aux_script() {
            scripts::aux_script_path(out_dir, self.task_type, task_number)
        } else {
            program.to_path_buf()
        };
        let argv = self.task_type.argv(&target, task_number, args_csv);

        let stdout = File::create(out_dir.join(format!("{task_number}_out.txt")))?;
        let err_path = out_dir.join(format!("{task_number}_err.txt"));
        let stderr = if self.create_err {
            Stdio::from(File::create(&err_path)?)
        } else {
            Stdio::null()
        };

        let before = child_usage();
        let mut child = match Command::new(&argv[0])
            .args(&argv[1..])
            .stdout(Stdio::from(stdout))
            .stderr(stderr)
            .spawn()
        {
            Ok(child) => child,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                ) =>
            {
                // The target cannot be exec'd; the task dies, the worker
                // lives on.
                let diagnostic = format!("could not execute {}: {}", argv[0], e);
                if self.create_err {
                    let _ = fs::write(&err_path, &diagnostic);
                }
                eprintln!("task {task_number}: {diagnostic}");
                return Ok(ExecOutcome {
                    status: Status::TaskKilled,
                    exec_seconds: 0.0,
                    max_rss_kib: 0,
                });
            }
            Err(e) => return Err(e),
        };
        let exit = child.wait()?;
        let after = child_usage();

        let exec_seconds = (after.cpu_seconds - before.cpu_seconds).max(0.0);
        if self.create_mem {
            let mem_path = out_dir.join(format!("{task_number}_mem.txt"));
            if let Err(e) = write_usage_record(&mem_path, task_number, exec_seconds, &after) {
                eprintln!("task {task_number}: could not write usage record: {e}");
            }
        }

        let status = if exit.success() {
            Status::Ok
        } else {
            Status::TaskKilled
        };
        Ok(ExecOutcome {
            status,
            exec_seconds,
            max_rss_kib: after.max_rss_kib,
        })
    }
}

struct ChildUsage {
    cpu_seconds: f64,
    max_rss_kib: i64,
}

fn child_usage() -> ChildUsage {
    match getrusage(UsageWho::RUSAGE_CHILDREN) {
        Ok(usage) => {
            let user = usage.user_time();
            let system = usage.system_time();
            let cpu_seconds = (user.tv_sec() + system.tv_sec()) as f64
                + (user.tv_usec() + system.tv_usec()) as f64 * 1e-6;
            ChildUsage {
                cpu_seconds,
                max_rss_kib: usage.max_rss(),
            }
        }
        Err(_) => ChildUsage {
            cpu_seconds: 0.0,
            max_rss_kib: 0,
        },
    }
}

fn write_usage_record(
    path: &Path,
    task_number: TaskId,
    exec_seconds: f64,
    usage: &ChildUsage,
) -> io::Result<()> {
    fs::write(
        path,
        format!(
            "Task {}:\nChild CPU time: {:.6} s\nMax RSS: {} KiB\n",
            task_number, exec_seconds, usage.max_rss_kib
        ),
    )
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::tempdir;

    use super::*;

    fn executor(create_err: bool, create_mem: bool) -> TaskExecutor {
        TaskExecutor::new(TaskType::C, create_err, create_mem, None)
    }

    #[test]
    fn echo_task_writes_its_out_file() {
        let dir = tempdir().unwrap();
        let outcome = executor(false, false)
            .execute(5, Path::new("/bin/echo"), dir.path(), "hello,world")
            .unwrap();
        assert_eq!(outcome.status, Status::Ok);
        assert!(outcome.exec_seconds >= 0.0);
        let out = fs::read_to_string(dir.path().join("5_out.txt")).unwrap();
        assert_eq!(out, "5 hello world\n");
    }

    #[test]
    fn nonzero_exit_is_task_killed() {
        let dir = tempdir().unwrap();
        let outcome = executor(false, false)
            .execute(1, Path::new("/bin/false"), dir.path(), "")
            .unwrap();
        assert_eq!(outcome.status, Status::TaskKilled);
    }

    #[test]
    fn missing_target_is_task_killed_with_diagnostic() {
        let dir = tempdir().unwrap();
        let outcome = executor(true, false)
            .execute(2, Path::new("/nonexistent/prog"), dir.path(), "a")
            .unwrap();
        assert_eq!(outcome.status, Status::TaskKilled);
        let err = fs::read_to_string(dir.path().join("2_err.txt")).unwrap();
        assert!(err.contains("could not execute"));
    }

    #[test]
    fn stderr_goes_to_err_file_when_enabled() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("prog.sh");
        fs::write(&script, "#!/bin/sh\necho to-stdout\necho to-stderr >&2\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let outcome = executor(true, false)
            .execute(3, &script, dir.path(), "")
            .unwrap();
        assert_eq!(outcome.status, Status::Ok);
        assert_eq!(fs::read_to_string(dir.path().join("3_out.txt")).unwrap(), "to-stdout\n");
        assert_eq!(fs::read_to_string(dir.path().join("3_err.txt")).unwrap(), "to-stderr\n");
    }

    #[test]
    fn usage_record_written_when_enabled() {
        let dir = tempdir().unwrap();
        executor(false, true)
            .execute(4, Path::new("/bin/true"), dir.path(), "")
            .unwrap();
        let mem = fs::read_to_string(dir.path().join("4_mem.txt")).unwrap();
        assert!(mem.contains("Max RSS:"));
    }

    #[test]
    fn program_override_wins() {
        let dir = tempdir().unwrap();
        let exec = TaskExecutor::new(
            TaskType::C,
            false,
            false,
            Some(PathBuf::from("/bin/echo")),
        );
        exec.execute(6, Path::new("/bin/false"), dir.path(), "override")
            .unwrap();
        let out = fs::read_to_string(dir.path().join("6_out.txt")).unwrap();
        assert_eq!(out, "6 override\n");
    }
}
