//! Command line arguments and run settings.
//!
//! `Cli` is the raw clap surface; `Settings` is what the rest of the
//! program sees after validation. Keeping them apart means the scheduler
//! never has to reason about optional positionals or numeric task-type
//! flags.

use std::path::PathBuf;

use clap::Parser;

use crate::error::MusterError;
use crate::message::{Greeting, WorkerId};
use crate::task::TaskType;

#[derive(Parser, Debug)]
#[command(author, version, about = "SPMD execution parallelizer for small compute clusters")]
pub struct Cli {
    /// Task type: 0 Maple, 1 C, 2 Python, 3 Pari, 4 Sage, 5 Octave
    #[arg(value_name = "TASKTYPE", required_unless_present = "kill")]
    pub task_type: Option<u8>,

    /// Program to execute (Maple library, C executable, script, ...)
    #[arg(value_name = "PROGRAMFILE", required_unless_present = "kill")]
    pub program: Option<PathBuf>,

    /// Data file: one task per line, `taskNumber,arguments...`
    #[arg(value_name = "DATAFILE", required_unless_present = "kill")]
    pub data_file: Option<PathBuf>,

    /// Node file: one `hostname cores` pair per line
    #[arg(value_name = "NODEFILE", required_unless_present = "kill")]
    pub node_file: Option<PathBuf>,

    /// Directory for per-task output files
    #[arg(value_name = "OUTDIR", required_unless_present = "kill")]
    pub out_dir: Option<PathBuf>,

    /// Approximate memory size of the biggest task (KiB); enables the
    /// specific memory check on workers
    #[arg(long = "max-mem-size", value_name = "KB", default_value_t = 0)]
    pub max_mem_size: u64,

    /// Force single-core Maple execution
    #[arg(long = "maple-single-core")]
    pub maple_single_core: bool,

    /// Create per-task stderr files
    #[arg(long = "create-errfiles")]
    pub create_err: bool,

    /// Create per-task memory usage files
    #[arg(long = "create-memfiles")]
    pub create_mem: bool,

    /// Create the node-assignment file (node_info.txt)
    #[arg(long = "create-slavefile")]
    pub create_slave: bool,

    /// Custom path for the executable program
    #[arg(long = "custom-process", value_name = "PATH")]
    pub custom_process: Option<PathBuf>,

    /// Kill stray worker processes left by a broken run, then exit
    #[arg(long, short)]
    pub kill: bool,
}

/// Validated run configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub task_type: TaskType,
    pub program: PathBuf,
    pub data_file: PathBuf,
    pub node_file: PathBuf,
    pub out_dir: PathBuf,
    pub max_task_kib: u64,
    pub maple_single_core: bool,
    pub create_err: bool,
    pub create_mem: bool,
    pub create_node_map: bool,
    pub program_override: Option<PathBuf>,
}

impl Cli {
    /// Validates the arguments of a dispatch run (everything but `--kill`).
    pub fn into_settings(self) -> Result<Settings, MusterError> {
        let (Some(flag), Some(program), Some(data_file), Some(node_file), Some(out_dir)) = (
            self.task_type,
            self.program,
            self.data_file,
            self.node_file,
            self.out_dir,
        ) else {
            return Err(MusterError::Usage);
        };
        let task_type = TaskType::from_flag(flag)?;
        // Workers may run with a different working directory than the
        // master; the output directory has to survive that.
        let cwd = std::env::current_dir().map_err(MusterError::Cwd)?;
        Ok(Settings {
            task_type,
            program,
            data_file,
            node_file,
            out_dir: cwd.join(out_dir),
            max_task_kib: self.max_mem_size,
            maple_single_core: self.maple_single_core,
            create_err: self.create_err,
            create_mem: self.create_mem,
            create_node_map: self.create_slave,
            program_override: self.custom_process,
        })
    }
}

impl Settings {
    /// The greeting sent to a freshly spawned worker. One constructor so
    /// the master can never pack fields the worker does not unpack.
    pub fn greeting(&self, worker_id: WorkerId) -> Greeting {
        Greeting {
            worker_id,
            task_type: self.task_type,
            max_task_kib: self.max_task_kib,
            create_err: self.create_err,
            create_mem: self.create_mem,
            program_override: self.program_override.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_dispatch_command() {
        let cli = Cli::try_parse_from([
            "muster",
            "1",
            "prog",
            "data.txt",
            "nodes.txt",
            "out",
            "--max-mem-size",
            "2048",
            "--create-errfiles",
            "--create-slavefile",
            "--custom-process",
            "/opt/prog",
        ])
        .unwrap();
        let settings = cli.into_settings().unwrap();
        assert_eq!(settings.task_type, TaskType::C);
        assert_eq!(settings.max_task_kib, 2048);
        assert!(settings.create_err);
        assert!(!settings.create_mem);
        assert!(settings.create_node_map);
        assert_eq!(settings.program_override.as_deref(), Some(std::path::Path::new("/opt/prog")));
        assert!(settings.out_dir.is_absolute());
    }

    #[test]
    fn kill_needs_no_positionals() {
        let cli = Cli::try_parse_from(["muster", "--kill"]).unwrap();
        assert!(cli.kill);
        assert!(cli.task_type.is_none());
    }

    #[test]
    fn missing_positionals_are_a_usage_error() {
        assert!(Cli::try_parse_from(["muster", "1", "prog"]).is_err());
    }

    #[test]
    fn wrong_task_type_flag_is_rejected_late() {
        let cli =
            Cli::try_parse_from(["muster", "9", "prog", "data", "nodes", "out"]).unwrap();
        assert!(matches!(cli.into_settings(), Err(MusterError::WrongTaskType)));
    }

    #[test]
    fn greeting_mirrors_settings() {
        let cli = Cli::try_parse_from([
            "muster", "0", "lib.mpl", "data", "nodes", "out", "--create-memfiles",
        ])
        .unwrap();
        let settings = cli.into_settings().unwrap();
        let greeting = settings.greeting(4);
        assert_eq!(greeting.worker_id, 4);
        assert_eq!(greeting.task_type, TaskType::Maple);
        assert!(greeting.create_mem);
        assert!(!greeting.create_err);
        assert!(greeting.program_override.is_none());
    }
}
