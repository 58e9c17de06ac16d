use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Everything that can abort a run, each carrying the fixed exit code the
/// operator scripts key on.
#[derive(Error, Debug)]
pub enum MusterError {
    #[error("missing required arguments (see --help)")]
    Usage,
    #[error("wrong task type value (must be one of: 0,1,2,3,4,5)")]
    WrongTaskType,
    #[error("cannot open node file {path}: {source}")]
    NodeOpen { path: PathBuf, source: io::Error },
    #[error("malformed node file line {line:?} (expected: hostname cores)")]
    NodeParse { line: String },
    #[error("cannot resolve working directory: {0}")]
    Cwd(#[source] io::Error),
    #[error("cluster init failed: {0}")]
    ClusterInit(String),
    #[error("cannot open data file {path}: {source}")]
    DataOpen { path: PathBuf, source: io::Error },
    #[error("first column of data file must be the task id: {line:?}")]
    DataFirstColumn { line: String },
    #[error("cannot open output file {path}: {source}")]
    OutfileOpen { path: PathBuf, source: io::Error },
    #[error("failed to spawn worker on {host}: {source}")]
    Spawn { host: String, source: io::Error },
    #[error("output directory {path} is not writable: {source}")]
    OutDir { path: PathBuf, source: io::Error },
    #[error("auxiliary script I/O error: {0}")]
    ScriptIo(#[source] io::Error),
    #[error("could not rewrite Maple library for single-core execution: {0}")]
    MapleRewrite(#[source] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl MusterError {
    /// Process exit code for this error. The numbering is part of the
    /// operator interface and must stay stable.
    pub fn exit_code(&self) -> i32 {
        match self {
            MusterError::Usage => E_ARGS,
            MusterError::NodeOpen { .. } => 12,
            MusterError::NodeParse { .. } => 13,
            MusterError::Cwd(_) => 14,
            MusterError::ClusterInit(_) => 15,
            MusterError::DataOpen { .. } => 17,
            MusterError::OutfileOpen { .. } => 18,
            MusterError::Spawn { .. } => 19,
            MusterError::DataFirstColumn { .. } => 20,
            MusterError::OutDir { .. } => 21,
            MusterError::WrongTaskType => 22,
            MusterError::ScriptIo(_) => 23,
            MusterError::MapleRewrite(_) => 24,
            MusterError::Protocol(_) => 25,
        }
    }
}

/// Exit code for command line usage errors (clap's own exit code is not
/// part of our enumeration).
pub const E_ARGS: i32 = 10;
