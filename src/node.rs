//! Cluster nodes.
//!
//! The node file names the machines that take part in a run: one line per
//! node, two whitespace-separated fields, `hostname cores`. One worker is
//! spawned per declared core, so the pool size is fixed before the first
//! task is dispatched.

use std::fs;
use std::path::Path;

use crate::error::MusterError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub hostname: String,
    pub cores: usize,
}

/// Parses the node file. Every line must carry exactly two fields and a
/// positive core count; anything else is a hard error, because a silently
/// skipped node would change the pool size.
pub fn parse_node_file(path: &Path) -> Result<Vec<NodeSpec>, MusterError> {
    let contents = fs::read_to_string(path).map_err(|source| MusterError::NodeOpen {
        path: path.to_path_buf(),
        source,
    })?;
    let mut nodes = Vec::new();
    for line in contents.lines() {
        nodes.push(parse_node_line(line)?);
    }
    Ok(nodes)
}

fn parse_node_line(line: &str) -> Result<NodeSpec, MusterError> {
    let malformed = || MusterError::NodeParse {
        line: line.to_string(),
    };
    let mut fields = line.split_whitespace();
    let hostname = fields.next().ok_or_else(malformed)?.to_string();
    let cores: usize = fields
        .next()
        .and_then(|f| f.parse().ok())
        .filter(|&c| c > 0)
        .ok_or_else(malformed)?;
    if fields.next().is_some() {
        return Err(malformed());
    }
    Ok(NodeSpec { hostname, cores })
}

/// Total worker count for a run: one worker per declared core.
pub fn total_cores(nodes: &[NodeSpec]) -> usize {
    nodes.iter().map(|n| n.cores).sum()
}
