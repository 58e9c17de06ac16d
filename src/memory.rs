//! Memory admission gate.
//!
//! Before a worker asks for work it checks whether starting one more task
//! is safe on its host. Two co-located workers can pass the check at the
//! same time and both admit; the race is accepted and kept small by never
//! running more workers per host than cores. On refusal the worker backs
//! off and re-gates instead of receiving a work message, so the master may
//! see a worker stay silent for a long time under memory pressure.

use std::fs;
use std::io;
use std::thread;
use std::time::Duration;

/// Refuse when admitting a task would leave less than this available.
pub const SAFETY_FLOOR_KIB: u64 = 128 * 1024;

/// Sleep between refusals.
pub const GATE_BACKOFF: Duration = Duration::from_secs(60);

/// Consecutive refusals after which the gate gives up and the pending task
/// is bounced back to the master as a memory error.
pub const GATE_MAX_REFUSALS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    /// Refuse when available memory is below the safety floor.
    Generic,
    /// Refuse when available memory minus the biggest-task estimate would
    /// fall below the safety floor.
    Specific { max_task_kib: u64 },
}

impl GateMode {
    /// 0 means the operator gave no estimate and we fall back to the
    /// generic check.
    pub fn from_max_task_kib(max_task_kib: u64) -> Self {
        if max_task_kib > 0 {
            GateMode::Specific { max_task_kib }
        } else {
            GateMode::Generic
        }
    }
}

/// Source of the host's available-memory figure.
pub trait MemProbe {
    fn available_kib(&mut self) -> io::Result<u64>;
}

/// Reads `MemAvailable` from `/proc/meminfo`.
pub struct ProcMeminfo;

impl MemProbe for ProcMeminfo {
    fn available_kib(&mut self) -> io::Result<u64> {
        let meminfo = fs::read_to_string("/proc/meminfo")?;
        for line in meminfo.lines() {
            let mut parts = line.split_whitespace();
            if parts.next() == Some("MemAvailable:") {
                return parts
                    .next()
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidData, "bad MemAvailable line")
                    });
            }
        }
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no MemAvailable in /proc/meminfo",
        ))
    }
}

pub struct MemoryGate<P> {
    mode: GateMode,
    probe: P,
    backoff: Duration,
    max_refusals: u32,
}

impl<P: MemProbe> MemoryGate<P> {
    pub fn new(mode: GateMode, probe: P) -> Self {
        Self {
            mode,
            probe,
            backoff: GATE_BACKOFF,
            max_refusals: GATE_MAX_REFUSALS,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration, max_refusals: u32) -> Self {
        self.backoff = backoff;
        self.max_refusals = max_refusals;
        self
    }

    /// Single admission check. A probe failure counts as a refusal; guessing
    /// at headroom we cannot measure would defeat the gate.
    pub fn admit(&mut self) -> bool {
        let available = match self.probe.available_kib() {
            Ok(v) => v,
            Err(_) => return false,
        };
        match self.mode {
            GateMode::Generic => available >= SAFETY_FLOOR_KIB,
            GateMode::Specific { max_task_kib } => {
                available.saturating_sub(max_task_kib) >= SAFETY_FLOOR_KIB
            }
        }
    }

    /// Gates with back-off until admission or until the refusal budget is
    /// exhausted. Returns whether the task may start.
    pub fn wait_admit(&mut self) -> bool {
        for refusals in 0u32.. {
            if self.admit() {
                return true;
            }
            if refusals + 1 >= self.max_refusals {
                return false;
            }
            thread::sleep(self.backoff);
        }
        unreachable!()
    }
}

/// Test probe fed from a fixed script of readings; repeats the last one,
/// errors once the script is empty.
#[cfg(test)]
pub(crate) struct FakeProbe(pub std::collections::VecDeque<u64>);

#[cfg(test)]
impl MemProbe for FakeProbe {
    fn available_kib(&mut self) -> io::Result<u64> {
        match self.0.len() {
            0 => Err(io::Error::other("empty script")),
            1 => Ok(self.0[0]),
            _ => Ok(self.0.pop_front().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    fn gate(mode: GateMode, script: &[u64]) -> MemoryGate<FakeProbe> {
        MemoryGate::new(mode, FakeProbe(script.iter().copied().collect()))
            .with_backoff(Duration::ZERO, 3)
    }

    #[test]
    fn generic_mode_checks_the_floor() {
        assert!(gate(GateMode::Generic, &[SAFETY_FLOOR_KIB]).admit());
        assert!(!gate(GateMode::Generic, &[SAFETY_FLOOR_KIB - 1]).admit());
    }

    #[test]
    fn specific_mode_reserves_the_task_estimate() {
        let mode = GateMode::from_max_task_kib(1024);
        assert_eq!(mode, GateMode::Specific { max_task_kib: 1024 });
        assert!(gate(mode, &[SAFETY_FLOOR_KIB + 1024]).admit());
        assert!(!gate(mode, &[SAFETY_FLOOR_KIB + 1023]).admit());
    }

    #[test]
    fn wait_admit_retries_then_succeeds() {
        // Two refusals, then headroom appears.
        let mut g = gate(GateMode::Generic, &[0, 0, SAFETY_FLOOR_KIB]);
        assert!(g.wait_admit());
    }

    #[test]
    fn wait_admit_exhausts_budget() {
        let mut g = gate(GateMode::Generic, &[0]);
        assert!(!g.wait_admit());
    }

    #[test]
    fn probe_failure_refuses() {
        let mut g = MemoryGate::new(GateMode::Generic, FakeProbe(VecDeque::new()))
            .with_backoff(Duration::ZERO, 2);
        assert!(!g.admit());
        assert!(!g.wait_admit());
    }

    #[test]
    fn proc_meminfo_reads_something() {
        let kib = ProcMeminfo.available_kib().unwrap();
        assert!(kib > 0);
    }
}
