//! Shared types used across the bbque crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Operating system process id.
pub type Pid = u32;

/// Stable workload identity: process id plus an optional sub-id for
/// workloads that expose more than one execution context per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkloadId {
    pub pid: Pid,
    pub sub: Option<u8>,
}

impl WorkloadId {
    pub fn new(pid: Pid) -> Self {
        Self { pid, sub: None }
    }

    pub fn with_sub(pid: Pid, sub: u8) -> Self {
        Self { pid, sub: Some(sub) }
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sub {
            Some(sub) => write!(f, "{}:{}", self.pid, sub),
            None => write!(f, "{}", self.pid),
        }
    }
}

impl FromStr for WorkloadId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((pid, sub)) => Ok(Self::with_sub(pid.parse()?, sub.parse()?)),
            None => Ok(Self::new(s.parse()?)),
        }
    }
}

/// Scheduling priority. 0 is the highest.
pub type Priority = u8;

/// Lowest priority accepted for a workload.
pub const LOWEST_PRIORITY: Priority = 10;
