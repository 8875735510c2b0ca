//! Configuration for VM states and their schedulers

use crate::error::HostError;
use serde::{Deserialize, Serialize};

/// Which OS thread may step the synchronized scheduling domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryDriver {
    /// The OS thread that created the state (overridable later)
    CreatingThread,
    /// Any OS thread; useful for hosts that hop threads between frames
    AnyThread,
}

/// Options for creating a [`VmState`](crate::vm::VmState)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmOptions {
    /// Maximum number of slots on any single thread's stack
    pub max_stack_slots: usize,

    /// Maximum nesting of native calls on one thread
    pub max_call_depth: usize,

    /// Allocation budget in bytes for VM tables and buffers (`None` = unlimited)
    pub memory_limit: Option<usize>,

    /// Policy for stepping the synchronized domain
    pub primary_driver: PrimaryDriver,

    /// Name reported for this state in diagnostics
    pub chunk_name: String,

    /// Scheduler configuration
    pub scheduler: SchedulerOptions,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            max_stack_slots: 1_000_000,
            max_call_depth: 200,
            memory_limit: None,
            primary_driver: PrimaryDriver::CreatingThread,
            chunk_name: String::from("hostlua"),
            scheduler: SchedulerOptions::default(),
        }
    }
}

impl VmOptions {
    /// Options with an allocation budget
    pub fn with_memory_limit(bytes: usize) -> Self {
        Self {
            memory_limit: Some(bytes),
            ..Default::default()
        }
    }

    /// Options whose synchronized domain may be stepped from any OS thread
    pub fn any_driver() -> Self {
        Self {
            primary_driver: PrimaryDriver::AnyThread,
            ..Default::default()
        }
    }

    /// Reject configurations the VM cannot run with
    pub fn validate(&self) -> Result<(), HostError> {
        if self.max_stack_slots < 64 {
            return Err(HostError::InvalidOptions(format!(
                "max_stack_slots must be at least 64, got {}",
                self.max_stack_slots
            )));
        }
        if self.max_call_depth == 0 {
            return Err(HostError::InvalidOptions(
                "max_call_depth must be positive".to_string(),
            ));
        }
        if self.scheduler.max_resumes_per_step == Some(0) {
            return Err(HostError::InvalidOptions(
                "max_resumes_per_step must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Options for the cooperative scheduler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Upper bound on resumptions per domain per step; the rest stay queued
    pub max_resumes_per_step: Option<usize>,
}

impl SchedulerOptions {
    pub fn throttled(max_resumes_per_step: usize) -> Self {
        Self {
            max_resumes_per_step: Some(max_resumes_per_step),
        }
    }
}
