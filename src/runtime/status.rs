use crate::Event;
use serde::{Deserialize, Serialize};

/// Lifecycle of an orchestration instance as projected from history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeStatus {
    /// Created, no replay pass has run yet.
    Pending,
    /// At least one pass ran and no terminal event exists.
    Running,
    Completed,
    Failed,
    Terminated,
    ContinuedAsNew,
}

impl RuntimeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RuntimeStatus::Completed | RuntimeStatus::Failed | RuntimeStatus::Terminated
        )
    }
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RuntimeStatus::Pending => "Pending",
            RuntimeStatus::Running => "Running",
            RuntimeStatus::Completed => "Completed",
            RuntimeStatus::Failed => "Failed",
            RuntimeStatus::Terminated => "Terminated",
            RuntimeStatus::ContinuedAsNew => "ContinuedAsNew",
        };
        f.write_str(s)
    }
}

/// Status snapshot returned by the client and runtime queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub instance: String,
    pub orchestration: String,
    pub runtime_status: RuntimeStatus,
    pub input: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub custom_status: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Pure projection of one execution's history. Never replays user code;
/// status queries stay cheap regardless of orchestration size.
pub(crate) struct StatusProjection {
    pub runtime_status: RuntimeStatus,
    pub orchestration: String,
    pub input: String,
    pub output: Option<String>,
    pub error: Option<String>,
}

pub(crate) fn project(history: &[Event]) -> StatusProjection {
    let mut orchestration = String::new();
    let mut input = String::new();
    let mut output = None;
    let mut error = None;
    let mut status = RuntimeStatus::Running;
    for ev in history {
        match ev {
            Event::ExecutionStarted { name, input: inp, .. } => {
                orchestration = name.clone();
                input = inp.clone();
            }
            Event::ExecutionCompleted { output: out } => {
                status = RuntimeStatus::Completed;
                output = Some(out.clone());
            }
            Event::ExecutionFailed { error: err } => {
                status = RuntimeStatus::Failed;
                error = Some(err.clone());
            }
            Event::ExecutionTerminated { reason } => {
                status = RuntimeStatus::Terminated;
                error = Some(reason.clone());
            }
            Event::ContinuedAsNew { .. } => {
                status = RuntimeStatus::ContinuedAsNew;
            }
            _ => {}
        }
    }
    // Only the ExecutionStarted record present: no pass has run yet
    if status == RuntimeStatus::Running && history.len() <= 1 {
        status = RuntimeStatus::Pending;
    }
    StatusProjection {
        runtime_status: status,
        orchestration,
        input,
        output,
        error,
    }
}
