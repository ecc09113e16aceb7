//! Storage and queue providers.
//!
//! A provider owns two durable surfaces per task hub: append-only event
//! histories (one file/vec per execution of an instance) and three work
//! queues with peek-lock delivery. History appends are guarded by
//! optimistic concurrency: callers pass the version they read and get
//! `StoreError::VersionConflict` back when it went stale.
use crate::Event;

pub mod error;
pub mod fs;
pub mod in_memory;

pub use error::StoreError;

use serde::{Deserialize, Serialize};

/// The three queues of a task hub. Orchestrator items wake instance
/// replays, Worker items carry activity invocations, Timer items hold
/// deferred firings until their deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueKind {
    Orchestrator,
    Worker,
    Timer,
}

/// Messages flowing through the task-hub queues. Completions carry the
/// `execution_id` they belong to so a continued-as-new instance can shed
/// stale messages from a previous execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    /// Activate a newly created (or continued) instance.
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
    },
    /// Invoke one activity; `attempt` starts at 1 and counts retries.
    ActivityExecute {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
        attempt: u32,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    /// Final activity failure, posted after the retry policy is exhausted.
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        error: String,
        retriable: bool,
    },
    /// A timer deadline elapsed; routed from the timer queue to the
    /// orchestrator queue by the timer dispatcher.
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    /// An external event raised by a client, matched to a subscription
    /// during completion application.
    ExternalRaised {
        instance: String,
        name: String,
        payload: String,
    },
    /// Operator-requested termination.
    Terminate { instance: String, reason: String },
    SubOrchCompleted {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        result: String,
    },
    SubOrchFailed {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        error: String,
    },
}

impl WorkItem {
    /// Instance the item should be routed to.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::Terminate { instance, .. } => instance,
            WorkItem::SubOrchCompleted { parent_instance, .. }
            | WorkItem::SubOrchFailed { parent_instance, .. } => parent_instance,
        }
    }
}

/// Queue line format: an item plus the wall-clock instant it becomes
/// visible to dequeuers (0 for immediately).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct QueueEntry {
    pub item: WorkItem,
    pub visible_at_ms: u64,
}

/// Instance metadata maintained by the provider alongside history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InstanceInfo {
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub custom_status: Option<String>,
    pub latest_execution_id: u64,
}

/// Pluggable persistence for histories and work queues.
///
/// Implementations must keep `append` atomic per instance: either every
/// event in the batch lands and the version advances by the batch size,
/// or nothing changes and an error is returned.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Read the latest execution's history.
    async fn read(&self, instance: &str) -> Vec<Event>;

    /// Read the latest execution's history together with its version
    /// (the event count), for use as `expected_version` in `append`.
    async fn read_with_version(&self, instance: &str) -> (Vec<Event>, u64);

    /// Append events to the latest execution iff its version still equals
    /// `expected_version`. Returns the new version.
    async fn append(&self, instance: &str, new_events: Vec<Event>, expected_version: u64) -> Result<u64, StoreError>;

    /// Create an empty instance with execution 1.
    async fn create_instance(&self, instance: &str) -> Result<(), StoreError>;

    /// Remove the instance and all of its executions.
    async fn remove_instance(&self, instance: &str) -> Result<(), StoreError>;

    async fn list_instances(&self) -> Vec<String>;

    async fn latest_execution_id(&self, instance: &str) -> Option<u64>;

    async fn list_executions(&self, instance: &str) -> Vec<u64>;

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event>;

    /// Begin a fresh execution for continue-as-new, seeded with its
    /// `ExecutionStarted` event. Returns the new execution id.
    async fn start_new_execution(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
        parent_instance: Option<&str>,
        parent_id: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Enqueue an immediately visible work item.
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), StoreError>;

    /// Enqueue a work item that stays invisible until `visible_at_ms`.
    async fn enqueue_work_at(&self, kind: QueueKind, item: WorkItem, visible_at_ms: u64) -> Result<(), StoreError>;

    /// Pop the first visible item under a lock token. The item is
    /// redelivered if neither `ack` nor `abandon` arrives before the
    /// provider's lock timeout.
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;

    /// Delete a locked item permanently.
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), StoreError>;

    /// Return a locked item to the front of its queue.
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), StoreError>;

    async fn instance_info(&self, instance: &str) -> Option<InstanceInfo>;

    /// Persist the orchestrator's published custom status.
    async fn set_custom_status(&self, instance: &str, status: &str) -> Result<(), StoreError>;

    /// Drop all stored state (tests).
    async fn reset(&self);

    /// Human-readable dump of all histories (debugging).
    async fn dump_all_pretty(&self) -> String;
}
