//! Management client: instance lifecycle operations against a provider.
//!
//! The client never replays orchestrator code and holds no runtime state;
//! every operation is a history read, a conditional append, or an enqueue
//! that some runtime over the same store will pick up.
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::providers::{HistoryStore, QueueKind, StoreError, WorkItem};
use crate::runtime::status::{self, InstanceStatus};
use crate::runtime::{RuntimeStatus, WaitError};
use crate::Event;
use tracing::{info, warn};

#[derive(Clone)]
pub struct Client {
    store: Arc<dyn HistoryStore>,
}

impl Client {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Start an orchestration under a caller-supplied instance id.
    /// Fails with `InstanceAlreadyExists` when the id is taken; a terminal
    /// instance keeps its id until purged.
    pub async fn start(
        &self,
        instance: &str,
        orchestration: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<(), StoreError> {
        let orchestration = orchestration.into();
        let input = input.into();
        self.store.create_instance(instance).await?;
        self.store
            .append(
                instance,
                vec![Event::ExecutionStarted {
                    name: orchestration.clone(),
                    input: input.clone(),
                    parent_instance: None,
                    parent_id: None,
                }],
                0,
            )
            .await?;
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::StartOrchestration {
                    instance: instance.to_string(),
                    orchestration,
                    input,
                    parent_instance: None,
                    parent_id: None,
                },
            )
            .await?;
        info!(instance, "client started orchestration");
        Ok(())
    }

    /// Start under a generated instance id and return it.
    pub async fn start_new(
        &self,
        orchestration: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<String, StoreError> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let instance = format!("inst-{nanos:032x}");
        self.start(&instance, orchestration, input).await?;
        Ok(instance)
    }

    pub async fn start_typed<In: serde::Serialize>(
        &self,
        instance: &str,
        orchestration: impl Into<String>,
        input: &In,
    ) -> Result<(), StoreError> {
        let payload = crate::codec::encode(input).map_err(StoreError::Io)?;
        self.start(instance, orchestration, payload).await
    }

    /// Deliver an external event by name; matched against an open
    /// subscription during the instance's next pass.
    pub async fn raise_event(&self, instance: &str, name: impl Into<String>, payload: impl Into<String>) {
        let name = name.into();
        if let Err(e) = self
            .store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::ExternalRaised {
                    instance: instance.to_string(),
                    name: name.clone(),
                    payload: payload.into(),
                },
            )
            .await
        {
            warn!(instance, event=%name, error=%e, "raise_event: failed to enqueue");
        }
    }

    /// Request termination of a running instance.
    pub async fn terminate(&self, instance: &str, reason: impl Into<String>) {
        let _ = self
            .store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::Terminate {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
            )
            .await;
    }

    /// Read-only status projection over the latest execution's history.
    pub async fn get_status(&self, instance: &str) -> Option<InstanceStatus> {
        let info = self.store.instance_info(instance).await;
        let history = self.store.read(instance).await;
        if history.is_empty() && info.is_none() {
            return None;
        }
        let p = status::project(&history);
        let info = info.unwrap_or_default();
        Some(InstanceStatus {
            instance: instance.to_string(),
            orchestration: p.orchestration,
            runtime_status: p.runtime_status,
            input: p.input,
            output: p.output,
            error: p.error,
            custom_status: info.custom_status,
            created_at_ms: info.created_at_ms,
            updated_at_ms: info.updated_at_ms,
        })
    }

    /// Poll until terminal status or timeout, with bounded backoff.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: std::time::Duration,
    ) -> Result<InstanceStatus, WaitError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut delay_ms: u64 = 5;
        loop {
            if let Some(st) = self.get_status(instance).await {
                if st.runtime_status.is_terminal() {
                    return Ok(st);
                }
            }
            if std::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            delay_ms = (delay_ms.saturating_mul(2)).min(100);
        }
    }

    pub async fn wait_for_orchestration_typed<Out: serde::de::DeserializeOwned>(
        &self,
        instance: &str,
        timeout: std::time::Duration,
    ) -> Result<Result<Out, String>, WaitError> {
        let st = self.wait_for_orchestration(instance, timeout).await?;
        match st.runtime_status {
            RuntimeStatus::Completed => {
                let output = st.output.unwrap_or_default();
                match crate::codec::decode::<Out>(&output) {
                    Ok(v) => Ok(Ok(v)),
                    Err(e) => Err(WaitError::Other(format!("decode failed: {e}"))),
                }
            }
            _ => Ok(Err(st.error.unwrap_or_default())),
        }
    }

    /// Delete a terminal instance's history. Refused while running.
    pub async fn purge(&self, instance: &str) -> Result<(), StoreError> {
        let history = self.store.read(instance).await;
        if history.is_empty() {
            return Err(StoreError::InstanceNotFound(instance.to_string()));
        }
        let p = status::project(&history);
        if !p.runtime_status.is_terminal() {
            return Err(StoreError::Io(format!(
                "cannot purge non-terminal instance {instance} ({})",
                p.runtime_status
            )));
        }
        self.store.remove_instance(instance).await
    }

    pub async fn list_instances(&self) -> Vec<String> {
        self.store.list_instances().await
    }
}
