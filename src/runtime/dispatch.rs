//! Materialization of replay actions into queue work.
//!
//! Runs after a successful history append, so every item sent here is
//! backed by a persisted schedule event. Enqueues are idempotent at the
//! provider level, which makes re-dispatch after a crash safe.
use std::sync::Arc;

use crate::providers::{HistoryStore, QueueKind, StoreError, WorkItem};
use crate::{Action, Event};
use tracing::warn;

/// Turn one pass's actions into queue messages.
pub(crate) async fn dispatch_actions(
    store: &Arc<dyn HistoryStore>,
    instance: &str,
    execution_id: u64,
    actions: Vec<Action>,
) -> Result<(), StoreError> {
    for action in actions {
        match action {
            Action::CallActivity { id, name, input } => {
                store
                    .enqueue_work(
                        QueueKind::Worker,
                        WorkItem::ActivityExecute {
                            instance: instance.to_string(),
                            execution_id,
                            id,
                            name,
                            input,
                            attempt: 1,
                        },
                    )
                    .await?;
            }
            Action::CreateTimer { id, fire_at_ms } => {
                // Invisible until the deadline; the timer dispatcher
                // forwards it to the orchestrator queue once visible.
                store
                    .enqueue_work_at(
                        QueueKind::Timer,
                        WorkItem::TimerFired {
                            instance: instance.to_string(),
                            execution_id,
                            id,
                            fire_at_ms,
                        },
                        fire_at_ms,
                    )
                    .await?;
            }
            Action::WaitExternal { .. } => {
                // The subscription event in history is the whole effect.
            }
            Action::StartSubOrchestration {
                id,
                name,
                instance: suffix,
                input,
            } => {
                let child = format!("{instance}::{suffix}");
                match store.create_instance(&child).await {
                    Ok(()) => {}
                    Err(StoreError::InstanceAlreadyExists(_)) => {
                        // Re-dispatch after a conflict retry; the child is
                        // already underway.
                        continue;
                    }
                    Err(e) => return Err(e),
                }
                store
                    .append(
                        &child,
                        vec![Event::ExecutionStarted {
                            name: name.clone(),
                            input: input.clone(),
                            parent_instance: Some(instance.to_string()),
                            parent_id: Some(id),
                        }],
                        0,
                    )
                    .await?;
                store
                    .enqueue_work(
                        QueueKind::Orchestrator,
                        WorkItem::StartOrchestration {
                            instance: child,
                            orchestration: name,
                            input,
                            parent_instance: Some(instance.to_string()),
                            parent_id: Some(id),
                        },
                    )
                    .await?;
            }
            Action::ContinueAsNew { .. } => {
                // Handled by the instance pass before dispatch.
                warn!(instance, "continue-as-new action reached dispatch");
            }
        }
    }
    Ok(())
}
