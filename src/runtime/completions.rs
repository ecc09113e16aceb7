//! Translation of queue messages into history completion events.
//!
//! Activities run at least once, so the same completion can arrive more
//! than once; this module is where effectively-once application is
//! enforced: a completion is appended only if its schedule event exists,
//! no completion for that id was applied before, and it targets the
//! current execution.
use crate::providers::WorkItem;
use crate::Event;
use tracing::{debug, info, warn};

/// Decision for one incoming queue message.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CompletionDecision {
    /// Append these events and replay.
    Apply(Vec<Event>),
    /// Already applied; ack without replaying.
    Duplicate,
    /// Not applicable to this execution; ack and discard.
    Dropped(String),
}

fn has_task_schedule(history: &[Event], id: u64) -> Option<&str> {
    history.iter().find_map(|e| match e {
        Event::TaskScheduled { id: sid, name, .. } if *sid == id => Some(name.as_str()),
        _ => None,
    })
}

fn has_task_completion(history: &[Event], id: u64) -> bool {
    history.iter().any(|e| {
        matches!(e, Event::TaskCompleted { id: cid, .. } | Event::TaskFailed { id: cid, .. } if *cid == id)
    })
}

fn has_sub_orch_completion(history: &[Event], id: u64) -> bool {
    history.iter().any(|e| {
        matches!(
            e,
            Event::SubOrchestrationCompleted { id: cid, .. } | Event::SubOrchestrationFailed { id: cid, .. }
            if *cid == id
        )
    })
}

/// Decide how the message maps onto the latest execution's history.
pub(crate) fn prepare_completion(history: &[Event], latest_execution_id: u64, item: &WorkItem) -> CompletionDecision {
    match item {
        WorkItem::ActivityCompleted {
            execution_id,
            id,
            result,
            ..
        } => {
            if *execution_id != latest_execution_id {
                return CompletionDecision::Dropped(format!(
                    "stale execution: message for #{execution_id}, latest is #{latest_execution_id}"
                ));
            }
            let Some(name) = has_task_schedule(history, *id) else {
                return CompletionDecision::Dropped(format!("no schedule for completion id={id}"));
            };
            // Trace results are logged, never recorded; history stays lean
            // and the fire-and-forget trace future is never awaited.
            if name == crate::SYSTEM_TRACE_ACTIVITY {
                match result.split_once(':') {
                    Some(("ERROR", msg)) => warn!(message=%msg, "orchestration trace"),
                    Some(("WARN", msg)) => warn!(message=%msg, "orchestration trace"),
                    Some(("DEBUG", msg)) => debug!(message=%msg, "orchestration trace"),
                    Some((_, msg)) => info!(message=%msg, "orchestration trace"),
                    None => info!(message=%result, "orchestration trace"),
                }
                return CompletionDecision::Dropped("system trace".to_string());
            }
            if has_task_completion(history, *id) {
                return CompletionDecision::Duplicate;
            }
            CompletionDecision::Apply(vec![Event::TaskCompleted {
                id: *id,
                result: result.clone(),
            }])
        }
        WorkItem::ActivityFailed {
            execution_id,
            id,
            error,
            retriable,
            ..
        } => {
            if *execution_id != latest_execution_id {
                return CompletionDecision::Dropped(format!(
                    "stale execution: message for #{execution_id}, latest is #{latest_execution_id}"
                ));
            }
            if has_task_schedule(history, *id).is_none() {
                return CompletionDecision::Dropped(format!("no schedule for failure id={id}"));
            }
            if has_task_completion(history, *id) {
                return CompletionDecision::Duplicate;
            }
            CompletionDecision::Apply(vec![Event::TaskFailed {
                id: *id,
                error: error.clone(),
                retriable: *retriable,
            }])
        }
        WorkItem::TimerFired { execution_id, id, .. } => {
            if *execution_id != latest_execution_id {
                return CompletionDecision::Dropped(format!(
                    "stale execution: message for #{execution_id}, latest is #{latest_execution_id}"
                ));
            }
            if !history.iter().any(|e| matches!(e, Event::TimerCreated { id: tid, .. } if tid == id)) {
                return CompletionDecision::Dropped(format!("no timer for firing id={id}"));
            }
            if history.iter().any(|e| matches!(e, Event::TimerFired { id: tid } if tid == id)) {
                return CompletionDecision::Duplicate;
            }
            CompletionDecision::Apply(vec![Event::TimerFired { id: *id }])
        }
        WorkItem::ExternalRaised { name, payload, .. } => {
            // Route to the earliest open subscription for this name.
            let open = history.iter().find_map(|e| match e {
                Event::EventSubscribed { id, name: n } if n == name => {
                    let resolved = history
                        .iter()
                        .any(|e2| matches!(e2, Event::EventRaised { id: rid, .. } if rid == id));
                    if resolved { None } else { Some(*id) }
                }
                _ => None,
            });
            match open {
                Some(id) => CompletionDecision::Apply(vec![Event::EventRaised {
                    id,
                    name: name.clone(),
                    payload: payload.clone(),
                }]),
                None => CompletionDecision::Dropped(format!("no open subscription for event '{name}'")),
            }
        }
        WorkItem::SubOrchCompleted {
            parent_execution_id,
            parent_id,
            result,
            ..
        } => {
            if *parent_execution_id != latest_execution_id {
                return CompletionDecision::Dropped(format!(
                    "stale execution: message for #{parent_execution_id}, latest is #{latest_execution_id}"
                ));
            }
            let scheduled = history
                .iter()
                .any(|e| matches!(e, Event::SubOrchestrationScheduled { id, .. } if id == parent_id));
            if !scheduled {
                return CompletionDecision::Dropped(format!("no sub-orchestration for completion id={parent_id}"));
            }
            if has_sub_orch_completion(history, *parent_id) {
                return CompletionDecision::Duplicate;
            }
            CompletionDecision::Apply(vec![Event::SubOrchestrationCompleted {
                id: *parent_id,
                result: result.clone(),
            }])
        }
        WorkItem::SubOrchFailed {
            parent_execution_id,
            parent_id,
            error,
            ..
        } => {
            if *parent_execution_id != latest_execution_id {
                return CompletionDecision::Dropped(format!(
                    "stale execution: message for #{parent_execution_id}, latest is #{latest_execution_id}"
                ));
            }
            let scheduled = history
                .iter()
                .any(|e| matches!(e, Event::SubOrchestrationScheduled { id, .. } if id == parent_id));
            if !scheduled {
                return CompletionDecision::Dropped(format!("no sub-orchestration for failure id={parent_id}"));
            }
            if has_sub_orch_completion(history, *parent_id) {
                return CompletionDecision::Duplicate;
            }
            CompletionDecision::Apply(vec![Event::SubOrchestrationFailed {
                id: *parent_id,
                error: error.clone(),
            }])
        }
        // Activation and control messages carry no completion payload.
        WorkItem::StartOrchestration { .. } | WorkItem::ActivityExecute { .. } | WorkItem::Terminate { .. } => {
            CompletionDecision::Apply(Vec::new())
        }
    }
}
