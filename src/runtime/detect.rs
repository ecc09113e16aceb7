//! Nondeterminism detection.
//!
//! After a replay pass the completions already recorded in history must
//! line up with the futures the orchestrator actually created this pass.
//! A mismatch means the orchestration code changed underneath recorded
//! history (or used a forbidden nondeterministic source), and the
//! instance is failed rather than left to diverge silently.
use crate::{ClaimedIds, Event};

/// Completion events whose sequence id was never claimed by any future
/// during the pass. Happens when code stops awaiting work it used to
/// schedule.
pub(crate) fn detect_unclaimed_completion(history: &[Event], claims: &ClaimedIds) -> Option<String> {
    for ev in history {
        match ev {
            Event::TaskCompleted { id, .. } | Event::TaskFailed { id, .. } => {
                if !claims.tasks.contains(id) {
                    return Some(format!("completion for unclaimed activity id={id}"));
                }
            }
            Event::TimerFired { id } => {
                if !claims.timers.contains(id) {
                    return Some(format!("firing for unclaimed timer id={id}"));
                }
            }
            Event::EventRaised { id, .. } => {
                if !claims.events.contains(id) {
                    return Some(format!("event for unclaimed subscription id={id}"));
                }
            }
            Event::SubOrchestrationCompleted { id, .. } | Event::SubOrchestrationFailed { id, .. } => {
                if !claims.sub_orchestrations.contains(id) {
                    return Some(format!("completion for unclaimed sub-orchestration id={id}"));
                }
            }
            _ => {}
        }
    }
    None
}

/// Completion events whose id was scheduled as a different kind of work.
/// Catches code swaps like replacing an activity with a timer while
/// history still holds the activity's completion.
pub(crate) fn detect_kind_mismatch(history: &[Event]) -> Option<String> {
    for ev in history {
        let (id, expected): (u64, &str) = match ev {
            Event::TaskCompleted { id, .. } | Event::TaskFailed { id, .. } => (*id, "activity"),
            Event::TimerFired { id } => (*id, "timer"),
            Event::EventRaised { id, .. } => (*id, "external"),
            Event::SubOrchestrationCompleted { id, .. } | Event::SubOrchestrationFailed { id, .. } => {
                (*id, "sub-orchestration")
            }
            _ => continue,
        };
        let scheduled = history.iter().find_map(|s| match s {
            Event::TaskScheduled { id: sid, .. } if *sid == id => Some("activity"),
            Event::TimerCreated { id: sid, .. } if *sid == id => Some("timer"),
            Event::EventSubscribed { id: sid, .. } if *sid == id => Some("external"),
            Event::SubOrchestrationScheduled { id: sid, .. } if *sid == id => Some("sub-orchestration"),
            _ => None,
        });
        match scheduled {
            None => {
                return Some(format!("completion id={id} has no schedule event"));
            }
            Some(kind) if kind != expected => {
                return Some(format!(
                    "completion kind mismatch for id={id}: scheduled as {kind}, completed as {expected}"
                ));
            }
            Some(_) => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn claims_with_task(id: u64) -> ClaimedIds {
        ClaimedIds {
            tasks: HashSet::from([id]),
            ..Default::default()
        }
    }

    #[test]
    fn matched_completion_passes_both_checks() {
        let hist = vec![
            Event::TaskScheduled {
                id: 1,
                name: "A".to_string(),
                input: String::new(),
            },
            Event::TaskCompleted {
                id: 1,
                result: "r".to_string(),
            },
        ];
        assert!(detect_kind_mismatch(&hist).is_none());
        assert!(detect_unclaimed_completion(&hist, &claims_with_task(1)).is_none());
    }

    #[test]
    fn dropped_await_is_reported() {
        let hist = vec![
            Event::TaskScheduled {
                id: 1,
                name: "A".to_string(),
                input: String::new(),
            },
            Event::TaskCompleted {
                id: 1,
                result: "r".to_string(),
            },
        ];
        let err = detect_unclaimed_completion(&hist, &ClaimedIds::default());
        assert!(err.is_some());
    }

    #[test]
    fn timer_completion_for_activity_schedule_is_mismatch() {
        let hist = vec![
            Event::TaskScheduled {
                id: 1,
                name: "A".to_string(),
                input: String::new(),
            },
            Event::TimerFired { id: 1 },
        ];
        let err = detect_kind_mismatch(&hist).unwrap();
        assert!(err.contains("mismatch"), "got: {err}");
    }

    #[test]
    fn completion_without_schedule_is_reported() {
        let hist = vec![Event::TaskCompleted {
            id: 7,
            result: "r".to_string(),
        }];
        assert!(detect_kind_mismatch(&hist).is_some());
    }
}
