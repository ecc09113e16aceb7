use std::sync::Arc;

use crate::runtime::OrchestrationHandler;
use crate::{Event, TurnOutcome};

/// Pluggable turn driver. The default polls the orchestrator once per
/// pass; tests can substitute an engine that injects faults or inspects
/// intermediate state.
pub trait ReplayEngine: Send + Sync {
    /// Replay one pass over `history` and return its full outcome.
    fn replay(
        &self,
        history: Vec<Event>,
        turn_index: u64,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> TurnOutcome;
}

pub struct DefaultReplayEngine;

impl Default for DefaultReplayEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultReplayEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ReplayEngine for DefaultReplayEngine {
    fn replay(
        &self,
        history: Vec<Event>,
        turn_index: u64,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> TurnOutcome {
        let orchestrator = |ctx: crate::OrchestrationContext| {
            let h = handler.clone();
            let inp = input.clone();
            async move { h.invoke(ctx, inp).await }
        };
        crate::run_turn_outcome(history, turn_index, orchestrator)
    }
}
