//! Unified durable futures for activities, timers, external events, and
//! sub-orchestrations.
//!
//! Each future carries its correlation id, assigned (or adopted from
//! history) by the context at schedule time. On first poll the future
//! records the schedule event and action if history does not already hold
//! them; afterwards it resolves purely by scanning history for its
//! completion. Polls never block: a missing completion means `Pending`,
//! and the runtime replays the orchestrator when new events arrive.
use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{Action, Event, OrchestrationContext};

/// Output of a `DurableFuture` when awaited via unified composition.
#[derive(Debug, Clone)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
    SubOrchestration(Result<String, String>),
}

/// A composable future correlated to one scheduled operation.
pub struct DurableFuture(pub(crate) Kind);

pub(crate) enum Kind {
    Task {
        id: u64,
        name: String,
        input: String,
        scheduled: Cell<bool>,
        ctx: OrchestrationContext,
    },
    Timer {
        id: u64,
        fire_at_ms: u64,
        scheduled: Cell<bool>,
        ctx: OrchestrationContext,
    },
    External {
        id: u64,
        name: String,
        scheduled: Cell<bool>,
        ctx: OrchestrationContext,
    },
    SubOrch {
        id: u64,
        name: String,
        instance: String,
        input: String,
        scheduled: Cell<bool>,
        ctx: OrchestrationContext,
    },
}

impl Future for DurableFuture {
    type Output = DurableOutput;
    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.0 {
            Kind::Task { id, name, input, scheduled, ctx } => {
                let mut inner = ctx.inner.lock().unwrap();
                if !scheduled.get() {
                    let exists = inner
                        .history
                        .iter()
                        .any(|e| matches!(e, Event::TaskScheduled { id: eid, .. } if eid == id));
                    if !exists {
                        inner.history.push(Event::TaskScheduled {
                            id: *id,
                            name: name.clone(),
                            input: input.clone(),
                        });
                        inner.record_action(Action::CallActivity {
                            id: *id,
                            name: name.clone(),
                            input: input.clone(),
                        });
                    }
                    scheduled.set(true);
                }
                for e in &inner.history {
                    match e {
                        Event::TaskCompleted { id: cid, result } if cid == id => {
                            return Poll::Ready(DurableOutput::Activity(Ok(result.clone())));
                        }
                        Event::TaskFailed { id: cid, error, .. } if cid == id => {
                            return Poll::Ready(DurableOutput::Activity(Err(error.clone())));
                        }
                        _ => {}
                    }
                }
                Poll::Pending
            }
            Kind::Timer { id, fire_at_ms, scheduled, ctx } => {
                let mut inner = ctx.inner.lock().unwrap();
                if !scheduled.get() {
                    let exists = inner
                        .history
                        .iter()
                        .any(|e| matches!(e, Event::TimerCreated { id: eid, .. } if eid == id));
                    if !exists {
                        inner.history.push(Event::TimerCreated {
                            id: *id,
                            fire_at_ms: *fire_at_ms,
                        });
                        inner.record_action(Action::CreateTimer {
                            id: *id,
                            fire_at_ms: *fire_at_ms,
                        });
                    }
                    scheduled.set(true);
                }
                let fired = inner
                    .history
                    .iter()
                    .any(|e| matches!(e, Event::TimerFired { id: fid } if fid == id));
                if fired {
                    Poll::Ready(DurableOutput::Timer)
                } else {
                    Poll::Pending
                }
            }
            Kind::External { id, name, scheduled, ctx } => {
                let mut inner = ctx.inner.lock().unwrap();
                if !scheduled.get() {
                    let exists = inner
                        .history
                        .iter()
                        .any(|e| matches!(e, Event::EventSubscribed { id: eid, .. } if eid == id));
                    if !exists {
                        inner.history.push(Event::EventSubscribed {
                            id: *id,
                            name: name.clone(),
                        });
                        inner.record_action(Action::WaitExternal {
                            id: *id,
                            name: name.clone(),
                        });
                    }
                    scheduled.set(true);
                }
                for e in &inner.history {
                    if let Event::EventRaised { id: cid, payload, .. } = e {
                        if cid == id {
                            return Poll::Ready(DurableOutput::External(payload.clone()));
                        }
                    }
                }
                Poll::Pending
            }
            Kind::SubOrch {
                id,
                name,
                instance,
                input,
                scheduled,
                ctx,
            } => {
                let mut inner = ctx.inner.lock().unwrap();
                if !scheduled.get() {
                    let exists = inner.history.iter().any(
                        |e| matches!(e, Event::SubOrchestrationScheduled { id: eid, .. } if eid == id),
                    );
                    if !exists {
                        inner.history.push(Event::SubOrchestrationScheduled {
                            id: *id,
                            name: name.clone(),
                            instance: instance.clone(),
                            input: input.clone(),
                        });
                        inner.record_action(Action::StartSubOrchestration {
                            id: *id,
                            name: name.clone(),
                            instance: instance.clone(),
                            input: input.clone(),
                        });
                    }
                    scheduled.set(true);
                }
                for e in &inner.history {
                    match e {
                        Event::SubOrchestrationCompleted { id: cid, result } if cid == id => {
                            return Poll::Ready(DurableOutput::SubOrchestration(Ok(result.clone())));
                        }
                        Event::SubOrchestrationFailed { id: cid, error } if cid == id => {
                            return Poll::Ready(DurableOutput::SubOrchestration(Err(error.clone())));
                        }
                        _ => {}
                    }
                }
                Poll::Pending
            }
        }
    }
}

// Index of a child's completion event within history; select winners are
// decided by this position so replay always agrees with first execution.
fn completion_index(history: &[Event], child: &Kind) -> Option<usize> {
    history.iter().position(|e| match (child, e) {
        (Kind::Task { id, .. }, Event::TaskCompleted { id: cid, .. }) => cid == id,
        (Kind::Task { id, .. }, Event::TaskFailed { id: cid, .. }) => cid == id,
        (Kind::Timer { id, .. }, Event::TimerFired { id: cid }) => cid == id,
        (Kind::External { id, .. }, Event::EventRaised { id: cid, .. }) => cid == id,
        (Kind::SubOrch { id, .. }, Event::SubOrchestrationCompleted { id: cid, .. }) => cid == id,
        (Kind::SubOrch { id, .. }, Event::SubOrchestrationFailed { id: cid, .. }) => cid == id,
        _ => false,
    })
}

enum AggregateMode {
    Select,
    Join,
}

/// Shared machinery behind `select`/`join` composition.
pub(crate) struct AggregateDurableFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
    mode: AggregateMode,
}

impl AggregateDurableFuture {
    pub(crate) fn new_select(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self {
            ctx,
            children,
            mode: AggregateMode::Select,
        }
    }
    pub(crate) fn new_join(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self {
            ctx,
            children,
            mode: AggregateMode::Join,
        }
    }

    fn poll_select(&mut self, cx: &mut Context<'_>) -> Poll<(usize, DurableOutput)> {
        // Poll every child first so all schedule events are recorded even
        // for eventual losers.
        for child in &mut self.children {
            let _ = Pin::new(child).poll(cx);
        }
        let history = self.ctx.inner.lock().unwrap().history.clone();
        let mut winner: Option<(usize, usize)> = None; // (history index, child index)
        for (ci, child) in self.children.iter().enumerate() {
            if let Some(hi) = completion_index(&history, &child.0) {
                if winner.map(|(whi, _)| hi < whi).unwrap_or(true) {
                    winner = Some((hi, ci));
                }
            }
        }
        match winner {
            Some((_, ci)) => match Pin::new(&mut self.children[ci]).poll(cx) {
                Poll::Ready(out) => Poll::Ready((ci, out)),
                Poll::Pending => Poll::Pending,
            },
            None => Poll::Pending,
        }
    }

    fn poll_join(&mut self, cx: &mut Context<'_>) -> Poll<Vec<DurableOutput>> {
        let mut outputs: Vec<Option<DurableOutput>> = Vec::with_capacity(self.children.len());
        for child in &mut self.children {
            match Pin::new(child).poll(cx) {
                Poll::Ready(out) => outputs.push(Some(out)),
                Poll::Pending => outputs.push(None),
            }
        }
        if outputs.iter().all(|o| o.is_some()) {
            Poll::Ready(outputs.into_iter().flatten().collect())
        } else {
            Poll::Pending
        }
    }
}

/// Future returned by `ctx.select`/`ctx.select2`: resolves to the winner's
/// index and output.
pub struct SelectFuture(pub(crate) AggregateDurableFuture);

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(matches!(this.0.mode, AggregateMode::Select));
        this.0.poll_select(cx)
    }
}

/// Future returned by `ctx.join`: resolves to all outputs in input order.
pub struct JoinFuture(pub(crate) AggregateDurableFuture);

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(matches!(this.0.mode, AggregateMode::Join));
        this.0.poll_join(cx)
    }
}
