//! Durable task-hub orchestration core.
//!
//! Workflows ("orchestrations") are async functions whose progress is
//! event-sourced: every decision they make is recorded as an append-only
//! `Event` and re-derived by deterministic replay, so logical progress
//! survives process restarts, crashes, and activity retries without the
//! workflow author writing any persistence code. The crate provides:
//!
//! - The public data model: `Event`, `Action`, `WorkItem` (in `providers`)
//! - The replay step function: `run_turn` / `run_turn_outcome` — each pass
//!   takes a history prefix and returns the next actions plus whether the
//!   orchestration suspended or completed; suspension is a finished pass,
//!   never a blocked thread
//! - An `OrchestrationContext` exposing replay-safe primitives
//!   (`schedule_activity`, `schedule_timer`, `schedule_wait`,
//!   `schedule_sub_orchestration`, `current_time_ms`, `new_guid`) as
//!   `DurableFuture`s correlated by per-instance sequence ids
//! - A task-hub `runtime` that owns instance lifecycle, activity dispatch
//!   with retries, and status projection over pluggable `providers`
use std::cell::Cell;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub mod client;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;

pub use crate::client::Client;
pub use crate::futures::{DurableFuture, DurableOutput, JoinFuture, SelectFuture};
pub use crate::logging::LogLevel;
pub use runtime::registry::{ActivityError, ActivityRegistry, OrchestrationRegistry};
pub use runtime::{InstanceStatus, OrchestrationHandler, RuntimeStatus};

// Internal system activity names; their results are captured as history
// events, which is what makes wall-clock time and GUIDs replay-safe.
pub(crate) const SYSTEM_TRACE_ACTIVITY: &str = "__system_trace";
pub(crate) const SYSTEM_NOW_ACTIVITY: &str = "__system_now";
pub(crate) const SYSTEM_NEW_GUID_ACTIVITY: &str = "__system_new_guid";

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

// JSON codec for the typed helper APIs; payloads cross the engine boundary
// as strings so providers stay oblivious to user types.
pub(crate) mod codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;

    pub fn encode<T: Serialize>(v: &T) -> Result<String, String> {
        // A JSON string value is stored raw so plain-string orchestrations
        // and typed orchestrations read the same history.
        match serde_json::to_value(v) {
            Ok(Value::String(s)) => Ok(s),
            Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
        match serde_json::from_str::<T>(s) {
            Ok(v) => Ok(v),
            Err(_) => {
                let val = Value::String(s.to_string());
                serde_json::from_value(val).map_err(|e| e.to_string())
            }
        }
    }
}

/// Append-only history entries persisted by a provider and consumed during
/// replay. Scheduling variants and their completions are paired by a
/// per-execution monotonic sequence `id`; replay must re-derive identical
/// ids for an identical prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Instance execution was created with the orchestration name and input.
    /// Parent linkage is present when this is a sub-orchestration.
    ExecutionStarted {
        name: String,
        input: String,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
    },
    /// Orchestration returned successfully (terminal).
    ExecutionCompleted { output: String },
    /// Orchestration failed (terminal): user error or determinism violation.
    ExecutionFailed { error: String },
    /// Instance was terminated by an operator request (terminal).
    ExecutionTerminated { reason: String },
    /// Execution restarted with fresh input (terminal for this execution;
    /// the instance id lives on with a new history and sequence-id space).
    ContinuedAsNew { input: String },

    /// Activity was scheduled once with a unique sequence id.
    TaskScheduled { id: u64, name: String, input: String },
    /// Activity completed; at most one completion is applied per id.
    TaskCompleted { id: u64, result: String },
    /// Activity failed after the dispatcher exhausted its retry policy
    /// (`retriable` records the last classification for diagnostics).
    TaskFailed { id: u64, error: String, retriable: bool },

    /// Durable timer was created; `fire_at_ms` is fixed at first issuance.
    TimerCreated { id: u64, fire_at_ms: u64 },
    /// The timer's logical deadline elapsed.
    TimerFired { id: u64 },

    /// Subscription to an external event by name.
    EventSubscribed { id: u64, name: String },
    /// External event delivered to the matching subscription.
    EventRaised { id: u64, name: String, payload: String },

    /// Sub-orchestration scheduled with a deterministic child instance id.
    SubOrchestrationScheduled {
        id: u64,
        name: String,
        instance: String,
        input: String,
    },
    /// Sub-orchestration completed and returned a result to the parent.
    SubOrchestrationCompleted { id: u64, result: String },
    /// Sub-orchestration failed and returned an error to the parent.
    SubOrchestrationFailed { id: u64, error: String },
}

impl Event {
    /// True for events that end the current execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::ExecutionCompleted { .. }
                | Event::ExecutionFailed { .. }
                | Event::ExecutionTerminated { .. }
                | Event::ContinuedAsNew { .. }
        )
    }
}

/// Declarative decisions produced by one replay pass. The runtime
/// materializes these into work items exactly once; replay never re-issues
/// an action whose schedule event is already in history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Dispatch an activity invocation to the worker queue.
    CallActivity { id: u64, name: String, input: String },
    /// Arm a durable timer firing at the given wall-clock deadline.
    CreateTimer { id: u64, fire_at_ms: u64 },
    /// Subscribe to an external event by name. The subscription record in
    /// history is the whole effect; nothing is dispatched.
    WaitExternal { id: u64, name: String },
    /// Start a child orchestration whose result routes back to the parent.
    StartSubOrchestration {
        id: u64,
        name: String,
        instance: String,
        input: String,
    },
    /// Restart this instance with new input (terminal for this execution).
    ContinueAsNew { input: String },
}

#[derive(Debug)]
struct CtxInner {
    history: Vec<Event>,
    actions: Vec<Action>,

    // Next sequence id, assigned in program order; seeded past the max id
    // already present in history so re-execution and first execution agree.
    next_sequence_id: u64,

    turn_index: u64,
    logging_enabled_this_poll: bool,
    log_buffer: Vec<(LogLevel, String)>,

    // Opaque status the orchestrator may publish; projected by status
    // queries, never consumed by replay.
    custom_status: Option<String>,

    // Ids claimed by futures during this pass. Stops two futures adopting
    // the same schedule event and lets the runtime validate that every
    // applied completion was actually awaited.
    claimed_task_ids: HashSet<u64>,
    claimed_timer_ids: HashSet<u64>,
    claimed_event_ids: HashSet<u64>,
    claimed_sub_ids: HashSet<u64>,
}

impl CtxInner {
    fn new(history: Vec<Event>) -> Self {
        let mut max_id = 0u64;
        for ev in &history {
            let id_opt = match ev {
                Event::TaskScheduled { id, .. }
                | Event::TaskCompleted { id, .. }
                | Event::TaskFailed { id, .. }
                | Event::TimerCreated { id, .. }
                | Event::TimerFired { id, .. }
                | Event::EventSubscribed { id, .. }
                | Event::EventRaised { id, .. }
                | Event::SubOrchestrationScheduled { id, .. }
                | Event::SubOrchestrationCompleted { id, .. }
                | Event::SubOrchestrationFailed { id, .. } => Some(*id),
                Event::ExecutionStarted { .. }
                | Event::ExecutionCompleted { .. }
                | Event::ExecutionFailed { .. }
                | Event::ExecutionTerminated { .. }
                | Event::ContinuedAsNew { .. } => None,
            };
            if let Some(id) = id_opt {
                max_id = max_id.max(id);
            }
        }
        Self {
            history,
            actions: Vec::new(),
            next_sequence_id: max_id.saturating_add(1),
            turn_index: 0,
            logging_enabled_this_poll: false,
            log_buffer: Vec::new(),
            custom_status: None,
            claimed_task_ids: HashSet::new(),
            claimed_timer_ids: HashSet::new(),
            claimed_event_ids: HashSet::new(),
            claimed_sub_ids: HashSet::new(),
        }
    }

    fn record_action(&mut self, a: Action) {
        // A new decision means this poll is making fresh progress, so
        // buffered orchestrator logs may be flushed for this turn.
        self.logging_enabled_this_poll = true;
        self.actions.push(a);
    }

    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_sequence_id;
        self.next_sequence_id += 1;
        id
    }
}

/// User-facing orchestration context: all interaction with the outside
/// world goes through these replay-safe primitives.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a context over an existing history prefix.
    pub fn new(history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history))),
        }
    }

    fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.inner.lock().unwrap().actions)
    }

    /// Zero-based pass counter assigned by the runtime, for diagnostics.
    pub fn turn_index(&self) -> u64 {
        self.inner.lock().unwrap().turn_index
    }
    pub(crate) fn set_turn_index(&self, idx: u64) {
        self.inner.lock().unwrap().turn_index = idx;
    }

    /// Whether logging is enabled for the current poll; flipped on when a
    /// decision is recorded so replayed prefixes stay silent.
    pub fn is_logging_enabled(&self) -> bool {
        self.inner.lock().unwrap().logging_enabled_this_poll
    }
    /// Drain the log messages buffered during the last pass.
    pub fn take_log_buffer(&self) -> Vec<(LogLevel, String)> {
        std::mem::take(&mut self.inner.lock().unwrap().log_buffer)
    }
    /// Buffer a structured log message for the current pass.
    pub fn push_log(&self, level: LogLevel, msg: String) {
        self.inner.lock().unwrap().log_buffer.push((level, msg));
    }

    /// Publish an opaque custom status visible through status queries.
    /// Recomputed deterministically on every replay; the latest call in
    /// program order wins.
    pub fn set_custom_status(&self, value: impl Into<String>) {
        self.inner.lock().unwrap().custom_status = Some(value.into());
    }

    /// Emit a trace entry through the system trace activity so it is
    /// recorded exactly once across replays.
    pub fn trace(&self, level: impl Into<String>, message: impl Into<String>) {
        let payload = format!("{}:{}", level.into(), message.into());
        let mut fut = self.schedule_activity(SYSTEM_TRACE_ACTIVITY, payload);
        let _ = poll_once(&mut fut);
    }
    pub fn trace_info(&self, message: impl Into<String>) {
        self.trace("INFO", message.into());
    }
    pub fn trace_warn(&self, message: impl Into<String>) {
        self.trace("WARN", message.into());
    }
    pub fn trace_error(&self, message: impl Into<String>) {
        self.trace("ERROR", message.into());
    }
    pub fn trace_debug(&self, message: impl Into<String>) {
        self.trace("DEBUG", message.into());
    }

    /// Replay-safe wall-clock time in milliseconds since the epoch, backed
    /// by a system activity whose result is captured in history.
    pub async fn current_time_ms(&self) -> u64 {
        let v = self
            .schedule_activity(SYSTEM_NOW_ACTIVITY, "")
            .into_activity()
            .await
            .unwrap_or_default();
        v.parse::<u64>().unwrap_or(0)
    }

    /// Replay-safe pseudo-GUID string, backed by a system activity.
    pub async fn new_guid(&self) -> String {
        self.schedule_activity(SYSTEM_NEW_GUID_ACTIVITY, "")
            .into_activity()
            .await
            .unwrap_or_default()
    }

    /// Signal that this execution should restart with new input. Terminal
    /// for the current execution; the runtime resets history to a fresh
    /// `ExecutionStarted` and the sequence-id space starts over.
    pub fn continue_as_new(&self, input: impl Into<String>) {
        let input: String = input.into();
        self.inner
            .lock()
            .unwrap()
            .record_action(Action::ContinueAsNew { input });
    }

    pub fn continue_as_new_typed<In: Serialize>(&self, input: &In) {
        let payload = codec::encode(input).expect("encode");
        self.continue_as_new(payload);
    }
}

use crate::futures::{AggregateDurableFuture, Kind};

impl DurableFuture {
    /// Await an activity result as a raw String.
    pub fn into_activity(self) -> impl Future<Output = Result<String, String>> {
        struct Map(DurableFuture);
        impl Future for Map {
            type Output = Result<String, String>;
            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                let this = unsafe { self.map_unchecked_mut(|s| &mut s.0) };
                match this.poll(cx) {
                    Poll::Ready(DurableOutput::Activity(v)) => Poll::Ready(v),
                    Poll::Ready(other) => {
                        panic!("into_activity used on non-activity future: {other:?}")
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
        Map(self)
    }

    /// Await an activity result decoded to a typed value.
    pub async fn into_activity_typed<Out: serde::de::DeserializeOwned>(self) -> Result<Out, String> {
        let s = self.into_activity().await?;
        codec::decode::<Out>(&s)
    }

    /// Await the correlated timer's firing.
    pub fn into_timer(self) -> impl Future<Output = ()> {
        struct Map(DurableFuture);
        impl Future for Map {
            type Output = ();
            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                let this = unsafe { self.map_unchecked_mut(|s| &mut s.0) };
                match this.poll(cx) {
                    Poll::Ready(DurableOutput::Timer) => Poll::Ready(()),
                    Poll::Ready(other) => panic!("into_timer used on non-timer future: {other:?}"),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
        Map(self)
    }

    /// Await the payload of the correlated external event.
    pub fn into_event(self) -> impl Future<Output = String> {
        struct Map(DurableFuture);
        impl Future for Map {
            type Output = String;
            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                let this = unsafe { self.map_unchecked_mut(|s| &mut s.0) };
                match this.poll(cx) {
                    Poll::Ready(DurableOutput::External(v)) => Poll::Ready(v),
                    Poll::Ready(other) => {
                        panic!("into_event used on non-external future: {other:?}")
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
        Map(self)
    }

    /// Await an external event decoded to a typed value.
    pub async fn into_event_typed<T: serde::de::DeserializeOwned>(self) -> T {
        codec::decode::<T>(&self.into_event().await).expect("decode")
    }

    /// Await a sub-orchestration result as a raw String.
    pub fn into_sub_orchestration(self) -> impl Future<Output = Result<String, String>> {
        struct Map(DurableFuture);
        impl Future for Map {
            type Output = Result<String, String>;
            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                let this = unsafe { self.map_unchecked_mut(|s| &mut s.0) };
                match this.poll(cx) {
                    Poll::Ready(DurableOutput::SubOrchestration(v)) => Poll::Ready(v),
                    Poll::Ready(other) => {
                        panic!("into_sub_orchestration used on non-sub-orch future: {other:?}")
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
        Map(self)
    }

    /// Await a sub-orchestration result decoded to a typed value.
    pub async fn into_sub_orchestration_typed<Out: serde::de::DeserializeOwned>(self) -> Result<Out, String> {
        match self.into_sub_orchestration().await {
            Ok(s) => codec::decode::<Out>(&s),
            Err(e) => Err(e),
        }
    }
}

impl OrchestrationContext {
    /// Schedule an activity and return a `DurableFuture` correlated to it.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let name: String = name.into();
        let input: String = input.into();
        let mut inner = self.inner.lock().unwrap();
        // Adopt the first unclaimed schedule event matching name+input so
        // replay reuses the recorded sequence id instead of re-issuing.
        let adopted = inner.history.iter().find_map(|e| match e {
            Event::TaskScheduled { id, name: n, input: inp }
                if n == &name && inp == &input && !inner.claimed_task_ids.contains(id) =>
            {
                Some(*id)
            }
            _ => None,
        });
        let id = adopted.unwrap_or_else(|| inner.next_id());
        inner.claimed_task_ids.insert(id);
        drop(inner);
        DurableFuture(Kind::Task {
            id,
            name,
            input,
            scheduled: Cell::new(false),
            ctx: self.clone(),
        })
    }

    /// Typed activity call; pairs with `into_activity_typed` for decoding.
    pub fn schedule_activity_typed<In: Serialize>(&self, name: impl Into<String>, input: &In) -> DurableFuture {
        let payload = codec::encode(input).expect("encode");
        self.schedule_activity(name, payload)
    }

    /// Create a durable timer firing after `delay_ms`.
    pub fn schedule_timer(&self, delay_ms: u64) -> DurableFuture {
        let mut inner = self.inner.lock().unwrap();
        // Adopt the first unclaimed TimerCreated; its recorded deadline
        // wins over a recomputed one so replay stays stable.
        let adopted = inner.history.iter().find_map(|e| match e {
            Event::TimerCreated { id, fire_at_ms } if !inner.claimed_timer_ids.contains(id) => {
                Some((*id, *fire_at_ms))
            }
            _ => None,
        });
        let (id, fire_at_ms) = match adopted {
            Some(pair) => pair,
            None => {
                let fire_at = inner.now_ms().saturating_add(delay_ms);
                (inner.next_id(), fire_at)
            }
        };
        inner.claimed_timer_ids.insert(id);
        drop(inner);
        DurableFuture(Kind::Timer {
            id,
            fire_at_ms,
            scheduled: Cell::new(false),
            ctx: self.clone(),
        })
    }

    /// Subscribe to an external event by name.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        let name: String = name.into();
        let mut inner = self.inner.lock().unwrap();
        let adopted = inner.history.iter().find_map(|e| match e {
            Event::EventSubscribed { id, name: n }
                if n == &name && !inner.claimed_event_ids.contains(id) =>
            {
                Some(*id)
            }
            _ => None,
        });
        let id = adopted.unwrap_or_else(|| inner.next_id());
        inner.claimed_event_ids.insert(id);
        drop(inner);
        DurableFuture(Kind::External {
            id,
            name,
            scheduled: Cell::new(false),
            ctx: self.clone(),
        })
    }

    /// Schedule a sub-orchestration. The child instance suffix is derived
    /// from the sequence id; the runtime prefixes it with the parent
    /// instance so child ids are deterministic and collision-free.
    pub fn schedule_sub_orchestration(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let name: String = name.into();
        let input: String = input.into();
        let mut inner = self.inner.lock().unwrap();
        let adopted = inner.history.iter().find_map(|e| match e {
            Event::SubOrchestrationScheduled { id, name: n, instance: inst, input: inp }
                if n == &name && inp == &input && !inner.claimed_sub_ids.contains(id) =>
            {
                Some((*id, inst.clone()))
            }
            _ => None,
        });
        let (id, instance) = match adopted {
            Some(pair) => pair,
            None => {
                let id = inner.next_id();
                (id, format!("sub::{id}"))
            }
        };
        inner.claimed_sub_ids.insert(id);
        drop(inner);
        DurableFuture(Kind::SubOrch {
            id,
            name,
            instance,
            input,
            scheduled: Cell::new(false),
            ctx: self.clone(),
        })
    }

    pub fn schedule_sub_orchestration_typed<In: Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> DurableFuture {
        let payload = codec::encode(input).expect("encode");
        self.schedule_sub_orchestration(name, payload)
    }

    /// Deterministic select over two futures: resolves to
    /// `(winner_index, output)`, the winner being the earliest completion
    /// in history order.
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        SelectFuture(AggregateDurableFuture::new_select(self.clone(), vec![a, b]))
    }
    /// Deterministic select over N futures.
    pub fn select(&self, futures: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture(AggregateDurableFuture::new_select(self.clone(), futures))
    }
    /// Join over N futures; outputs come back in input order.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture(AggregateDurableFuture::new_join(self.clone(), futures))
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

// Single cooperative poll with a no-op waker. All wakeups in this model
// are replays from the runtime, not waker notifications.
fn poll_once<F: Future>(fut: &mut F) -> Poll<F::Output> {
    let w = noop_waker();
    let mut cx = Context::from_waker(&w);
    let pinned = unsafe { Pin::new_unchecked(fut) };
    pinned.poll(&mut cx)
}

/// Result of one replay pass: updated history, newly requested actions,
/// buffered logs, and the output when the orchestration completed.
pub type TurnResult<O> = (Vec<Event>, Vec<Action>, Vec<(LogLevel, String)>, Option<O>);

/// Replay the orchestrator once against `history`. The orchestrator is
/// polled exactly once with a no-op waker: either it completes, or it
/// suspends having recorded the actions discovered this pass.
pub fn run_turn<O, F>(history: Vec<Event>, orchestrator: impl Fn(OrchestrationContext) -> F) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    run_turn_with(history, 0, orchestrator)
}

/// Same as `run_turn` with a caller-supplied pass index for diagnostics.
pub fn run_turn_with<O, F>(
    history: Vec<Event>,
    turn_index: u64,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::new(history);
    ctx.set_turn_index(turn_index);
    let mut fut = orchestrator(ctx.clone());
    let output = match poll_once(&mut fut) {
        Poll::Ready(out) => {
            ctx.inner.lock().unwrap().logging_enabled_this_poll = true;
            Some(out)
        }
        Poll::Pending => None,
    };
    let logs = ctx.take_log_buffer();
    let actions = ctx.take_actions();
    let hist_after = ctx.inner.lock().unwrap().history.clone();
    (hist_after, actions, logs, output)
}

/// Sequence ids claimed by the orchestrator's futures during one pass.
/// The runtime validates incoming completions against these to detect
/// nondeterministic code changes.
#[derive(Debug, Clone, Default)]
pub struct ClaimedIds {
    pub tasks: HashSet<u64>,
    pub timers: HashSet<u64>,
    pub events: HashSet<u64>,
    pub sub_orchestrations: HashSet<u64>,
}

/// Everything the runtime needs from one replay pass.
#[derive(Debug)]
pub struct TurnOutcome {
    pub history: Vec<Event>,
    pub actions: Vec<Action>,
    pub logs: Vec<(LogLevel, String)>,
    /// Last custom status published during this pass, if any.
    pub custom_status: Option<String>,
    pub claims: ClaimedIds,
    /// `Some` when the orchestration ran to completion this pass.
    pub output: Option<Result<String, String>>,
}

/// Full-fidelity turn driver used by the runtime's replay engine.
pub fn run_turn_outcome<F>(
    history: Vec<Event>,
    turn_index: u64,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnOutcome
where
    F: Future<Output = Result<String, String>>,
{
    let ctx = OrchestrationContext::new(history);
    ctx.set_turn_index(turn_index);
    let mut fut = orchestrator(ctx.clone());
    let output = match poll_once(&mut fut) {
        Poll::Ready(out) => {
            ctx.inner.lock().unwrap().logging_enabled_this_poll = true;
            Some(out)
        }
        Poll::Pending => None,
    };
    let logs = ctx.take_log_buffer();
    let actions = ctx.take_actions();
    let inner = ctx.inner.lock().unwrap();
    TurnOutcome {
        history: inner.history.clone(),
        actions,
        logs,
        custom_status: inner.custom_status.clone(),
        claims: ClaimedIds {
            tasks: inner.claimed_task_ids.clone(),
            timers: inner.claimed_timer_ids.clone(),
            events: inner.claimed_event_ids.clone(),
            sub_orchestrations: inner.claimed_sub_ids.clone(),
        },
        output,
    }
}
