//! Task-hub runtime: stateless dispatcher loops over the provider queues.
//!
//! Orchestration workers process one queue message per pass: read history
//! under a version, apply the message as a completion event, replay the
//! orchestrator once, and append the resulting delta conditionally. The
//! store's conditional append is the only serialization point; a losing
//! writer sees `VersionConflict`, discards its computed actions, and
//! recomputes from fresh history. No instance state lives in memory
//! between passes.
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::{HistoryStore, QueueKind, StoreError, WorkItem};
use crate::{Event, OrchestrationContext};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod completions;
pub mod detect;
pub mod dispatch;
pub mod registry;
pub mod replay;
pub mod status;

pub use registry::{ActivityError, ActivityRegistry, OrchestrationRegistry};
pub use status::{InstanceStatus, RuntimeStatus};

use completions::CompletionDecision;
use replay::{DefaultReplayEngine, ReplayEngine};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => f.write_str("timed out waiting for orchestration"),
            WaitError::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for WaitError {}

#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Delay shape between activity retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Linear,
    Exponential,
}

/// Dispatcher-level retry for retriable activity failures. Exhausting
/// `max_attempts` converts the failure into a `TaskFailed` event the
/// orchestrator can branch on.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff: Backoff,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 50,
            backoff: Backoff::Linear,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let attempt = attempt.max(1);
        let raw = match self.backoff {
            Backoff::Fixed => self.initial_delay_ms,
            Backoff::Linear => self.initial_delay_ms.saturating_mul(attempt as u64),
            Backoff::Exponential => self
                .initial_delay_ms
                .saturating_mul(1u64 << (attempt - 1).min(32)),
        };
        raw.min(self.max_delay_ms)
    }
}

/// Host configuration for the dispatcher pools.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub orchestration_workers: usize,
    pub activity_workers: usize,
    pub idle_sleep_ms: u64,
    pub retry_policy: RetryPolicy,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            orchestration_workers: 2,
            activity_workers: 4,
            idle_sleep_ms: 10,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// The task-hub host: owns the dispatcher pools over one provider.
pub struct Runtime {
    history_store: Arc<dyn HistoryStore>,
    orchestration_registry: OrchestrationRegistry,
    replay_engine: Arc<dyn ReplayEngine>,
    options: RuntimeOptions,
    joins: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Start a runtime over an in-memory provider (tests and samples).
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        let history_store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
        Self::start_with_store(history_store, activity_registry, orchestration_registry).await
    }

    /// Start a new runtime with a custom `HistoryStore` implementation.
    pub async fn start_with_store(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    pub async fn start_with_options(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let runtime = Arc::new(Self {
            history_store,
            orchestration_registry,
            replay_engine: Arc::new(DefaultReplayEngine::new()),
            options,
            joins: tokio::sync::Mutex::new(Vec::new()),
        });

        let mut joins = Vec::new();
        for _ in 0..runtime.options.orchestration_workers {
            joins.push(runtime.clone().start_orchestration_dispatcher());
        }
        for _ in 0..runtime.options.activity_workers {
            joins.push(runtime.clone().start_activity_dispatcher(activity_registry.clone()));
        }
        joins.push(runtime.clone().start_timer_dispatcher());
        runtime.joins.lock().await.extend(joins);
        runtime
    }

    /// Abort background tasks. Queue locks expire on their own, so any
    /// in-flight item is redelivered to the next runtime over this store.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
    }

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Orchestrator).await {
                    match self.process_orchestrator_item(&item).await {
                        Ok(()) => {
                            let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                        }
                        Err(e) if e.is_retryable() => {
                            warn!(error=%e, "orchestrator pass hit a retryable store error; abandoning for redelivery");
                            let _ = self.history_store.abandon(QueueKind::Orchestrator, &token).await;
                        }
                        Err(e) => {
                            error!(error=%e, item=?item, "orchestrator pass failed permanently; dropping item");
                            let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                        }
                    }
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(self.options.idle_sleep_ms)).await;
                }
            }
        })
    }

    fn start_activity_dispatcher(self: Arc<Self>, activities: Arc<ActivityRegistry>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Worker).await {
                    match item {
                        WorkItem::ActivityExecute {
                            instance,
                            execution_id,
                            id,
                            name,
                            input,
                            attempt,
                        } => {
                            self.execute_activity(&activities, instance, execution_id, id, name, input, attempt)
                                .await;
                            let _ = self.history_store.ack(QueueKind::Worker, &token).await;
                        }
                        other => {
                            error!(?other, "unexpected WorkItem in Worker dispatcher; state corruption");
                            let _ = self.history_store.ack(QueueKind::Worker, &token).await;
                        }
                    }
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(self.options.idle_sleep_ms)).await;
                }
            }
        })
    }

    // Timer items become visible at their deadline; all this loop does is
    // forward them to the orchestrator queue.
    fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Timer).await {
                    match item {
                        WorkItem::TimerFired { .. } => {
                            let _ = self.history_store.enqueue_work(QueueKind::Orchestrator, item).await;
                            let _ = self.history_store.ack(QueueKind::Timer, &token).await;
                        }
                        other => {
                            error!(?other, "unexpected WorkItem in Timer dispatcher; state corruption");
                            let _ = self.history_store.ack(QueueKind::Timer, &token).await;
                        }
                    }
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(self.options.idle_sleep_ms)).await;
                }
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_activity(
        &self,
        activities: &ActivityRegistry,
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
        attempt: u32,
    ) {
        let Some(handler) = activities.get(&name) else {
            // Fails fast: a name with no registration can never succeed.
            let _ = self
                .history_store
                .enqueue_work(
                    QueueKind::Orchestrator,
                    WorkItem::ActivityFailed {
                        instance,
                        execution_id,
                        id,
                        error: format!("unknown activity: {name}"),
                        retriable: false,
                    },
                )
                .await;
            return;
        };
        match handler.invoke(input.clone()).await {
            Ok(result) => {
                let _ = self
                    .history_store
                    .enqueue_work(
                        QueueKind::Orchestrator,
                        WorkItem::ActivityCompleted {
                            instance,
                            execution_id,
                            id,
                            result,
                        },
                    )
                    .await;
            }
            Err(err) if err.retriable && attempt < self.options.retry_policy.max_attempts => {
                let delay = self.options.retry_policy.delay_for(attempt);
                warn!(
                    instance,
                    activity=%name,
                    attempt,
                    delay_ms = delay,
                    error=%err,
                    "activity failed; scheduling retry"
                );
                let _ = self
                    .history_store
                    .enqueue_work_at(
                        QueueKind::Worker,
                        WorkItem::ActivityExecute {
                            instance,
                            execution_id,
                            id,
                            name,
                            input,
                            attempt: attempt + 1,
                        },
                        now_ms() + delay,
                    )
                    .await;
            }
            Err(err) => {
                let _ = self
                    .history_store
                    .enqueue_work(
                        QueueKind::Orchestrator,
                        WorkItem::ActivityFailed {
                            instance,
                            execution_id,
                            id,
                            error: err.message,
                            retriable: err.retriable,
                        },
                    )
                    .await;
            }
        }
    }

    async fn process_orchestrator_item(self: &Arc<Self>, item: &WorkItem) -> Result<(), StoreError> {
        match item {
            WorkItem::Terminate { instance, reason } => self.apply_terminate(instance, reason).await,
            WorkItem::ActivityExecute { .. } => {
                error!(?item, "unexpected WorkItem in Orchestrator dispatcher; state corruption");
                Ok(())
            }
            _ => self.run_instance_pass(item.instance().to_string(), item).await,
        }
    }

    /// One pass for one instance: apply the message, replay, append the
    /// delta conditionally, then dispatch the new actions.
    async fn run_instance_pass(self: &Arc<Self>, instance: String, item: &WorkItem) -> Result<(), StoreError> {
        loop {
            let latest_exec = self.history_store.latest_execution_id(&instance).await.unwrap_or(1);
            let (history, version) = self.history_store.read_with_version(&instance).await;
            if history.is_empty() {
                warn!(instance, item=?item, "message for unknown instance; dropping");
                return Ok(());
            }

            let decision = completions::prepare_completion(&history, latest_exec, item);
            let appended = match decision {
                CompletionDecision::Apply(evs) => evs,
                CompletionDecision::Duplicate => {
                    debug!(instance, item=?item, "duplicate completion; already applied");
                    return Ok(());
                }
                CompletionDecision::Dropped(reason) => {
                    debug!(instance, %reason, "dropping completion");
                    return Ok(());
                }
            };

            // Terminal instance: accept the completion into history for
            // the record, but never replay or dispatch from it.
            if history.iter().any(|e| e.is_terminal()) {
                if appended.is_empty() {
                    debug!(instance, item=?item, "message for terminal instance; dropping");
                    return Ok(());
                }
                match self.history_store.append(&instance, appended, version).await {
                    Ok(_) => {
                        debug!(instance, "recorded completion on terminal instance");
                        return Ok(());
                    }
                    Err(StoreError::VersionConflict { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }

            let mut work_history = history.clone();
            work_history.extend(appended.clone());

            let projection = status::project(&work_history);
            let orchestration = projection.orchestration.clone();
            let Some(handler) = self.orchestration_registry.get(&orchestration) else {
                let mut events = appended;
                events.push(Event::ExecutionFailed {
                    error: format!("unregistered orchestration: {orchestration}"),
                });
                match self.history_store.append(&instance, events, version).await {
                    Ok(_) => {
                        self.notify_parent(&instance, &work_history, Err(format!(
                            "unregistered orchestration: {orchestration}"
                        )))
                        .await?;
                        return Ok(());
                    }
                    Err(StoreError::VersionConflict { .. }) => continue,
                    Err(e) => return Err(e),
                }
            };

            let outcome = self
                .replay_engine
                .replay(work_history.clone(), version, handler, projection.input.clone());

            for (level, msg) in &outcome.logs {
                match level {
                    crate::LogLevel::Error => error!(instance, "{msg}"),
                    crate::LogLevel::Warn => warn!(instance, "{msg}"),
                    crate::LogLevel::Debug => debug!(instance, "{msg}"),
                    crate::LogLevel::Info => info!(instance, "{msg}"),
                }
            }

            // Fail the instance on nondeterminism; no safe recovery exists.
            let nondeterminism =
                detect::detect_kind_mismatch(&outcome.history).or_else(|| {
                    detect::detect_unclaimed_completion(&outcome.history, &outcome.claims)
                });
            if let Some(diag) = nondeterminism {
                error!(instance, %diag, "nondeterministic orchestration");
                let mut events = appended;
                events.push(Event::ExecutionFailed {
                    error: format!("nondeterministic orchestration: {diag}"),
                });
                match self.history_store.append(&instance, events, version).await {
                    Ok(_) => {
                        self.notify_parent(
                            &instance,
                            &work_history,
                            Err(format!("nondeterministic orchestration: {diag}")),
                        )
                        .await?;
                        return Ok(());
                    }
                    Err(StoreError::VersionConflict { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }

            // Continue-as-new preempts everything else this pass.
            if let Some(new_input) = outcome.actions.iter().find_map(|a| match a {
                crate::Action::ContinueAsNew { input } => Some(input.clone()),
                _ => None,
            }) {
                let mut events = appended;
                events.push(Event::ContinuedAsNew {
                    input: new_input.clone(),
                });
                match self.history_store.append(&instance, events, version).await {
                    Ok(_) => {}
                    Err(StoreError::VersionConflict { .. }) => continue,
                    Err(e) => return Err(e),
                }
                let (parent_instance, parent_id) = parent_link(&history);
                self.history_store
                    .start_new_execution(
                        &instance,
                        &orchestration,
                        &new_input,
                        parent_instance.as_deref(),
                        parent_id,
                    )
                    .await?;
                self.history_store
                    .enqueue_work(
                        QueueKind::Orchestrator,
                        WorkItem::StartOrchestration {
                            instance: instance.clone(),
                            orchestration,
                            input: new_input,
                            parent_instance,
                            parent_id,
                        },
                    )
                    .await?;
                info!(instance, "continued as new");
                return Ok(());
            }

            // Delta = applied completions plus schedule events recorded
            // during the poll, plus the terminal event if it finished.
            let mut new_events: Vec<Event> = outcome.history[history.len()..].to_vec();
            match &outcome.output {
                Some(Ok(output)) => new_events.push(Event::ExecutionCompleted { output: output.clone() }),
                Some(Err(error)) => new_events.push(Event::ExecutionFailed { error: error.clone() }),
                None => {}
            }
            if new_events.is_empty() && outcome.custom_status.is_none() {
                return Ok(());
            }
            match self.history_store.append(&instance, new_events, version).await {
                Ok(_) => {}
                Err(StoreError::VersionConflict { expected, actual }) => {
                    debug!(instance, expected, actual, "append lost the race; recomputing");
                    continue;
                }
                Err(e) => return Err(e),
            }

            if let Some(cs) = &outcome.custom_status {
                self.history_store.set_custom_status(&instance, cs).await?;
            }

            dispatch::dispatch_actions(&self.history_store, &instance, latest_exec, outcome.actions).await?;

            if let Some(result) = outcome.output {
                info!(instance, ok = result.is_ok(), "orchestration reached a terminal state");
                self.notify_parent(&instance, &work_history, result).await?;
            }
            return Ok(());
        }
    }

    /// Terminate: append the terminal event, cascade to running children,
    /// and surface a failure to the parent if this was a sub-orchestration.
    async fn apply_terminate(self: &Arc<Self>, instance: &str, reason: &str) -> Result<(), StoreError> {
        loop {
            let (history, version) = self.history_store.read_with_version(instance).await;
            if history.is_empty() {
                warn!(instance, "terminate for unknown instance; dropping");
                return Ok(());
            }
            if history.iter().any(|e| e.is_terminal()) {
                debug!(instance, "terminate on already-terminal instance; no-op");
                return Ok(());
            }
            match self
                .history_store
                .append(
                    instance,
                    vec![Event::ExecutionTerminated {
                        reason: reason.to_string(),
                    }],
                    version,
                )
                .await
            {
                Ok(_) => {}
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
            info!(instance, %reason, "orchestration terminated");

            // Cascade to children that have not completed yet.
            for ev in &history {
                if let Event::SubOrchestrationScheduled { id, instance: suffix, .. } = ev {
                    let done = history.iter().any(|e| {
                        matches!(
                            e,
                            Event::SubOrchestrationCompleted { id: cid, .. }
                            | Event::SubOrchestrationFailed { id: cid, .. }
                            if cid == id
                        )
                    });
                    if !done {
                        let child = format!("{instance}::{suffix}");
                        self.history_store
                            .enqueue_work(
                                QueueKind::Orchestrator,
                                WorkItem::Terminate {
                                    instance: child,
                                    reason: reason.to_string(),
                                },
                            )
                            .await?;
                    }
                }
            }

            self.notify_parent(instance, &history, Err(format!("terminated: {reason}")))
                .await?;
            return Ok(());
        }
    }

    // Route a terminal result to the parent instance, if any.
    async fn notify_parent(
        &self,
        instance: &str,
        history: &[Event],
        result: Result<String, String>,
    ) -> Result<(), StoreError> {
        let (parent_instance, parent_id) = parent_link(history);
        let (Some(parent), Some(parent_id)) = (parent_instance, parent_id) else {
            return Ok(());
        };
        let parent_execution_id = self.history_store.latest_execution_id(&parent).await.unwrap_or(1);
        let item = match result {
            Ok(result) => WorkItem::SubOrchCompleted {
                parent_instance: parent,
                parent_execution_id,
                parent_id,
                result,
            },
            Err(error) => WorkItem::SubOrchFailed {
                parent_instance: parent,
                parent_execution_id,
                parent_id,
                error,
            },
        };
        debug!(instance, "routing sub-orchestration result to parent");
        self.history_store.enqueue_work(QueueKind::Orchestrator, item).await?;
        Ok(())
    }
}

fn parent_link(history: &[Event]) -> (Option<String>, Option<u64>) {
    for ev in history {
        if let Event::ExecutionStarted {
            parent_instance,
            parent_id,
            ..
        } = ev
        {
            return (parent_instance.clone(), *parent_id);
        }
    }
    (None, None)
}

impl Runtime {
    /// Create an instance and enqueue its activation.
    /// Fails with `InstanceAlreadyExists` when the id is taken; terminal
    /// instances keep their history until purged.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<(), StoreError> {
        let orchestration = orchestration.into();
        let input = input.into();
        self.history_store.create_instance(instance).await?;
        self.history_store
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
        self.history_store
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
        info!(instance, "orchestration started");
        Ok(())
    }

    pub async fn start_orchestration_typed<In: serde::Serialize>(
        &self,
        instance: &str,
        orchestration: impl Into<String>,
        input: &In,
    ) -> Result<(), StoreError> {
        let payload = crate::codec::encode(input).map_err(StoreError::Io)?;
        self.start_orchestration(instance, orchestration, payload).await
    }

    /// Raise an external event by name into a running instance. Matching
    /// against an open subscription happens during the pass.
    pub async fn raise_event(&self, instance: &str, name: impl Into<String>, payload: impl Into<String>) {
        let name = name.into();
        let payload = payload.into();
        if let Err(e) = self
            .history_store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::ExternalRaised {
                    instance: instance.to_string(),
                    name: name.clone(),
                    payload,
                },
            )
            .await
        {
            warn!(instance, event=%name, error=%e, "raise_event: failed to enqueue");
        }
    }

    /// Request termination. Honored on the next pass; activities already
    /// dispatched run to completion but their results change nothing.
    pub async fn terminate(&self, instance: &str, reason: impl Into<String>) {
        let _ = self
            .history_store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::Terminate {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
            )
            .await;
    }

    /// Read-only status projection; never replays orchestrator code.
    pub async fn get_status(&self, instance: &str) -> Option<InstanceStatus> {
        let info = self.history_store.instance_info(instance).await;
        let history = self.history_store.read(instance).await;
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

    /// Wait until the instance reaches a terminal status or the timeout
    /// elapses, polling with bounded backoff.
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

    /// Typed variant: Ok(Ok(T)) on Completed, Ok(Err(e)) on Failed or
    /// Terminated.
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

    /// Delete history for a terminal instance. Running instances are
    /// refused; terminate first.
    pub async fn purge_instance(&self, instance: &str) -> Result<(), StoreError> {
        let history = self.history_store.read(instance).await;
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
        self.history_store.remove_instance(instance).await?;
        info!(instance, "purged");
        Ok(())
    }

    /// Purge every terminal instance not updated within `retention_ms`.
    /// Returns the purged instance ids.
    pub async fn purge_expired(&self, retention_ms: u64) -> Result<Vec<String>, StoreError> {
        let cutoff = now_ms().saturating_sub(retention_ms);
        let mut purged = Vec::new();
        for instance in self.history_store.list_instances().await {
            let history = self.history_store.read(&instance).await;
            if history.is_empty() || !status::project(&history).runtime_status.is_terminal() {
                continue;
            }
            let updated = self
                .history_store
                .instance_info(&instance)
                .await
                .map(|i| i.updated_at_ms)
                .unwrap_or(0);
            if updated <= cutoff {
                self.history_store.remove_instance(&instance).await?;
                purged.push(instance);
            }
        }
        Ok(purged)
    }

    /// Debug dump of all histories via the provider.
    pub async fn dump_all_pretty(&self) -> String {
        self.history_store.dump_all_pretty().await
    }
}
