use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

use super::{HistoryStore, InstanceInfo, QueueEntry, QueueKind, StoreError, WorkItem};
use crate::Event;

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30_000;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct Instance {
    // execution_id starts at 1; index i holds execution i+1
    executions: Vec<Vec<Event>>,
    info: InstanceInfo,
}

#[derive(Default)]
struct Queue {
    pending: Vec<QueueEntry>,
    // token -> (entry, lock expiry); invisible until ack/abandon or expiry
    locked: HashMap<String, (QueueEntry, u64)>,
}

impl Queue {
    fn reap_expired(&mut self, now: u64) {
        let expired: Vec<String> = self
            .locked
            .iter()
            .filter(|(_, (_, until))| *until <= now)
            .map(|(t, _)| t.clone())
            .collect();
        for token in expired {
            if let Some((entry, _)) = self.locked.remove(&token) {
                self.pending.insert(0, entry);
            }
        }
    }
}

/// Volatile provider for tests and samples. Lock expiry gives the same
/// at-least-once redelivery behavior as the filesystem provider.
pub struct InMemoryHistoryStore {
    instances: Mutex<HashMap<String, Instance>>,
    orchestrator_q: Mutex<Queue>,
    worker_q: Mutex<Queue>,
    timer_q: Mutex<Queue>,
    lock_timeout_ms: u64,
    token_seq: AtomicU64,
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT_MS)
    }
}

impl InMemoryHistoryStore {
    pub fn new(lock_timeout_ms: u64) -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            orchestrator_q: Mutex::new(Queue::default()),
            worker_q: Mutex::new(Queue::default()),
            timer_q: Mutex::new(Queue::default()),
            lock_timeout_ms,
            token_seq: AtomicU64::new(1),
        }
    }

    fn queue(&self, kind: QueueKind) -> &Mutex<Queue> {
        match kind {
            QueueKind::Orchestrator => &self.orchestrator_q,
            QueueKind::Worker => &self.worker_q,
            QueueKind::Timer => &self.timer_q,
        }
    }

    fn next_token(&self) -> String {
        format!("mem-{}", self.token_seq.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        let g = self.instances.lock().await;
        match g.get(instance) {
            Some(inst) => inst.executions.last().cloned().unwrap_or_default(),
            None => Vec::new(),
        }
    }

    async fn read_with_version(&self, instance: &str) -> (Vec<Event>, u64) {
        let g = self.instances.lock().await;
        match g.get(instance).and_then(|i| i.executions.last()) {
            Some(hist) => (hist.clone(), hist.len() as u64),
            None => (Vec::new(), 0),
        }
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>, expected_version: u64) -> Result<u64, StoreError> {
        let mut g = self.instances.lock().await;
        let inst = g
            .get_mut(instance)
            .ok_or_else(|| StoreError::InstanceNotFound(instance.to_string()))?;
        let hist = inst
            .executions
            .last_mut()
            .ok_or_else(|| StoreError::InstanceNotFound(instance.to_string()))?;
        let actual = hist.len() as u64;
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                actual,
            });
        }
        hist.extend(new_events);
        inst.info.updated_at_ms = now_ms();
        Ok(hist.len() as u64)
    }

    async fn create_instance(&self, instance: &str) -> Result<(), StoreError> {
        let mut g = self.instances.lock().await;
        if g.contains_key(instance) {
            return Err(StoreError::InstanceAlreadyExists(instance.to_string()));
        }
        let now = now_ms();
        g.insert(
            instance.to_string(),
            Instance {
                executions: vec![Vec::new()],
                info: InstanceInfo {
                    created_at_ms: now,
                    updated_at_ms: now,
                    custom_status: None,
                    latest_execution_id: 1,
                },
            },
        );
        Ok(())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), StoreError> {
        let mut g = self.instances.lock().await;
        if g.remove(instance).is_none() {
            return Err(StoreError::InstanceNotFound(instance.to_string()));
        }
        Ok(())
    }

    async fn list_instances(&self) -> Vec<String> {
        self.instances.lock().await.keys().cloned().collect()
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let g = self.instances.lock().await;
        g.get(instance).map(|i| i.executions.len() as u64)
    }

    async fn list_executions(&self, instance: &str) -> Vec<u64> {
        let g = self.instances.lock().await;
        match g.get(instance) {
            Some(i) => (1..=i.executions.len() as u64).collect(),
            None => Vec::new(),
        }
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        let g = self.instances.lock().await;
        g.get(instance)
            .and_then(|i| i.executions.get((execution_id as usize).saturating_sub(1)))
            .cloned()
            .unwrap_or_default()
    }

    async fn start_new_execution(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
        parent_instance: Option<&str>,
        parent_id: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut g = self.instances.lock().await;
        let inst = g
            .get_mut(instance)
            .ok_or_else(|| StoreError::InstanceNotFound(instance.to_string()))?;
        inst.executions.push(vec![Event::ExecutionStarted {
            name: orchestration.to_string(),
            input: input.to_string(),
            parent_instance: parent_instance.map(|s| s.to_string()),
            parent_id,
        }]);
        let eid = inst.executions.len() as u64;
        inst.info.latest_execution_id = eid;
        inst.info.updated_at_ms = now_ms();
        Ok(eid)
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), StoreError> {
        self.enqueue_work_at(kind, item, 0).await
    }

    async fn enqueue_work_at(&self, kind: QueueKind, item: WorkItem, visible_at_ms: u64) -> Result<(), StoreError> {
        let mut q = self.queue(kind).lock().await;
        let entry = QueueEntry { item, visible_at_ms };
        if !q.pending.contains(&entry) {
            q.pending.push(entry);
        }
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let now = now_ms();
        let mut q = self.queue(kind).lock().await;
        q.reap_expired(now);
        let pos = q.pending.iter().position(|e| e.visible_at_ms <= now)?;
        let entry = q.pending.remove(pos);
        let token = self.next_token();
        let item = entry.item.clone();
        q.locked.insert(token.clone(), (entry, now + self.lock_timeout_ms));
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        let mut q = self.queue(kind).lock().await;
        q.locked.remove(token);
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        let mut q = self.queue(kind).lock().await;
        if let Some((mut entry, _)) = q.locked.remove(token) {
            entry.visible_at_ms = 0;
            q.pending.insert(0, entry);
        }
        Ok(())
    }

    async fn instance_info(&self, instance: &str) -> Option<InstanceInfo> {
        let g = self.instances.lock().await;
        g.get(instance).map(|i| i.info.clone())
    }

    async fn set_custom_status(&self, instance: &str, status: &str) -> Result<(), StoreError> {
        let mut g = self.instances.lock().await;
        let inst = g
            .get_mut(instance)
            .ok_or_else(|| StoreError::InstanceNotFound(instance.to_string()))?;
        inst.info.custom_status = Some(status.to_string());
        inst.info.updated_at_ms = now_ms();
        Ok(())
    }

    async fn reset(&self) {
        self.instances.lock().await.clear();
        self.orchestrator_q.lock().await.pending.clear();
        self.worker_q.lock().await.pending.clear();
        self.timer_q.lock().await.pending.clear();
    }

    async fn dump_all_pretty(&self) -> String {
        let g = self.instances.lock().await;
        let mut out = String::new();
        for (inst, data) in g.iter() {
            out.push_str(&format!("instance={inst}\n"));
            for (idx, hist) in data.executions.iter().enumerate() {
                for ev in hist {
                    out.push_str(&format!("  exec#{} {ev:#?}\n", idx + 1));
                }
            }
        }
        out
    }
}
