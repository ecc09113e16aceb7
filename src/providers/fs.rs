use serde::{Deserialize, Serialize};
use serde_json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::{fs, io::AsyncWriteExt};

use super::{HistoryStore, InstanceInfo, QueueEntry, QueueKind, StoreError, WorkItem};
use crate::Event;

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30_000;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// Lock sidecar contents; the deadline makes crashed consumers' items
// visible again without any recovery step.
#[derive(Serialize, Deserialize)]
struct LockedEntry {
    entry: QueueEntry,
    locked_until_ms: u64,
}

/// Filesystem-backed store writing JSONL per execution under
/// `<root>/<instance>/<execution_id>.jsonl`, with queue files and lock
/// sidecars beside them. The history version is the line count of the
/// latest execution file.
///
/// Mutations are read-modify-write over files, so clones share an
/// instance lock and one lock per queue; without them two concurrent
/// appends could both pass the version check.
#[derive(Clone)]
pub struct FsHistoryStore {
    root: PathBuf,
    orch_queue_file: PathBuf,
    work_queue_file: PathBuf,
    timer_queue_file: PathBuf,
    cap: usize,
    lock_timeout_ms: u64,
    instance_lock: Arc<Mutex<()>>,
    orch_q_lock: Arc<Mutex<()>>,
    work_q_lock: Arc<Mutex<()>>,
    timer_q_lock: Arc<Mutex<()>>,
}

impl FsHistoryStore {
    /// Create a new store rooted at the given directory path.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        let orch_q = path.join("orch-queue.jsonl");
        let work_q = path.join("work-queue.jsonl");
        let timer_q = path.join("timer-queue.jsonl");
        // best-effort create
        let _ = std::fs::create_dir_all(&path);
        let _ = std::fs::OpenOptions::new().create(true).append(true).open(&orch_q);
        let _ = std::fs::OpenOptions::new().create(true).append(true).open(&work_q);
        let _ = std::fs::OpenOptions::new().create(true).append(true).open(&timer_q);
        Self {
            root: path,
            orch_queue_file: orch_q,
            work_queue_file: work_q,
            timer_queue_file: timer_q,
            cap: 1024,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            instance_lock: Arc::new(Mutex::new(())),
            orch_q_lock: Arc::new(Mutex::new(())),
            work_q_lock: Arc::new(Mutex::new(())),
            timer_q_lock: Arc::new(Mutex::new(())),
        }
    }
    /// Create a new store with a custom history cap (useful for tests).
    pub fn new_with_cap(root: impl AsRef<Path>, reset_on_create: bool, cap: usize) -> Self {
        let mut s = Self::new(root, reset_on_create);
        s.cap = cap;
        s
    }
    /// Create a new store with a custom peek-lock timeout (useful for tests).
    pub fn new_with_lock_timeout(root: impl AsRef<Path>, reset_on_create: bool, lock_timeout_ms: u64) -> Self {
        let mut s = Self::new(root, reset_on_create);
        s.lock_timeout_ms = lock_timeout_ms;
        s
    }
    fn inst_root(&self, instance: &str) -> PathBuf {
        self.root.join(instance)
    }
    fn exec_path(&self, instance: &str, execution_id: u64) -> PathBuf {
        self.inst_root(instance).join(format!("{}.jsonl", execution_id))
    }
    fn meta_path(&self, instance: &str) -> PathBuf {
        self.inst_root(instance).join("meta.json")
    }
    fn lock_dir(&self, kind: QueueKind) -> PathBuf {
        match kind {
            QueueKind::Orchestrator => self.root.join(".locks/orch"),
            QueueKind::Worker => self.root.join(".locks/work"),
            QueueKind::Timer => self.root.join(".locks/timer"),
        }
    }
    fn lock_path(&self, kind: QueueKind, token: &str) -> PathBuf {
        self.lock_dir(kind).join(format!("{token}.lock"))
    }
    fn queue_file(&self, kind: QueueKind) -> &PathBuf {
        match kind {
            QueueKind::Orchestrator => &self.orch_queue_file,
            QueueKind::Worker => &self.work_queue_file,
            QueueKind::Timer => &self.timer_queue_file,
        }
    }
    fn queue_lock(&self, kind: QueueKind) -> &Mutex<()> {
        match kind {
            QueueKind::Orchestrator => &self.orch_q_lock,
            QueueKind::Worker => &self.work_q_lock,
            QueueKind::Timer => &self.timer_q_lock,
        }
    }

    fn read_queue(&self, kind: QueueKind) -> Vec<QueueEntry> {
        let content = std::fs::read_to_string(self.queue_file(kind)).unwrap_or_default();
        content
            .lines()
            .filter_map(|l| serde_json::from_str::<QueueEntry>(l).ok())
            .collect()
    }

    fn write_queue(&self, kind: QueueKind, entries: &[QueueEntry]) -> Result<(), StoreError> {
        // Rewrite atomically via a tmp file
        let qf = self.queue_file(kind).clone();
        let tmp = qf.with_extension("jsonl.tmp");
        {
            let mut tf = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            for e in entries {
                let line = serde_json::to_string(e)?;
                use std::io::Write as _;
                tf.write_all(line.as_bytes())?;
                tf.write_all(b"\n")?;
            }
        }
        std::fs::rename(&tmp, &qf)?;
        Ok(())
    }

    // Return items from expired locks to the queue front so a crashed
    // consumer never loses a message.
    fn reap_expired_locks(&self, kind: QueueKind, now: u64) {
        let dir = self.lock_dir(kind);
        let Ok(rd) = std::fs::read_dir(&dir) else { return };
        for ent in rd.flatten() {
            let path = ent.path();
            let Ok(data) = std::fs::read_to_string(&path) else { continue };
            let Ok(locked) = serde_json::from_str::<LockedEntry>(&data) else { continue };
            if locked.locked_until_ms <= now {
                let mut entries = self.read_queue(kind);
                entries.insert(0, locked.entry);
                if self.write_queue(kind, &entries).is_ok() {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
    }

    fn read_meta(&self, instance: &str) -> Option<InstanceInfo> {
        let data = std::fs::read_to_string(self.meta_path(instance)).ok()?;
        serde_json::from_str(&data).ok()
    }

    fn write_meta(&self, instance: &str, info: &InstanceInfo) -> Result<(), StoreError> {
        let line = serde_json::to_string(info)?;
        std::fs::write(self.meta_path(instance), line)?;
        Ok(())
    }

    fn touch_meta(&self, instance: &str, f: impl FnOnce(&mut InstanceInfo)) -> Result<(), StoreError> {
        let mut info = self.read_meta(instance).unwrap_or_default();
        f(&mut info);
        info.updated_at_ms = now_ms();
        self.write_meta(instance, &info)
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    /// Read the latest execution's JSONL file and deserialize each line.
    async fn read(&self, instance: &str) -> Vec<Event> {
        let latest = self.latest_execution_id(instance).await.unwrap_or(1);
        self.read_with_execution(instance, latest).await
    }

    async fn read_with_version(&self, instance: &str) -> (Vec<Event>, u64) {
        let hist = self.read(instance).await;
        let version = hist.len() as u64;
        (hist, version)
    }

    /// Append under optimistic concurrency: the latest execution's event
    /// count must still equal `expected_version`.
    async fn append(&self, instance: &str, new_events: Vec<Event>, expected_version: u64) -> Result<u64, StoreError> {
        let _guard = self.instance_lock.lock().await;
        let latest = self.latest_execution_id(instance).await.unwrap_or(1);
        let path = self.exec_path(instance, latest);
        if !fs::try_exists(&path).await.map_err(StoreError::from)? {
            return Err(StoreError::InstanceNotFound(instance.to_string()));
        }
        let existing = self.read_with_execution(instance, latest).await;
        let actual = existing.len() as u64;
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                actual,
            });
        }
        if existing.len() + new_events.len() > self.cap {
            return Err(StoreError::Io(format!(
                "history cap exceeded (cap={}, have={}, append={})",
                self.cap,
                existing.len(),
                new_events.len()
            )));
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(StoreError::from)?;
        let count = new_events.len() as u64;
        for ev in new_events {
            let line = serde_json::to_string(&ev)?;
            file.write_all(line.as_bytes()).await.map_err(StoreError::from)?;
            file.write_all(b"\n").await.map_err(StoreError::from)?;
        }
        file.flush().await.map_err(StoreError::from)?;
        self.touch_meta(instance, |_| {})?;
        Ok(actual + count)
    }

    async fn create_instance(&self, instance: &str) -> Result<(), StoreError> {
        let _guard = self.instance_lock.lock().await;
        fs::create_dir_all(&self.root).await.map_err(StoreError::from)?;
        let inst_dir = self.inst_root(instance);
        if fs::try_exists(&inst_dir).await.map_err(StoreError::from)? {
            return Err(StoreError::InstanceAlreadyExists(instance.to_string()));
        }
        fs::create_dir_all(&inst_dir).await.map_err(StoreError::from)?;
        let _ = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.exec_path(instance, 1))
            .await
            .map_err(StoreError::from)?;
        let now = now_ms();
        self.write_meta(
            instance,
            &InstanceInfo {
                created_at_ms: now,
                updated_at_ms: now,
                custom_status: None,
                latest_execution_id: 1,
            },
        )?;
        Ok(())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), StoreError> {
        let _guard = self.instance_lock.lock().await;
        let inst_dir = self.inst_root(instance);
        if !fs::try_exists(&inst_dir).await.map_err(StoreError::from)? {
            return Err(StoreError::InstanceNotFound(instance.to_string()));
        }
        fs::remove_dir_all(&inst_dir).await.map_err(StoreError::from)?;
        Ok(())
    }

    /// List instances by scanning instance directories.
    async fn list_instances(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(mut rd) = fs::read_dir(&self.root).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                let path = ent.path();
                if let Some(name) = ent.file_name().to_str() {
                    if path.is_dir() && !name.starts_with('.') {
                        out.push(name.to_string());
                    }
                }
            }
        }
        out
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let inst_dir = self.inst_root(instance);
        let mut max_eid = 0u64;
        if let Ok(mut rd) = fs::read_dir(&inst_dir).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                if let Some(name) = ent.file_name().to_str() {
                    if let Some(stem) = name.strip_suffix(".jsonl") {
                        if let Ok(id) = stem.parse::<u64>() {
                            max_eid = max_eid.max(id);
                        }
                    }
                }
            }
        }
        if max_eid == 0 { None } else { Some(max_eid) }
    }

    async fn list_executions(&self, instance: &str) -> Vec<u64> {
        match self.latest_execution_id(instance).await {
            Some(lat) => (1..=lat).collect(),
            None => Vec::new(),
        }
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        let path = self.exec_path(instance, execution_id);
        let data = fs::read_to_string(&path).await.unwrap_or_default();
        let mut out = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(ev) = serde_json::from_str::<Event>(line) {
                out.push(ev)
            }
        }
        out
    }

    async fn start_new_execution(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
        parent_instance: Option<&str>,
        parent_id: Option<u64>,
    ) -> Result<u64, StoreError> {
        let _guard = self.instance_lock.lock().await;
        let lat = self.latest_execution_id(instance).await.unwrap_or(0) + 1;
        fs::create_dir_all(self.inst_root(instance))
            .await
            .map_err(StoreError::from)?;
        let path = self.exec_path(instance, lat);
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
            .map_err(StoreError::from)?;
        let started = Event::ExecutionStarted {
            name: orchestration.to_string(),
            input: input.to_string(),
            parent_instance: parent_instance.map(|s| s.to_string()),
            parent_id,
        };
        let line = serde_json::to_string(&started)?;
        file.write_all(line.as_bytes()).await.map_err(StoreError::from)?;
        file.write_all(b"\n").await.map_err(StoreError::from)?;
        file.flush().await.map_err(StoreError::from)?;
        self.touch_meta(instance, |info| info.latest_execution_id = lat)?;
        Ok(lat)
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), StoreError> {
        self.enqueue_work_at(kind, item, 0).await
    }

    async fn enqueue_work_at(&self, kind: QueueKind, item: WorkItem, visible_at_ms: u64) -> Result<(), StoreError> {
        let _guard = self.queue_lock(kind).lock().await;
        // Idempotent enqueue: only append if an identical item is absent
        let mut entries = self.read_queue(kind);
        if entries.iter().any(|e| e.item == item) {
            return Ok(());
        }
        entries.push(QueueEntry { item, visible_at_ms });
        self.write_queue(kind, &entries)
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let _guard = self.queue_lock(kind).lock().await;
        let now = now_ms();
        self.reap_expired_locks(kind, now);
        let mut entries = self.read_queue(kind);
        let pos = entries.iter().position(|e| e.visible_at_ms <= now)?;
        let entry = entries.remove(pos);
        self.write_queue(kind, &entries).ok()?;
        // Persist the locked item in a sidecar with its expiry
        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let pid = std::process::id();
        let token = format!("{now_ns:x}-{pid:x}");
        let _ = std::fs::create_dir_all(self.lock_dir(kind));
        let item = entry.item.clone();
        let locked = LockedEntry {
            entry,
            locked_until_ms: now + self.lock_timeout_ms,
        };
        let line = serde_json::to_string(&locked).ok()?;
        std::fs::write(self.lock_path(kind, &token), line).ok()?;
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        let _guard = self.queue_lock(kind).lock().await;
        let path = self.lock_path(kind, token);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        let _guard = self.queue_lock(kind).lock().await;
        // Read locked item and re-enqueue at front, then remove lock
        let path = self.lock_path(kind, token);
        if !path.exists() {
            return Ok(());
        }
        let data = std::fs::read_to_string(&path)?;
        let locked: LockedEntry = serde_json::from_str(&data)?;
        let mut entries = self.read_queue(kind);
        let mut entry = locked.entry;
        entry.visible_at_ms = 0;
        entries.insert(0, entry);
        self.write_queue(kind, &entries)?;
        std::fs::remove_file(&path)?;
        Ok(())
    }

    async fn instance_info(&self, instance: &str) -> Option<InstanceInfo> {
        self.read_meta(instance)
    }

    async fn set_custom_status(&self, instance: &str, status: &str) -> Result<(), StoreError> {
        let _guard = self.instance_lock.lock().await;
        if !self.inst_root(instance).exists() {
            return Err(StoreError::InstanceNotFound(instance.to_string()));
        }
        self.touch_meta(instance, |info| info.custom_status = Some(status.to_string()))
    }

    /// Remove the root directory and all contents.
    async fn reset(&self) {
        let _ = fs::remove_dir_all(&self.root).await;
    }

    /// Produce a human-readable dump of all stored histories.
    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for inst in self.list_instances().await {
            out.push_str(&format!("instance={inst}\n"));
            if let Some(lat) = self.latest_execution_id(&inst).await {
                for eid in 1..=lat {
                    for ev in self.read_with_execution(&inst, eid).await {
                        out.push_str(&format!("  exec#{eid} {ev:#?}\n"));
                    }
                }
            }
        }
        out
    }
}
