// 12.0 supervisor.rs: long running protocol work as durable background tasks.
// a task is Pending until it ends in Success or Failed(detail). the record lives
// in storage so a restart can re-enter it. one pending task per (kind, channel);
// asking again hands back a watch on the existing one.
//
// 12.1 retryable errors are retried with exponential backoff up to max_attempts.
// cancel() fails the task and leaves channel state as it is. shutdown() stops all
// tasks but keeps them Pending for the next start.

use crate::config::RetrySettings;
use crate::engine::EngineError;
use crate::events::{EventHub, EventPayload, TaskKind, TaskStatus, TaskUpdate};
use crate::order::TradePlan;
use crate::storage::Storage;
use crate::types::{ChannelId, Clock, OrderId, Price, ProtocolId, TaskId, Timestamp};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// What the task was asked to do. Enough to rebuild the work after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskInput {
    Trade { order_id: OrderId },
    Rollover,
    CollaborativeRevert { price: Option<Price> },
    FullSync,
    RecoverDlc,
}

impl TaskInput {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskInput::Trade { .. } => TaskKind::AsyncTrade,
            TaskInput::Rollover => TaskKind::Rollover,
            TaskInput::CollaborativeRevert { .. } => TaskKind::CollaborativeRevert,
            TaskInput::FullSync => TaskKind::FullSync,
            TaskInput::RecoverDlc => TaskKind::RecoverDlc,
        }
    }
}

/** 12.2: task record. only the supervisor writes it */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub id: TaskId,
    pub kind: TaskKind,
    pub channel_id: Option<ChannelId>,
    pub input: TaskInput,
    pub status: TaskStatus,
    /// Slot owner for the task's channel work.
    pub protocol_id: ProtocolId,
    pub attempts: u32,
    /// Finalized phases of a multi-phase trade.
    pub phase: u32,
    /// Trade phases fixed at the first attempt, so retries renegotiate the same terms.
    #[serde(default)]
    pub plan: Option<TradePlan>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl BackgroundTask {
    pub fn new(input: TaskInput, channel_id: Option<ChannelId>, protocol_id: ProtocolId, now: Timestamp) -> Self {
        Self {
            id: TaskId::new(),
            kind: input.kind(),
            channel_id,
            input,
            status: TaskStatus::Pending,
            protocol_id,
            attempts: 0,
            phase: 0,
            plan: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn update(&self) -> TaskUpdate {
        TaskUpdate {
            task_id: self.id,
            kind: self.kind,
            channel_id: self.channel_id,
            status: self.status.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_backoff: Duration::from_millis(settings.base_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }

    // delay after the given (1-based) failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(1u32 << exponent).min(self.max_backoff)
    }
}

/// Passed to every attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub channel_id: Option<ChannelId>,
    pub protocol_id: ProtocolId,
    pub attempt: u32,
    pub cancel: CancellationToken,
}

/// Does the work of a task. Called once per attempt with the latest record.
#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    async fn run(&self, task: BackgroundTask, ctx: TaskContext) -> Result<(), EngineError>;
}

/// Read-only view on a task's status.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub channel_id: Option<ChannelId>,
    status: watch::Receiver<TaskStatus>,
}

impl TaskHandle {
    pub fn status(&self) -> TaskStatus {
        self.status.borrow().clone()
    }

    /// Waits until the task leaves Pending. Returns Pending if the supervisor
    /// shut down first.
    pub async fn wait(mut self) -> TaskStatus {
        loop {
            let current = self.status.borrow_and_update().clone();
            if !current.is_pending() {
                return current;
            }
            if self.status.changed().await.is_err() {
                return self.status.borrow().clone();
            }
        }
    }
}

struct Running {
    kind: TaskKind,
    input: TaskInput,
    protocol_id: ProtocolId,
    channel_id: Option<ChannelId>,
    cancel: CancellationToken,
    status: watch::Receiver<TaskStatus>,
}

struct SupervisorInner {
    storage: Arc<dyn Storage>,
    hub: Arc<EventHub>,
    clock: Arc<Clock>,
    retry: RetryPolicy,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    running: Mutex<HashMap<TaskId, Running>>,
    records: Mutex<()>,
}

enum Outcome {
    Done(TaskStatus),
    Shutdown,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(storage: Arc<dyn Storage>, hub: Arc<EventHub>, clock: Arc<Clock>, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                storage,
                hub,
                clock,
                retry,
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                running: Mutex::new(HashMap::new()),
                records: Mutex::new(()),
            }),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry
    }

    // 12.3: start a task, or observe the pending one with the same kind and channel
    pub fn spawn(
        &self,
        input: TaskInput,
        channel_id: Option<ChannelId>,
        protocol_id: ProtocolId,
        runner: Arc<dyn TaskRunner>,
    ) -> Result<TaskHandle, EngineError> {
        self.spawn_planned(input, channel_id, protocol_id, None, runner)
    }

    /// Like `spawn`, with the trade plan stored on the new record before the first attempt.
    pub fn spawn_planned(
        &self,
        input: TaskInput,
        channel_id: Option<ChannelId>,
        protocol_id: ProtocolId,
        plan: Option<TradePlan>,
        runner: Arc<dyn TaskRunner>,
    ) -> Result<TaskHandle, EngineError> {
        let kind = input.kind();
        let mut running = self.inner.running.lock();

        if let Some((task_id, existing)) = running
            .iter()
            .find(|(_, r)| r.kind == kind && r.channel_id == channel_id)
        {
            if kind == TaskKind::AsyncTrade && existing.input != input {
                return Err(busy(channel_id, existing.protocol_id));
            }
            debug!(task = %kind, task_id = %task_id, "task already pending, attaching");
            return Ok(TaskHandle {
                task_id: *task_id,
                kind,
                channel_id,
                status: existing.status.clone(),
            });
        }

        let stored = self
            .inner
            .storage
            .pending_tasks()?
            .into_iter()
            .find(|t| t.kind == kind && t.channel_id == channel_id);

        let task = match stored {
            Some(task) if kind == TaskKind::AsyncTrade && task.input != input => {
                return Err(busy(channel_id, task.protocol_id));
            }
            Some(task) => task,
            None => {
                let mut task = BackgroundTask::new(input, channel_id, protocol_id, self.inner.clock.now());
                task.plan = plan;
                self.inner.storage.upsert_task(&task)?;
                self.inner.hub.publish(task.created_at, EventPayload::BackgroundTask(task.update()));
                info!(task = %kind, task_id = %task.id, channel_id = ?channel_id, "task created");
                task
            }
        };

        Ok(self.start(&mut running, task, runner))
    }

    /// Re-enters a pending task loaded from storage.
    pub fn resume(&self, task: BackgroundTask, runner: Arc<dyn TaskRunner>) -> TaskHandle {
        let mut running = self.inner.running.lock();
        if let Some(existing) = running.get(&task.id) {
            return TaskHandle {
                task_id: task.id,
                kind: task.kind,
                channel_id: task.channel_id,
                status: existing.status.clone(),
            };
        }
        info!(task = %task.kind, task_id = %task.id, attempts = task.attempts, "resuming task");
        self.start(&mut running, task, runner)
    }

    fn start(&self, running: &mut HashMap<TaskId, Running>, task: BackgroundTask, runner: Arc<dyn TaskRunner>) -> TaskHandle {
        let cancel = self.inner.shutdown.child_token();
        let (sender, receiver) = watch::channel(TaskStatus::Pending);
        running.insert(
            task.id,
            Running {
                kind: task.kind,
                input: task.input.clone(),
                protocol_id: task.protocol_id,
                channel_id: task.channel_id,
                cancel: cancel.clone(),
                status: receiver.clone(),
            },
        );

        let handle = TaskHandle {
            task_id: task.id,
            kind: task.kind,
            channel_id: task.channel_id,
            status: receiver,
        };

        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            let task_id = task.id;
            let outcome = drive(&inner, task, runner, cancel).await;
            inner.running.lock().remove(&task_id);
            if let Outcome::Done(status) = outcome {
                // receivers may all be gone
                let _ = sender.send(status);
            }
        });

        handle
    }

    /// Cooperative cancel. The task ends Failed; its channel is left for recovery.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        match self.inner.running.lock().get(&task_id) {
            Some(running) => {
                info!(task_id = %task_id, "cancelling task");
                running.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn watch(&self, task_id: TaskId) -> Option<TaskHandle> {
        self.inner.running.lock().get(&task_id).map(|r| TaskHandle {
            task_id,
            kind: r.kind,
            channel_id: r.channel_id,
            status: r.status.clone(),
        })
    }

    pub fn is_running(&self, task_id: TaskId) -> bool {
        self.inner.running.lock().contains_key(&task_id)
    }

    pub fn task(&self, task_id: TaskId) -> Result<Option<BackgroundTask>, EngineError> {
        Ok(self.inner.storage.get_task(task_id)?)
    }

    /// Records progress of a multi-phase task.
    pub fn set_phase(&self, task_id: TaskId, phase: u32) -> Result<(), EngineError> {
        self.inner.modify(task_id, |task| task.phase = phase)?;
        Ok(())
    }

    pub fn set_plan(&self, task_id: TaskId, plan: TradePlan) -> Result<(), EngineError> {
        self.inner.modify(task_id, |task| task.plan = Some(plan))?;
        Ok(())
    }

    /// Marks a stored task finished without running it. Used by restart reconciliation.
    pub fn settle_task(&self, task_id: TaskId, status: TaskStatus) -> Result<(), EngineError> {
        self.inner.finish(task_id, status)?;
        Ok(())
    }

    // 12.4: stop everything. pending tasks stay pending in storage.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("supervisor stopped");
    }
}

fn busy(channel_id: Option<ChannelId>, owner: ProtocolId) -> EngineError {
    EngineError::NegotiationInProgress { channel_id: channel_id.unwrap_or_default(), owner }
}

impl SupervisorInner {
    fn modify(&self, task_id: TaskId, f: impl FnOnce(&mut BackgroundTask)) -> Result<Option<BackgroundTask>, EngineError> {
        let _guard = self.records.lock();
        let Some(mut task) = self.storage.get_task(task_id)? else {
            return Ok(None);
        };
        f(&mut task);
        task.updated_at = self.clock.now();
        self.storage.upsert_task(&task)?;
        Ok(Some(task))
    }

    // returns the status as stored. nothing is reported that is not durable.
    fn finish(&self, task_id: TaskId, status: TaskStatus) -> Result<TaskStatus, EngineError> {
        let Some(task) = self.modify(task_id, |task| task.status = status.clone())? else {
            warn!(task_id = %task_id, "finished task has no record");
            return Ok(status);
        };
        match &task.status {
            TaskStatus::Failed(detail) => warn!(task = %task.kind, task_id = %task_id, detail = %detail, "task failed"),
            _ => info!(task = %task.kind, task_id = %task_id, status = ?task.status, "task finished"),
        }
        self.hub.publish(task.updated_at, EventPayload::BackgroundTask(task.update()));
        Ok(task.status)
    }
}

async fn drive(
    inner: &SupervisorInner,
    task: BackgroundTask,
    runner: Arc<dyn TaskRunner>,
    cancel: CancellationToken,
) -> Outcome {
    let kind = task.kind;
    let task_id = task.id;
    let channel_id = task.channel_id;

    let cancelled = || {
        if inner.shutdown.is_cancelled() {
            debug!(task = %kind, task_id = %task_id, "task left pending for next start");
            Outcome::Shutdown
        } else {
            Outcome::Done(TaskStatus::Failed(format!("{kind}: cancelled")))
        }
    };

    let outcome = loop {
        let current = match inner.modify(task_id, |t| t.attempts += 1) {
            Ok(Some(current)) => current,
            Ok(None) => break Outcome::Done(TaskStatus::Failed(format!("{kind}: task record missing"))),
            Err(e) => break Outcome::Done(TaskStatus::Failed(format!("{kind}: {e}"))),
        };
        let attempt = current.attempts;
        let ctx = TaskContext {
            task_id,
            kind,
            channel_id: current.channel_id,
            protocol_id: current.protocol_id,
            attempt,
            cancel: cancel.clone(),
        };

        debug!(task = %kind, task_id = %task_id, attempt, "running task attempt");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            result = runner.run(current, ctx) => result,
        };

        match result {
            Ok(()) => break Outcome::Done(TaskStatus::Success),
            Err(EngineError::Cancelled) => break cancelled(),
            Err(e) if e.is_retryable() && attempt < inner.retry.max_attempts => {
                let delay = inner.retry.backoff(attempt);
                warn!(task = %kind, task_id = %task_id, attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying task");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break cancelled(),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => break Outcome::Done(TaskStatus::Failed(format!("{kind}: {e}"))),
        }
    };

    let Outcome::Done(status) = outcome else {
        return outcome;
    };
    match inner.finish(task_id, status) {
        Ok(status) => Outcome::Done(status),
        Err(e) => {
            // the record stays pending in storage; watchers must not see success
            error!(task = %kind, task_id = %task_id, error = %e, "could not persist task status");
            let failed = TaskStatus::Failed(format!("{kind}: {e}"));
            let update = TaskUpdate { task_id, kind, channel_id, status: failed.clone() };
            inner.hub.publish(inner.clock.now(), EventPayload::BackgroundTask(update));
            Outcome::Done(failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileStorage, MemoryStorage};
    use crate::types::PeerId;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl TaskRunner for Flaky {
        async fn run(&self, _task: BackgroundTask, ctx: TaskContext) -> Result<(), EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if ctx.attempt >= self.succeed_on {
                Ok(())
            } else {
                Err(EngineError::CounterpartyTimeout { peer: PeerId::new("t"), timeout_ms: 1 })
            }
        }
    }

    struct Forever;

    #[async_trait]
    impl TaskRunner for Forever {
        async fn run(&self, _task: BackgroundTask, ctx: TaskContext) -> Result<(), EngineError> {
            ctx.cancel.cancelled().await;
            Err(EngineError::Cancelled)
        }
    }

    fn supervisor(max_attempts: u32) -> (Arc<MemoryStorage>, Supervisor) {
        let storage = Arc::new(MemoryStorage::new());
        let retry = RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        };
        let sup = Supervisor::new(
            storage.clone(),
            Arc::new(EventHub::new(64, 64)),
            Arc::new(Clock::default()),
            retry,
        );
        (storage, sup)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn retryable_errors_are_retried_until_success() {
        let (storage, sup) = supervisor(5);
        let runner = Arc::new(Flaky { calls: AtomicU32::new(0), succeed_on: 3 });
        let handle = sup
            .spawn(TaskInput::FullSync, None, ProtocolId::new(), runner.clone())
            .unwrap();
        let task_id = handle.task_id;
        assert_eq!(handle.wait().await, TaskStatus::Success);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(storage.get_task(task_id).unwrap().unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (_, sup) = supervisor(2);
        let runner = Arc::new(Flaky { calls: AtomicU32::new(0), succeed_on: 10 });
        let handle = sup.spawn(TaskInput::FullSync, None, ProtocolId::new(), runner).unwrap();
        match handle.wait().await {
            TaskStatus::Failed(detail) => assert!(detail.starts_with("full_sync:")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_request_observes_existing_task() {
        let (_, sup) = supervisor(1);
        let channel_id = Some(ChannelId::new());
        let first = sup
            .spawn(TaskInput::Rollover, channel_id, ProtocolId::new(), Arc::new(Forever))
            .unwrap();
        let second = sup
            .spawn(TaskInput::Rollover, channel_id, ProtocolId::new(), Arc::new(Forever))
            .unwrap();
        assert_eq!(first.task_id, second.task_id);
        sup.cancel(first.task_id);
        assert!(matches!(first.wait().await, TaskStatus::Failed(_)));
    }

    // succeeds, but takes the store's directory with it
    struct LosesStore {
        dir: std::path::PathBuf,
    }

    #[async_trait]
    impl TaskRunner for LosesStore {
        async fn run(&self, _task: BackgroundTask, _ctx: TaskContext) -> Result<(), EngineError> {
            std::fs::remove_dir_all(&self.dir).map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn unpersisted_success_is_reported_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStorage::open(dir.path().join("store.json")).unwrap());
        let hub = Arc::new(EventHub::new(64, 64));
        let retry = RetryPolicy {
            max_attempts: 1,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        };
        let sup = Supervisor::new(storage.clone(), hub.clone(), Arc::new(Clock::default()), retry);

        let runner = Arc::new(LosesStore { dir: dir.path().to_path_buf() });
        let handle = sup.spawn(TaskInput::FullSync, None, ProtocolId::new(), runner).unwrap();
        let task_id = handle.task_id;
        match handle.wait().await {
            TaskStatus::Failed(detail) => assert!(detail.starts_with("full_sync: persistence failure")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(storage.get_task(task_id).unwrap().unwrap().status, TaskStatus::Pending);

        let published: Vec<TaskStatus> = hub
            .history_since(None)
            .into_iter()
            .filter_map(|e| match e.payload {
                EventPayload::BackgroundTask(update) if update.task_id == task_id => Some(update.status),
                _ => None,
            })
            .collect();
        assert!(!published.contains(&TaskStatus::Success));
        assert!(matches!(published.last(), Some(TaskStatus::Failed(_))));
    }

    #[tokio::test]
    async fn shutdown_keeps_tasks_pending() {
        let (storage, sup) = supervisor(1);
        let handle = sup
            .spawn(TaskInput::RecoverDlc, None, ProtocolId::new(), Arc::new(Forever))
            .unwrap();
        let task_id = handle.task_id;
        tokio::task::yield_now().await;
        sup.shutdown().await;
        assert_eq!(storage.get_task(task_id).unwrap().unwrap().status, TaskStatus::Pending);
        assert_eq!(handle.wait().await, TaskStatus::Pending);
    }
}
