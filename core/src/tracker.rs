use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::warn;

use crate::exec_id::ExecId;
use crate::status::ExecStatus;
use crate::status::ExecutionRecord;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle notifications for history/tracking consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        exec_id: ExecId,
        session: Option<String>,
        command_preview: String,
    },
    ProcessStarted {
        session: Option<String>,
        exec_id: Option<ExecId>,
        pid: Option<u32>,
    },
    StatusChanged {
        exec_id: ExecId,
        status: ExecStatus,
    },
    ExecutionCompleted {
        exec_id: ExecId,
        status: ExecStatus,
        detail: Option<String>,
    },
}

/// Live view over executions that have not reached a terminal status.
pub trait ProgressDisplay: Send + Sync {
    fn render(&self, pending: &[ExecutionRecord]);

    /// Called once the last pending execution finished.
    fn finish(&self);
}

#[derive(Default)]
struct TrackerInner {
    records: HashMap<ExecId, ExecutionRecord>,
    display_running: bool,
}

impl TrackerInner {
    fn pending(&self) -> Vec<ExecutionRecord> {
        let mut pending: Vec<_> = self
            .records
            .values()
            .filter(|record| !record.status.is_terminal())
            .cloned()
            .collect();
        pending.sort_by_key(|record| record.submitted_at);
        pending
    }
}

pub struct StatusTracker {
    inner: Mutex<TrackerInner>,
    events: broadcast::Sender<ExecutionEvent>,
    display: Mutex<Option<Arc<dyn ProgressDisplay>>>,
    refresh: Duration,
}

impl std::fmt::Debug for StatusTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusTracker")
            .field("refresh", &self.refresh)
            .finish_non_exhaustive()
    }
}

impl StatusTracker {
    pub fn new(refresh: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(TrackerInner::default()),
            events,
            display: Mutex::new(None),
            refresh,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ExecutionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn set_display(self: &Arc<Self>, display: Arc<dyn ProgressDisplay>) {
        *self.display.lock().unwrap_or_else(PoisonError::into_inner) = Some(display);
        self.ensure_display();
    }

    pub(crate) fn register(self: &Arc<Self>, record: ExecutionRecord) {
        let event = ExecutionEvent::ExecutionStarted {
            exec_id: record.exec_id,
            session: record.session.clone(),
            command_preview: record.command_preview.clone(),
        };
        self.lock().records.insert(record.exec_id, record);
        self.emit(event);
        self.ensure_display();
    }

    /// Applies a status transition. Invalid transitions are ignored so a late
    /// event can never resurrect a finished execution.
    pub(crate) fn set_status(&self, exec_id: ExecId, status: ExecStatus) -> bool {
        self.apply(exec_id, status, None)
    }

    /// Records the router's final status. Only the first call per execution
    /// takes effect and emits `ExecutionCompleted`.
    pub(crate) fn finish(&self, exec_id: ExecId, status: ExecStatus, detail: Option<String>) {
        if self.apply(exec_id, status, Some(detail.clone())) {
            self.emit(ExecutionEvent::ExecutionCompleted {
                exec_id,
                status,
                detail,
            });
        }
    }

    /// `detail` is present for the final transition, which seals the record.
    fn apply(&self, exec_id: ExecId, status: ExecStatus, detail: Option<Option<String>>) -> bool {
        let changed = {
            let mut inner = self.lock();
            let Some(record) = inner.records.get_mut(&exec_id) else {
                return false;
            };
            if record.finalized {
                debug!(%exec_id, from = %record.status, to = %status, "execution already finalized");
                return false;
            }
            let changed = record.status != status;
            if changed && !record.status.can_transition_to(status) {
                warn!(
                    %exec_id,
                    from = %record.status,
                    to = %status,
                    "ignoring invalid status transition"
                );
                return false;
            }
            if changed {
                record.status = status;
                match status {
                    ExecStatus::Executing => record.started_at = Some(Utc::now()),
                    status if status.is_terminal() => record.finished_at = Some(Utc::now()),
                    _ => {}
                }
            }
            if let Some(detail) = detail {
                record.detail = detail;
                record.finalized = true;
            }
            changed
        };
        if changed {
            debug!(%exec_id, %status, "status changed");
            self.emit(ExecutionEvent::StatusChanged { exec_id, status });
        }
        true
    }

    pub(crate) fn set_progress(&self, exec_id: ExecId, percent: u8) {
        if let Some(record) = self.lock().records.get_mut(&exec_id) {
            record.progress = Some(percent.min(100));
        }
    }

    pub(crate) fn process_started(
        &self,
        session: Option<String>,
        exec_id: Option<ExecId>,
        pid: Option<u32>,
    ) {
        if let Some(exec_id) = exec_id
            && let Some(record) = self.lock().records.get_mut(&exec_id)
        {
            record.pid = pid;
        }
        self.emit(ExecutionEvent::ProcessStarted {
            session,
            exec_id,
            pid,
        });
    }

    pub fn get(&self, exec_id: ExecId) -> Option<ExecutionRecord> {
        self.lock().records.get(&exec_id).cloned()
    }

    pub fn status(&self, exec_id: ExecId) -> Option<ExecStatus> {
        self.lock().records.get(&exec_id).map(|record| record.status)
    }

    pub fn snapshot(&self) -> Vec<ExecutionRecord> {
        let mut records: Vec<_> = self.lock().records.values().cloned().collect();
        records.sort_by_key(|record| record.submitted_at);
        records
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .records
            .values()
            .filter(|record| !record.status.is_terminal())
            .count()
    }

    pub fn executing_in_session(&self, session: &str) -> usize {
        self.lock()
            .records
            .values()
            .filter(|record| {
                record.status == ExecStatus::Executing && record.session.as_deref() == Some(session)
            })
            .count()
    }

    /// Drops finished records; returns how many were removed. A provisional
    /// `Completed` still awaiting the router is kept.
    pub fn clear_finished(&self) -> usize {
        let mut inner = self.lock();
        let before = inner.records.len();
        inner.records.retain(|_, record| {
            !record.status.is_terminal()
                || (record.status == ExecStatus::Completed && !record.finalized)
        });
        before - inner.records.len()
    }

    fn ensure_display(self: &Arc<Self>) {
        let Some(display) = self
            .display
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return;
        };
        {
            let mut inner = self.lock();
            if inner.display_running || inner.pending().is_empty() {
                return;
            }
            inner.display_running = true;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.lock().display_running = false;
            return;
        };

        let tracker = Arc::clone(self);
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(tracker.refresh);
            loop {
                ticker.tick().await;
                let pending = {
                    let mut inner = tracker.lock();
                    let pending = inner.pending();
                    if pending.is_empty() {
                        inner.display_running = false;
                    }
                    pending
                };
                if pending.is_empty() {
                    display.finish();
                    break;
                }
                display.render(&pending);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    fn record(session: &str) -> ExecutionRecord {
        ExecutionRecord::new(
            ExecId::new(),
            Some(session.to_string()),
            "SELECT 1".to_string(),
            None,
        )
    }

    #[tokio::test]
    async fn finish_emits_completion_once() {
        let tracker = Arc::new(StatusTracker::new(Duration::from_millis(50)));
        let mut events = tracker.subscribe();
        let rec = record("s");
        let id = rec.exec_id;
        tracker.register(rec);
        assert!(tracker.set_status(id, ExecStatus::Executing));
        tracker.finish(id, ExecStatus::Completed, None);
        // The record is sealed; a second finish must stay silent.
        tracker.finish(id, ExecStatus::Error, Some("late".to_string()));

        let mut completed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ExecutionEvent::ExecutionCompleted { status, .. } = event {
                completed.push(status);
            }
        }
        assert_eq!(completed, vec![ExecStatus::Completed]);
        assert_eq!(tracker.status(id), Some(ExecStatus::Completed));
    }

    #[tokio::test]
    async fn provisional_completion_is_refined_once() {
        let tracker = Arc::new(StatusTracker::new(Duration::from_millis(50)));
        let mut events = tracker.subscribe();
        let rec = record("s");
        let id = rec.exec_id;
        tracker.register(rec);
        assert!(tracker.set_status(id, ExecStatus::Executing));
        // Marker seen; the router has not run yet.
        assert!(tracker.set_status(id, ExecStatus::Completed));
        tracker.finish(
            id,
            ExecStatus::CompletedWithErrors,
            Some("Catalog Error: x".to_string()),
        );
        assert!(!tracker.set_status(id, ExecStatus::Error));
        tracker.finish(id, ExecStatus::Completed, None);

        let record = tracker.get(id).expect("record");
        assert_eq!(record.status, ExecStatus::CompletedWithErrors);
        assert_eq!(record.detail.as_deref(), Some("Catalog Error: x"));
        assert!(record.finalized);

        let mut completed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ExecutionEvent::ExecutionCompleted { status, .. } = event {
                completed.push(status);
            }
        }
        assert_eq!(completed, vec![ExecStatus::CompletedWithErrors]);
    }

    #[tokio::test]
    async fn clearing_keeps_records_the_router_has_not_finalized() {
        let tracker = Arc::new(StatusTracker::new(Duration::from_millis(50)));
        let provisional = record("s");
        let provisional_id = provisional.exec_id;
        let done = record("s");
        let done_id = done.exec_id;
        tracker.register(provisional);
        tracker.register(done);
        tracker.set_status(provisional_id, ExecStatus::Executing);
        tracker.set_status(provisional_id, ExecStatus::Completed);
        tracker.finish(done_id, ExecStatus::Cancelled, None);

        assert_eq!(tracker.clear_finished(), 1);
        assert!(tracker.get(done_id).is_none());
        assert_eq!(tracker.status(provisional_id), Some(ExecStatus::Completed));
    }

    #[tokio::test]
    async fn queued_can_be_cancelled_directly() {
        let tracker = Arc::new(StatusTracker::new(Duration::from_millis(50)));
        let rec = record("s");
        let id = rec.exec_id;
        tracker.register(rec);
        assert!(tracker.set_status(id, ExecStatus::Cancelled));
        assert!(!tracker.set_status(id, ExecStatus::Executing));
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(tracker.clear_finished(), 1);
    }

    struct CountingDisplay {
        renders: AtomicUsize,
        finished: AtomicUsize,
    }

    impl ProgressDisplay for CountingDisplay {
        fn render(&self, _pending: &[ExecutionRecord]) {
            self.renders.fetch_add(1, Ordering::SeqCst);
        }

        fn finish(&self) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn display_stops_once_nothing_is_pending() {
        let tracker = Arc::new(StatusTracker::new(Duration::from_millis(20)));
        let display = Arc::new(CountingDisplay {
            renders: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        });
        tracker.set_display(display.clone());

        let rec = record("s");
        let id = rec.exec_id;
        tracker.register(rec);
        tracker.set_status(id, ExecStatus::Executing);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(display.renders.load(Ordering::SeqCst) >= 1);

        tracker.finish(id, ExecStatus::Completed, None);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(display.finished.load(Ordering::SeqCst), 1);
    }
}
