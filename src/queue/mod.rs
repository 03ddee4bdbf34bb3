//! The work queue. Admission control in front of an executor.
//!
//! A [`WorkQueue`] accepts tasks from any number of threads, hands at most
//! `limit` of them to its executor at a time, and keeps the rest in an
//! ordered pending sequence. Callers steer pending work through the
//! [`WorkItem`] handle each submission returns.
//!
//! All bookkeeping (pending sequence, item table, active count) lives behind
//! one lock. Handing work to the executor always happens after that lock is
//! released, so executors are free to run tasks inline or call back into the
//! queue.

mod handle;
mod validate;

pub use handle::WorkItem;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{Span, debug, error, warn};

use crate::config::{Config, DEFAULT_EVENT_CAPACITY, DEFAULT_MAX_CONCURRENT};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::executor::{Executor, TokioExecutor};
use crate::model::{
    Placement, QueueSnapshot, State, StateCell, Task, WorkId, WorkItemInfo,
};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_work_span};

/// Bounded-concurrency dispatch queue.
///
/// Cloning is cheap and yields another handle to the same queue.
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl Clone for WorkQueue {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

pub(crate) struct Shared {
    limit: usize,
    executor: Arc<dyn Executor>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<Event>,
}

/// Everything guarded by the queue lock.
struct Inner {
    /// Pending ids in dispatch order.
    pending: VecDeque<WorkId>,
    /// Pending and active items. Terminal items are dropped from the table;
    /// their handles keep the final state.
    entries: HashMap<WorkId, Entry>,
    active: usize,
    next_seq: u64,
}

struct Entry {
    cell: Arc<StateCell>,
    /// Present while pending, taken on dispatch.
    task: Option<Task>,
    placement: Placement,
    created_at: DateTime<Utc>,
    dispatched_at: Option<DateTime<Utc>>,
}

/// A task released from the lock and ready for the executor.
struct Dispatch {
    id: WorkId,
    task: Task,
    wait_ms: f64,
}

impl WorkQueue {
    /// Queue with [`DEFAULT_MAX_CONCURRENT`] slots on a background
    /// [`TokioExecutor`].
    pub fn new() -> Result<Self> {
        Self::with_limit(DEFAULT_MAX_CONCURRENT)
    }

    /// Queue with `limit` slots on a background [`TokioExecutor`].
    pub fn with_limit(limit: usize) -> Result<Self> {
        if limit == 0 {
            return Err(Error::InvalidLimit(limit));
        }
        Self::with_executor(limit, Arc::new(TokioExecutor::new()?))
    }

    /// Queue with `limit` slots that dispatches onto `executor`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidLimit`] if `limit` is zero.
    pub fn with_executor(limit: usize, executor: Arc<dyn Executor>) -> Result<Self> {
        Self::build(limit, DEFAULT_EVENT_CAPACITY, executor)
    }

    /// Queue sized from configuration.
    pub fn from_config(config: &Config, executor: Arc<dyn Executor>) -> Result<Self> {
        Self::build(config.max_concurrent, config.event_capacity, executor)
    }

    fn build(limit: usize, event_capacity: usize, executor: Arc<dyn Executor>) -> Result<Self> {
        if limit == 0 {
            return Err(Error::InvalidLimit(limit));
        }
        let (events, _) = broadcast::channel(event_capacity.max(1));

        Ok(Self {
            shared: Arc::new(Shared {
                limit,
                executor,
                inner: Mutex::new(Inner {
                    pending: VecDeque::new(),
                    entries: HashMap::new(),
                    active: 0,
                    next_seq: 0,
                }),
                events,
            }),
        })
    }

    /// Submit `task`. Dispatches it right away if a slot is free, otherwise
    /// appends it to the tail of the pending sequence.
    ///
    /// Never waits for the task to run.
    pub fn add_active_work_item<F>(&self, task: F) -> WorkItem
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.submit(Box::new(task), false)
    }

    /// Like [`add_active_work_item`](Self::add_active_work_item), but a task
    /// that has to wait goes to the head of the pending sequence.
    pub fn add_active_work_item_to_front<F>(&self, task: F) -> WorkItem
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.submit(Box::new(task), true)
    }

    pub fn limit(&self) -> usize {
        self.shared.limit
    }

    /// Number of items currently holding a slot.
    pub fn active_count(&self) -> usize {
        self.shared.inner.lock().active
    }

    pub fn pending_count(&self) -> usize {
        self.shared.inner.lock().pending.len()
    }

    /// Pending ids in the order they will be dispatched.
    pub fn pending_ids(&self) -> Vec<WorkId> {
        self.shared.inner.lock().pending.iter().copied().collect()
    }

    /// Consistent view of the queue, taken under its lock.
    pub fn snapshot(&self) -> QueueSnapshot {
        let inner = self.shared.inner.lock();

        let mut items: Vec<WorkItemInfo> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.cell.get() == State::Active)
            .map(|(id, entry)| entry.info(*id))
            .collect();
        items.sort_by_key(|info| info.dispatched_at);
        items.extend(
            inner
                .pending
                .iter()
                .filter_map(|id| inner.entries.get(id).map(|entry| entry.info(*id))),
        );

        QueueSnapshot {
            limit: self.shared.limit,
            active: inner.active,
            pending: inner.pending.iter().copied().collect(),
            items,
        }
    }

    /// Subscribe to queue events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Check the queue's internal invariants.
    ///
    /// A violation is an implementation bug: it is logged, and fatal in
    /// debug builds.
    pub fn validate(&self) {
        if let Err(e) = self.check_invariants() {
            error!(error = %e, "work queue invariant violated");
            if cfg!(debug_assertions) {
                panic!("{e}");
            }
        }
    }

    /// Same checks as [`validate`](Self::validate), reported as a `Result`.
    pub fn check_invariants(&self) -> Result<()> {
        self.shared.inner.lock().check(self.shared.limit)
    }
}

impl Entry {
    fn info(&self, id: WorkId) -> WorkItemInfo {
        WorkItemInfo {
            id,
            state: self.cell.get(),
            placement: self.placement,
            created_at: self.created_at,
            dispatched_at: self.dispatched_at,
        }
    }
}

impl Shared {
    fn submit(self: &Arc<Self>, task: Task, front: bool) -> WorkItem {
        let id = WorkId::new();
        let cell = Arc::new(StateCell::new(State::Pending));
        let now = Utc::now();
        let placement = if front {
            Placement::Promoted
        } else {
            Placement::Normal
        };

        let dispatch = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            inner.entries.insert(
                id,
                Entry {
                    cell: Arc::clone(&cell),
                    task: Some(task),
                    placement,
                    created_at: now,
                    dispatched_at: None,
                },
            );

            // Pending can only be non-empty when every slot is taken, so a
            // free slot means this item is next in line regardless of `front`.
            if inner.active < self.limit {
                self.activate(inner, id)
            } else {
                if front {
                    inner.pending.push_front(id);
                } else {
                    inner.pending.push_back(id);
                }
                self.emit(inner, EventKind::WorkQueued { id, front });
                None
            }
        };

        debug!(%id, front, dispatched = dispatch.is_some(), "work submitted");
        metrics::work_submitted().add(
            1,
            &[
                KeyValue::new("placement", if front { "front" } else { "back" }),
                KeyValue::new(
                    "dispatch",
                    if dispatch.is_some() { "immediate" } else { "queued" },
                ),
            ],
        );

        self.launch_all(dispatch.into_iter().collect());

        WorkItem::new(id, cell, Arc::downgrade(self))
    }

    /// Mark a tracked pending item active and take its task.
    fn activate(&self, inner: &mut Inner, id: WorkId) -> Option<Dispatch> {
        let entry = inner.entries.get_mut(&id)?;
        let task = entry.task.take()?;
        let now = Utc::now();

        transition(&entry.cell, State::Active);
        entry.dispatched_at = Some(now);
        let wait_ms = (now - entry.created_at)
            .num_microseconds()
            .map_or(0.0, |us| us as f64 / 1000.0);

        inner.active += 1;
        self.emit(inner, EventKind::WorkDispatched { id });

        Some(Dispatch { id, task, wait_ms })
    }

    /// Dispatch from the head of pending until slots or pending run out.
    fn refill(&self, inner: &mut Inner) -> Vec<Dispatch> {
        let mut ready = Vec::new();
        while inner.active < self.limit {
            let Some(id) = inner.pending.pop_front() else {
                break;
            };
            if let Some(dispatch) = self.activate(inner, id) {
                ready.push(dispatch);
            }
        }
        ready
    }

    /// Hand released tasks to the executor. Must be called without the lock.
    ///
    /// An executor that runs or drops tasks synchronously re-enters here
    /// from the completion guard. Such nested calls only append to this
    /// thread's backlog; the outermost call drains it, so the stack stays
    /// flat however long the pending sequence is.
    fn launch_all(self: &Arc<Self>, ready: Vec<Dispatch>) {
        if ready.is_empty() {
            return;
        }
        let mut launches: VecDeque<Launch> =
            ready.into_iter().map(|dispatch| self.wrap(dispatch)).collect();

        let nested = BACKLOG.with(|cell| {
            let mut backlog = cell.borrow_mut();
            match backlog.as_mut() {
                Some(queued) => {
                    queued.append(&mut launches);
                    true
                }
                None => {
                    *backlog = Some(std::mem::take(&mut launches));
                    false
                }
            }
        });
        if !nested {
            drain_backlog();
        }
    }

    /// Wrap a dispatched task so that its completion frees the slot.
    fn wrap(self: &Arc<Self>, dispatch: Dispatch) -> Launch {
        let Dispatch { id, task, wait_ms } = dispatch;
        metrics::work_wait_ms().record(wait_ms, &[]);
        record_transition_metric(State::Pending, State::Active);

        let span = start_work_span(id, self.limit);
        record_state_transition(&span, State::Pending, State::Active);

        let guard = CompletionGuard {
            shared: Arc::downgrade(self),
            id,
            span: span.clone(),
        };
        Launch {
            shared: Arc::clone(self),
            task: Box::new(move || {
                let _guard = guard;
                span.in_scope(task);
            }),
        }
    }

    /// Release the slot held by `id` and refill from pending.
    fn finish(self: &Arc<Self>, id: WorkId, panicked: bool) {
        let (tracked, ready) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            let tracked = match inner.entries.remove(&id) {
                Some(entry) => {
                    transition(&entry.cell, State::Completed);
                    inner.active = inner.active.saturating_sub(1);
                    self.emit(inner, EventKind::WorkCompleted { id, panicked });
                    true
                }
                None => false,
            };

            (tracked, self.refill(inner))
        };

        if tracked {
            record_transition_metric(State::Active, State::Completed);
            if panicked {
                metrics::work_panicked().add(1, &[]);
            }
        } else {
            error!(%id, "completion for untracked work item");
        }

        self.launch_all(ready);
    }

    pub(crate) fn cancel(&self, id: WorkId) -> bool {
        let task = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            let is_pending = inner
                .entries
                .get(&id)
                .is_some_and(|entry| entry.cell.get() == State::Pending);
            if !is_pending {
                return false;
            }

            if let Some(pos) = inner.pending.iter().position(|p| *p == id) {
                inner.pending.remove(pos);
            }
            let Some(entry) = inner.entries.remove(&id) else {
                return false;
            };
            transition(&entry.cell, State::Cancelled);
            self.emit(inner, EventKind::WorkCancelled { id });
            entry.task
        };

        // The closure's captures are dropped here, outside the lock.
        drop(task);

        debug!(%id, "work cancelled");
        record_transition_metric(State::Pending, State::Cancelled);
        true
    }

    pub(crate) fn move_to_front(&self, id: WorkId) {
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            let Some(entry) = inner.entries.get_mut(&id) else {
                return;
            };
            if entry.cell.get() != State::Pending {
                return;
            }
            entry.placement = Placement::Promoted;

            if let Some(pos) = inner.pending.iter().position(|p| *p == id) {
                if pos != 0 {
                    inner.pending.remove(pos);
                    inner.pending.push_front(id);
                }
            }
            self.emit(inner, EventKind::WorkPromoted { id });
        }

        debug!(%id, "work moved to front");
        metrics::work_promoted().add(1, &[]);
    }

    fn emit(&self, inner: &mut Inner, kind: EventKind) {
        let seq = inner.next_seq;
        inner.next_seq += 1;
        // No receivers is fine.
        let _ = self.events.send(Event {
            seq,
            timestamp: Utc::now(),
            kind,
        });
    }
}

fn transition(cell: &StateCell, to: State) {
    let from = cell.get();
    if !from.can_transition_to(to) {
        error!(%from, %to, "invalid work item state transition");
    }
    cell.set(to);
}

fn record_transition_metric(from: State, to: State) {
    metrics::work_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}

thread_local! {
    /// Launches waiting for the outermost `launch_all` on this thread.
    /// `Some` while that call is draining.
    static BACKLOG: RefCell<Option<VecDeque<Launch>>> = const { RefCell::new(None) };
}

/// A wrapped task bound for its queue's executor.
struct Launch {
    shared: Arc<Shared>,
    task: Task,
}

/// Run launches until this thread's backlog is empty, then clear it.
///
/// A panic escaping an executor (an inline executor propagates task panics)
/// is held back until the backlog is empty and then resumed, so work
/// released by the panicking task's completion still gets launched.
fn drain_backlog() {
    let mut escaped = None;
    while let Some(Launch { shared, task }) =
        BACKLOG.with(|cell| cell.borrow_mut().as_mut().and_then(VecDeque::pop_front))
    {
        let result = catch_unwind(AssertUnwindSafe(|| shared.executor.execute(task)));
        if let Err(payload) = result {
            if escaped.is_none() {
                escaped = Some(payload);
            }
        }
    }
    BACKLOG.with(|cell| *cell.borrow_mut() = None);

    if let Some(payload) = escaped {
        resume_unwind(payload);
    }
}

/// Frees the slot when the wrapped task returns or unwinds.
///
/// Holds the queue weakly: parked tasks never keep a dropped queue alive,
/// and completing after the queue is gone does nothing.
struct CompletionGuard {
    shared: Weak<Shared>,
    id: WorkId,
    span: Span,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let panicked = std::thread::panicking();
        if panicked {
            warn!(parent: &self.span, id = %self.id, "work item panicked");
        }
        record_state_transition(&self.span, State::Active, State::Completed);
        if let Some(shared) = self.shared.upgrade() {
            shared.finish(self.id, panicked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ManualExecutor;

    #[test]
    fn completion_for_untracked_id_changes_nothing() {
        let executor = Arc::new(ManualExecutor::new());
        let queue = WorkQueue::with_executor(1, executor.clone()).unwrap();
        queue.add_active_work_item(|| {});
        queue.add_active_work_item(|| {});
        let mut events = queue.subscribe();

        queue.shared.finish(WorkId::new(), false);

        assert!(events.try_recv().is_err());
        assert_eq!(queue.active_count(), 1);
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(executor.len(), 1);
        queue.validate();
    }

    #[test]
    fn backlog_is_cleared_after_draining() {
        let queue = WorkQueue::with_executor(1, Arc::new(crate::InlineExecutor)).unwrap();
        queue.add_active_work_item(|| {});
        assert!(BACKLOG.with(|cell| cell.borrow().is_none()));
    }
}
