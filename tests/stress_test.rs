//! Concurrency tests: many threads mutating one queue while completions
//! arrive from executor threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use workq::event::EventKind;
use workq::model::{State, WorkId};
use workq::{ManualExecutor, TokioExecutor, WorkItem, WorkQueue};

const THREADS: usize = 20;
const ACTIONS: usize = 50;

#[derive(Default)]
struct Tally {
    submitted: AtomicUsize,
    cancelled: AtomicUsize,
    ran: AtomicUsize,
}

/// One randomized action against the queue. Handles are shared across
/// threads so cancel and promote race with other threads' submissions.
fn random_action(
    queue: &WorkQueue,
    executor: Option<&ManualExecutor>,
    handles: &Mutex<Vec<WorkItem>>,
    tally: &Arc<Tally>,
) {
    match fastrand::u32(0..6) {
        0 | 1 => {
            let ran = Arc::clone(tally);
            let item = queue.add_active_work_item(move || {
                ran.ran.fetch_add(1, Ordering::SeqCst);
            });
            tally.submitted.fetch_add(1, Ordering::SeqCst);
            handles.lock().push(item);
        }
        2 => {
            let item = pick(handles);
            if item.is_some_and(|item| item.cancel()) {
                tally.cancelled.fetch_add(1, Ordering::SeqCst);
            }
        }
        3 => {
            if let Some(item) = pick(handles) {
                item.move_to_front();
            }
        }
        4 => {
            if let Some(executor) = executor {
                executor.run_next();
            }
        }
        _ => queue.validate(),
    }
}

fn pick(handles: &Mutex<Vec<WorkItem>>) -> Option<WorkItem> {
    let handles = handles.lock();
    if handles.is_empty() {
        None
    } else {
        Some(handles[fastrand::usize(0..handles.len())].clone())
    }
}

#[test]
fn randomized_threads_never_break_invariants() {
    let executor = Arc::new(ManualExecutor::new());
    let queue = WorkQueue::with_executor(4, executor.clone()).unwrap();
    let handles = Arc::new(Mutex::new(Vec::new()));
    let tally = Arc::new(Tally::default());
    let barrier = Arc::new(Barrier::new(THREADS));

    let threads: Vec<_> = (0..THREADS)
        .map(|_| {
            let queue = queue.clone();
            let executor = Arc::clone(&executor);
            let handles = Arc::clone(&handles);
            let tally = Arc::clone(&tally);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                for _ in 0..ACTIONS {
                    random_action(&queue, Some(&executor), &handles, &tally);
                }
                queue.validate();
                queue.check_invariants()
            })
        })
        .collect();

    for thread in threads {
        thread.join().expect("thread panicked").expect("invariants hold");
    }

    executor.run_all();
    queue.validate();

    let submitted = tally.submitted.load(Ordering::SeqCst);
    let cancelled = tally.cancelled.load(Ordering::SeqCst);
    assert_eq!(tally.ran.load(Ordering::SeqCst), submitted - cancelled);
    assert_eq!(queue.active_count(), 0);
    assert_eq!(queue.pending_count(), 0);

    for item in handles.lock().iter() {
        assert!(matches!(item.state(), State::Completed | State::Cancelled));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn randomized_threads_on_tokio_executor() {
    let queue = WorkQueue::with_executor(3, Arc::new(TokioExecutor::new().unwrap())).unwrap();
    let handles = Arc::new(Mutex::new(Vec::new()));
    let tally = Arc::new(Tally::default());
    let barrier = Arc::new(Barrier::new(THREADS));

    let threads: Vec<_> = (0..THREADS)
        .map(|_| {
            let queue = queue.clone();
            let handles = Arc::clone(&handles);
            let tally = Arc::clone(&tally);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                for _ in 0..ACTIONS {
                    random_action(&queue, None, &handles, &tally);
                }
                queue.validate();
                queue.check_invariants()
            })
        })
        .collect();

    for thread in threads {
        thread.join().expect("thread panicked").expect("invariants hold");
    }

    let expected =
        tally.submitted.load(Ordering::SeqCst) - tally.cancelled.load(Ordering::SeqCst);
    let deadline = Instant::now() + Duration::from_secs(10);
    while queue.active_count() > 0 || queue.pending_count() > 0 {
        assert!(Instant::now() < deadline, "queue did not drain");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(tally.ran.load(Ordering::SeqCst), expected);
    queue.validate();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn active_items_never_exceed_limit() {
    const LIMIT: usize = 3;
    let queue =
        WorkQueue::with_executor(LIMIT, Arc::new(TokioExecutor::new().unwrap())).unwrap();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

    for _ in 0..30 {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let done_tx = done_tx.clone();
        queue.add_active_work_item(move || {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            running.fetch_sub(1, Ordering::SeqCst);
            let _ = done_tx.send(());
        });
        assert!(queue.active_count() <= LIMIT);
    }
    drop(done_tx);

    let mut finished = 0;
    while done_rx.recv().await.is_some() {
        finished += 1;
    }

    assert_eq!(finished, 30);
    assert!(peak.load(Ordering::SeqCst) <= LIMIT);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[test]
fn slow_task_does_not_block_queue_operations() {
    let queue = WorkQueue::with_executor(1, Arc::new(TokioExecutor::new().unwrap())).unwrap();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

    let slow = queue.add_active_work_item(move || {
        let _ = release_rx.recv_timeout(Duration::from_secs(10));
    });
    let waiting = queue.add_active_work_item(|| {});
    let other = queue.add_active_work_item(|| {});

    // The slot is held, yet pending items stay fully steerable.
    other.move_to_front();
    assert_eq!(queue.pending_ids(), vec![other.id(), waiting.id()]);
    assert!(waiting.cancel());
    assert!(slow.is_running());

    release_tx.send(()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while other.state() != State::Completed {
        assert!(Instant::now() < deadline, "promoted item never ran");
        std::thread::sleep(Duration::from_millis(2));
    }
    queue.validate();
}

/// Two threads promote different items at the same moment. The lock
/// linearizes them: whichever promotion is recorded last owns the head.
#[test]
fn concurrent_move_to_front_is_linearizable() {
    for _ in 0..50 {
        let executor = Arc::new(ManualExecutor::new());
        let queue = WorkQueue::with_executor(1, executor.clone()).unwrap();
        let mut events = queue.subscribe();

        let _active = queue.add_active_work_item(|| {});
        let items: Vec<WorkItem> = (0..4).map(|_| queue.add_active_work_item(|| {})).collect();
        let ids: Vec<WorkId> = items.iter().map(WorkItem::id).collect();

        let barrier = Arc::new(Barrier::new(2));
        let promoters: Vec<_> = [items[2].clone(), items[3].clone()]
            .into_iter()
            .map(|item| {
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    item.move_to_front();
                })
            })
            .collect();
        for promoter in promoters {
            promoter.join().unwrap();
        }

        let mut promoted = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EventKind::WorkPromoted { id } = event.kind {
                promoted.push(id);
            }
        }
        assert_eq!(promoted.len(), 2);

        let pending = queue.pending_ids();
        assert_eq!(pending[0], promoted[1]);
        assert_eq!(pending[1], promoted[0]);
        assert_eq!(&pending[2..], &[ids[0], ids[1]]);
        queue.validate();

        executor.run_all();
    }
}

/// Cancel races the dispatch of the same item. Whoever takes the queue
/// lock first decides the outcome, and the two never both happen.
#[test]
fn cancel_racing_dispatch_picks_exactly_one_outcome() {
    for _ in 0..100 {
        let executor = Arc::new(ManualExecutor::new());
        let queue = WorkQueue::with_executor(1, executor.clone()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        queue.add_active_work_item(|| {});
        let counter = Arc::clone(&ran);
        let target = queue.add_active_work_item(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let barrier = Arc::new(Barrier::new(2));
        let canceller = {
            let barrier = Arc::clone(&barrier);
            let target = target.clone();
            std::thread::spawn(move || {
                barrier.wait();
                target.cancel()
            })
        };
        let stepper = {
            let barrier = Arc::clone(&barrier);
            let executor = Arc::clone(&executor);
            std::thread::spawn(move || {
                barrier.wait();
                executor.run_next();
            })
        };

        let cancelled = canceller.join().unwrap();
        stepper.join().unwrap();
        executor.run_all();

        if cancelled {
            assert_eq!(target.state(), State::Cancelled);
            assert_eq!(ran.load(Ordering::SeqCst), 0);
        } else {
            assert_eq!(target.state(), State::Completed);
            assert_eq!(ran.load(Ordering::SeqCst), 1);
        }
        assert_eq!(queue.active_count(), 0);
        queue.validate();
    }
}
