//! The pipeline scheduler: a fixed-size worker pool plus a set of
//! per-context ordered work queues, enforcing per-`sync_context`
//! exclusivity and `(originating_time, sequence_id)` ordering.

mod sync_context;

pub use sync_context::{SyncContext, SyncContextId};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::time::{Clock, Instant};

/// Opaque identifier for a [`SchedulerContext`] (activation context, main
/// context, or a subpipeline's own context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchedulerContextId(pub u32);

/// One unit of scheduled work: a thunk to run exclusively under a
/// `sync_context`, gated by a due time.
pub struct WorkItem {
    origin_key: (Instant, u32, u64),
    due_time: Instant,
    thunk: Box<dyn FnOnce() + Send>,
}

impl WorkItem {
    /// Creates a work item.
    ///
    /// `origin_key` is `(originating_time, source_id, sequence_id)` and
    /// determines strict per-`sync_context` delivery order. `due_time` is
    /// the virtual instant at which the item becomes eligible to run; it is
    /// `Instant::MIN` for live (non-paced) delivery and the message's
    /// originating time for clock-enforced replay.
    #[must_use]
    pub fn new(
        origin_key: (Instant, u32, u64),
        due_time: Instant,
        thunk: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            origin_key,
            due_time,
            thunk: Box::new(thunk),
        }
    }
}

struct ContextEntry {
    sync_context: SyncContext,
    queue: BTreeMap<(Instant, u32, u64), WorkItem>,
}

/// A named work-item queue whose start/stop/quiescence is controlled as a
/// unit: the activation context, the main context, or one subpipeline's
/// own context.
pub struct SchedulerContext {
    id: SchedulerContextId,
    name: String,
    pending: Mutex<HashMap<SyncContextId, ContextEntry>>,
    accepting: AtomicBool,
    active_count: AtomicUsize,
    quiescence: Condvar,
    quiescence_lock: Mutex<()>,
}

impl SchedulerContext {
    fn new(id: SchedulerContextId, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            pending: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            active_count: AtomicUsize::new(0),
            quiescence: Condvar::new(),
            quiescence_lock: Mutex::new(()),
        })
    }

    /// This context's stable id.
    #[must_use]
    pub fn id(&self) -> SchedulerContextId {
        self.id
    }

    /// This context's human-readable name (for logging/diagnostics).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if the context currently accepts new work.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Number of work items pending or currently executing.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    fn notify_if_quiescent(&self) {
        if self.active_count.load(Ordering::SeqCst) == 0 {
            let _g = self.quiescence_lock.lock().unwrap();
            self.quiescence.notify_all();
        }
    }

    fn try_dispatch_one(&self, now: Instant) -> bool {
        let mut pending = self.pending.lock().unwrap();
        let mut claimed: Option<(SyncContext, WorkItem)> = None;
        for entry in pending.values_mut() {
            if entry.sync_context.has_in_flight_posts() || entry.queue.is_empty() {
                continue;
            }
            if !entry.sync_context.try_begin_exec() {
                continue;
            }
            let key = *entry.queue.keys().next().expect("checked non-empty");
            if entry.queue[&key].due_time > now {
                entry.sync_context.end_exec();
                continue;
            }
            let item = entry.queue.remove(&key).expect("key just observed");
            claimed = Some((entry.sync_context.clone(), item));
            break;
        }
        drop(pending);

        match claimed {
            Some((sc, item)) => {
                (item.thunk)();
                sc.end_exec();
                self.active_count.fetch_sub(1, Ordering::SeqCst);
                self.notify_if_quiescent();
                true
            }
            None => false,
        }
    }
}

/// A fixed-size worker pool dispatching work items from a set of
/// [`SchedulerContext`]s, enforcing per-`sync_context` exclusivity and
/// delivery ordering.
pub struct Scheduler {
    contexts: Mutex<HashMap<SchedulerContextId, Arc<SchedulerContext>>>,
    next_context_id: AtomicU32,
    clock: Arc<Mutex<Clock>>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Condvar>,
    wake_lock: Arc<Mutex<()>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl Scheduler {
    /// Creates a scheduler with `worker_count` OS-thread workers (minimum
    /// 1), a live clock, and no contexts yet. Call
    /// [`Scheduler::create_context`] to register work queues and
    /// [`Scheduler::start`] to spin up worker threads.
    #[must_use]
    pub fn new(worker_count: usize) -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            next_context_id: AtomicU32::new(0),
            clock: Arc::new(Mutex::new(Clock::live())),
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Condvar::new()),
            wake_lock: Arc::new(Mutex::new(())),
            workers: Mutex::new(Vec::new()),
            worker_count: worker_count.max(1),
        }
    }

    /// Replaces the scheduler's clock, e.g. switching to a replay clock
    /// whose origin is the replay interval's start.
    pub fn set_clock(&self, clock: Clock) {
        *self.clock.lock().unwrap() = clock;
    }

    /// Returns the scheduler's current virtual time.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.clock.lock().unwrap().now()
    }

    /// Creates and registers a new scheduler context.
    pub fn create_context(&self, name: impl Into<String>) -> Arc<SchedulerContext> {
        let id = SchedulerContextId(self.next_context_id.fetch_add(1, Ordering::SeqCst));
        let ctx = SchedulerContext::new(id, name);
        self.contexts.lock().unwrap().insert(id, Arc::clone(&ctx));
        ctx
    }

    /// Registers a `sync_context`'s queue with a scheduler context, if not
    /// already registered. Idempotent.
    pub fn register_sync_context(&self, ctx: &SchedulerContext, sync_context: &SyncContext) {
        let mut pending = ctx.pending.lock().unwrap();
        pending
            .entry(sync_context.id())
            .or_insert_with(|| ContextEntry {
                sync_context: sync_context.clone(),
                queue: BTreeMap::new(),
            });
    }

    /// Enqueues a work item targeting `sync_context` under `ctx`. Returns
    /// `false` (the item is dropped) if the context is no longer accepting
    /// work (post-`stop_scheduling`).
    pub fn schedule(
        &self,
        ctx: &SchedulerContext,
        sync_context: &SyncContext,
        item: WorkItem,
    ) -> bool {
        if !ctx.is_accepting() {
            return false;
        }
        {
            let mut pending = ctx.pending.lock().unwrap();
            let entry = pending
                .entry(sync_context.id())
                .or_insert_with(|| ContextEntry {
                    sync_context: sync_context.clone(),
                    queue: BTreeMap::new(),
                });
            entry.queue.insert(item.origin_key, item);
        }
        ctx.active_count.fetch_add(1, Ordering::SeqCst);
        let _g = self.wake_lock.lock().unwrap();
        self.wake.notify_all();
        true
    }

    /// Begins tracking an in-flight post against `sync_context` (see
    /// [`SyncContext::enter_post`]). Used by `Emitter::post` to keep the
    /// scheduler from dispatching a context's head item while an
    /// earlier-time message from a concurrent poster is still being
    /// enqueued.
    #[must_use]
    pub(crate) fn enter_post(&self, sync_context: &SyncContext) -> sync_context::InFlightGuard {
        sync_context.enter_post()
    }

    /// Starts the worker threads. Idempotent no-op if already started.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap();
        if !workers.is_empty() {
            return;
        }
        for idx in 0..self.worker_count {
            let scheduler = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name(format!("chronopipe-worker-{idx}"))
                .spawn(move || scheduler.worker_loop())
                .expect("failed to spawn scheduler worker thread");
            workers.push(handle);
        }
    }

    fn worker_loop(&self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            let now = self.now();
            let mut did_work = false;
            let contexts: Vec<_> = self.contexts.lock().unwrap().values().cloned().collect();
            for ctx in &contexts {
                if ctx.try_dispatch_one(now) {
                    did_work = true;
                }
            }
            if !did_work {
                let guard = self.wake_lock.lock().unwrap();
                let _ = self
                    .wake
                    .wait_timeout(guard, Duration::from_millis(2))
                    .unwrap();
            }
        }
    }

    /// Blocks until `ctx` has no pending or executing work.
    pub fn pause_for_quiescence(&self, ctx: &SchedulerContext) {
        let mut guard = ctx.quiescence_lock.lock().unwrap();
        while ctx.active_count() > 0 {
            guard = ctx.quiescence.wait_timeout(guard, Duration::from_millis(5)).unwrap().0;
        }
    }

    /// Stops accepting new work on `ctx`; already-queued work still drains.
    /// Callers typically follow with [`Scheduler::pause_for_quiescence`].
    pub fn stop_scheduling(&self, ctx: &SchedulerContext) {
        ctx.accepting.store(false, Ordering::SeqCst);
    }

    /// Signals all worker threads to exit once their current item
    /// completes, and joins them. Call only after every context has been
    /// drained via `stop_scheduling` + `pause_for_quiescence`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        {
            let _g = self.wake_lock.lock().unwrap();
            self.wake.notify_all();
        }
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.shutdown.load(Ordering::SeqCst) {
            self.shutdown.store(true, Ordering::SeqCst);
            let _g = self.wake_lock.lock().unwrap();
            self.wake.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Runtime;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn dispatches_work_in_origin_order_per_sync_context() {
        let scheduler = Arc::new(Scheduler::new(2));
        let ctx = scheduler.create_context("main");
        let runtime = Runtime::new();
        let sync_ctx = SyncContext::new(&runtime);
        scheduler.register_sync_context(&ctx, &sync_ctx);

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in (0..10).rev() {
            let order = Arc::clone(&order);
            let item = WorkItem::new(
                (Instant::from_ticks(i), 0, i as u64),
                Instant::MIN,
                move || order.lock().unwrap().push(i),
            );
            scheduler.schedule(&ctx, &sync_ctx, item);
        }

        scheduler.start();
        scheduler.pause_for_quiescence(&ctx);
        scheduler.stop_scheduling(&ctx);
        scheduler.shutdown();

        let observed = order.lock().unwrap().clone();
        let mut expected: Vec<i64> = (0..10).collect();
        expected.sort_unstable();
        assert_eq!(observed, expected);
    }

    #[test]
    fn two_sync_contexts_run_independently() {
        let scheduler = Arc::new(Scheduler::new(4));
        let ctx = scheduler.create_context("main");
        let runtime = Runtime::new();
        let sc_a = SyncContext::new(&runtime);
        let sc_b = SyncContext::new(&runtime);
        scheduler.register_sync_context(&ctx, &sc_a);
        scheduler.register_sync_context(&ctx, &sc_b);

        let counter = Arc::new(AtomicU64::new(0));
        for i in 0..20 {
            let (sc, source) = if i % 2 == 0 { (&sc_a, 0u32) } else { (&sc_b, 1u32) };
            let counter = Arc::clone(&counter);
            let item = WorkItem::new((Instant::from_ticks(i), source, i as u64), Instant::MIN, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            scheduler.schedule(&ctx, sc, item);
        }

        scheduler.start();
        scheduler.pause_for_quiescence(&ctx);
        scheduler.stop_scheduling(&ctx);
        scheduler.shutdown();

        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn due_time_gates_dispatch_until_clock_advances() {
        let scheduler = Arc::new(Scheduler::new(1));
        scheduler.set_clock(Clock::for_replay(Instant::from_ticks(0)));
        let ctx = scheduler.create_context("main");
        let runtime = Runtime::new();
        let sc = SyncContext::new(&runtime);
        scheduler.register_sync_context(&ctx, &sc);

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        // Due far in the future relative to the replay clock's origin.
        let far_future = Instant::from_ticks(crate::time::TICKS_PER_SECOND * 3600);
        let item = WorkItem::new((far_future, 0, 0), far_future, move || {
            ran_clone.store(true, Ordering::SeqCst);
        });
        scheduler.schedule(&ctx, &sc, item);
        scheduler.start();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!ran.load(Ordering::SeqCst));
        scheduler.stop_scheduling(&ctx);
        scheduler.shutdown();
    }
}
