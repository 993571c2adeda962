//! Receivers: policy-governed message sinks.

use std::sync::{Arc, Mutex};

use crate::envelope::Envelope;
use crate::message::Message;
use crate::policy::{DeliveryPolicy, PolicyDecision, PolicyQueue};
use crate::scheduler::{Scheduler, SchedulerContext, SyncContext, WorkItem};
use crate::time::Instant;

/// A policy-governed sink for messages of type `T`, executing its `action`
/// exclusively under its owning element's `sync_context`.
///
/// A receiver may be wired to more than one emitter (fan-in merges a
/// component's inputs into one action); ordering across sources sharing a
/// `sync_context` is still enforced by the scheduler's per-context queue,
/// keyed by `(originating_time, source_id, sequence_id)`, not by anything
/// in this type.
#[derive(Clone)]
pub struct Receiver<T> {
    id: u32,
    name: String,
    sync_context: SyncContext,
    queue: Arc<Mutex<PolicyQueue<Message<T>>>>,
    action: Arc<Mutex<Box<dyn FnMut(Message<T>) + Send>>>,
    last_envelope: Arc<Mutex<Option<Envelope>>>,
}

impl<T> Receiver<T>
where
    T: Send + 'static,
{
    /// Creates a receiver owned by `sync_context`, governed by `policy`,
    /// invoking `action` for each delivered message.
    #[must_use]
    pub fn new(
        id: u32,
        name: impl Into<String>,
        sync_context: SyncContext,
        policy: DeliveryPolicy,
        action: impl FnMut(Message<T>) + Send + 'static,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            sync_context,
            queue: Arc::new(Mutex::new(PolicyQueue::new(policy))),
            action: Arc::new(Mutex::new(Box::new(action))),
            last_envelope: Arc::new(Mutex::new(None)),
        }
    }

    /// This receiver's stable id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// This receiver's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `sync_context` this receiver's action executes under.
    #[must_use]
    pub fn sync_context(&self) -> &SyncContext {
        &self.sync_context
    }

    /// The delivery policy governing this receiver's queue.
    #[must_use]
    pub fn policy(&self) -> DeliveryPolicy {
        self.queue.lock().unwrap().policy()
    }

    /// Number of messages dropped by this receiver's policy over its
    /// lifetime.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.queue.lock().unwrap().dropped_count()
    }

    /// True if this receiver is currently signaling its upstream
    /// emitter(s) to throttle.
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.queue.lock().unwrap().is_throttled()
    }

    /// The originating time of the most recently offered message, if any.
    #[must_use]
    pub fn last_originating_time(&self) -> Option<Instant> {
        self.last_envelope.lock().unwrap().map(|e| e.originating_time)
    }

    /// Offers `msg` to this receiver's policy queue and, if accepted,
    /// schedules its delivery (a call to `action`) under `sched_ctx`.
    ///
    /// `due_time` is the virtual instant at which the scheduler is allowed
    /// to run the action — `Instant::MIN` for live delivery, or the
    /// message's originating time when a replay driver is enforcing clock
    /// pacing.
    pub fn deliver(
        &self,
        scheduler: &Scheduler,
        sched_ctx: &SchedulerContext,
        msg: Message<T>,
        due_time: Instant,
    ) -> PolicyDecision {
        let key = msg.envelope.delivery_key();
        *self.last_envelope.lock().unwrap() = Some(msg.envelope);

        let decision = self.queue.lock().unwrap().offer(msg);
        if decision == PolicyDecision::Enqueue {
            let queue = Arc::clone(&self.queue);
            let action = Arc::clone(&self.action);
            let item = WorkItem::new(key, due_time, move || {
                if let Some(m) = queue.lock().unwrap().pop_front() {
                    (action.lock().unwrap())(m);
                }
            });
            scheduler.schedule(sched_ctx, &self.sync_context, item);
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::ids::Runtime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn latest_message_policy_collapses_rapid_offers() {
        let scheduler = Arc::new(Scheduler::new(1));
        let sched_ctx = scheduler.create_context("main");
        let runtime = Runtime::new();
        let sync_ctx = SyncContext::new(&runtime);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let receiver = Receiver::new(0, "r", sync_ctx, DeliveryPolicy::LatestMessage, move |_msg: Message<i32>| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        for i in 0..5 {
            let env = Envelope::new(0, i as u64, Instant::from_ticks(i as i64 + 1), Instant::from_ticks(0));
            receiver.deliver(&scheduler, &sched_ctx, Message::new(i, env), Instant::MIN);
        }

        scheduler.start();
        scheduler.pause_for_quiescence(&sched_ctx);
        scheduler.stop_scheduling(&sched_ctx);
        scheduler.shutdown();

        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(receiver.last_originating_time(), Some(Instant::from_ticks(5)));
    }
}
