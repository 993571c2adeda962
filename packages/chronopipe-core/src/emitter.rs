//! Emitters: the sole write side of a typed edge.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::envelope::Envelope;
use crate::error::{ChronopipeError, ChronopipeResult};
use crate::message::Message;
use crate::receiver::Receiver;
use crate::scheduler::{Scheduler, SchedulerContext};
use crate::time::{Clock, Instant};

type Subscriber<T> = Arc<dyn Fn(Message<T>) + Send + Sync>;

/// The sole write side of a typed edge.
///
/// Mints envelopes with a strictly increasing `originating_time` and fans
/// each resulting message out to every subscribed receiver. Cloning an
/// `Emitter` shares its sequence counter and subscriber list; the clone is
/// the same logical emitter, not a new source.
#[derive(Clone)]
pub struct Emitter<T> {
    id: u32,
    name: String,
    owner_element_id: u32,
    sequence: Arc<AtomicU64>,
    last_originating_time: Arc<AtomicI64>,
    closed: Arc<AtomicBool>,
    subscribers: Arc<Mutex<Vec<Subscriber<T>>>>,
}

impl<T> Emitter<T>
where
    T: Clone + Send + 'static,
{
    /// Creates an emitter owned by `owner_element_id`.
    #[must_use]
    pub fn new(id: u32, name: impl Into<String>, owner_element_id: u32) -> Self {
        Self {
            id,
            name: name.into(),
            owner_element_id,
            sequence: Arc::new(AtomicU64::new(0)),
            last_originating_time: Arc::new(AtomicI64::new(i64::MIN)),
            closed: Arc::new(AtomicBool::new(false)),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// This emitter's stable id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// This emitter's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the pipeline element that owns this emitter.
    #[must_use]
    pub fn owner_element_id(&self) -> u32 {
        self.owner_element_id
    }

    /// True once [`Emitter::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of receivers currently wired to this emitter.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Wires `receiver` to this emitter: every future post is delivered to
    /// it through `scheduler`/`sched_ctx`, subject to the receiver's own
    /// delivery policy.
    ///
    /// `due_time_for` turns a message's originating time into the virtual
    /// instant the scheduler may run the receiver's action at —
    /// `|_| Instant::MIN` for live delivery, or the identity function for
    /// clock-enforced replay pacing.
    pub fn subscribe(
        &self,
        receiver: Receiver<T>,
        scheduler: Arc<Scheduler>,
        sched_ctx: Arc<SchedulerContext>,
        due_time_for: impl Fn(Instant) -> Instant + Send + Sync + 'static,
    ) {
        let cb: Subscriber<T> = Arc::new(move |msg: Message<T>| {
            let due = due_time_for(msg.originating_time());
            let _ = receiver.deliver(&scheduler, &sched_ctx, msg, due);
        });
        self.subscribers.lock().unwrap().push(cb);
    }

    /// Mints an envelope for `payload` at `originating_time` and fans it
    /// out to every subscriber, cloning the payload once per subscriber.
    ///
    /// Fails with [`ChronopipeError::OutOfOrderEmission`] if
    /// `originating_time` does not strictly exceed the previous accepted
    /// post's, and with [`ChronopipeError::InactiveState`] if the emitter
    /// has been closed.
    pub fn post(&self, payload: T, originating_time: Instant, clock: &Clock) -> ChronopipeResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChronopipeError::InactiveState {
                operation: "post".to_string(),
                state: "closed".to_string(),
            });
        }

        let prev_ticks = self.last_originating_time.load(Ordering::SeqCst);
        if originating_time.ticks() <= prev_ticks {
            return Err(ChronopipeError::OutOfOrderEmission {
                emitter: self.name.clone(),
                new: originating_time,
                last: Instant::from_ticks(prev_ticks),
            });
        }
        // Compare-exchange guards against two threads racing `post` on the
        // same emitter concurrently and both passing the check above.
        if self
            .last_originating_time
            .compare_exchange(
                prev_ticks,
                originating_time.ticks(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(ChronopipeError::OutOfOrderEmission {
                emitter: self.name.clone(),
                new: originating_time,
                last: Instant::from_ticks(self.last_originating_time.load(Ordering::SeqCst)),
            });
        }

        let sequence_id = self.sequence.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope::new(self.id, sequence_id, originating_time, clock.now());

        let subscribers = self.subscribers.lock().unwrap();
        for sub in subscribers.iter() {
            sub(Message::new(payload.clone(), envelope));
        }
        Ok(())
    }

    /// Delivers `payload` under a pre-existing `envelope` instead of
    /// minting one, fanning it out to every subscriber exactly like `post`
    /// otherwise would.
    ///
    /// Used by replay and bridging connectors, which must preserve the
    /// envelope's original `source_id`/`sequence_id`/`originating_time`
    /// rather than re-stamping it with this emitter's own sequence counter.
    /// Bypasses `post`'s monotonic-originating-time check entirely: the
    /// ordering `deliver` is handing back was already established by
    /// whatever `post` originally minted the envelope. A closed emitter
    /// silently drops the delivery, matching `post`'s closed-state refusal.
    pub fn deliver(&self, payload: T, envelope: Envelope) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let subscribers = self.subscribers.lock().unwrap();
        for sub in subscribers.iter() {
            sub(Message::new(payload.clone(), envelope));
        }
    }

    /// Closes the emitter; further posts fail with `InactiveState`. Called
    /// during finalization once an element's final originating time has
    /// been determined.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Runtime;
    use crate::policy::DeliveryPolicy;
    use crate::scheduler::{Scheduler, SyncContext};
    use std::sync::Mutex as StdMutex;

    #[test]
    fn post_rejects_non_increasing_originating_time() {
        let emitter: Emitter<i32> = Emitter::new(0, "e", 0);
        let clock = Clock::live();
        emitter.post(1, Instant::from_ticks(10), &clock).unwrap();
        let err = emitter.post(2, Instant::from_ticks(5), &clock).unwrap_err();
        assert!(matches!(err, ChronopipeError::OutOfOrderEmission { .. }));
    }

    #[test]
    fn post_after_close_fails() {
        let emitter: Emitter<i32> = Emitter::new(0, "e", 0);
        emitter.close();
        let err = emitter.post(1, Instant::from_ticks(1), &Clock::live()).unwrap_err();
        assert!(matches!(err, ChronopipeError::InactiveState { .. }));
    }

    #[test]
    fn posted_messages_reach_subscribed_receiver() {
        let scheduler = Arc::new(Scheduler::new(1));
        let sched_ctx = scheduler.create_context("main");
        let runtime = Runtime::new();
        let sync_ctx = SyncContext::new(&runtime);

        let received = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        let receiver = Receiver::new(0, "r", sync_ctx, DeliveryPolicy::QueueUnlimited, move |msg: Message<i32>| {
            received_clone.lock().unwrap().push(msg.payload);
        });

        let emitter: Emitter<i32> = Emitter::new(0, "e", 0);
        emitter.subscribe(receiver, Arc::clone(&scheduler), Arc::clone(&sched_ctx), |_| Instant::MIN);

        let clock = Clock::live();
        for i in 0..5 {
            emitter.post(i, Instant::from_ticks(i as i64 + 1), &clock).unwrap();
        }

        scheduler.start();
        scheduler.pause_for_quiescence(&sched_ctx);
        scheduler.stop_scheduling(&sched_ctx);
        scheduler.shutdown();

        assert_eq!(*received.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn deliver_preserves_the_supplied_envelope_and_bypasses_the_monotonic_check() {
        let scheduler = Arc::new(Scheduler::new(1));
        let sched_ctx = scheduler.create_context("main");
        let runtime = Runtime::new();
        let sync_ctx = SyncContext::new(&runtime);

        let received: Arc<StdMutex<Vec<Envelope>>> = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        let receiver = Receiver::new(0, "r", sync_ctx, DeliveryPolicy::QueueUnlimited, move |msg: Message<i32>| {
            received_clone.lock().unwrap().push(msg.envelope);
        });

        let emitter: Emitter<i32> = Emitter::new(0, "e", 0);
        emitter.subscribe(receiver, Arc::clone(&scheduler), Arc::clone(&sched_ctx), |_| Instant::MIN);

        let replayed = Envelope::new(9, 100, Instant::from_ticks(5), Instant::from_ticks(5));
        emitter.deliver(7, replayed);
        // A later post with an earlier originating time than the delivered
        // envelope still succeeds: deliver never touched the sequence
        // counter or the monotonic originating-time bookkeeping.
        emitter.post(1, Instant::from_ticks(1), &Clock::live()).unwrap();

        scheduler.start();
        scheduler.pause_for_quiescence(&sched_ctx);
        scheduler.stop_scheduling(&sched_ctx);
        scheduler.shutdown();

        let seen = received.lock().unwrap();
        assert_eq!(seen[0], replayed);
    }

    #[test]
    fn deliver_after_close_is_dropped() {
        let emitter: Emitter<i32> = Emitter::new(0, "e", 0);
        emitter.close();
        // No subscribers and no panic: a closed emitter just drops the
        // delivery, matching `post`'s closed-state refusal.
        emitter.deliver(1, Envelope::new(0, 0, Instant::from_ticks(1), Instant::from_ticks(1)));
    }
}
