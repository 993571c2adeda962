//! Optional pipeline structure and throughput diagnostics.
//!
//! A [`Collector`] maintains live structural mirrors of pipelines, elements,
//! emitters, and receivers, plus per-receiver rolling histories. A
//! [`Sampler`] runs a background timer that periodically trims those
//! histories to the configured averaging window, builds a pointer-free
//! snapshot tree, and posts it through an [`Emitter`].
//!
//! The snapshot tree is built in two passes (create every node by id, then
//! fix up id-referencing cross-links) so that the inherently cyclic live
//! graph never needs to be represented as a cyclic Rust value.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant as WallInstant};

use crate::config::DiagnosticsConfig;
use crate::emitter::Emitter;
use crate::interpolate::correct_monotonic;
use crate::time::{Clock, Instant};

/// Structural record for one pipeline, registered once at construction.
#[derive(Debug, Clone)]
pub struct PipelineInfo {
    /// Pipeline id.
    pub id: u32,
    /// Pipeline name.
    pub name: String,
    /// Parent pipeline id, if this is a subpipeline.
    pub parent_id: Option<u32>,
}

/// Structural record for one pipeline element.
#[derive(Debug, Clone)]
pub struct ElementInfo {
    /// Element id.
    pub id: u32,
    /// Element name.
    pub name: String,
    /// Owning pipeline id.
    pub pipeline_id: u32,
}

/// Structural record for one emitter.
#[derive(Debug, Clone)]
pub struct EmitterInfo {
    /// Emitter id.
    pub id: u32,
    /// Emitter name.
    pub name: String,
    /// Owning element id.
    pub element_id: u32,
}

/// Structural record for one receiver.
#[derive(Debug, Clone)]
pub struct ReceiverInfo {
    /// Receiver id.
    pub id: u32,
    /// Receiver name.
    pub name: String,
    /// Owning element id.
    pub element_id: u32,
}

/// One recorded delivery to a receiver, used to compute rolling averages.
#[derive(Debug, Clone, Copy)]
struct ReceiverSample {
    at: WallInstant,
    processing_ticks: i64,
    size_bytes: Option<usize>,
}

#[derive(Default)]
struct ReceiverCounters {
    emitted: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
}

/// Live structural mirror plus rolling per-receiver histories.
///
/// Cheap to clone (internally `Arc`-backed); intended to be shared between
/// the pipeline's wiring code (which registers structure and records
/// samples) and the [`Sampler`] (which reads and trims it).
#[derive(Clone, Default)]
pub struct Collector {
    pipelines: Arc<Mutex<HashMap<u32, PipelineInfo>>>,
    elements: Arc<Mutex<HashMap<u32, ElementInfo>>>,
    emitters: Arc<Mutex<HashMap<u32, EmitterInfo>>>,
    receivers: Arc<Mutex<HashMap<u32, ReceiverInfo>>>,
    counters: Arc<Mutex<HashMap<u32, Arc<ReceiverCounters>>>>,
    histories: Arc<Mutex<HashMap<u32, VecDeque<ReceiverSample>>>>,
}

impl Collector {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pipeline's structural record.
    pub fn register_pipeline(&self, info: PipelineInfo) {
        self.pipelines.lock().unwrap().insert(info.id, info);
    }

    /// Registers an element's structural record.
    pub fn register_element(&self, info: ElementInfo) {
        self.elements.lock().unwrap().insert(info.id, info);
    }

    /// Registers an emitter's structural record.
    pub fn register_emitter(&self, info: EmitterInfo) {
        self.emitters.lock().unwrap().insert(info.id, info);
    }

    /// Registers a receiver's structural record and its counters.
    pub fn register_receiver(&self, info: ReceiverInfo) {
        let id = info.id;
        self.receivers.lock().unwrap().insert(id, info);
        self.counters.lock().unwrap().entry(id).or_insert_with(|| Arc::new(ReceiverCounters::default()));
        self.histories.lock().unwrap().entry(id).or_insert_with(VecDeque::new);
    }

    /// Records that a message was emitted toward `receiver_id` (queued or
    /// about to be, prior to any policy decision).
    pub fn record_emitted(&self, receiver_id: u32) {
        if let Some(counters) = self.counters.lock().unwrap().get(&receiver_id) {
            counters.emitted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records that `receiver_id` dropped a message (policy overflow).
    pub fn record_dropped(&self, receiver_id: u32) {
        if let Some(counters) = self.counters.lock().unwrap().get(&receiver_id) {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records that `receiver_id`'s action ran, taking `processing_ticks`
    /// and (optionally) the delivered payload's serialized size.
    pub fn record_processed(&self, receiver_id: u32, processing_ticks: i64, size_bytes: Option<usize>) {
        if let Some(counters) = self.counters.lock().unwrap().get(&receiver_id) {
            counters.processed.fetch_add(1, Ordering::Relaxed);
        }
        self.histories.lock().unwrap().entry(receiver_id).or_default().push_back(ReceiverSample {
            at: WallInstant::now(),
            processing_ticks,
            size_bytes,
        });
    }

    /// Drops every history entry older than `window` relative to now.
    fn trim_histories(&self, window: Duration) {
        let now = WallInstant::now();
        for history in self.histories.lock().unwrap().values_mut() {
            while history.front().is_some_and(|s| now.duration_since(s.at) > window) {
                history.pop_front();
            }
        }
    }

    /// Builds a pointer-free snapshot of the current structure and stats.
    ///
    /// Pass 1 creates one summary node per id; pass 2 groups them by parent
    /// id so every cross-link in the result is an id, never a reference.
    fn snapshot(&self) -> PipelineDiagnostics {
        let pipelines = self.pipelines.lock().unwrap();
        let elements = self.elements.lock().unwrap();
        let emitters = self.emitters.lock().unwrap();
        let receivers = self.receivers.lock().unwrap();
        let counters = self.counters.lock().unwrap();
        let histories = self.histories.lock().unwrap();

        let pipeline_nodes: Vec<PipelineNode> = pipelines
            .values()
            .map(|p| PipelineNode {
                id: p.id,
                name: p.name.clone(),
                parent_id: p.parent_id,
            })
            .collect();

        let element_nodes: Vec<ElementNode> = elements
            .values()
            .map(|e| ElementNode {
                id: e.id,
                name: e.name.clone(),
                pipeline_id: e.pipeline_id,
            })
            .collect();

        let emitter_nodes: Vec<EmitterNode> = emitters
            .values()
            .map(|e| EmitterNode {
                id: e.id,
                name: e.name.clone(),
                element_id: e.element_id,
            })
            .collect();

        let receiver_nodes: Vec<ReceiverNode> = receivers
            .values()
            .map(|r| {
                let history = histories.get(&r.id);
                let (avg_processing_ticks, avg_size_bytes) = match history {
                    Some(h) if !h.is_empty() => {
                        let total_ticks: i64 = h.iter().map(|s| s.processing_ticks).sum();
                        let sizes: Vec<usize> = h.iter().filter_map(|s| s.size_bytes).collect();
                        let avg_size = if sizes.is_empty() { None } else { Some(sizes.iter().sum::<usize>() / sizes.len()) };
                        (total_ticks / h.len() as i64, avg_size)
                    }
                    _ => (0, None),
                };
                let c = counters.get(&r.id);
                ReceiverNode {
                    id: r.id,
                    name: r.name.clone(),
                    element_id: r.element_id,
                    emitted: c.map_or(0, |c| c.emitted.load(Ordering::Relaxed)),
                    processed: c.map_or(0, |c| c.processed.load(Ordering::Relaxed)),
                    dropped: c.map_or(0, |c| c.dropped.load(Ordering::Relaxed)),
                    queue_size: history.map_or(0, VecDeque::len),
                    avg_processing_ticks,
                    avg_message_size_bytes: avg_size_bytes,
                }
            })
            .collect();

        PipelineDiagnostics {
            pipelines: pipeline_nodes,
            elements: element_nodes,
            emitters: emitter_nodes,
            receivers: receiver_nodes,
        }
    }
}

/// A pipeline, summarized for export.
#[derive(Debug, Clone)]
pub struct PipelineNode {
    /// Pipeline id.
    pub id: u32,
    /// Pipeline name.
    pub name: String,
    /// Parent pipeline id, for subpipelines.
    pub parent_id: Option<u32>,
}

/// An element, summarized for export.
#[derive(Debug, Clone)]
pub struct ElementNode {
    /// Element id.
    pub id: u32,
    /// Element name.
    pub name: String,
    /// Owning pipeline id.
    pub pipeline_id: u32,
}

/// An emitter, summarized for export.
#[derive(Debug, Clone)]
pub struct EmitterNode {
    /// Emitter id.
    pub id: u32,
    /// Emitter name.
    pub name: String,
    /// Owning element id.
    pub element_id: u32,
}

/// A receiver with its rolling statistics, summarized for export.
#[derive(Debug, Clone)]
pub struct ReceiverNode {
    /// Receiver id.
    pub id: u32,
    /// Receiver name.
    pub name: String,
    /// Owning element id.
    pub element_id: u32,
    /// Total messages ever offered to this receiver.
    pub emitted: u64,
    /// Total messages this receiver's action has processed.
    pub processed: u64,
    /// Total messages this receiver dropped under policy overflow.
    pub dropped: u64,
    /// Entries currently in the rolling history (bounded by the averaging
    /// window, not the delivery queue's own depth).
    pub queue_size: usize,
    /// Average processing time across the rolling window, in ticks.
    pub avg_processing_ticks: i64,
    /// Average payload size across the rolling window, if tracked.
    pub avg_message_size_bytes: Option<usize>,
}

/// One sampled snapshot of the whole pipeline's structure and throughput.
#[derive(Debug, Clone, Default)]
pub struct PipelineDiagnostics {
    /// Every registered pipeline (root and subpipelines).
    pub pipelines: Vec<PipelineNode>,
    /// Every registered element.
    pub elements: Vec<ElementNode>,
    /// Every registered emitter.
    pub emitters: Vec<EmitterNode>,
    /// Every registered receiver, with its current rolling statistics.
    pub receivers: Vec<ReceiverNode>,
}

/// Periodically samples a [`Collector`] and posts snapshots to a dedicated
/// stream.
pub struct Sampler {
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sampler {
    /// Starts a background thread that samples `collector` on
    /// `config.sample_interval_ms`, emitting each snapshot through `sink`.
    #[must_use]
    pub fn start(collector: Collector, sink: Emitter<PipelineDiagnostics>, config: DiagnosticsConfig) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let running_thread = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name("chronopipe-diagnostics".to_string())
            .spawn(move || {
                let interval = Duration::from_millis(config.sample_interval_ms);
                let window = Duration::from_millis(config.averaging_window_ms);
                let clock = Clock::live();
                let mut last_posted: Option<Instant> = None;
                while running_thread.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    if !running_thread.load(Ordering::Relaxed) {
                        break;
                    }
                    collector.trim_histories(window);
                    let snapshot = collector.snapshot();
                    let now = correct_monotonic(clock.now(), last_posted);
                    if sink.post(snapshot, now, &clock).is_ok() {
                        last_posted = Some(now);
                    }
                }
            })
            .expect("failed to spawn diagnostics sampler thread");
        Self {
            running,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signals the sampler thread to stop and waits for it to exit.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_registered_structure() {
        let collector = Collector::new();
        collector.register_pipeline(PipelineInfo {
            id: 1,
            name: "root".into(),
            parent_id: None,
        });
        collector.register_element(ElementInfo {
            id: 10,
            name: "source".into(),
            pipeline_id: 1,
        });
        collector.register_receiver(ReceiverInfo {
            id: 100,
            name: "in".into(),
            element_id: 10,
        });
        collector.record_emitted(100);
        collector.record_processed(100, 5, Some(128));

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.pipelines.len(), 1);
        assert_eq!(snapshot.receivers.len(), 1);
        assert_eq!(snapshot.receivers[0].emitted, 1);
        assert_eq!(snapshot.receivers[0].processed, 1);
        assert_eq!(snapshot.receivers[0].avg_message_size_bytes, Some(128));
    }

    #[test]
    fn trim_histories_drops_entries_past_the_window() {
        let collector = Collector::new();
        collector.register_receiver(ReceiverInfo {
            id: 1,
            name: "r".into(),
            element_id: 1,
        });
        collector.record_processed(1, 1, None);
        collector.trim_histories(Duration::from_millis(0));
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.receivers[0].queue_size, 0);
    }
}
