//! chronopipe-cli - a runnable harness proving the chronopipe pipeline
//! runtime end-to-end.
//!
//! Wires two synthetic periodic sensors, a greedy nearest-neighbor fusion
//! stage, and a store-writer sink; runs the pipeline to completion (or until
//! Ctrl+C) and prints a delivery summary. With `--replay`, it instead plays
//! back an existing store and prints how many messages were recovered. This
//! is a demonstration surface, not a product one.

mod config;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use chronopipe_core::element::Source;
use chronopipe_core::interpolate::{correct_monotonic, InterpolationResult};
use chronopipe_core::store::importer::TimeInterval;
use chronopipe_core::store::{StoreExporter, StoreImporter};
use chronopipe_core::{
    ChronopipeConfig, Clock, DeliveryPolicy, Emitter, Instant, MatchKind, Message, Pipeline,
    PipelineElement, Receiver, SourceRegistry, TickDelta, WindowSpec,
};

const STORE_NAME: &str = "chronopipe-demo";
const SAMPLE_COUNT: u64 = 40;

/// Runs or replays a chronopipe demonstration pipeline.
#[derive(Parser, Debug)]
#[command(name = "chronopipe-cli")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the pipeline runtime configuration file (YAML).
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace). Env: CHRONOPIPE_LOG_LEVEL.
    #[arg(long)]
    log_level: Option<String>,

    /// Root directory for persisted stores. Env: CHRONOPIPE_STORE_DIR.
    #[arg(long, value_name = "DIR")]
    store_dir: Option<PathBuf>,

    /// Replay an existing store at this root directory instead of running
    /// the demo pipeline live.
    #[arg(long, value_name = "DIR")]
    replay: Option<PathBuf>,

    /// While replaying, reproduce the recording's real-time spacing instead
    /// of delivering every message as fast as it can be read. Ignored
    /// without `--replay`.
    #[arg(long)]
    paced: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = config::resolve_log_level(args.log_level.as_deref());
    env_logger::Builder::new()
        .parse_filters(&log_level)
        .format_timestamp_millis()
        .init();

    log::info!("chronopipe-cli v{}", env!("CARGO_PKG_VERSION"));

    if let Some(replay_dir) = args.replay {
        return replay_store(&replay_dir, args.paced);
    }

    let store_dir = config::resolve_store_dir(args.store_dir);
    run_demo(args.config.as_deref(), &store_dir).await
}

/// Replays the `fused` stream of an existing store back through a small
/// reader-into-sink pipeline, reconstructing each `Message<(f64, f64)>` from
/// its recovered envelope instead of merely counting raw bytes. With
/// `paced`, delivery reproduces the recording's real-time spacing.
fn replay_store(root: &std::path::Path, paced: bool) -> Result<()> {
    let probe = StoreImporter::open(root, STORE_NAME).with_context(|| format!("failed to open store at {}", root.display()))?;
    let streams: Vec<String> = probe.available_streams().into_iter().map(str::to_string).collect();
    log::info!("replaying store at {} ({} stream(s): {:?})", root.display(), streams.len(), streams);
    anyhow::ensure!(
        streams.iter().any(|s| s == "fused"),
        "store at {} has no 'fused' stream to replay",
        root.display()
    );
    drop(probe);

    let registry = SourceRegistry::new();
    let pipeline = Pipeline::new("chronopipe-replay", ChronopipeConfig::default(), registry);
    let runtime = pipeline.runtime().clone();

    let replay_element = PipelineElement::new(&runtime, "store-replay", true);
    let sink_element = PipelineElement::new(&runtime, "replay-sink", false);
    pipeline.add_element(Arc::clone(&replay_element))?;
    pipeline.add_element(Arc::clone(&sink_element))?;

    let replay_emitter: Emitter<(f64, f64)> = Emitter::new(runtime.next_emitter_id(), "replayed", replay_element.id());
    replay_element.register_output("replayed", replay_emitter.clone());

    let delivered = Arc::new(AtomicU64::new(0));
    let delivered_for_sink = Arc::clone(&delivered);
    let sink_receiver = Receiver::new(
        runtime.next_receiver_id(),
        "replayed-in",
        sink_element.sync_context().clone(),
        DeliveryPolicy::QueueUnlimited,
        move |msg: Message<(f64, f64)>| {
            delivered_for_sink.fetch_add(1, Ordering::SeqCst);
            log::debug!("replayed sample: temperature={:.3} pressure={:.3}", msg.payload.0, msg.payload.1);
        },
    );
    sink_element.register_input("replayed-in");
    replay_emitter.subscribe(sink_receiver, Arc::clone(pipeline.scheduler()), Arc::clone(pipeline.main_context()), |_| Instant::MIN);

    {
        let e = replay_emitter.clone();
        pipeline.register_edge(replay_element.id(), sink_element.id(), move || e.is_closed());
    }

    pipeline.registry().register(
        "store-replay",
        Arc::new({
            let root = root.to_path_buf();
            let emitter = replay_emitter.clone();
            move |_config: &ChronopipeConfig| {
                let importer = StoreImporter::open(&root, STORE_NAME)?;
                Ok(Box::new(StoreReplaySource::new(importer, "fused", emitter.clone(), paced)) as Box<dyn Source>)
            }
        }),
    );
    pipeline.register_named_source(replay_element.id(), "store-replay").context("failed to construct the store-replay source")?;

    pipeline.run(None).context("replay run failed")?;

    println!("replay summary: {} message(s) delivered", delivered.load(Ordering::SeqCst));
    Ok(())
}

/// Parses a `"temperature,pressure"` payload back into its two fields,
/// mirroring the format `wire_store_sink` writes.
fn parse_fused_csv(payload: &[u8]) -> Result<(f64, f64)> {
    let text = std::str::from_utf8(payload).context("fused payload was not valid utf-8")?;
    let (a, b) = text.split_once(',').with_context(|| format!("malformed fused payload '{text}'"))?;
    let temperature: f64 = a.trim().parse().with_context(|| format!("malformed temperature field '{a}'"))?;
    let pressure: f64 = b.trim().parse().with_context(|| format!("malformed pressure field '{b}'"))?;
    Ok((temperature, pressure))
}

/// Replays one stream's recorded messages on a dedicated background thread,
/// delivering each one under its originally recorded envelope via
/// `Emitter::deliver` rather than re-stamping it with a fresh sequence id.
/// When `paced`, sleeps between reads to reproduce the recording's real-time
/// spacing via a replay clock anchored to the first message's originating
/// time.
struct StoreReplaySource {
    importer: Option<StoreImporter>,
    stream: String,
    emitter: Emitter<(f64, f64)>,
    paced: bool,
    stop_requested: Arc<std::sync::atomic::AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl StoreReplaySource {
    fn new(importer: StoreImporter, stream: impl Into<String>, emitter: Emitter<(f64, f64)>, paced: bool) -> Self {
        Self {
            importer: Some(importer),
            stream: stream.into(),
            emitter,
            paced,
            stop_requested: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl Source for StoreReplaySource {
    fn start(&mut self, notify_completion_time: Box<dyn Fn(Instant) + Send>) {
        let Some(mut importer) = self.importer.take() else { return };
        let stream = self.stream.clone();
        let emitter = self.emitter.clone();
        let paced = self.paced;
        let stop_requested = Arc::clone(&self.stop_requested);
        self.handle = Some(std::thread::spawn(move || {
            if let Err(e) = importer.open_stream(&stream) {
                log::warn!("replay: failed to open stream '{stream}': {e}");
                notify_completion_time(Instant::MIN);
                return;
            }
            if let Err(e) = importer.seek(TimeInterval::new(Instant::MIN, Instant::MAX)) {
                log::warn!("replay: failed to seek stream '{stream}': {e}");
                notify_completion_time(Instant::MIN);
                return;
            }

            let mut replay_clock: Option<Clock> = None;
            let mut last_originating_time = Instant::MIN;
            loop {
                if stop_requested.load(Ordering::SeqCst) {
                    break;
                }
                match importer.read() {
                    Ok(Some((envelope, payload))) => {
                        if paced {
                            let clock = replay_clock.get_or_insert_with(|| Clock::for_replay(envelope.originating_time));
                            std::thread::sleep(clock.to_real_delay(envelope.originating_time));
                        }
                        match parse_fused_csv(&payload) {
                            Ok(value) => {
                                emitter.deliver(value, envelope);
                                last_originating_time = envelope.originating_time;
                            }
                            Err(e) => log::warn!("replay: skipping malformed payload on '{stream}': {e}"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("replay: read failed on '{stream}': {e}");
                        break;
                    }
                }
            }
            notify_completion_time(last_originating_time);
        }));
    }

    fn stop(&mut self, _final_time: Instant, notify_completed: Box<dyn FnOnce() + Send>) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        notify_completed();
    }
}

/// Runs the demonstration pipeline to completion, racing it against Ctrl+C.
async fn run_demo(config_path: Option<&std::path::Path>, store_dir: &std::path::Path) -> Result<()> {
    let runtime_config = ChronopipeConfig::load(config_path).context("failed to load pipeline configuration")?;
    let registry = SourceRegistry::new();
    let pipeline = Pipeline::new("chronopipe-demo", runtime_config, registry);
    let runtime = pipeline.runtime().clone();

    std::fs::create_dir_all(store_dir).with_context(|| format!("failed to create store directory {}", store_dir.display()))?;
    let exporter = Arc::new(Mutex::new(
        StoreExporter::create(store_dir, STORE_NAME).context("failed to create store")?,
    ));
    exporter
        .lock()
        .unwrap()
        .open_stream("fused", "temperature_pressure_csv", false)
        .context("failed to open the fused stream")?;

    let temperature_element = PipelineElement::new(&runtime, "temperature-sensor", true);
    let pressure_element = PipelineElement::new(&runtime, "pressure-sensor", true);
    let fusion_element = PipelineElement::new(&runtime, "fusion", false);
    let sink_element = PipelineElement::new(&runtime, "store-sink", false);
    pipeline.add_element(Arc::clone(&temperature_element))?;
    pipeline.add_element(Arc::clone(&pressure_element))?;
    pipeline.add_element(Arc::clone(&fusion_element))?;
    pipeline.add_element(Arc::clone(&sink_element))?;

    let temperature_emitter: Emitter<f64> = Emitter::new(runtime.next_emitter_id(), "temperature", temperature_element.id());
    temperature_element.register_output("temperature", temperature_emitter.clone());
    let pressure_emitter: Emitter<f64> = Emitter::new(runtime.next_emitter_id(), "pressure", pressure_element.id());
    pressure_element.register_output("pressure", pressure_emitter.clone());
    let fused_emitter: Emitter<(f64, f64)> = Emitter::new(runtime.next_emitter_id(), "fused", fusion_element.id());
    fusion_element.register_output("fused", fused_emitter.clone());

    wire_fusion_stage(&pipeline, &fusion_element, &temperature_emitter, &pressure_emitter, &fused_emitter);

    let delivered = Arc::new(AtomicU64::new(0));
    wire_store_sink(&pipeline, &sink_element, &fused_emitter, Arc::clone(&exporter), Arc::clone(&delivered));

    {
        let e = temperature_emitter.clone();
        pipeline.register_edge(temperature_element.id(), fusion_element.id(), move || e.is_closed());
    }
    {
        let e = pressure_emitter.clone();
        pipeline.register_edge(pressure_element.id(), fusion_element.id(), move || e.is_closed());
    }
    {
        let e = fused_emitter.clone();
        pipeline.register_edge(fusion_element.id(), sink_element.id(), move || e.is_closed());
    }

    pipeline.registry().register(
        "temperature-sensor",
        Arc::new({
            let emitter = temperature_emitter.clone();
            move |_config: &ChronopipeConfig| {
                Ok(Box::new(PeriodicSensor::new(
                    "temperature-sensor",
                    emitter.clone(),
                    Duration::from_millis(80),
                    SAMPLE_COUNT,
                    |i| 20.0 + (i as f64 * 0.37).sin() * 3.0,
                )) as Box<dyn Source>)
            }
        }),
    );
    pipeline.registry().register(
        "pressure-sensor",
        Arc::new({
            let emitter = pressure_emitter.clone();
            move |_config: &ChronopipeConfig| {
                Ok(Box::new(PeriodicSensor::new(
                    "pressure-sensor",
                    emitter.clone(),
                    Duration::from_millis(110),
                    SAMPLE_COUNT,
                    |i| 1013.0 + (i as f64 * 0.21).cos() * 5.0,
                )) as Box<dyn Source>)
            }
        }),
    );
    pipeline
        .register_named_source(temperature_element.id(), "temperature-sensor")
        .context("failed to construct the temperature sensor")?;
    pipeline
        .register_named_source(pressure_element.id(), "pressure-sensor")
        .context("failed to construct the pressure sensor")?;

    let pipeline_for_run = Arc::clone(&pipeline);
    let run_task = tokio::task::spawn_blocking(move || pipeline_for_run.run(None));

    tokio::select! {
        result = run_task => {
            result.context("pipeline run task panicked")?.context("pipeline run failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("received ctrl-c, stopping the pipeline early");
            let now = pipeline.scheduler().now();
            pipeline.stop(now).context("failed to stop pipeline")?;
        }
    }

    println!(
        "demo pipeline complete: {} fused sample(s) written to {}",
        delivered.load(Ordering::SeqCst),
        store_dir.join(STORE_NAME).display()
    );
    Ok(())
}

/// Wires the fusion stage: a greedy nearest-neighbor interpolator matching
/// each temperature reading against the closest pressure reading within a
/// 200ms window, emitting the paired result.
fn wire_fusion_stage(
    pipeline: &Arc<Pipeline>,
    fusion_element: &Arc<PipelineElement>,
    temperature_emitter: &Emitter<f64>,
    pressure_emitter: &Emitter<f64>,
    fused_emitter: &Emitter<(f64, f64)>,
) {
    let secondary_queue: Arc<Mutex<VecDeque<Message<f64>>>> = Arc::new(Mutex::new(VecDeque::new()));
    let interpolator = chronopipe_core::Interpolator::new(
        MatchKind::Nearest,
        WindowSpec::new(TickDelta::from_millis(-200), true, TickDelta::from_millis(200), true),
        false,
        None,
    )
    .expect("a bounded nearest-match window is always a valid interpolator configuration");

    let pressure_queue_for_receiver = Arc::clone(&secondary_queue);
    let pressure_receiver = Receiver::new(
        pipeline.runtime().next_receiver_id(),
        "pressure-in",
        fusion_element.sync_context().clone(),
        DeliveryPolicy::QueueUnlimited,
        move |msg: Message<f64>| {
            pressure_queue_for_receiver.lock().unwrap().push_back(msg);
        },
    );
    fusion_element.register_input("pressure-in");
    pressure_emitter.subscribe(pressure_receiver, Arc::clone(pipeline.scheduler()), Arc::clone(pipeline.main_context()), |_| Instant::MIN);

    let last_emitted: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    let fused_emitter_for_temp = fused_emitter.clone();
    let pressure_closed = pressure_emitter.clone();
    let clock_for_temp = Clock::live();
    let temperature_receiver = Receiver::new(
        pipeline.runtime().next_receiver_id(),
        "temperature-in",
        fusion_element.sync_context().clone(),
        DeliveryPolicy::QueueUnlimited,
        move |msg: Message<f64>| {
            let matched_pressure = {
                let mut queue = secondary_queue.lock().unwrap();
                match interpolator.evaluate(&mut queue, msg.originating_time(), pressure_closed.is_closed()) {
                    InterpolationResult::Matched(p) | InterpolationResult::Default(p) => Some(p),
                    InterpolationResult::InsufficientData | InterpolationResult::NotFound => None,
                }
            };
            let Some(pressure) = matched_pressure else { return };
            let mut last = last_emitted.lock().unwrap();
            let t = correct_monotonic(msg.originating_time(), *last);
            *last = Some(t);
            if let Err(e) = fused_emitter_for_temp.post((msg.payload, pressure), t, &clock_for_temp) {
                log::warn!("fusion: failed to emit fused sample: {e}");
            }
        },
    );
    fusion_element.register_input("temperature-in");
    temperature_emitter.subscribe(temperature_receiver, Arc::clone(pipeline.scheduler()), Arc::clone(pipeline.main_context()), |_| Instant::MIN);
}

/// Wires the store-writer sink: every fused sample is serialized as a CSV
/// pair and appended to the `fused` stream.
fn wire_store_sink(
    pipeline: &Arc<Pipeline>,
    sink_element: &Arc<PipelineElement>,
    fused_emitter: &Emitter<(f64, f64)>,
    exporter: Arc<Mutex<StoreExporter>>,
    delivered: Arc<AtomicU64>,
) {
    let sink_receiver = Receiver::new(
        pipeline.runtime().next_receiver_id(),
        "fused-in",
        sink_element.sync_context().clone(),
        DeliveryPolicy::QueueUnlimited,
        move |msg: Message<(f64, f64)>| {
            let envelope = msg.envelope;
            let payload = format!("{:.3},{:.3}", msg.payload.0, msg.payload.1);
            match exporter.lock().unwrap().write("fused", envelope, payload.as_bytes()) {
                Ok(()) => {
                    delivered.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => log::warn!("store-sink: write failed: {e}"),
            }
        },
    );
    sink_element.register_input("fused-in");
    fused_emitter.subscribe(sink_receiver, Arc::clone(pipeline.scheduler()), Arc::clone(pipeline.main_context()), |_| Instant::MIN);
}

/// A synthetic periodic source: posts `sample_count` values spaced `period`
/// apart on a dedicated background thread, computed by `next_value`.
struct PeriodicSensor {
    name: String,
    emitter: Emitter<f64>,
    period: Duration,
    sample_count: u64,
    next_value: Box<dyn FnMut(u64) -> f64 + Send>,
    stop_requested: Arc<std::sync::atomic::AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PeriodicSensor {
    fn new(
        name: impl Into<String>,
        emitter: Emitter<f64>,
        period: Duration,
        sample_count: u64,
        next_value: impl FnMut(u64) -> f64 + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            emitter,
            period,
            sample_count,
            next_value: Box::new(next_value),
            stop_requested: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl Source for PeriodicSensor {
    fn start(&mut self, notify_completion_time: Box<dyn Fn(Instant) + Send>) {
        let emitter = self.emitter.clone();
        let period = self.period;
        let sample_count = self.sample_count;
        let stop_requested = Arc::clone(&self.stop_requested);
        let mut next_value = std::mem::replace(&mut self.next_value, Box::new(|_| 0.0));
        let name = self.name.clone();
        self.handle = Some(std::thread::spawn(move || {
            let clock = Clock::live();
            let mut last_posted = Instant::MIN;
            for i in 0..sample_count {
                if stop_requested.load(Ordering::SeqCst) {
                    break;
                }
                std::thread::sleep(period);
                let t = clock.now();
                let value = next_value(i);
                match emitter.post(value, t, &clock) {
                    Ok(()) => last_posted = t,
                    Err(e) => log::warn!("{name}: post failed: {e}"),
                }
            }
            notify_completion_time(last_posted);
        }));
    }

    fn stop(&mut self, _final_time: Instant, notify_completed: Box<dyn FnOnce() + Send>) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        notify_completed();
    }
}
