//! Pipeline elements: the lifecycle wrapper around a user component.

use std::sync::{Arc, Mutex};

use crate::emitter::Emitter;
use crate::error::{ChronopipeError, ChronopipeResult};
use crate::ids::Runtime;
use crate::scheduler::SyncContext;
use crate::time::Instant;

/// Lifecycle states a pipeline element moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    /// Created, not yet activated.
    Initial,
    /// Running normally.
    Activated,
    /// `stop` requested; draining in-flight work.
    Deactivating,
    /// Drained; awaiting finalization.
    Deactivated,
    /// `final` has run; emitters closed.
    Finalized,
}

impl ElementState {
    fn name(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Activated => "activated",
            Self::Deactivating => "deactivating",
            Self::Deactivated => "deactivated",
            Self::Finalized => "finalized",
        }
    }

    fn next_allowed(self) -> Option<ElementState> {
        match self {
            Self::Initial => Some(Self::Activated),
            Self::Activated => Some(Self::Deactivating),
            Self::Deactivating => Some(Self::Deactivated),
            Self::Deactivated => Some(Self::Finalized),
            Self::Finalized => None,
        }
    }
}

/// The capability kind of a pipeline element.
///
/// Most elements are `Source` (drives itself via [`Source::start`]) or
/// `Reactive` (driven purely by delivery to its receivers). `Connector`
/// marks one side of a bridging pair — the input side and output side of a
/// subpipeline boundary, or any other construct that relays messages across
/// a pipeline edge on another element's behalf — which `Pipeline` tracks in
/// its bridge map and treats as a single logical node during finalization's
/// cycle analysis (see [`crate::pipeline::Pipeline::register_bridge`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    /// Originates messages on its own schedule.
    Source,
    /// Driven purely by delivery to its receivers.
    Reactive,
    /// One side of a bridging connector pair.
    Connector,
}

/// Implemented by components that originate messages on their own
/// schedule, rather than purely in reaction to upstream delivery.
///
/// A reactive-only element (one driven purely by its receivers) does not
/// implement this trait; `PipelineElement::is_source` tracks which kind it
/// is for finalization purposes.
pub trait Source: Send {
    /// Starts producing messages. `notify_completion_time` must eventually
    /// be called with this source's final originating time: `Instant::MAX`
    /// for an infinite source, `Instant::MIN` for a purely reactive one,
    /// or a finite instant once known.
    fn start(&mut self, notify_completion_time: Box<dyn Fn(Instant) + Send>);

    /// Requests the source stop producing messages no later than
    /// `final_time`. Must eventually call `notify_completed`.
    fn stop(&mut self, final_time: Instant, notify_completed: Box<dyn FnOnce() + Send>);
}

impl Source for Box<dyn Source> {
    fn start(&mut self, notify_completion_time: Box<dyn Fn(Instant) + Send>) {
        (**self).start(notify_completion_time);
    }

    fn stop(&mut self, final_time: Instant, notify_completed: Box<dyn FnOnce() + Send>) {
        (**self).stop(final_time, notify_completed);
    }
}

/// One node in the pipeline graph.
///
/// Owns the names of its typed inputs/outputs (the emitters/receivers
/// themselves are held by the user's component and registered here only
/// by name, per the design note on treating the graph as a flat
/// id-referencing arena) and the lifecycle state machine.
pub struct PipelineElement {
    id: u32,
    name: String,
    sync_context: SyncContext,
    state: Mutex<ElementState>,
    kind: ElementKind,
    final_originating_time: Mutex<Option<Instant>>,
    input_names: Mutex<Vec<String>>,
    outputs: Mutex<Vec<(String, Box<dyn Fn() + Send>)>>,
    final_hook: Mutex<Option<Box<dyn FnMut(Instant) + Send>>>,
}

impl PipelineElement {
    /// Creates an element owned by `runtime`'s id scope.
    #[must_use]
    pub fn new(runtime: &Runtime, name: impl Into<String>, is_source: bool) -> Arc<Self> {
        Self::with_kind(runtime, name, if is_source { ElementKind::Source } else { ElementKind::Reactive })
    }

    /// Creates a connector-side element: one half of a bridging pair
    /// registered with [`crate::pipeline::Pipeline::register_bridge`]. A
    /// connector is driven by delivery like a reactive element, but
    /// finalization treats it as one logical node together with its
    /// bridged peer.
    #[must_use]
    pub fn new_connector(runtime: &Runtime, name: impl Into<String>) -> Arc<Self> {
        Self::with_kind(runtime, name, ElementKind::Connector)
    }

    fn with_kind(runtime: &Runtime, name: impl Into<String>, kind: ElementKind) -> Arc<Self> {
        Arc::new(Self {
            id: runtime.next_element_id(),
            name: name.into(),
            sync_context: SyncContext::new(runtime),
            state: Mutex::new(ElementState::Initial),
            kind,
            final_originating_time: Mutex::new(None),
            input_names: Mutex::new(Vec::new()),
            outputs: Mutex::new(Vec::new()),
            final_hook: Mutex::new(None),
        })
    }

    /// Registers the closure run once, at finalization time, before this
    /// element's outputs are closed. Used for components that emit
    /// trailing messages summarizing buffered state.
    pub fn set_final_hook(&self, hook: impl FnMut(Instant) + Send + 'static) {
        *self.final_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Runs the registered final hook (if any) with `t`, then closes every
    /// output. Idempotent in practice because the pipeline calls this at
    /// most once per element, but safe to call only once: a second call
    /// runs no hook (it was taken) but re-closes already-closed outputs,
    /// which is a no-op.
    pub fn run_final(&self, t: Instant) {
        if let Some(mut hook) = self.final_hook.lock().unwrap().take() {
            hook(t);
        }
        self.close_outputs();
    }

    /// This element's stable id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// This element's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `sync_context` serializing this element's receivers and
    /// lifecycle callbacks.
    #[must_use]
    pub fn sync_context(&self) -> &SyncContext {
        &self.sync_context
    }

    /// True if this element implements [`Source`].
    #[must_use]
    pub fn is_source(&self) -> bool {
        self.kind == ElementKind::Source
    }

    /// This element's capability kind.
    #[must_use]
    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ElementState {
        *self.state.lock().unwrap()
    }

    /// Registers an input name, for diagnostics and finalization input
    /// tracking (the `Receiver` itself is held by the user's component).
    pub fn register_input(&self, name: impl Into<String>) {
        self.input_names.lock().unwrap().push(name.into());
    }

    /// Registers an output by name and a closure that closes its emitter.
    /// Called by the wiring layer for every `Emitter<T>` a component owns,
    /// so finalization can close outputs generically without knowing `T`.
    pub fn register_output<T>(&self, name: impl Into<String>, emitter: Emitter<T>)
    where
        T: Clone + Send + 'static,
    {
        self.outputs
            .lock()
            .unwrap()
            .push((name.into(), Box::new(move || emitter.close())));
    }

    /// Names of this element's registered inputs.
    #[must_use]
    pub fn input_names(&self) -> Vec<String> {
        self.input_names.lock().unwrap().clone()
    }

    /// Names of this element's registered outputs.
    #[must_use]
    pub fn output_names(&self) -> Vec<String> {
        self.outputs.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }

    /// The final originating time reported for this element, if any.
    #[must_use]
    pub fn final_originating_time(&self) -> Option<Instant> {
        *self.final_originating_time.lock().unwrap()
    }

    /// Records a candidate final originating time, keeping the smaller of
    /// any previously-set value and `t` (never decreasing a smaller,
    /// already-set finalize time per the pipeline `stop` contract).
    pub fn propose_final_originating_time(&self, t: Instant) {
        let mut guard = self.final_originating_time.lock().unwrap();
        *guard = Some(match *guard {
            Some(existing) if existing < t => existing,
            _ => t,
        });
    }

    /// Advances to the next lifecycle state, failing if `to` is not the
    /// legal successor of the current state.
    pub fn transition_to(&self, to: ElementState) -> ChronopipeResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.next_allowed() {
            Some(allowed) if allowed == to => {
                *state = to;
                Ok(())
            }
            _ => Err(ChronopipeError::InactiveState {
                operation: format!("transition to {}", to.name()),
                state: state.name().to_string(),
            }),
        }
    }

    /// Closes every registered output's emitter. Called once per element by
    /// the pipeline finalization algorithm.
    pub fn close_outputs(&self) {
        for (_, close) in self.outputs.lock().unwrap().iter() {
            close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions_follow_the_fixed_order() {
        let rt = Runtime::new();
        let el = PipelineElement::new(&rt, "comp", false);
        assert_eq!(el.state(), ElementState::Initial);
        el.transition_to(ElementState::Activated).unwrap();
        el.transition_to(ElementState::Deactivating).unwrap();
        el.transition_to(ElementState::Deactivated).unwrap();
        el.transition_to(ElementState::Finalized).unwrap();
        assert_eq!(el.state(), ElementState::Finalized);
    }

    #[test]
    fn skipping_a_state_is_rejected() {
        let rt = Runtime::new();
        let el = PipelineElement::new(&rt, "comp", false);
        let err = el.transition_to(ElementState::Deactivating).unwrap_err();
        assert!(matches!(err, ChronopipeError::InactiveState { .. }));
    }

    #[test]
    fn final_originating_time_never_increases_once_set() {
        let rt = Runtime::new();
        let el = PipelineElement::new(&rt, "comp", true);
        el.propose_final_originating_time(Instant::from_ticks(100));
        el.propose_final_originating_time(Instant::from_ticks(50));
        el.propose_final_originating_time(Instant::from_ticks(75));
        assert_eq!(el.final_originating_time(), Some(Instant::from_ticks(50)));
    }

    #[test]
    fn connector_elements_are_not_sources_but_carry_the_connector_kind() {
        let rt = Runtime::new();
        let el = PipelineElement::new_connector(&rt, "bridge-in");
        assert!(!el.is_source());
        assert_eq!(el.kind(), ElementKind::Connector);
    }

    #[test]
    fn close_outputs_closes_every_registered_emitter() {
        let rt = Runtime::new();
        let el = PipelineElement::new(&rt, "comp", false);
        let emitter: Emitter<i32> = Emitter::new(0, "out", el.id());
        el.register_output("out", emitter.clone());
        assert!(!emitter.is_closed());
        el.close_outputs();
        assert!(emitter.is_closed());
    }
}
