//! Pipeline: the element container and collective lifecycle driver.
//!
//! A pipeline registers elements by name, wires adjacent pairs with
//! auto-created ports of the kind the upstream element declares, and fans
//! lifecycle operations (run/pause/resume/stop/terminate) out to every
//! linked element in registration order. Status flows back over the
//! pipeline's event bus, never through the data path.
//!
//! # Example
//!
//! ```rust,ignore
//! use cascade::pipeline::Pipeline;
//!
//! let pipeline = Pipeline::new("player");
//! pipeline.register(source)?;
//! pipeline.register(decoder)?;
//! pipeline.register(sink)?;
//! pipeline.link(&["source", "decoder", "sink"])?;
//! pipeline.set_listener();
//! pipeline.run()?;
//! while let Some(msg) = pipeline.recv_event(Duration::from_secs(1)) {
//!     println!("{}: {}", msg.source, msg.event);
//! }
//! ```

use crate::element::{Element, ElementState};
use crate::error::{Error, Result};
use crate::event::{self, ElementEvent, EventListener, EventMessage, EventPublisher};
use crate::port::Port;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Collective state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// Elements registered, nothing running.
    Idle,
    /// All linked elements have been started.
    Running,
    /// A collective pause was requested.
    Paused,
    /// A collective stop completed (or was requested and waited out).
    Stopped,
    /// An element failed; the graph was terminated.
    Error,
}

struct Entry {
    element: Element,
    linked: bool,
}

struct Body {
    entries: Vec<Entry>,
    auto_ports: Vec<Port>,
    state: PipelineState,
}

/// An ordered container of elements plus the bus they report through.
pub struct Pipeline {
    name: Arc<str>,
    body: Mutex<Body>,
    publisher: EventPublisher,
    listener: EventListener,
}

impl Pipeline {
    /// Default event bus capacity.
    pub const DEFAULT_BUS_CAPACITY: usize = 64;

    /// Create an empty pipeline.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_bus_capacity(name, Self::DEFAULT_BUS_CAPACITY)
    }

    /// Create an empty pipeline with an explicit bus capacity.
    pub fn with_bus_capacity(name: impl Into<String>, capacity: usize) -> Self {
        let (publisher, listener) = event::channel(capacity);
        Self {
            name: name.into().into(),
            body: Mutex::new(Body {
                entries: Vec::new(),
                auto_ports: Vec::new(),
                state: PipelineState::Idle,
            }),
            publisher,
            listener,
        }
    }

    /// The pipeline's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current collective state.
    pub fn state(&self) -> PipelineState {
        self.body.lock().unwrap().state
    }

    /// Register an element at the tail, unlinked. Registration order is
    /// the fan-out order for every collective operation.
    pub fn register(&self, element: Element) -> Result<()> {
        let mut body = self.body.lock().unwrap();
        if body.entries.iter().any(|e| e.element.name() == element.name()) {
            return Err(Error::Pipeline(format!(
                "element '{}' already registered in '{}'",
                element.name(),
                self.name
            )));
        }
        debug!(pipeline = %self.name, element = element.name(), "registered");
        body.entries.push(Entry {
            element,
            linked: false,
        });
        Ok(())
    }

    /// A handle to a registered element.
    pub fn element(&self, name: &str) -> Option<Element> {
        self.body
            .lock()
            .unwrap()
            .entries
            .iter()
            .find(|e| e.element.name() == name)
            .map(|e| e.element.clone())
    }

    /// Wire the named elements in order, auto-creating the inter-element
    /// port each adjacency needs.
    ///
    /// Fails fast if any name is unregistered or already linked. The port
    /// kind and sizing come from the upstream element's declared output;
    /// an upstream declaring an external output must already have one set
    /// (it is then shared with the downstream element and left alone at
    /// unlink). Linking a single element is a no-op wiring-wise.
    pub fn link(&self, names: &[&str]) -> Result<()> {
        let mut body = self.body.lock().unwrap();

        let mut indices = Vec::with_capacity(names.len());
        for name in names {
            let idx = body
                .entries
                .iter()
                .position(|e| e.element.name() == *name)
                .ok_or_else(|| Error::UnknownElement((*name).to_string()))?;
            if body.entries[idx].linked {
                return Err(Error::Pipeline(format!(
                    "element '{}' is already linked",
                    name
                )));
            }
            indices.push(idx);
        }

        for pair in indices.windows(2) {
            let upstream = body.entries[pair[0]].element.clone();
            let downstream = body.entries[pair[1]].element.clone();
            let port_name = format!("{}->{}", upstream.name(), downstream.name());

            match Port::from_spec(&port_name, &upstream.declared_output())? {
                Some(port) => {
                    debug!(pipeline = %self.name, port = %port_name, kind = ?port.kind(), "auto-created port");
                    upstream.set_internal_output(port.clone());
                    downstream.set_internal_input(port.clone());
                    body.auto_ports.push(port);
                }
                None => {
                    // Externally-owned output: reuse it as the downstream
                    // input, but do not take ownership.
                    let port = upstream.output_port().ok_or_else(|| {
                        Error::Pipeline(format!(
                            "element '{}' declares an external output but none is set",
                            upstream.name()
                        ))
                    })?;
                    downstream.set_external_input(port);
                }
            }
        }

        for idx in indices {
            body.entries[idx].linked = true;
        }
        info!(pipeline = %self.name, ?names, "linked");
        Ok(())
    }

    /// Tear down the wiring: auto-created ports are aborted and released
    /// exactly once, element port slots are cleared, and externally-owned
    /// (kept-context) ports are left untouched. Idempotent.
    pub fn unlink(&self) {
        let mut body = self.body.lock().unwrap();
        for port in body.auto_ports.drain(..) {
            port.abort();
        }
        for entry in body.entries.iter_mut() {
            if entry.linked {
                entry.element.clear_internal_ports();
                entry.linked = false;
            }
        }
        debug!(pipeline = %self.name, "unlinked");
    }

    /// Register the pipeline's bus endpoint with every linked element.
    pub fn set_listener(&self) {
        let body = self.body.lock().unwrap();
        for entry in body.entries.iter().filter(|e| e.linked) {
            entry
                .element
                .set_event_publisher(Some(self.publisher.clone()));
        }
    }

    /// Unregister the pipeline's bus endpoint from every linked element.
    pub fn remove_listener(&self) {
        let body = self.body.lock().unwrap();
        for entry in body.entries.iter().filter(|e| e.linked) {
            entry.element.set_event_publisher(None);
        }
    }

    /// Start every linked element, in registration order, then resume
    /// them all. A failure rolls the pipeline into `Error` and terminates
    /// the whole graph rather than leaving it half-running.
    pub fn run(&self) -> Result<()> {
        let (elements, ports) = {
            let body = self.body.lock().unwrap();
            (self.linked_elements(&body), body.auto_ports.clone())
        };

        // Rewinding: clear data and abort/done flags left by a previous
        // stop before the workers come back up.
        for port in &ports {
            port.reset();
        }

        for element in &elements {
            if let Err(e) = element.run() {
                warn!(pipeline = %self.name, element = element.name(), error = %e, "run failed");
                self.fail(format!("element '{}' failed to start: {}", element.name(), e));
                return Err(Error::Pipeline(format!(
                    "pipeline '{}' failed to start",
                    self.name
                )));
            }
        }
        for element in &elements {
            element.resume();
        }

        self.set_state(PipelineState::Running);
        Ok(())
    }

    /// Request a cooperative pause of every linked element.
    pub fn pause(&self) {
        let elements = {
            let body = self.body.lock().unwrap();
            self.linked_elements(&body)
        };
        for element in &elements {
            element.pause();
        }
        self.set_state(PipelineState::Paused);
    }

    /// Resume every linked element after a pause.
    pub fn resume(&self) {
        let elements = {
            let body = self.body.lock().unwrap();
            self.linked_elements(&body)
        };
        for element in &elements {
            element.resume();
        }
        self.set_state(PipelineState::Running);
    }

    /// Request every linked element to stop. Ports are aborted so stages
    /// stuck in long waits unblock; follow with [`Pipeline::wait_for_stop`].
    pub fn stop(&self) {
        let elements = {
            let body = self.body.lock().unwrap();
            self.linked_elements(&body)
        };
        for element in &elements {
            element.stop();
        }
    }

    /// Wait (bounded, per element) until every linked element reaches a
    /// terminal state.
    ///
    /// One element overrunning `timeout` is logged and does not abort the
    /// wait for the rest; `Err(Timeout)` is returned at the end if any
    /// element failed to stop in time.
    pub fn wait_for_stop(&self, timeout: Duration) -> Result<()> {
        let elements = {
            let body = self.body.lock().unwrap();
            self.linked_elements(&body)
        };

        let mut stragglers = 0;
        for element in &elements {
            match element.wait_for_state(|s| s.is_terminal(), Some(timeout)) {
                Ok(state) => {
                    debug!(pipeline = %self.name, element = element.name(), ?state, "stopped")
                }
                Err(_) => {
                    warn!(pipeline = %self.name, element = element.name(), "did not stop in time");
                    stragglers += 1;
                }
            }
        }

        if self.state() != PipelineState::Error {
            self.set_state(PipelineState::Stopped);
        }
        if stragglers > 0 {
            return Err(Error::Timeout);
        }
        Ok(())
    }

    /// Terminate every linked element (ends and joins their workers).
    pub fn terminate(&self) {
        let elements = {
            let body = self.body.lock().unwrap();
            self.linked_elements(&body)
        };
        for element in &elements {
            if let Err(e) = element.terminate() {
                warn!(pipeline = %self.name, element = element.name(), error = %e, "terminate failed");
            }
        }
        if self.state() != PipelineState::Error {
            self.set_state(PipelineState::Stopped);
        }
    }

    /// Receive the next bus report, bounded by `timeout`.
    ///
    /// This is the application's listen call. A fatal element failure
    /// observed here rolls the pipeline into `Error` and terminates the
    /// graph before the report is handed back.
    pub fn recv_event(&self, timeout: Duration) -> Option<EventMessage> {
        let msg = self.listener.recv(timeout)?;
        if matches!(msg.event, ElementEvent::StateChanged(ElementState::Error))
            && self.is_linked(&msg.source)
            && self.state() != PipelineState::Error
        {
            warn!(pipeline = %self.name, element = %msg.source, "element failed, terminating pipeline");
            self.fail(format!("element '{}' reported an error", msg.source));
        }
        Some(msg)
    }

    /// Take the next bus report without blocking.
    pub fn try_recv_event(&self) -> Option<EventMessage> {
        self.listener.try_recv()
    }

    fn linked_elements(&self, body: &Body) -> Vec<Element> {
        body.entries
            .iter()
            .filter(|e| e.linked)
            .map(|e| e.element.clone())
            .collect()
    }

    fn is_linked(&self, name: &str) -> bool {
        let body = self.body.lock().unwrap();
        body.entries
            .iter()
            .any(|e| e.linked && e.element.name() == name)
    }

    fn set_state(&self, state: PipelineState) {
        {
            let mut body = self.body.lock().unwrap();
            if body.state == state {
                return;
            }
            body.state = state;
        }
        debug!(pipeline = %self.name, ?state, "pipeline state changed");
        self.publisher
            .notify(&self.name, ElementEvent::PipelineState(state));
    }

    fn fail(&self, reason: String) {
        warn!(pipeline = %self.name, reason = %reason, "pipeline error");
        self.set_state(PipelineState::Error);
        let elements = {
            let body = self.body.lock().unwrap();
            self.linked_elements(&body)
        };
        for element in &elements {
            if let Err(e) = element.terminate() {
                warn!(pipeline = %self.name, element = element.name(), error = %e, "terminate failed");
            }
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = self.body.lock().unwrap();
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("elements", &body.entries.len())
            .field("state", &body.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{ProcCtx, Processor, Progress};
    use crate::port::PortSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ByteSource {
        remaining: usize,
    }

    impl Processor for ByteSource {
        fn process(&mut self, ctx: &mut ProcCtx) -> Result<Progress> {
            if self.remaining == 0 {
                return Ok(Progress::Finished);
            }
            ctx.write(&[0u8; 8])?;
            self.remaining -= 1;
            Ok(Progress::Advanced)
        }

        fn output_spec(&self) -> PortSpec {
            PortSpec::Ring { capacity: 64 }
        }
    }

    struct ByteSink {
        consumed: Arc<AtomicUsize>,
    }

    impl Processor for ByteSink {
        fn process(&mut self, ctx: &mut ProcCtx) -> Result<Progress> {
            let mut buf = [0u8; 32];
            let n = ctx.read(&mut buf)?;
            if n == 0 {
                return Ok(Progress::Finished);
            }
            self.consumed.fetch_add(n, Ordering::Relaxed);
            Ok(Progress::Advanced)
        }
    }

    fn two_stage(blocks: usize) -> (Pipeline, Arc<AtomicUsize>) {
        let pipeline = Pipeline::new("test");
        let consumed = Arc::new(AtomicUsize::new(0));
        pipeline
            .register(Element::new("src", ByteSource { remaining: blocks }))
            .unwrap();
        pipeline
            .register(Element::new(
                "sink",
                ByteSink {
                    consumed: consumed.clone(),
                },
            ))
            .unwrap();
        (pipeline, consumed)
    }

    #[test]
    fn test_register_rejects_duplicate() {
        let (pipeline, _) = two_stage(1);
        let dup = Element::new("src", ByteSource { remaining: 1 });
        assert!(pipeline.register(dup).is_err());
    }

    #[test]
    fn test_link_fails_fast_on_unknown_name() {
        let (pipeline, _) = two_stage(1);
        let err = pipeline.link(&["src", "nope"]).unwrap_err();
        assert!(matches!(err, Error::UnknownElement(name) if name == "nope"));
        // Nothing got linked.
        assert!(pipeline.element("src").unwrap().output_port().is_none());
    }

    #[test]
    fn test_link_creates_declared_port() {
        let (pipeline, _) = two_stage(1);
        pipeline.link(&["src", "sink"]).unwrap();

        let out = pipeline.element("src").unwrap().output_port().unwrap();
        assert_eq!(out.name(), "src->sink");
        let input = pipeline.element("sink").unwrap().input_port().unwrap();
        assert_eq!(input.name(), "src->sink");
    }

    #[test]
    fn test_single_element_link_is_noop() {
        let (pipeline, _) = two_stage(1);
        pipeline.link(&["src"]).unwrap();
        assert!(pipeline.element("src").unwrap().output_port().is_none());
    }

    #[test]
    fn test_unlink_idempotent() {
        let (pipeline, _) = two_stage(1);
        pipeline.link(&["src", "sink"]).unwrap();

        pipeline.unlink();
        assert!(pipeline.element("src").unwrap().output_port().is_none());
        assert!(pipeline.element("sink").unwrap().input_port().is_none());

        // Second unlink observes the same state, releases nothing twice.
        pipeline.unlink();
        assert!(pipeline.element("src").unwrap().output_port().is_none());

        // The elements can be linked again afterwards.
        pipeline.link(&["src", "sink"]).unwrap();
        assert!(pipeline.element("src").unwrap().output_port().is_some());
    }

    #[test]
    fn test_run_to_finish() {
        let (pipeline, consumed) = two_stage(10);
        pipeline.link(&["src", "sink"]).unwrap();
        pipeline.set_listener();
        pipeline.run().unwrap();

        pipeline
            .element("sink")
            .unwrap()
            .wait_for_state(
                |s| s == ElementState::Finished,
                Some(Duration::from_secs(5)),
            )
            .unwrap();
        assert_eq!(consumed.load(Ordering::Relaxed), 80);
        pipeline.terminate();
    }

    #[test]
    fn test_stop_and_wait_bounded() {
        let (pipeline, _) = two_stage(usize::MAX);
        pipeline.link(&["src", "sink"]).unwrap();
        pipeline.run().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        pipeline.stop();
        pipeline.wait_for_stop(Duration::from_secs(5)).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        pipeline.terminate();
    }

    #[test]
    fn test_restart_after_stop() {
        let (pipeline, consumed) = two_stage(usize::MAX);
        pipeline.link(&["src", "sink"]).unwrap();
        pipeline.run().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        pipeline.stop();
        pipeline.wait_for_stop(Duration::from_secs(5)).unwrap();

        let before = consumed.load(Ordering::Relaxed);
        pipeline.run().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(consumed.load(Ordering::Relaxed) > before);

        pipeline.stop();
        pipeline.wait_for_stop(Duration::from_secs(5)).unwrap();
        pipeline.terminate();
    }

    #[test]
    fn test_element_error_fails_pipeline() {
        struct Exploding;
        impl Processor for Exploding {
            fn process(&mut self, _ctx: &mut ProcCtx) -> Result<Progress> {
                Err(Error::Element("boom".into()))
            }
            fn output_spec(&self) -> PortSpec {
                PortSpec::Ring { capacity: 16 }
            }
        }

        let pipeline = Pipeline::new("failing");
        let consumed = Arc::new(AtomicUsize::new(0));
        pipeline.register(Element::new("bad", Exploding)).unwrap();
        pipeline
            .register(Element::new("sink", ByteSink { consumed }))
            .unwrap();
        pipeline.link(&["bad", "sink"]).unwrap();
        pipeline.set_listener();
        pipeline.run().unwrap();

        // Drain events until the error surfaces; recv_event rolls the
        // pipeline into Error and terminates the graph.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pipeline.state() != PipelineState::Error {
            assert!(std::time::Instant::now() < deadline, "error never surfaced");
            pipeline.recv_event(Duration::from_millis(100));
        }
        assert_eq!(pipeline.state(), PipelineState::Error);
    }
}
