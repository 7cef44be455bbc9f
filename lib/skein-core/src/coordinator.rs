//! Exclusive/concurrent message coordination.
//!
//! A [`Coordinator`] owns up to three receivers, one per lane, and decides when each lane's messages may run:
//!
//! - concurrent messages run in parallel with each other, on the scheduler's pool
//! - an exclusive message runs alone: once one is queued, no new concurrent message starts, and it runs as soon as
//!   every active message has returned
//! - a teardown message runs once, last, after every active message has returned
//!
//! Once in exclusive mode, queued exclusive messages keep priority over queued concurrent ones, so that a burst of
//! exclusive messages does not switch modes back and forth. When a teardown is requested, messages still queued on
//! the other lanes are discarded, and anything posted afterwards is ignored.
use std::{
    collections::VecDeque,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use skein_error::panic_message;
use tracing::{debug, error, trace, warn};

use crate::{Message, Port, Receiver, Scheduler, SchedulerError};

type ExclusiveHandler = Box<dyn FnMut(Message) + Send>;
type ConcurrentHandler = Box<dyn Fn(Message) + Send + Sync>;
type TeardownHandler = Box<dyn FnOnce(Message) + Send>;

/// What a coordinator currently lets through.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CoordinationMode {
    /// Concurrent messages run in parallel.
    Concurrent,

    /// Exclusive messages run one at a time, with nothing else active.
    Exclusive,

    /// A teardown was requested. It runs once nothing else is active.
    TearingDown,

    /// The teardown ran. Nothing runs anymore.
    Complete,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Lane {
    Exclusive,
    Concurrent,
    Teardown,
}

struct State {
    mode: CoordinationMode,
    active: usize,
    exclusive: VecDeque<Message>,
    concurrent: VecDeque<Message>,
    teardown: Option<Message>,
}

impl State {
    fn discard_queued(&mut self) -> usize {
        let discarded = self.exclusive.len() + self.concurrent.len();
        self.exclusive.clear();
        self.concurrent.clear();
        discarded
    }
}

struct Inner {
    scheduler: Scheduler,
    state: Mutex<State>,
    exclusive: Option<Mutex<ExclusiveHandler>>,
    concurrent: Option<ConcurrentHandler>,
    teardown: Mutex<Option<TeardownHandler>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accept(self: &Arc<Self>, lane: Lane, message: Message) {
        let mut state = self.state();
        match (state.mode, lane) {
            (CoordinationMode::Complete, _) => {
                trace!(?lane, what = message.what(), "Coordinator complete. Ignoring message.");
                return;
            }
            (CoordinationMode::TearingDown, _) => {
                trace!(?lane, what = message.what(), "Coordinator tearing down. Ignoring message.");
                return;
            }
            (_, Lane::Teardown) => {
                state.mode = CoordinationMode::TearingDown;
                state.teardown = Some(message);
                let discarded = state.discard_queued();
                debug!(active = state.active, discarded, "Coordinator teardown requested.");
            }
            (_, Lane::Exclusive) => state.exclusive.push_back(message),
            (_, Lane::Concurrent) => state.concurrent.push_back(message),
        }
        self.pump(&mut state);
    }

    /// Starts every message the current mode allows.
    fn pump(self: &Arc<Self>, state: &mut State) {
        loop {
            match state.mode {
                CoordinationMode::Complete => return,
                CoordinationMode::TearingDown => {
                    if state.active == 0 {
                        if let Some(message) = state.teardown.take() {
                            self.start(Lane::Teardown, message, state);
                        }
                    }
                    return;
                }
                CoordinationMode::Concurrent => {
                    if !state.exclusive.is_empty() {
                        if state.active > 0 {
                            return;
                        }
                        trace!("Coordinator switching to exclusive mode.");
                        state.mode = CoordinationMode::Exclusive;
                        continue;
                    }
                    while let Some(message) = state.concurrent.pop_front() {
                        self.start(Lane::Concurrent, message, state);
                    }
                    return;
                }
                CoordinationMode::Exclusive => {
                    if state.active > 0 {
                        return;
                    }
                    if let Some(message) = state.exclusive.pop_front() {
                        self.start(Lane::Exclusive, message, state);
                        return;
                    }
                    if state.concurrent.is_empty() {
                        return;
                    }
                    trace!("Coordinator switching to concurrent mode.");
                    state.mode = CoordinationMode::Concurrent;
                }
            }
        }
    }

    fn start(self: &Arc<Self>, lane: Lane, message: Message, state: &mut State) {
        state.active += 1;
        let inner = Arc::clone(self);
        match self.scheduler.queue(move || inner.run(lane, message)) {
            Ok(()) => {}
            Err(e @ SchedulerError::ShutDown) => {
                warn!(?lane, error = %e, "Dropping coordinated message.");
                state.active -= 1;
                if lane == Lane::Teardown {
                    state.mode = CoordinationMode::Complete;
                }
            }
            Err(e) => warn!(?lane, error = %e, "Coordinated message is queued, but the pool has no thread to run it."),
        }
    }

    fn run(self: &Arc<Self>, lane: Lane, message: Message) {
        let what = message.what();
        let outcome = catch_unwind(AssertUnwindSafe(|| match lane {
            Lane::Exclusive => {
                if let Some(handler) = &self.exclusive {
                    let mut handler = handler.lock().unwrap_or_else(PoisonError::into_inner);
                    (*handler)(message);
                }
            }
            Lane::Concurrent => {
                if let Some(handler) = &self.concurrent {
                    handler(message);
                }
            }
            Lane::Teardown => {
                let handler = self.teardown.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(handler) = handler {
                    handler(message);
                }
            }
        }));
        if let Err(payload) = outcome {
            error!(?lane, what, error = %panic_message(payload.as_ref()), "Coordinated handler panicked.");
        }

        let mut state = self.state();
        state.active -= 1;
        if lane == Lane::Teardown {
            state.mode = CoordinationMode::Complete;
            debug!("Coordinator complete.");
        }
        self.pump(&mut state);
    }
}

/// Builder for [`Coordinator`].
#[derive(Default)]
pub struct CoordinatorBuilder {
    scheduler: Option<Scheduler>,
    exclusive: Option<(Port, ExclusiveHandler)>,
    concurrent: Option<(Port, ConcurrentHandler)>,
    teardown: Option<(Port, TeardownHandler)>,
}

impl CoordinatorBuilder {
    /// Sets the scheduler that runs the handlers.
    ///
    /// Defaults to [`Scheduler::global`].
    pub fn scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Handles messages posted to `port` one at a time, with no other message active.
    pub fn exclusive<F>(mut self, port: Port, handler: F) -> Self
    where
        F: FnMut(Message) + Send + 'static,
    {
        self.exclusive = Some((port, Box::new(handler)));
        self
    }

    /// Handles messages posted to `port` in parallel with each other.
    pub fn concurrent<F>(mut self, port: Port, handler: F) -> Self
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.concurrent = Some((port, Box::new(handler)));
        self
    }

    /// Handles the first message posted to `port` last, once nothing else is active, and then stops coordinating.
    pub fn teardown<F>(mut self, port: Port, handler: F) -> Self
    where
        F: FnOnce(Message) + Send + 'static,
    {
        self.teardown = Some((port, Box::new(handler)));
        self
    }

    /// Builds the coordinator, binding a receiver to every configured port.
    ///
    /// # Panics
    ///
    /// Panics if a live receiver is already bound to one of the ports.
    pub fn build(self) -> Coordinator {
        let scheduler = self.scheduler.unwrap_or_else(Scheduler::global);
        let (exclusive_port, exclusive) = split(self.exclusive);
        let (concurrent_port, concurrent) = split(self.concurrent);
        let (teardown_port, teardown) = split(self.teardown);

        let inner = Arc::new(Inner {
            scheduler: scheduler.clone(),
            state: Mutex::new(State {
                mode: CoordinationMode::Concurrent,
                active: 0,
                exclusive: VecDeque::new(),
                concurrent: VecDeque::new(),
                teardown: None,
            }),
            exclusive: exclusive.map(Mutex::new),
            concurrent,
            teardown: Mutex::new(teardown),
        });

        let receivers = [
            (exclusive_port, Lane::Exclusive),
            (concurrent_port, Lane::Concurrent),
            (teardown_port, Lane::Teardown),
        ]
        .into_iter()
        .filter_map(|(port, lane)| {
            let port = port?;
            let inner = Arc::clone(&inner);
            Some(Receiver::shared(port, &scheduler, move |message| inner.accept(lane, message)))
        })
        .collect::<Vec<_>>();

        debug!(receivers = receivers.len(), "Coordinator created.");
        Coordinator { inner, receivers }
    }
}

fn split<H>(lane: Option<(Port, H)>) -> (Option<Port>, Option<H>) {
    match lane {
        Some((port, handler)) => (Some(port), Some(handler)),
        None => (None, None),
    }
}

/// Coordinates exclusive, concurrent and teardown messages posted to separate ports.
///
/// Dropping the coordinator unbinds its ports. Messages already accepted still run.
pub struct Coordinator {
    inner: Arc<Inner>,
    receivers: Vec<Receiver>,
}

impl Coordinator {
    /// Creates a builder for a coordinator.
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::default()
    }

    /// Returns the current mode.
    pub fn mode(&self) -> CoordinationMode {
        self.inner.state().mode
    }

    /// Returns the number of handlers currently running.
    pub fn active(&self) -> usize {
        self.inner.state().active
    }

    /// Returns the number of accepted messages waiting for their turn.
    pub fn queued(&self) -> usize {
        let state = self.inner.state();
        state.exclusive.len() + state.concurrent.len() + usize::from(state.teardown.is_some())
    }

    /// Returns `true` once the teardown handler has run.
    pub fn is_complete(&self) -> bool {
        self.mode() == CoordinationMode::Complete
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("Coordinator")
            .field("mode", &state.mode)
            .field("active", &state.active)
            .field("receivers", &self.receivers.len())
            .finish()
    }
}
