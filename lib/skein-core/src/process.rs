//! Processes.
//!
//! A [`Process`] is a task that consumes a stream of work items instead of running once. Items are posted to a work
//! port, distinct from the task's control port, and handed one at a time to the process function. The process
//! finishes once end-of-stream was signalled and every item, including the ones the function added through
//! [`recurse`][Process::recurse], has been processed.
//!
//! Processes can be chained with [`connect`]: the head forwards items to its successor and signals end-of-stream to it
//! once its own queue drains. The head then stays executing until the successor terminates, so a finished head
//! implies a terminated tail. Cancellation anywhere in the chain reaches every other process of the chain.
use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak,
    },
    time::{Duration, Instant},
};

use skein_error::{from_panic, GenericError};
use snafu::{ensure, Snafu};
use tracing::{debug, trace, warn};

use crate::{
    progress::{Snapshot, WatchMode},
    task::{Kind, Slot, TaskBuilder, TaskInner},
    ExclusiveThread, Message, Port, Receiver, Scheduler, Task, TaskError, TaskId, TaskState, TeardownMode, Value,
};

mod code {
    use crate::task::control::PROCESS_BASE;

    pub const NO_MORE_WORK: i32 = PROCESS_BASE;
    pub const WORK_DRAINED: i32 = PROCESS_BASE + 1;
    pub const PROGRESS_TICK: i32 = PROCESS_BASE + 2;
    pub const SET_TITLE: i32 = PROCESS_BASE + 3;
    pub const PROCESS_FAILED: i32 = PROCESS_BASE + 4;
}

static CONNECT_LOCK: Mutex<()> = Mutex::new(());

/// Connect error.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConnectError {
    /// The head and the tail are the same process.
    #[snafu(display("cannot connect a process to itself"))]
    SelfLoop,

    /// The tail is upstream of the head.
    #[snafu(display("connecting these processes would create a cycle"))]
    Cycle,

    /// The head already has a successor.
    #[snafu(display("head process is already connected to a successor"))]
    HeadHasSuccessor,

    /// The tail already has a predecessor.
    #[snafu(display("tail process is already connected to a predecessor"))]
    TailHasPredecessor,

    /// The head was already run.
    #[snafu(display("head process is already running"))]
    AlreadyRunning,
}

/// Enqueue error.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum EnqueueError {
    /// End-of-stream was already signalled.
    #[snafu(display("process {} no longer accepts work: end of stream was signalled", id))]
    EndOfStream {
        /// Identifier of the process.
        id: TaskId,
    },

    /// The process already reached a terminal state.
    #[snafu(display("process {} no longer accepts work: it has terminated", id))]
    Terminated {
        /// Identifier of the process.
        id: TaskId,
    },
}

/// Function invoked for each work item of a process.
///
/// Implemented for any `FnMut(&Process, Message) -> Result<(), GenericError> + Send` closure.
pub trait ProcessFn: Send + 'static {
    /// Processes one work item.
    ///
    /// # Errors
    ///
    /// An error finishes the process with that error. Items still queued are discarded, and upstream processes are
    /// canceled.
    fn process(&mut self, process: &Process, item: Message) -> Result<(), GenericError>;
}

impl<F> ProcessFn for F
where
    F: FnMut(&Process, Message) -> Result<(), GenericError> + Send + 'static,
{
    fn process(&mut self, process: &Process, item: Message) -> Result<(), GenericError> {
        self(process, item)
    }
}

#[derive(Default)]
struct Links {
    successor: Option<Process>,
    predecessor: Option<Weak<TaskInner>>,
}

pub(crate) struct ProcessCore {
    func: Mutex<Option<Box<dyn ProcessFn>>>,
    work: Port,
    work_receiver: OnceLock<Receiver>,
    work_thread: Option<ExclusiveThread>,
    total: AtomicUsize,
    processed: AtomicUsize,
    end_of_stream: AtomicBool,
    // Own queue drained, waiting on the successor to terminate.
    drained: AtomicBool,
    failed: AtomicBool,
    // f32 bits, NaN while unset.
    fraction: AtomicU32,
    title: Mutex<String>,
    links: Mutex<Links>,
    progress_interval: Duration,
    last_tick: Mutex<Option<Instant>>,
}

impl ProcessCore {
    fn links(&self) -> MutexGuard<'_, Links> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builder for [`Process`].
#[derive(Default)]
pub struct ProcessBuilder {
    task: TaskBuilder,
    title: Option<String>,
    work_thread: Option<ExclusiveThread>,
    progress_interval: Option<Duration>,
}

impl ProcessBuilder {
    /// Sets the title of the process, reported to progress watchers.
    pub fn title<S: Into<String>>(mut self, title: S) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Sets the scheduler the process runs on.
    ///
    /// Defaults to [`Scheduler::global`].
    pub fn scheduler(mut self, scheduler: Scheduler) -> Self {
        self.task = self.task.scheduler(scheduler);
        self
    }

    /// Processes work items on the given exclusive thread instead of the shared pool.
    pub fn work_thread(mut self, thread: ExclusiveThread) -> Self {
        self.work_thread = Some(thread);
        self
    }

    /// Sets the minimum interval between two non-terminal progress events.
    ///
    /// Defaults to the `progress_interval_ms` of the scheduler configuration.
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = Some(interval);
        self
    }

    /// Builds a process that hands every work item to `func`.
    pub fn build<F: ProcessFn>(self, func: F) -> Process {
        let progress_interval = self
            .progress_interval
            .unwrap_or_else(|| self.task.scheduler_or_global().config().progress_interval());
        let title = self.title.unwrap_or_default();

        let mut task = self.task;
        if !title.is_empty() {
            task = task.name(title.clone());
        }

        let core = ProcessCore {
            func: Mutex::new(Some(Box::new(func))),
            work: Port::new(),
            work_receiver: OnceLock::new(),
            work_thread: self.work_thread,
            total: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
            end_of_stream: AtomicBool::new(false),
            drained: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            fraction: AtomicU32::new(f32::NAN.to_bits()),
            title: Mutex::new(title),
            links: Mutex::new(Links::default()),
            progress_interval,
            last_tick: Mutex::new(None),
        };

        Process {
            task: task.build_kind(Kind::Process(core)),
        }
    }
}

/// A task that processes a stream of work items.
///
/// `Process` is a cheap, cloneable handle.
#[derive(Clone)]
pub struct Process {
    task: Task,
}

impl Process {
    /// Creates a process on the default scheduler.
    pub fn new<F: ProcessFn>(func: F) -> Process {
        Self::builder().build(func)
    }

    /// Creates a builder for a process.
    pub fn builder() -> ProcessBuilder {
        ProcessBuilder::default()
    }

    pub(crate) fn wrap(task: Task) -> Process {
        Process { task }
    }

    fn core(&self) -> &ProcessCore {
        match &self.task.inner.kind {
            Kind::Process(core) => core,
            _ => unreachable!("process handle over a plain task"),
        }
    }

    /// Returns the underlying task.
    pub fn as_task(&self) -> &Task {
        &self.task
    }

    /// Returns the unique identifier of this process.
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    /// Returns the state of this process.
    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    /// Runs the process, along with every successor that was not run yet.
    ///
    /// # Panics
    ///
    /// Panics if the process already reached a terminal state.
    pub fn run(&self) {
        self.task.run();

        let mut next = self.successor();
        while let Some(successor) = next {
            if successor.task.request_run() {
                debug!(process = %self.id(), successor = %successor.id(), "Started successor process.");
            }
            next = successor.successor();
        }
    }

    /// Cancels the process.
    ///
    /// Cancellation propagates to every process connected upstream and downstream.
    pub fn cancel(&self) {
        self.task.cancel();
    }

    /// Returns `true` if the process was asked to cancel, or has been canceled.
    pub fn is_canceled(&self) -> bool {
        self.task.is_canceled()
    }

    /// Returns `true` if this process finished, and every process downstream of it has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        if !self.task.is_finished() {
            return false;
        }
        match self.successor() {
            Some(successor) => successor.is_finished() || successor.state() == TaskState::Canceled,
            None => true,
        }
    }

    /// Returns `true` if the process reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.task.is_terminal()
    }

    /// Returns `true` if the process finished with an error.
    pub fn has_failed(&self) -> bool {
        self.task.has_failed()
    }

    /// Returns the error the process finished with, if any.
    pub fn error(&self) -> Option<TaskError> {
        self.task.error()
    }

    /// Enqueues a work item.
    ///
    /// # Errors
    ///
    /// If end-of-stream was signalled, or the process already terminated, an error is returned and the item is
    /// dropped.
    pub fn enqueue(&self, item: Message) -> Result<(), EnqueueError> {
        let core = self.core();
        if self.task.is_terminal() {
            warn!(process = %self.id(), "Rejected work item enqueued on a terminated process.");
            return Terminated { id: self.id() }.fail();
        }

        core.total.fetch_add(1, Ordering::SeqCst);
        if core.end_of_stream.load(Ordering::SeqCst) {
            core.total.fetch_sub(1, Ordering::SeqCst);
            // A drain check may have raced with the increment above.
            self.task.post(Message::new(code::WORK_DRAINED));
            warn!(process = %self.id(), "Rejected work item enqueued after end of stream.");
            return EndOfStream { id: self.id() }.fail();
        }

        core.work.post(item);
        Ok(())
    }

    /// Signals that no more work items will be enqueued.
    ///
    /// The process finishes once every queued item has been processed. Ignored for processes with a predecessor,
    /// which receive end-of-stream from it instead.
    pub fn no_more_work(&self) {
        if self.has_predecessor() {
            debug!(process = %self.id(), "Ignoring end of stream signalled on a connected process.");
            return;
        }
        self.signal_end_of_stream();
    }

    fn signal_end_of_stream(&self) {
        if !self.core().end_of_stream.swap(true, Ordering::SeqCst) {
            self.task.post(Message::new(code::NO_MORE_WORK));
        }
    }

    /// Forwards a work item to the successor of this process.
    ///
    /// Items forwarded to a terminated successor are dropped.
    ///
    /// # Panics
    ///
    /// Panics if the process has no successor.
    pub fn forward(&self, item: Message) {
        let Some(successor) = self.successor() else {
            panic!("process {} has no successor to forward to", self.id());
        };
        if successor.is_terminal() {
            trace!(process = %self.id(), successor = %successor.id(), "Dropping item forwarded to terminated successor.");
            return;
        }
        successor.push_item(item);
    }

    /// Enqueues a work item into this process's own queue.
    ///
    /// Unlike [`enqueue`][Self::enqueue], this is allowed after end-of-stream, and the process does not finish until
    /// the item has been processed.
    pub fn recurse(&self, item: Message) {
        if self.is_terminal() {
            trace!(process = %self.id(), "Dropping item recursed on terminated process.");
            return;
        }
        self.push_item(item);
    }

    fn push_item(&self, item: Message) {
        let core = self.core();
        core.total.fetch_add(1, Ordering::SeqCst);
        core.work.post(item);
    }

    /// Returns the number of items enqueued but not processed yet.
    pub fn queue_len(&self) -> usize {
        let core = self.core();
        core.total
            .load(Ordering::SeqCst)
            .saturating_sub(core.processed.load(Ordering::SeqCst))
    }

    /// Returns the number of items processed so far.
    pub fn processed_items(&self) -> usize {
        self.core().processed.load(Ordering::SeqCst)
    }

    /// Returns the number of items enqueued so far.
    pub fn total_items(&self) -> usize {
        self.core().total.load(Ordering::SeqCst)
    }

    /// Returns the title of the process.
    pub fn title(&self) -> String {
        self.core().title.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Sets the title of the process, and reports it to watchers.
    pub fn set_title<S: Into<String>>(&self, title: S) {
        let title = title.into();
        *self.core().title.lock().unwrap_or_else(PoisonError::into_inner) = title.clone();
        self.task.post(Message::with_data(code::SET_TITLE, title));
    }

    /// Reports the completed fraction, for processes whose item counts are not meaningful.
    ///
    /// The value is clamped to `[0, 1]`.
    pub fn report_fraction(&self, fraction: f32) {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        self.core().fraction.store(fraction.to_bits(), Ordering::SeqCst);
        self.maybe_tick();
    }

    /// Returns `true` if the process has a successor.
    pub fn has_successor(&self) -> bool {
        self.core().links().successor.is_some()
    }

    /// Returns `true` if the process has a predecessor.
    pub fn has_predecessor(&self) -> bool {
        self.core().links().predecessor.is_some()
    }

    /// Returns the successor of this process.
    pub fn successor(&self) -> Option<Process> {
        self.core().links().successor.clone()
    }

    /// Returns the predecessor of this process, if it is still alive.
    pub fn predecessor(&self) -> Option<Process> {
        let inner = self.core().links().predecessor.as_ref()?.upgrade()?;
        Some(Process::wrap(Task { inner }))
    }

    /// Registers a progress watcher. See [`Task::add_watch`].
    pub fn add_watch(&self, port: &Port, mode: WatchMode) {
        self.task.add_watch(port, mode);
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        let core = self.core();
        let fraction = f32::from_bits(core.fraction.load(Ordering::SeqCst));
        Snapshot {
            processed: core.processed.load(Ordering::SeqCst),
            total: core.total.load(Ordering::SeqCst),
            fraction: (!fraction.is_nan()).then_some(fraction),
        }
    }

    /// Binds the work receiver. Called once the process starts executing.
    pub(crate) fn start(&self) {
        let core = self.core();
        let weak = Arc::downgrade(&self.task.inner);
        let handler = move |item: Message| {
            if let Some(inner) = weak.upgrade() {
                Process::wrap(Task { inner }).run_item(item);
            }
        };

        let receiver = match &core.work_thread {
            Some(thread) => Receiver::on_thread(core.work.clone(), thread, handler),
            None => Receiver::shared(core.work.clone(), self.task.scheduler(), handler),
        };
        let _ = core.work_receiver.set(receiver.with_teardown(TeardownMode::Discard));

        self.task.broadcast_status();
        self.check_drained();
    }

    fn run_item(&self, item: Message) {
        let core = self.core();
        if !self.task.is_terminal() && !self.task.is_canceled() && !core.failed.load(Ordering::SeqCst) {
            let outcome = {
                let mut func = core.func.lock().unwrap_or_else(PoisonError::into_inner);
                match func.as_mut() {
                    Some(func) => catch_unwind(AssertUnwindSafe(|| func.process(self, item)))
                        .unwrap_or_else(|payload| Err(from_panic("process function", payload))),
                    None => Ok(()),
                }
            };

            if let Err(e) = outcome {
                if !core.failed.swap(true, Ordering::SeqCst) {
                    self.task.post(Slot::message(code::PROCESS_FAILED, e));
                }
            }
        }

        let processed = core.processed.fetch_add(1, Ordering::SeqCst) + 1;
        self.task.scheduler().metrics().items_processed.increment(1);

        if core.end_of_stream.load(Ordering::SeqCst) && processed == core.total.load(Ordering::SeqCst) {
            self.task.post(Message::new(code::WORK_DRAINED));
        } else {
            self.maybe_tick();
        }
    }

    fn maybe_tick(&self) {
        let core = self.core();
        let now = Instant::now();
        let mut last_tick = core.last_tick.lock().unwrap_or_else(PoisonError::into_inner);
        let due = last_tick.map_or(true, |last| now.duration_since(last) >= core.progress_interval);
        if due {
            *last_tick = Some(now);
            drop(last_tick);
            self.task.post(Message::new(code::PROGRESS_TICK));
        }
    }

    fn check_drained(&self) {
        let core = self.core();
        if self.task.state() != TaskState::Executing
            || core.drained.load(Ordering::SeqCst)
            || !core.end_of_stream.load(Ordering::SeqCst)
            || core.processed.load(Ordering::SeqCst) != core.total.load(Ordering::SeqCst)
        {
            return;
        }

        match self.successor() {
            Some(successor) if !successor.is_terminal() => {
                core.drained.store(true, Ordering::SeqCst);
                debug!(process = %self.id(), successor = %successor.id(), "Process drained. Waiting on successor.");
                successor.signal_end_of_stream();
                self.close_work();
                self.task.observe(&successor.task);
            }
            _ => self.task.transition_finished(),
        }
    }

    /// Returns `true` if `id` identifies the successor of this process.
    pub(crate) fn is_successor(&self, id: TaskId) -> bool {
        self.core().links().successor.as_ref().is_some_and(|successor| successor.id() == id)
    }

    /// Called on the control receiver once the successor of a drained process reached a terminal state.
    pub(crate) fn on_successor_terminated(&self, canceled: bool) {
        if !self.core().drained.load(Ordering::SeqCst) {
            return;
        }
        if canceled {
            self.task.transition_canceled();
        } else {
            self.task.transition_finished();
        }
    }

    /// Applies a process-specific control message. Runs on the control receiver.
    pub(crate) fn handle_control(&self, message: Message) {
        match message.what() {
            code::NO_MORE_WORK | code::WORK_DRAINED => self.check_drained(),
            code::PROGRESS_TICK => self.task.broadcast_status(),
            code::SET_TITLE => {
                if let Some(Value::String(title)) = message.get_data() {
                    self.task.broadcast_title(title);
                }
            }
            code::PROCESS_FAILED => {
                if self.task.is_terminal() {
                    return;
                }
                if let Some(error) = Slot::<GenericError>::take(&message) {
                    self.task.record_error(TaskError::new(error));
                }
                self.task.transition_finished();
                if let Some(predecessor) = self.predecessor() {
                    debug!(process = %self.id(), predecessor = %predecessor.id(), "Process failed. Canceling upstream.");
                    predecessor.cancel();
                }
            }
            what => warn!(process = %self.id(), what, "Ignoring unknown process control message."),
        }
    }

    /// Called on the control receiver when the process finished.
    pub(crate) fn on_finished(&self) {
        if let Some(successor) = self.successor() {
            successor.signal_end_of_stream();
        }
        self.close_work();
    }

    /// Called on the control receiver when the process was canceled.
    pub(crate) fn on_canceled(&self) {
        if let Some(successor) = self.successor() {
            successor.cancel();
        }
        if let Some(predecessor) = self.predecessor() {
            predecessor.cancel();
        }
        self.close_work();
    }

    fn close_work(&self) {
        let discarded = match self.core().work_receiver.get() {
            Some(receiver) => receiver.close(TeardownMode::Discard),
            None => {
                let mut discarded = 0;
                while self.core().work.pop().is_some() {
                    discarded += 1;
                }
                discarded
            }
        };
        if discarded > 0 {
            debug!(process = %self.id(), discarded, "Discarded pending work items.");
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id())
            .field("title", &self.title())
            .field("state", &self.state())
            .field("processed", &self.processed_items())
            .field("total", &self.total_items())
            .finish()
    }
}

/// Connects `head` to `tail`, so that `head` can [forward][Process::forward] items to it.
///
/// # Errors
///
/// Fails if the link would connect a process to itself or create a cycle, if `head` already has a successor or is
/// already running, or if `tail` already has a predecessor.
pub fn connect(head: &Process, tail: &Process) -> Result<(), ConnectError> {
    let _guard = CONNECT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

    ensure!(head.id() != tail.id(), SelfLoop);
    ensure!(!head.task.run_requested(), AlreadyRunning);
    ensure!(!head.has_successor(), HeadHasSuccessor);
    ensure!(!tail.has_predecessor(), TailHasPredecessor);

    let mut ancestor = head.predecessor();
    while let Some(process) = ancestor {
        ensure!(process.id() != tail.id(), Cycle);
        ancestor = process.predecessor();
    }

    head.core().links().successor = Some(tail.clone());
    tail.core().links().predecessor = Some(Arc::downgrade(&head.task.inner));
    debug!(head = %head.id(), tail = %tail.id(), "Connected processes.");

    Ok(())
}
