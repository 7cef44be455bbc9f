//! Tasks.
//!
//! A [`Task`] is an actor-style unit of work. Every change to a task's state (running it, canceling it, adding a
//! dependency or a callback, recording its outcome) is expressed as a control message posted to the task's own
//! [`Port`], and applied by the task's own [`Receiver`]. Since a receiver handles one message at a time, all state
//! transitions of a task happen sequentially no matter how many threads are poking at it, and only the work closure
//! itself runs concurrently with them, on the scheduler's shared pool.
//!
//! # Lifecycle
//!
//! `Initial → WaitingOnDependencies → Executing → {Canceled, Finished}`
//!
//! Running a task latches an execute request: execution starts as soon as every dependency has finished and the task
//! has not been canceled. When the work closure returns, the task records its result or error and reaches a terminal
//! state, at which point observers (dependent tasks) are notified and the callback or errback chain runs, exactly
//! once. Canceling a task that has not started yet terminates it immediately, while canceling a task that is
//! executing is cooperative: the closure must poll [`Task::is_canceled`] and return early.
use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
};

use indexmap::IndexMap;
use skein_error::{from_panic, panic_message, GenericError};
use tracing::{debug, error, trace, warn};

use crate::{
    process::{Process, ProcessCore},
    progress::{ProgressEvent, Watch, WatchMode},
    scheduler::{ExclusiveThread, Executor, SchedulerError},
    Handle, Message, Port, Receiver, Scheduler, TeardownMode, Value,
};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Control message discriminants.
pub(crate) mod control {
    pub const EXECUTE: i32 = 1;
    pub const CANCEL: i32 = 2;
    pub const ADD_DEPENDENCY: i32 = 3;
    pub const REMOVE_DEPENDENCY: i32 = 4;
    pub const ADD_OBSERVER: i32 = 5;
    pub const REMOVE_OBSERVER: i32 = 6;
    pub const DEPENDENCY_FINISHED: i32 = 7;
    pub const DEPENDENCY_CANCELED: i32 = 8;
    pub const ADD_HANDLER: i32 = 9;
    pub const SET_CALLBACK_CONTEXT: i32 = 10;
    pub const COMPLETE: i32 = 11;
    pub const SET_RESULT: i32 = 12;
    pub const SET_ERROR: i32 = 13;
    pub const ADD_WATCH: i32 = 14;

    /// Discriminants at or above this value are specific to processes.
    pub const PROCESS_BASE: i32 = 100;
}

const TASK_ID_FIELD: &str = "task_id";

/// Unique identifier of a task.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw identifier.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub(crate) fn from_u64(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskState {
    /// Not yet asked to run.
    Initial,

    /// Asked to run, but waiting for dependencies to finish.
    WaitingOnDependencies,

    /// Running.
    Executing,

    /// Canceled. Terminal.
    Canceled,

    /// Finished, either successfully or with an error. Terminal.
    Finished,
}

impl TaskState {
    /// Returns `true` if no further state change is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Canceled | TaskState::Finished)
    }

    fn as_u8(self) -> u8 {
        match self {
            TaskState::Initial => 0,
            TaskState::WaitingOnDependencies => 1,
            TaskState::Executing => 2,
            TaskState::Canceled => 3,
            TaskState::Finished => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Initial,
            1 => TaskState::WaitingOnDependencies,
            2 => TaskState::Executing,
            3 => TaskState::Canceled,
            _ => TaskState::Finished,
        }
    }
}

/// The error a task finished with.
///
/// Cheap to clone: every clone shares the same underlying error.
#[derive(Clone)]
pub struct TaskError(Arc<GenericError>);

impl TaskError {
    /// Wraps the given error.
    pub fn new(error: GenericError) -> Self {
        Self(Arc::new(error))
    }

    /// Returns the underlying error.
    pub fn inner(&self) -> &GenericError {
        &self.0
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Work executed by a task.
///
/// Implemented for any `FnMut(&Task) -> Result<Option<Value>, GenericError> + Send` closure. Long-running work should
/// periodically check [`Task::is_canceled`] and return early once it is set.
pub trait TaskFn: Send + 'static {
    /// Executes the work, returning an optional result value.
    ///
    /// # Errors
    ///
    /// An error finishes the task with that error, and runs its errbacks instead of its callbacks.
    fn execute(&mut self, task: &Task) -> Result<Option<Value>, GenericError>;
}

impl<F> TaskFn for F
where
    F: FnMut(&Task) -> Result<Option<Value>, GenericError> + Send + 'static,
{
    fn execute(&mut self, task: &Task) -> Result<Option<Value>, GenericError> {
        self(task)
    }
}

type Callback = Box<dyn FnOnce(&Task) + Send>;
type Errback = Box<dyn FnOnce(&Task, &TaskError) + Send>;

struct HandlerPair {
    callback: Option<Callback>,
    errback: Option<Errback>,
}

/// A one-shot payload carried in a message handle.
pub(crate) struct Slot<T>(Mutex<Option<T>>);

impl<T: Send + 'static> Slot<T> {
    pub(crate) fn message(what: i32, value: T) -> Message {
        Message::with_data(what, Handle::new(Slot(Mutex::new(Some(value)))))
    }

    pub(crate) fn take(message: &Message) -> Option<T> {
        match message.get_data() {
            Some(Value::Handle(handle)) => handle
                .downcast_ref::<Slot<T>>()?
                .0
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
            _ => None,
        }
    }
}

struct Completion {
    outcome: Option<Result<Option<Value>, GenericError>>,
    from_closure: bool,
}

#[derive(Clone)]
struct ObserverLink {
    id: TaskId,
    port: Port,
}

#[derive(Default)]
struct ActorState {
    execute_requested: bool,
    dependencies: IndexMap<TaskId, Task>,
    any_finished: bool,
    observers: Vec<ObserverLink>,
    handlers: Vec<HandlerPair>,
    callback_context: Option<Arc<dyn Executor>>,
    watches: Vec<Watch>,
    closure_returned: bool,
    keep_alive: Option<Task>,
}

pub(crate) enum Kind {
    Work(Mutex<Option<Box<dyn TaskFn>>>),
    AllOf,
    AnyOf,
    Process(ProcessCore),
}

pub(crate) struct TaskInner {
    id: TaskId,
    name: Option<String>,
    scheduler: Scheduler,
    control: Port,
    receiver: OnceLock<Receiver>,
    state: AtomicU8,
    run_requested: AtomicBool,
    cancel_requested: AtomicBool,
    deferred: AtomicBool,
    result: Mutex<Option<Value>>,
    error: Mutex<Option<TaskError>>,
    // Only touched from the control receiver, apart from `keep_alive` being set once by `request_run`.
    actor: Mutex<ActorState>,
    pub(crate) kind: Kind,
}

/// Builder for [`Task`].
#[derive(Default)]
pub struct TaskBuilder {
    name: Option<String>,
    scheduler: Option<Scheduler>,
    callback_context: Option<Arc<dyn Executor>>,
    control_thread: Option<ExclusiveThread>,
}

impl TaskBuilder {
    /// Sets the name of the task, used in logs.
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the scheduler that runs the task's work and control messages.
    ///
    /// Defaults to [`Scheduler::global`].
    pub fn scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Sets the execution context of the callback chain.
    ///
    /// By default, callbacks run inline on whichever thread completes the task.
    pub fn callback_context(mut self, executor: Arc<dyn Executor>) -> Self {
        self.callback_context = Some(executor);
        self
    }

    /// Dispatches the task's control messages on the given exclusive thread instead of the shared pool.
    pub fn control_thread(mut self, thread: ExclusiveThread) -> Self {
        self.control_thread = Some(thread);
        self
    }

    /// Builds a task that executes the given work.
    pub fn build<F: TaskFn>(self, work: F) -> Task {
        self.build_kind(Kind::Work(Mutex::new(Some(Box::new(work)))))
    }

    /// Builds a task that finishes once every one of `dependencies` has finished.
    ///
    /// The task is canceled if any dependency is canceled. It still needs to be [run][Task::run].
    pub fn all_of(self, dependencies: &[Task]) -> Task {
        let task = self.build_kind(Kind::AllOf);
        for dependency in dependencies {
            task.add_dependency(dependency);
        }
        task
    }

    /// Builds a task that finishes as soon as any one of `dependencies` has finished.
    ///
    /// The task is canceled only once every dependency is canceled. It still needs to be [run][Task::run].
    pub fn any_of(self, dependencies: &[Task]) -> Task {
        let task = self.build_kind(Kind::AnyOf);
        for dependency in dependencies {
            task.add_dependency(dependency);
        }
        task
    }

    pub(crate) fn scheduler_or_global(&self) -> Scheduler {
        self.scheduler.clone().unwrap_or_else(Scheduler::global)
    }

    pub(crate) fn build_kind(self, kind: Kind) -> Task {
        let scheduler = self.scheduler_or_global();
        let inner = Arc::new(TaskInner {
            id: TaskId::next(),
            name: self.name,
            scheduler: scheduler.clone(),
            control: Port::new(),
            receiver: OnceLock::new(),
            state: AtomicU8::new(TaskState::Initial.as_u8()),
            run_requested: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            deferred: AtomicBool::new(false),
            result: Mutex::new(None),
            error: Mutex::new(None),
            actor: Mutex::new(ActorState {
                callback_context: self.callback_context,
                ..Default::default()
            }),
            kind,
        });

        let weak = Arc::downgrade(&inner);
        let handler = move |message: Message| {
            if let Some(inner) = weak.upgrade() {
                Task { inner }.handle_control(message);
            }
        };
        let receiver = match &self.control_thread {
            Some(thread) => Receiver::on_thread(inner.control.clone(), thread, handler),
            None => Receiver::shared(inner.control.clone(), &scheduler, handler),
        };
        let _ = inner.receiver.set(receiver.with_teardown(TeardownMode::Discard));

        debug!(task_id = %inner.id, name = inner.name.as_deref().unwrap_or(""), "Task created.");
        Task { inner }
    }
}

/// An actor-style unit of work with dependencies, callbacks and a terminal state.
///
/// `Task` is a cheap, cloneable handle. A task that was [run][Self::run] keeps itself alive until it reaches a
/// terminal state, so callers may drop their handles right after running it.
#[derive(Clone)]
pub struct Task {
    pub(crate) inner: Arc<TaskInner>,
}

impl Task {
    /// Creates a task that executes the given work on the default scheduler.
    pub fn new<F: TaskFn>(work: F) -> Task {
        Self::builder().build(work)
    }

    /// Creates a builder for a task.
    pub fn builder() -> TaskBuilder {
        TaskBuilder::default()
    }

    /// Creates a task that finishes once every one of `dependencies` has finished.
    ///
    /// See [`TaskBuilder::all_of`].
    pub fn all_of(dependencies: &[Task]) -> Task {
        Self::builder().all_of(dependencies)
    }

    /// Creates a task that finishes as soon as any one of `dependencies` has finished.
    ///
    /// See [`TaskBuilder::any_of`].
    pub fn any_of(dependencies: &[Task]) -> Task {
        Self::builder().any_of(dependencies)
    }

    /// Returns the unique identifier of this task.
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Returns the name of this task, if one was set.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Returns the scheduler this task runs on.
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Returns the current state of this task.
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Returns `true` if the task is executing.
    pub fn is_executing(&self) -> bool {
        self.state() == TaskState::Executing
    }

    /// Returns `true` if the task was asked to cancel, or has been canceled.
    ///
    /// Work closures should poll this periodically and return early once it is set.
    pub fn is_canceled(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::SeqCst) || self.state() == TaskState::Canceled
    }

    /// Returns `true` if the task finished, successfully or with an error.
    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    /// Returns `true` if the task reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Returns `true` if the task finished without an error.
    pub fn has_succeeded(&self) -> bool {
        self.is_finished() && self.error().is_none()
    }

    /// Returns `true` if the task finished with an error.
    pub fn has_failed(&self) -> bool {
        self.is_finished() && self.error().is_some()
    }

    /// Returns the result value of the task, if one was recorded.
    pub fn result(&self) -> Option<Value> {
        self.inner
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the error of the task, if one was recorded.
    pub fn error(&self) -> Option<TaskError> {
        self.inner
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs the task.
    ///
    /// Execution starts once every dependency has finished. Running a task that is already running does nothing.
    ///
    /// # Panics
    ///
    /// Panics if the task already reached a terminal state.
    pub fn run(&self) {
        let state = self.state();
        assert!(
            !state.is_terminal(),
            "task {} cannot be run: it is already {:?}",
            self.id(),
            state
        );

        if !self.request_run() {
            warn!(task_id = %self.id(), "Task is already running. Ignoring run request.");
        }
    }

    /// Posts an execute request, unless one was already posted or the task is terminal.
    pub(crate) fn request_run(&self) -> bool {
        if self.is_terminal() || self.inner.run_requested.swap(true, Ordering::SeqCst) {
            return false;
        }

        // Terminal transitions set the state before taking `keep_alive` under this lock, so checking the state again
        // here guarantees the reference is either never taken or released by that transition.
        {
            let mut actor = self.actor();
            if self.is_terminal() {
                return false;
            }
            actor.keep_alive = Some(self.clone());
        }

        self.post(Message::new(control::EXECUTE));
        true
    }

    pub(crate) fn run_requested(&self) -> bool {
        self.inner.run_requested.load(Ordering::SeqCst)
    }

    /// Cancels the task.
    ///
    /// A task that has not started executing is canceled immediately. An executing task is flagged, and its work
    /// closure is expected to notice and return early. Canceling a terminated task does nothing.
    pub fn cancel(&self) {
        if self.is_terminal() {
            return;
        }
        self.inner.cancel_requested.store(true, Ordering::SeqCst);
        self.post(Message::new(control::CANCEL));
    }

    /// Adds a dependency: this task will not start executing until `dependency` has finished.
    ///
    /// If `dependency` is canceled, this task is canceled too.
    ///
    /// # Panics
    ///
    /// Panics if this task is executing or terminated, or if `dependency` is this task.
    pub fn add_dependency(&self, dependency: &Task) {
        self.assert_dependencies_mutable(dependency);
        self.post(Message::with_data(
            control::ADD_DEPENDENCY,
            Handle::new(dependency.clone()),
        ));
    }

    /// Removes a dependency previously added with [`add_dependency`][Self::add_dependency].
    ///
    /// # Panics
    ///
    /// Panics if this task is executing or terminated, or if `dependency` is this task.
    pub fn remove_dependency(&self, dependency: &Task) {
        self.assert_dependencies_mutable(dependency);
        self.post(Message::with_data(
            control::REMOVE_DEPENDENCY,
            Handle::new(dependency.clone()),
        ));
    }

    fn assert_dependencies_mutable(&self, dependency: &Task) {
        assert!(dependency.id() != self.id(), "task {} cannot depend on itself", self.id());
        let state = self.state();
        assert!(
            matches!(state, TaskState::Initial | TaskState::WaitingOnDependencies),
            "dependencies of task {} can only change before it executes (state: {:?})",
            self.id(),
            state
        );
    }

    /// Adds a callback, run once the task finishes without an error.
    ///
    /// Callbacks and errbacks run in registration order, each at most once. Handlers added after the task finished
    /// run right away. Handlers of a canceled task never run.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        self.add_handler(HandlerPair {
            callback: Some(Box::new(callback)),
            errback: None,
        });
    }

    /// Adds an errback, run once the task finishes with an error.
    ///
    /// See [`add_callback`][Self::add_callback] for ordering.
    pub fn add_errback<F>(&self, errback: F)
    where
        F: FnOnce(&Task, &TaskError) + Send + 'static,
    {
        self.add_handler(HandlerPair {
            callback: None,
            errback: Some(Box::new(errback)),
        });
    }

    /// Adds a callback/errback pair, exactly one of which runs once the task finishes.
    ///
    /// See [`add_callback`][Self::add_callback] for ordering.
    pub fn add_both<C, E>(&self, callback: C, errback: E)
    where
        C: FnOnce(&Task) + Send + 'static,
        E: FnOnce(&Task, &TaskError) + Send + 'static,
    {
        self.add_handler(HandlerPair {
            callback: Some(Box::new(callback)),
            errback: Some(Box::new(errback)),
        });
    }

    fn add_handler(&self, pair: HandlerPair) {
        self.post(Slot::message(control::ADD_HANDLER, pair));
    }

    /// Routes the callback chain onto the given executor.
    pub fn set_callback_context(&self, executor: Arc<dyn Executor>) {
        self.post(Message::with_data(control::SET_CALLBACK_CONTEXT, Handle::new(executor)));
    }

    /// Keeps the task executing after its work closure returns successfully.
    ///
    /// Meant to be called from within the work closure. The task then stays executing until
    /// [`complete`][Self::complete] is called, typically after setting an outcome with
    /// [`set_result`][Self::set_result] or [`set_error`][Self::set_error].
    pub fn defer_completion(&self) {
        self.inner.deferred.store(true, Ordering::SeqCst);
    }

    /// Records the result of the task. Only the first recorded result is kept.
    pub fn set_result<V: Into<Value>>(&self, value: V) {
        self.post(Message::with_data(control::SET_RESULT, value));
    }

    /// Records an error for the task. Only the first recorded error is kept.
    pub fn set_error(&self, error: GenericError) {
        self.post(Slot::message(control::SET_ERROR, error));
    }

    /// Completes the task.
    ///
    /// Later completion attempts are ignored.
    pub fn complete(&self) {
        self.post(Slot::message(
            control::COMPLETE,
            Completion {
                outcome: None,
                from_closure: false,
            },
        ));
    }

    /// Registers a progress watcher.
    ///
    /// Progress events are posted to `port` until the task reaches a terminal state, followed by a single terminal
    /// event. A watcher added after termination immediately receives the final state and the terminal event.
    pub fn add_watch(&self, port: &Port, mode: WatchMode) {
        let mut watch = Watch::new(port.clone(), mode);
        if let Some(process) = self.as_process() {
            watch = watch.with_title(process.title());
        }
        self.post(Message::with_data(control::ADD_WATCH, Handle::new(watch)));
    }

    pub(crate) fn post(&self, message: Message) {
        self.inner.control.post(message);
    }

    /// Asks `other` to report its terminal state to this task, without making it a dependency.
    pub(crate) fn observe(&self, other: &Task) {
        other.post(Message::with_data(
            control::ADD_OBSERVER,
            Handle::new(ObserverLink {
                id: self.id(),
                port: self.inner.control.clone(),
            }),
        ));
    }

    pub(crate) fn as_process(&self) -> Option<Process> {
        match self.inner.kind {
            Kind::Process(_) => Some(Process::wrap(self.clone())),
            _ => None,
        }
    }

    fn set_state(&self, state: TaskState) {
        self.inner.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn actor(&self) -> MutexGuard<'_, ActorState> {
        self.inner.actor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_control(&self, message: Message) {
        trace!(task_id = %self.id(), what = message.what(), "Handling control message.");

        match message.what() {
            control::EXECUTE => self.on_execute(),
            control::CANCEL => self.on_cancel(),
            control::ADD_DEPENDENCY => {
                if let Some(dependency) = task_payload(&message) {
                    self.on_add_dependency(dependency);
                }
            }
            control::REMOVE_DEPENDENCY => {
                if let Some(dependency) = task_payload(&message) {
                    self.on_remove_dependency(dependency);
                }
            }
            control::ADD_OBSERVER => {
                if let Some(link) = handle_payload::<ObserverLink>(&message) {
                    self.on_add_observer(link);
                }
            }
            control::REMOVE_OBSERVER => {
                let id = TaskId::from_u64(message.get_long(TASK_ID_FIELD) as u64);
                self.actor().observers.retain(|link| link.id != id);
            }
            control::DEPENDENCY_FINISHED => {
                self.on_dependency_finished(TaskId::from_u64(message.get_long(TASK_ID_FIELD) as u64));
            }
            control::DEPENDENCY_CANCELED => {
                self.on_dependency_canceled(TaskId::from_u64(message.get_long(TASK_ID_FIELD) as u64));
            }
            control::ADD_HANDLER => {
                if let Some(pair) = Slot::<HandlerPair>::take(&message) {
                    self.on_add_handler(pair);
                }
            }
            control::SET_CALLBACK_CONTEXT => {
                if let Some(executor) = handle_payload::<Arc<dyn Executor>>(&message) {
                    self.actor().callback_context = Some(executor);
                }
            }
            control::COMPLETE => {
                if let Some(completion) = Slot::<Completion>::take(&message) {
                    self.on_complete(completion);
                }
            }
            control::SET_RESULT => {
                if self.is_terminal() {
                    warn!(task_id = %self.id(), "Ignoring result set on a terminated task.");
                } else if let Some(value) = message.get_data() {
                    self.record_result(value.clone());
                }
            }
            control::SET_ERROR => {
                if self.is_terminal() {
                    warn!(task_id = %self.id(), "Ignoring error set on a terminated task.");
                } else if let Some(error) = Slot::<GenericError>::take(&message) {
                    self.record_error(TaskError::new(error));
                }
            }
            control::ADD_WATCH => {
                if let Some(watch) = handle_payload::<Watch>(&message) {
                    self.on_add_watch(watch);
                }
            }
            what if what >= control::PROCESS_BASE => match self.as_process() {
                Some(process) => process.handle_control(message),
                None => warn!(task_id = %self.id(), what, "Ignoring process control message sent to a task."),
            },
            what => warn!(task_id = %self.id(), what, "Ignoring unknown control message."),
        }
    }

    fn on_execute(&self) {
        {
            let mut actor = self.actor();
            if self.is_terminal() || actor.execute_requested {
                return;
            }
            actor.execute_requested = true;
        }
        self.try_start();
    }

    fn try_start(&self) {
        let state = self.state();
        if state.is_terminal() || state == TaskState::Executing {
            return;
        }

        let ready = {
            let actor = self.actor();
            if !actor.execute_requested {
                return;
            }
            match self.inner.kind {
                Kind::AnyOf => actor.any_finished || actor.dependencies.is_empty(),
                _ => actor.dependencies.is_empty(),
            }
        };

        if self.inner.cancel_requested.load(Ordering::SeqCst) {
            self.transition_canceled();
            return;
        }

        if !ready {
            if state != TaskState::WaitingOnDependencies {
                self.set_state(TaskState::WaitingOnDependencies);
                debug!(task_id = %self.id(), "Task waiting on dependencies.");
            }
            return;
        }

        self.set_state(TaskState::Executing);
        debug!(task_id = %self.id(), "Task executing.");

        match &self.inner.kind {
            Kind::Work(work) => {
                let work = work.lock().unwrap_or_else(PoisonError::into_inner).take();
                match work {
                    Some(work) => self.spawn_work(work),
                    None => error!(task_id = %self.id(), "Task has no work left to execute."),
                }
            }
            Kind::AllOf | Kind::AnyOf => self.transition_finished(),
            Kind::Process(_) => Process::wrap(self.clone()).start(),
        }
    }

    fn spawn_work(&self, mut work: Box<dyn TaskFn>) {
        let task = self.clone();
        let queued = self.inner.scheduler.queue(move || {
            let outcome = match catch_unwind(AssertUnwindSafe(|| work.execute(&task))) {
                Ok(outcome) => outcome,
                Err(payload) => Err(from_panic("work closure", payload)),
            };
            task.post(Slot::message(
                control::COMPLETE,
                Completion {
                    outcome: Some(outcome),
                    from_closure: true,
                },
            ));
        });

        match queued {
            Ok(()) => {}
            // The closure was dropped, so nothing else will ever complete the task.
            Err(e @ SchedulerError::ShutDown) => self.post(Slot::message(
                control::COMPLETE,
                Completion {
                    outcome: Some(Err(e.into())),
                    from_closure: true,
                },
            )),
            Err(e) => warn!(task_id = %self.id(), error = %e, "Work is queued, but the pool has no thread to run it."),
        }
    }

    fn on_complete(&self, completion: Completion) {
        if self.is_terminal() {
            debug!(task_id = %self.id(), "Ignoring completion of a terminated task.");
            return;
        }

        if completion.from_closure {
            self.actor().closure_returned = true;
        }

        // A canceled task ends without an outcome, whatever the closure returned.
        if self.inner.cancel_requested.load(Ordering::SeqCst) {
            self.transition_canceled();
            return;
        }

        let mut failed = false;
        match completion.outcome {
            Some(Ok(Some(value))) => self.record_result(value),
            Some(Ok(None)) | None => {}
            Some(Err(e)) => {
                failed = true;
                self.record_error(TaskError::new(e));
            }
        }

        if completion.from_closure && !failed && self.inner.deferred.load(Ordering::SeqCst) {
            debug!(task_id = %self.id(), "Work closure returned. Completion deferred.");
            return;
        }

        self.transition_finished();
    }

    fn record_result(&self, value: Value) {
        let mut result = self.inner.result.lock().unwrap_or_else(PoisonError::into_inner);
        if result.is_none() {
            *result = Some(value);
        } else {
            warn!(task_id = %self.id(), "Task result already recorded. Ignoring.");
        }
    }

    pub(crate) fn record_error(&self, error: TaskError) {
        let mut slot = self.inner.error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            debug!(task_id = %self.id(), error = %error, "Task failed.");
            *slot = Some(error);
        } else {
            warn!(task_id = %self.id(), error = %error, "Task error already recorded. Ignoring.");
        }
    }

    fn on_cancel(&self) {
        let state = self.state();
        if state.is_terminal() {
            return;
        }

        self.inner.cancel_requested.store(true, Ordering::SeqCst);
        let closure_returned = self.actor().closure_returned;
        match (state, &self.inner.kind) {
            (TaskState::Executing, Kind::Work(_)) if !closure_returned => {
                debug!(task_id = %self.id(), "Cancellation requested while executing. Waiting for work to return.");
            }
            _ => self.transition_canceled(),
        }
    }

    pub(crate) fn transition_finished(&self) {
        if self.is_terminal() {
            return;
        }
        self.set_state(TaskState::Finished);
        debug!(task_id = %self.id(), failed = self.error().is_some(), "Task finished.");

        let (observers, handlers, context, watches, keep_alive, dependencies) = {
            let mut actor = self.actor();
            (
                std::mem::take(&mut actor.observers),
                std::mem::take(&mut actor.handlers),
                actor.callback_context.clone(),
                std::mem::take(&mut actor.watches),
                actor.keep_alive.take(),
                std::mem::take(&mut actor.dependencies),
            )
        };

        let process = self.as_process();
        for watch in &watches {
            if let Some(process) = &process {
                watch.send_status(self.id(), &process.snapshot());
            }
            watch.send(self.id(), ProgressEvent::Complete);
        }
        if let Some(process) = &process {
            process.on_finished();
        }

        self.run_handlers(handlers, context);

        for observer in &observers {
            observer.port.post(self.id_message(control::DEPENDENCY_FINISHED));
        }

        drop(dependencies);
        drop(keep_alive);
    }

    pub(crate) fn transition_canceled(&self) {
        if self.is_terminal() {
            return;
        }
        self.inner.cancel_requested.store(true, Ordering::SeqCst);
        self.set_state(TaskState::Canceled);
        debug!(task_id = %self.id(), "Task canceled.");

        let (observers, handlers, watches, keep_alive, dependencies) = {
            let mut actor = self.actor();
            (
                std::mem::take(&mut actor.observers),
                std::mem::take(&mut actor.handlers),
                std::mem::take(&mut actor.watches),
                actor.keep_alive.take(),
                std::mem::take(&mut actor.dependencies),
            )
        };

        for watch in &watches {
            watch.send(self.id(), ProgressEvent::Cancelled);
        }
        if let Some(process) = self.as_process() {
            process.on_canceled();
        }

        if !handlers.is_empty() {
            trace!(task_id = %self.id(), count = handlers.len(), "Dropping handlers of canceled task.");
        }
        drop(handlers);

        for observer in &observers {
            observer.port.post(self.id_message(control::DEPENDENCY_CANCELED));
        }

        drop(dependencies);
        drop(keep_alive);
    }

    fn id_message(&self, what: i32) -> Message {
        Message::new_full(what, [(TASK_ID_FIELD, Value::Long(self.id().as_u64() as i64))])
    }

    fn run_handlers(&self, handlers: Vec<HandlerPair>, context: Option<Arc<dyn Executor>>) {
        if handlers.is_empty() {
            return;
        }

        let task = self.clone();
        let run = move || {
            let error = task.error();
            for pair in handlers {
                task.run_handler(pair, error.as_ref());
            }
        };

        match context {
            Some(executor) => executor.execute(Box::new(run)),
            None => run(),
        }
    }

    fn run_handler(&self, pair: HandlerPair, error: Option<&TaskError>) {
        let outcome = match (error, pair.callback, pair.errback) {
            (None, Some(callback), _) => catch_unwind(AssertUnwindSafe(|| callback(self))),
            (Some(error), _, Some(errback)) => catch_unwind(AssertUnwindSafe(|| errback(self, error))),
            _ => Ok(()),
        };

        if let Err(payload) = outcome {
            error!(task_id = %self.id(), error = %panic_message(payload.as_ref()), "Task handler panicked.");
        }
    }

    fn on_add_handler(&self, pair: HandlerPair) {
        match self.state() {
            TaskState::Finished => {
                let context = self.actor().callback_context.clone();
                self.run_handlers(vec![pair], context);
            }
            TaskState::Canceled => trace!(task_id = %self.id(), "Dropping handler added to canceled task."),
            _ => self.actor().handlers.push(pair),
        }
    }

    fn on_add_dependency(&self, dependency: Task) {
        let state = self.state();
        if !matches!(state, TaskState::Initial | TaskState::WaitingOnDependencies) {
            error!(task_id = %self.id(), dependency = %dependency.id(), ?state, "Dependency added after execution started. Ignoring.");
            return;
        }

        {
            let mut actor = self.actor();
            if actor.dependencies.contains_key(&dependency.id()) {
                return;
            }
            actor.dependencies.insert(dependency.id(), dependency.clone());
        }

        debug!(task_id = %self.id(), dependency = %dependency.id(), "Dependency added.");
        self.observe(&dependency);
    }

    fn on_remove_dependency(&self, dependency: Task) {
        let state = self.state();
        if !matches!(state, TaskState::Initial | TaskState::WaitingOnDependencies) {
            error!(task_id = %self.id(), dependency = %dependency.id(), ?state, "Dependency removed after execution started. Ignoring.");
            return;
        }

        let removed = self.actor().dependencies.shift_remove(&dependency.id());
        if removed.is_some() {
            debug!(task_id = %self.id(), dependency = %dependency.id(), "Dependency removed.");
            dependency.post(self.id_message(control::REMOVE_OBSERVER));
            self.try_start();
        }
    }

    fn on_add_observer(&self, link: ObserverLink) {
        match self.state() {
            TaskState::Finished => link.port.post(self.id_message(control::DEPENDENCY_FINISHED)),
            TaskState::Canceled => link.port.post(self.id_message(control::DEPENDENCY_CANCELED)),
            _ => self.actor().observers.push(link),
        }
    }

    fn on_dependency_finished(&self, id: TaskId) {
        if self.is_terminal() {
            return;
        }
        if let Some(process) = self.as_process().filter(|process| process.is_successor(id)) {
            process.on_successor_terminated(false);
            return;
        }

        let removed = {
            let mut actor = self.actor();
            let removed = actor.dependencies.shift_remove(&id);
            if removed.is_some() && matches!(self.inner.kind, Kind::AnyOf) {
                actor.any_finished = true;
            }
            removed
        };

        if removed.is_some() {
            trace!(task_id = %self.id(), dependency = %id, "Dependency finished.");
            self.try_start();
        }
    }

    fn on_dependency_canceled(&self, id: TaskId) {
        if self.is_terminal() {
            return;
        }
        if let Some(process) = self.as_process().filter(|process| process.is_successor(id)) {
            process.on_successor_terminated(true);
            return;
        }

        let (removed, cancel) = {
            let mut actor = self.actor();
            let removed = actor.dependencies.shift_remove(&id);
            let cancel = match self.inner.kind {
                Kind::AnyOf => !actor.any_finished && actor.dependencies.is_empty(),
                _ => true,
            };
            (removed, cancel)
        };

        if removed.is_none() {
            return;
        }

        if cancel {
            debug!(task_id = %self.id(), dependency = %id, "Dependency canceled. Canceling dependent task.");
            self.on_cancel();
        } else {
            self.try_start();
        }
    }

    fn on_add_watch(&self, watch: Watch) {
        let process = self.as_process();
        watch.send_initial_title(self.id());

        match self.state() {
            TaskState::Finished => {
                if let Some(process) = &process {
                    watch.send_status(self.id(), &process.snapshot());
                }
                watch.send(self.id(), ProgressEvent::Complete);
            }
            TaskState::Canceled => watch.send(self.id(), ProgressEvent::Cancelled),
            _ => {
                if let Some(process) = &process {
                    watch.send_status(self.id(), &process.snapshot());
                }
                self.actor().watches.push(watch);
            }
        }
    }

    /// Sends a status update to every registered watcher.
    pub(crate) fn broadcast_status(&self) {
        let Some(process) = self.as_process() else {
            return;
        };
        if self.is_terminal() {
            return;
        }

        let snapshot = process.snapshot();
        for watch in self.actor().watches.iter() {
            watch.send_status(self.id(), &snapshot);
        }
    }

    /// Sends a title update to every registered watcher.
    pub(crate) fn broadcast_title(&self, title: &str) {
        if self.is_terminal() {
            return;
        }
        for watch in self.actor().watches.iter() {
            watch.send(self.id(), ProgressEvent::Title(title.to_string()));
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

fn handle_payload<T: Clone + 'static>(message: &Message) -> Option<T> {
    match message.get_data() {
        Some(Value::Handle(handle)) => handle.downcast_ref::<T>().cloned(),
        _ => None,
    }
}

fn task_payload(message: &Message) -> Option<Task> {
    handle_payload::<Task>(message)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
        thread,
        time::{Duration, Instant},
    };

    use skein_error::generic_error;

    use super::*;
    use crate::RuntimeConfiguration;

    fn scheduler() -> Scheduler {
        Scheduler::new(RuntimeConfiguration {
            min_threads: 1,
            max_threads: 4,
            thread_name: "task-test".to_string(),
            ..Default::default()
        })
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    fn task<F: TaskFn>(scheduler: &Scheduler, work: F) -> Task {
        Task::builder().scheduler(scheduler.clone()).build(work)
    }

    #[test]
    fn runs_and_records_result() {
        let scheduler = scheduler();
        let task = task(&scheduler, |_: &Task| Ok(Some(Value::Int(42))));
        assert_eq!(task.state(), TaskState::Initial);

        task.run();
        assert!(wait_until(|| task.is_finished()));
        assert!(task.has_succeeded());
        assert!(!task.has_failed());
        assert_eq!(task.result(), Some(Value::Int(42)));
    }

    #[test]
    fn error_runs_errbacks_only() {
        let scheduler = scheduler();
        let task = task(&scheduler, |_: &Task| Err(generic_error!("disk on fire")));
        let (tx, rx) = mpsc::channel();

        let callback_tx = tx.clone();
        task.add_callback(move |_| callback_tx.send("callback").expect("test alive"));
        let errback_tx = tx.clone();
        task.add_errback(move |_, error| {
            assert_eq!(error.to_string(), "disk on fire");
            errback_tx.send("errback").expect("test alive");
        });
        task.run();

        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), "errback");
        assert!(wait_until(|| task.has_failed()));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn panicking_work_becomes_an_error() {
        let scheduler = scheduler();
        let task = task(&scheduler, |_: &Task| -> Result<Option<Value>, GenericError> { panic!("oops") });
        task.run();

        assert!(wait_until(|| task.is_finished()));
        let error = task.error().expect("error should be recorded");
        assert!(error.to_string().contains("oops"));
    }

    #[test]
    fn callbacks_run_in_order_exactly_once() {
        let scheduler = scheduler();
        let task = task(&scheduler, |_: &Task| Ok(None));
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = Arc::clone(&order);
            task.add_callback(move |_| order.lock().unwrap().push(i));
        }
        task.run();
        assert!(wait_until(|| order.lock().unwrap().len() == 5));

        // Registered after completion: runs right away.
        let late = Arc::clone(&order);
        task.add_callback(move |_| late.lock().unwrap().push(5));
        assert!(wait_until(|| order.lock().unwrap().len() == 6));

        thread::sleep(Duration::from_millis(20));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn callback_context_runs_callbacks_on_that_executor() {
        let scheduler = scheduler();
        let thread = scheduler.exclusive_thread().expect("should spawn");
        let task = Task::builder()
            .scheduler(scheduler.clone())
            .callback_context(Arc::new(thread.clone()))
            .build(|_: &Task| Ok(None));

        let (tx, rx) = mpsc::channel();
        let handle = thread.clone();
        task.add_callback(move |_| tx.send(handle.is_current()).expect("test alive"));
        task.run();

        assert!(rx.recv_timeout(Duration::from_secs(10)).unwrap());
    }

    #[test]
    fn cancel_before_run_is_immediate() {
        let scheduler = scheduler();
        let ran = Arc::new(AtomicUsize::new(0));
        let task = {
            let ran = Arc::clone(&ran);
            task(&scheduler, move |_: &Task| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
        };
        let (tx, rx) = mpsc::channel::<()>();
        task.add_callback(move |_| tx.send(()).expect("test alive"));

        task.cancel();
        assert!(wait_until(|| task.state() == TaskState::Canceled));
        assert!(task.is_canceled());
        assert!(task.error().is_none());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    #[should_panic(expected = "cannot be run")]
    fn running_a_canceled_task_panics() {
        let scheduler = scheduler();
        let task = task(&scheduler, |_: &Task| Ok(None));
        task.cancel();
        assert!(wait_until(|| task.is_terminal()));
        task.run();
    }

    #[test]
    fn cancel_while_executing_is_cooperative() {
        let scheduler = scheduler();
        let (started_tx, started_rx) = mpsc::channel();
        let task = task(&scheduler, move |task: &Task| {
            started_tx.send(()).expect("test alive");
            while !task.is_canceled() {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(None)
        });

        task.run();
        started_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(task.is_executing());

        task.cancel();
        assert!(wait_until(|| task.state() == TaskState::Canceled));
        assert!(!task.is_finished());
    }

    #[test]
    fn dependencies_delay_execution() {
        let scheduler = scheduler();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let first = {
            let order = Arc::clone(&order);
            task(&scheduler, move |_: &Task| {
                let _ = release_rx.recv_timeout(Duration::from_secs(10));
                order.lock().unwrap().push("first");
                Ok(None)
            })
        };
        let second = {
            let order = Arc::clone(&order);
            task(&scheduler, move |_: &Task| {
                order.lock().unwrap().push("second");
                Ok(None)
            })
        };

        second.add_dependency(&first);
        second.run();
        assert!(wait_until(|| second.state() == TaskState::WaitingOnDependencies));

        first.run();
        release_tx.send(()).expect("first alive");
        assert!(wait_until(|| second.is_finished()));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn dependency_already_finished_does_not_block() {
        let scheduler = scheduler();
        let first = task(&scheduler, |_: &Task| Ok(None));
        first.run();
        assert!(wait_until(|| first.is_finished()));

        let second = task(&scheduler, |_: &Task| Ok(None));
        second.add_dependency(&first);
        second.run();
        assert!(wait_until(|| second.is_finished()));
    }

    #[test]
    fn removed_dependency_no_longer_blocks() {
        let scheduler = scheduler();
        let blocker = task(&scheduler, |_: &Task| Ok(None));
        let dependent = task(&scheduler, |_: &Task| Ok(None));

        dependent.add_dependency(&blocker);
        dependent.run();
        assert!(wait_until(|| dependent.state() == TaskState::WaitingOnDependencies));

        dependent.remove_dependency(&blocker);
        assert!(wait_until(|| dependent.is_finished()));
        assert_eq!(blocker.state(), TaskState::Initial);
    }

    #[test]
    fn canceled_dependency_cancels_dependent() {
        let scheduler = scheduler();
        let first = task(&scheduler, |_: &Task| Ok(None));
        let second = task(&scheduler, |_: &Task| Ok(None));
        second.add_dependency(&first);
        second.run();

        first.cancel();
        assert!(wait_until(|| second.state() == TaskState::Canceled));
    }

    #[test]
    #[should_panic(expected = "cannot depend on itself")]
    fn self_dependency_panics() {
        let scheduler = scheduler();
        let task = task(&scheduler, |_: &Task| Ok(None));
        task.add_dependency(&task.clone());
    }

    #[test]
    fn all_of_waits_for_everything() {
        let scheduler = scheduler();
        let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();
        let tasks = (0..3)
            .map(|_| {
                let release_rx = release_rx.clone();
                task(&scheduler, move |_: &Task| {
                    let _ = release_rx.recv_timeout(Duration::from_secs(10));
                    Ok(None)
                })
            })
            .collect::<Vec<_>>();

        let all = Task::builder().scheduler(scheduler.clone()).all_of(&tasks);
        all.run();
        tasks.iter().for_each(Task::run);

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!all.is_finished());

        release_tx.send(()).unwrap();
        assert!(wait_until(|| all.is_finished()));
    }

    #[test]
    fn any_of_finishes_on_first_and_cancels_on_all() {
        let scheduler = scheduler();
        let a = task(&scheduler, |_: &Task| Ok(None));
        let b = task(&scheduler, |_: &Task| Ok(None));
        let any = Task::builder().scheduler(scheduler.clone()).any_of(&[a.clone(), b.clone()]);
        any.run();
        a.run();
        assert!(wait_until(|| any.is_finished()));

        let c = task(&scheduler, |_: &Task| Ok(None));
        let d = task(&scheduler, |_: &Task| Ok(None));
        let any = Task::builder().scheduler(scheduler.clone()).any_of(&[c.clone(), d.clone()]);
        any.run();
        c.cancel();
        thread::sleep(Duration::from_millis(20));
        assert!(!any.is_terminal());
        d.cancel();
        assert!(wait_until(|| any.state() == TaskState::Canceled));
    }

    #[test]
    fn deferred_completion() {
        let scheduler = scheduler();
        let task = task(&scheduler, |task: &Task| {
            task.defer_completion();
            Ok(None)
        });
        task.run();

        thread::sleep(Duration::from_millis(20));
        assert!(task.is_executing());

        task.set_result("done");
        task.complete();
        assert!(wait_until(|| task.is_finished()));
        assert_eq!(task.result(), Some(Value::from("done")));

        // Later completion attempts are no-ops.
        task.set_error(generic_error!("late"));
        task.complete();
        thread::sleep(Duration::from_millis(20));
        assert!(task.has_succeeded());
    }

    #[test]
    fn canceling_a_deferred_task_after_its_work_returned() {
        let scheduler = scheduler();
        let (returned_tx, returned_rx) = mpsc::channel();
        let task = task(&scheduler, move |task: &Task| {
            task.defer_completion();
            returned_tx.send(()).expect("test alive");
            Ok(None)
        });
        task.run();

        returned_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(task.is_executing());

        task.cancel();
        assert!(wait_until(|| task.state() == TaskState::Canceled));
    }

    #[test]
    fn error_returned_after_cancel_is_not_recorded() {
        let scheduler = scheduler();
        let (started_tx, started_rx) = mpsc::channel();
        let task = task(&scheduler, move |task: &Task| {
            started_tx.send(()).expect("test alive");
            while !task.is_canceled() {
                thread::sleep(Duration::from_millis(1));
            }
            Err(generic_error!("interrupted"))
        });
        let (tx, rx) = mpsc::channel::<()>();
        task.add_errback(move |_, _| tx.send(()).expect("test alive"));

        task.run();
        started_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        task.cancel();

        assert!(wait_until(|| task.state() == TaskState::Canceled));
        assert!(task.error().is_none());
        assert!(!task.has_failed());
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn dropping_every_handle_right_after_run() {
        let scheduler = scheduler();
        let (tx, rx) = mpsc::channel();
        for i in 0..50 {
            let task = task(&scheduler, move |_: &Task| Ok(Some(Value::Int(i))));
            let tx = tx.clone();
            task.add_callback(move |task| tx.send(task.result()).expect("test alive"));
            task.run();
        }

        let mut results = (0..50)
            .map(|_| rx.recv_timeout(Duration::from_secs(10)).expect("every task should finish"))
            .collect::<Vec<_>>();
        results.sort_by_key(|value| match value {
            Some(Value::Int(i)) => *i,
            _ => -1,
        });
        assert_eq!(results, (0..50).map(|i| Some(Value::Int(i))).collect::<Vec<_>>());
    }

    #[test]
    fn work_refused_by_a_shut_down_scheduler_fails_the_task() {
        let control = scheduler();
        let thread = control.exclusive_thread().expect("should spawn");
        let work_pool = scheduler();
        work_pool.shutdown();

        let ran = Arc::new(AtomicUsize::new(0));
        let task = {
            let ran = Arc::clone(&ran);
            Task::builder()
                .scheduler(work_pool.clone())
                .control_thread(thread)
                .build(move |_: &Task| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })
        };
        task.run();

        assert!(wait_until(|| task.has_failed()));
        assert_eq!(task.error().expect("should fail").to_string(), "Scheduler has been shut down.");
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn running_task_keeps_itself_alive() {
        let scheduler = scheduler();
        let (tx, rx) = mpsc::channel();
        {
            let task = task(&scheduler, |_: &Task| Ok(Some(Value::Int(1))));
            task.add_callback(move |task| tx.send(task.result()).expect("test alive"));
            task.run();
        }
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(10)).unwrap(),
            Some(Value::Int(1))
        );
    }

    #[test]
    fn watchers_get_exactly_one_terminal_event() {
        let scheduler = scheduler();
        let port = Port::new();
        let task = task(&scheduler, |_: &Task| Ok(None));
        task.add_watch(&port, WatchMode::ItemCount);
        task.run();
        assert!(wait_until(|| task.is_finished()));
        assert!(wait_until(|| !port.is_empty()));

        let late = Port::new();
        task.add_watch(&late, WatchMode::Percentage);
        assert!(wait_until(|| !late.is_empty()));

        for port in [port, late] {
            thread::sleep(Duration::from_millis(10));
            let events = std::iter::from_fn(|| port.pop())
                .filter_map(|message| ProgressEvent::from_message(&message))
                .collect::<Vec<_>>();
            assert_eq!(events, vec![(task.id(), ProgressEvent::Complete)]);
        }
    }
}
