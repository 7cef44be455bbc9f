//! Thread pool and exclusive threads.
//!
//! A [`Scheduler`] owns a shared pool of worker threads which execute discrete jobs, plus any number of
//! [`ExclusiveThread`]s, each of which runs its own jobs in FIFO order. The pool is built on `crossbeam-deque`: jobs
//! submitted from outside the pool land in a global injector, jobs submitted from a pool worker land in that worker's
//! local queue, and idle workers steal from each other.
//!
//! Pool threads are spawned lazily on first use and grown on demand, up to the configured maximum, whenever a job is
//! queued while no worker is idle. Threads above the configured minimum retire after sitting idle for the configured
//! idle timeout.
use std::{
    cell::RefCell,
    io, iter,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak,
    },
    thread::{self, JoinHandle, ThreadId},
};

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver as ChannelReceiver, Sender};
use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use skein_error::panic_message;
use slab::Slab;
use snafu::Snafu;
use tracing::{debug, error, trace, warn};

use crate::{metrics::SchedulerMetrics, RuntimeConfiguration};

/// A unit of work executed by a scheduler.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// An execution context that jobs can be submitted to.
pub trait Executor: Send + Sync {
    /// Submits a job for execution.
    ///
    /// Never blocks waiting for the job to run.
    fn execute(&self, job: Job);
}

impl<E> Executor for Arc<E>
where
    E: Executor + ?Sized,
{
    fn execute(&self, job: Job) {
        (**self).execute(job)
    }
}

/// A scheduler error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum SchedulerError {
    /// A thread could not be spawned.
    #[snafu(display("Failed to spawn thread '{}'.", name))]
    ThreadSpawn {
        /// Name of the thread.
        name: String,

        /// Error source.
        source: io::Error,
    },

    /// The scheduler has been shut down.
    #[snafu(display("Scheduler has been shut down."))]
    ShutDown,
}

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);
static GLOBAL_SCHEDULER: OnceLock<ArcSwap<SchedulerHandle>> = OnceLock::new();

thread_local! {
    static CURRENT_WORKER: RefCell<Option<LocalWorker>> = const { RefCell::new(None) };
}

struct LocalWorker {
    scheduler_id: u64,
    queue: Worker<Job>,
}

#[derive(Default)]
struct PoolState {
    live: usize,
    idle: usize,
    next_thread: usize,
    handles: Vec<JoinHandle<()>>,
    shut_down: bool,
}

struct ExclusiveEntry {
    thread: Weak<ExclusiveInner>,
    handle: JoinHandle<()>,
}

struct Shared {
    id: u64,
    config: RuntimeConfiguration,
    injector: Injector<Job>,
    stealers: Mutex<Slab<Stealer<Job>>>,
    pending: AtomicUsize,
    pool: Mutex<PoolState>,
    wakeup: Condvar,
    exclusive: Mutex<Vec<ExclusiveEntry>>,
    next_exclusive: AtomicUsize,
    accepting: AtomicBool,
    metrics: SchedulerMetrics,
}

impl Shared {
    fn lock_pool(&self) -> MutexGuard<'_, PoolState> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a job, growing the pool if no worker is idle.
    ///
    /// A job is only ever dropped when the scheduler is shut down. If the pool has no thread at all and one cannot be
    /// spawned, the job stays queued until a later call manages to spawn one, and the spawn error is returned.
    fn submit(self: &Arc<Self>, job: Job) -> Result<(), SchedulerError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }

        self.metrics.jobs_queued.increment(1);

        // Count the job before it becomes visible, so that a worker taking it can never underflow the counter.
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Some(job) = self.push_local(job) {
            self.injector.push(job);
        }

        let mut pool = self.lock_pool();
        if pool.idle > 0 {
            self.wakeup.notify_one();
        } else if pool.live < self.config.effective_max_threads() && !pool.shut_down {
            if let Err(e) = self.spawn_worker(&mut pool) {
                if pool.live == 0 {
                    error!(scheduler = self.id, error = %e, pending = self.pending.load(Ordering::SeqCst), "No pool thread could be spawned. Job left queued.");
                    return Err(e);
                }
                warn!(scheduler = self.id, live = pool.live, error = %e, "Failed to grow thread pool.");
            }
        }
        Ok(())
    }

    /// Pushes the job onto the current thread's local queue if the current thread is one of our workers, otherwise
    /// hands it back.
    fn push_local(&self, job: Job) -> Option<Job> {
        CURRENT_WORKER.with(|current| {
            let current = current.borrow();
            match current.as_ref() {
                Some(local) if local.scheduler_id == self.id => {
                    local.queue.push(job);
                    None
                }
                _ => Some(job),
            }
        })
    }

    fn find_job(&self) -> Option<Job> {
        CURRENT_WORKER.with(|current| {
            let current = current.borrow();
            let local = &current.as_ref()?.queue;

            local.pop().or_else(|| {
                iter::repeat_with(|| {
                    self.injector.steal_batch_and_pop(local).or_else(|| {
                        let stealers = self.stealers.lock().unwrap_or_else(PoisonError::into_inner);
                        stealers.iter().map(|(_, stealer)| stealer.steal()).collect::<Steal<Job>>()
                    })
                })
                .find(|steal| !steal.is_retry())
                .and_then(Steal::success)
            })
        })
    }

    fn run_job(&self, job: Job) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            self.metrics.job_panics.increment(1);
            error!(
                scheduler = self.id,
                thread = thread::current().name().unwrap_or("<unnamed>"),
                error = %panic_message(payload.as_ref()),
                "Job panicked."
            );
        }
        self.metrics.jobs_executed.increment(1);
    }

    fn spawn_worker(self: &Arc<Self>, pool: &mut PoolState) -> Result<(), SchedulerError> {
        let name = format!("{}-pool-{:02}", self.config.thread_name, pool.next_thread);
        pool.next_thread += 1;

        let queue = Worker::new_fifo();
        let slot = self
            .stealers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue.stealer());

        let shared = Arc::clone(self);
        let spawn_result = self
            .config
            .thread_builder(name.clone())
            .spawn(move || shared.worker_loop(queue, slot));

        match spawn_result {
            Ok(handle) => {
                pool.handles.retain(|handle| !handle.is_finished());
                pool.handles.push(handle);
                pool.live += 1;
                self.metrics.threads_spawned.increment(1);
                self.metrics.threads_live.increment(1.0);
                debug!(scheduler = self.id, thread = %name, live = pool.live, "Spawned pool thread.");
                Ok(())
            }
            Err(source) => {
                self.stealers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(slot);
                Err(SchedulerError::ThreadSpawn { name, source })
            }
        }
    }

    fn worker_loop(self: Arc<Self>, queue: Worker<Job>, slot: usize) {
        CURRENT_WORKER.with(|current| {
            *current.borrow_mut() = Some(LocalWorker {
                scheduler_id: self.id,
                queue,
            })
        });

        let idle_timeout = self.config.idle_timeout();
        loop {
            if let Some(job) = self.find_job() {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                trace!(scheduler = self.id, "Running pooled job.");
                self.run_job(job);
                continue;
            }

            let mut pool = self.lock_pool();
            if self.pending.load(Ordering::SeqCst) > 0 {
                continue;
            }
            if pool.shut_down {
                pool.live -= 1;
                break;
            }

            pool.idle += 1;
            let (mut pool, wait) = self
                .wakeup
                .wait_timeout(pool, idle_timeout)
                .unwrap_or_else(PoisonError::into_inner);
            pool.idle -= 1;

            if wait.timed_out()
                && !pool.shut_down
                && pool.live > self.config.min_threads
                && self.pending.load(Ordering::SeqCst) == 0
            {
                pool.live -= 1;
                debug!(scheduler = self.id, "Retiring idle pool thread.");
                break;
            }
        }

        self.stealers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(slot);
        self.metrics.threads_live.decrement(1.0);
        CURRENT_WORKER.with(|current| current.borrow_mut().take());
    }

    fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);

        let mut pool = self.lock_pool();
        pool.shut_down = true;
        self.wakeup.notify_all();
        drop(pool);

        let entries = self.exclusive.lock().unwrap_or_else(PoisonError::into_inner);
        for entry in entries.iter() {
            if let Some(thread) = entry.thread.upgrade() {
                let _ = thread.sender.send(Command::Stop);
            }
        }
    }
}

/// Shuts the pool down once the last scheduler handle is gone.
struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        // We may be running on one of our own threads, so only signal: workers drain and exit by themselves.
        self.shared.stop_accepting();
    }
}

/// A thread pool with support for exclusive threads.
///
/// `Scheduler` is a cheap, cloneable handle. When the last handle is dropped, the pool stops accepting jobs and its
/// threads exit once they have drained everything already queued. Call [`shutdown`][Self::shutdown] to do the same
/// while also waiting for every thread to exit.
#[derive(Clone)]
pub struct Scheduler {
    handle: Arc<SchedulerHandle>,
}

impl Scheduler {
    /// Creates a new scheduler from the given configuration.
    ///
    /// No threads are spawned until the first job is queued, or [`start`][Self::start] is called.
    pub fn new(config: RuntimeConfiguration) -> Self {
        let id = NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed);
        let metrics = SchedulerMetrics::new(&config.thread_name);

        Self {
            handle: Arc::new(SchedulerHandle {
                shared: Arc::new(Shared {
                    id,
                    config,
                    injector: Injector::new(),
                    stealers: Mutex::new(Slab::new()),
                    pending: AtomicUsize::new(0),
                    pool: Mutex::new(PoolState::default()),
                    wakeup: Condvar::new(),
                    exclusive: Mutex::new(Vec::new()),
                    next_exclusive: AtomicUsize::new(0),
                    accepting: AtomicBool::new(true),
                    metrics,
                }),
            }),
        }
    }

    /// Returns the process-wide default scheduler.
    ///
    /// Built from the default configuration on first use, unless one was installed with
    /// [`set_global`][Self::set_global].
    pub fn global() -> Scheduler {
        let handle = GLOBAL_SCHEDULER
            .get_or_init(|| {
                let scheduler = Scheduler::new(RuntimeConfiguration::default());
                ArcSwap::new(scheduler.handle)
            })
            .load_full();

        Scheduler { handle }
    }

    /// Replaces the process-wide default scheduler, returning the previous one.
    ///
    /// Tasks and processes already bound to the previous scheduler keep using it.
    pub fn set_global(scheduler: Scheduler) -> Scheduler {
        let swap = GLOBAL_SCHEDULER.get_or_init(|| ArcSwap::new(Scheduler::new(RuntimeConfiguration::default()).handle));
        Scheduler {
            handle: swap.swap(scheduler.handle),
        }
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.handle.shared
    }

    pub(crate) fn metrics(&self) -> &SchedulerMetrics {
        &self.shared().metrics
    }

    /// Returns the unique identifier of this scheduler.
    pub fn id(&self) -> u64 {
        self.shared().id
    }

    /// Returns the configuration this scheduler was built with.
    pub fn config(&self) -> &RuntimeConfiguration {
        &self.shared().config
    }

    /// Spawns pool threads until at least `min_threads` are alive.
    ///
    /// # Errors
    ///
    /// If the scheduler was shut down, or a thread could not be spawned, an error is returned. Threads spawned before
    /// the failure keep running.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let shared = self.shared();
        let mut pool = shared.lock_pool();
        if pool.shut_down {
            return Err(SchedulerError::ShutDown);
        }

        while pool.live < shared.config.min_threads.min(shared.config.effective_max_threads()) {
            shared.spawn_worker(&mut pool)?;
        }
        Ok(())
    }

    /// Spawns up to `additional` pool threads, without exceeding `max_threads`.
    ///
    /// Returns the number of threads spawned.
    ///
    /// # Errors
    ///
    /// If the scheduler was shut down, or a thread could not be spawned, an error is returned. Threads spawned before
    /// the failure keep running.
    pub fn grow(&self, additional: usize) -> Result<usize, SchedulerError> {
        let shared = self.shared();
        let mut pool = shared.lock_pool();
        if pool.shut_down {
            return Err(SchedulerError::ShutDown);
        }

        let mut spawned = 0;
        while spawned < additional && pool.live < shared.config.effective_max_threads() {
            shared.spawn_worker(&mut pool)?;
            spawned += 1;
        }
        Ok(spawned)
    }

    /// Queues a closure on the shared pool.
    ///
    /// # Errors
    ///
    /// If the scheduler was shut down, the closure is dropped and an error is returned. If the pool has no thread and
    /// none could be spawned, an error is returned but the closure stays queued, and runs once a thread is spawned by
    /// [`start`][Self::start], [`grow`][Self::grow] or a later call to `queue`.
    pub fn queue<F>(&self, f: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared().submit(Box::new(f))
    }

    /// Spawns a new exclusive thread.
    ///
    /// Jobs queued on the returned thread run in FIFO order on that thread only. The thread exits once every handle
    /// to it is dropped and its queue has drained, or when the scheduler shuts down.
    ///
    /// # Errors
    ///
    /// If the scheduler was shut down, or the thread could not be spawned, an error is returned.
    pub fn exclusive_thread(&self) -> Result<ExclusiveThread, SchedulerError> {
        let shared = self.shared();
        if !shared.accepting.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }

        let index = shared.next_exclusive.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-excl-{:02}", shared.config.thread_name, index);
        let (sender, receiver) = crossbeam_channel::unbounded();

        let thread_shared = Arc::clone(shared);
        let thread_name = name.clone();
        let handle = shared
            .config
            .thread_builder(name.clone())
            .spawn(move || exclusive_loop(thread_shared, thread_name, receiver))
            .map_err(|source| {
                error!(scheduler = shared.id, thread = %name, error = %source, "Failed to spawn exclusive thread.");
                SchedulerError::ThreadSpawn {
                    name: name.clone(),
                    source,
                }
            })?;

        shared.metrics.threads_spawned.increment(1);
        shared.metrics.exclusive_threads_live.increment(1.0);
        debug!(scheduler = shared.id, thread = %name, "Spawned exclusive thread.");

        let inner = Arc::new(ExclusiveInner {
            name,
            thread_id: handle.thread().id(),
            sender,
        });

        let mut entries = shared.exclusive.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|entry| !entry.handle.is_finished());
        entries.push(ExclusiveEntry {
            thread: Arc::downgrade(&inner),
            handle,
        });

        Ok(ExclusiveThread { inner })
    }

    /// Returns the number of live shared-pool threads.
    pub fn live_threads(&self) -> usize {
        self.shared().lock_pool().live
    }

    /// Returns the number of jobs queued on the shared pool but not yet started.
    pub fn pending_jobs(&self) -> usize {
        self.shared().pending.load(Ordering::SeqCst)
    }

    /// Returns `true` if the scheduler no longer accepts jobs.
    pub fn is_shut_down(&self) -> bool {
        !self.shared().accepting.load(Ordering::Acquire)
    }

    /// Shuts the scheduler down.
    ///
    /// Stops accepting new jobs, lets every thread drain the jobs already queued to it, and then joins all threads,
    /// except the calling thread if it belongs to this scheduler. Jobs queued after this point are dropped.
    pub fn shutdown(&self) {
        let shared = self.shared();
        debug!(scheduler = shared.id, "Shutting down scheduler.");
        shared.stop_accepting();

        let current = thread::current().id();
        let handles = std::mem::take(&mut shared.lock_pool().handles);
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }

        let entries = std::mem::take(&mut *shared.exclusive.lock().unwrap_or_else(PoisonError::into_inner));
        for entry in entries {
            if entry.handle.thread().id() != current {
                let _ = entry.handle.join();
            }
        }
    }
}

impl Executor for Scheduler {
    fn execute(&self, job: Job) {
        if let Err(e) = self.shared().submit(job) {
            warn!(scheduler = self.id(), error = %e, "Failed to submit job.");
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.shared().id)
            .field("thread_name", &self.shared().config.thread_name)
            .finish()
    }
}

enum Command {
    Run(Job),
    Stop,
}

struct ExclusiveInner {
    name: String,
    thread_id: ThreadId,
    sender: Sender<Command>,
}

impl Drop for ExclusiveInner {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Stop);
    }
}

/// A thread dedicated to running jobs in FIFO order.
///
/// `ExclusiveThread` is a cheap, cloneable handle.
#[derive(Clone)]
pub struct ExclusiveThread {
    inner: Arc<ExclusiveInner>,
}

impl ExclusiveThread {
    /// Returns the name of the thread.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns `true` if called from this thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Queues a closure to run on this thread.
    ///
    /// Closures run in the order they were queued.
    pub fn queue<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute(Box::new(f));
    }
}

impl Executor for ExclusiveThread {
    fn execute(&self, job: Job) {
        if self.inner.sender.send(Command::Run(job)).is_err() {
            warn!(thread = %self.inner.name, "Exclusive thread has stopped. Dropping job.");
        }
    }
}

impl std::fmt::Debug for ExclusiveThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveThread").field("name", &self.inner.name).finish()
    }
}

fn exclusive_loop(shared: Arc<Shared>, name: String, receiver: ChannelReceiver<Command>) {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Run(job) => {
                trace!(thread = %name, "Running exclusive job.");
                shared.run_job(job);
            }
            Command::Stop => break,
        }
    }

    shared.metrics.exclusive_threads_live.decrement(1.0);
    debug!(scheduler = shared.id, thread = %name, "Exclusive thread stopped.");
}
