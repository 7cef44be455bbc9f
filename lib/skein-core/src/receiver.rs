//! Message dispatch.
//!
//! A [`Receiver`] binds to a [`Port`] and invokes its handler once per posted message, one message at a time, in
//! post order. Dispatch is driven by a single "scheduled" token: whoever flips it from unset to set owns the right to
//! dispatch, and each dispatch job handles exactly one message before handing the token back. Since at most one job
//! per receiver is ever queued or running, the handler behaves like a single-threaded actor even when the physical
//! thread changes from one message to the next.
use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use skein_error::panic_message;
use tracing::{debug, error, trace};

use crate::{
    scheduler::{ExclusiveThread, Executor, SchedulerError},
    Message, Port, Scheduler,
};

static NEXT_RECEIVER_ID: AtomicU64 = AtomicU64::new(1);

const OPEN: u8 = 0;
const CLOSING_DRAIN: u8 = 1;
const CLOSING_DISCARD: u8 = 2;

/// What to do with pending messages when a receiver is torn down.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TeardownMode {
    /// Run every pending message through the handler.
    #[default]
    Drain,

    /// Drop every pending message without handling it.
    Discard,
}

impl TeardownMode {
    fn as_state(self) -> u8 {
        match self {
            TeardownMode::Drain => CLOSING_DRAIN,
            TeardownMode::Discard => CLOSING_DISCARD,
        }
    }
}

/// How a receiver's dispatch jobs are executed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchMode {
    /// Each message is dispatched as a discrete job on the shared pool.
    Shared,

    /// Every message is dispatched on one dedicated thread.
    Exclusive,
}

type Handler = Box<dyn FnMut(Message) + Send>;

pub(crate) struct Dispatcher {
    id: u64,
    port: Port,
    handler: Mutex<Handler>,
    executor: Arc<dyn Executor>,
    mode: DispatchMode,
    scheduled: AtomicBool,
    state: AtomicU8,
}

impl Dispatcher {
    fn closing(&self) -> Option<TeardownMode> {
        match self.state.load(Ordering::SeqCst) {
            CLOSING_DRAIN => Some(TeardownMode::Drain),
            CLOSING_DISCARD => Some(TeardownMode::Discard),
            _ => None,
        }
    }

    /// Wakes the receiver up, scheduling a dispatch job unless one is already queued or running.
    pub(crate) fn notify(self: &Arc<Self>) {
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(mode) = self.closing() {
            self.teardown(mode);
            return;
        }

        let dispatcher = Arc::clone(self);
        self.executor.execute(Box::new(move || dispatcher.dispatch_one()));
    }

    fn dispatch_one(self: &Arc<Self>) {
        if let Some(mode) = self.closing() {
            self.teardown(mode);
            return;
        }

        if let Some(message) = self.port.pop() {
            trace!(receiver = self.id, what = message.what(), "Dispatching message.");
            self.invoke(message);
        }

        // A teardown requested while we were handling the message is ours to finish, since we hold the token.
        if let Some(mode) = self.closing() {
            self.teardown(mode);
            return;
        }

        self.scheduled.store(false, Ordering::SeqCst);
        if self.closing().is_some() || !self.port.is_empty() {
            self.notify();
        }
    }

    fn invoke(&self, message: Message) {
        let mut handler = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(message))) {
            error!(
                receiver = self.id,
                error = %panic_message(payload.as_ref()),
                "Receiver handler panicked. Continuing with the next message."
            );
        }
    }

    /// Tears the receiver down. Must only be called while holding the dispatch token, which is never released again.
    fn teardown(&self, mode: TeardownMode) -> usize {
        let mut count = 0;
        while let Some(message) = self.port.pop() {
            if mode == TeardownMode::Drain {
                self.invoke(message);
            }
            count += 1;
        }

        debug!(receiver = self.id, ?mode, pending = count, "Receiver torn down.");
        count
    }

    fn close(&self, mode: TeardownMode) -> usize {
        if self
            .state
            .compare_exchange(OPEN, mode.as_state(), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return 0;
        }

        self.port.unbind(self);

        if !self.scheduled.swap(true, Ordering::SeqCst) {
            return self.teardown(mode);
        }

        // A dispatch job is queued or running, and it finishes the teardown. Discarding needs no handler, so pending
        // messages can be released right away.
        match mode {
            TeardownMode::Discard => std::iter::from_fn(|| self.port.pop()).count(),
            TeardownMode::Drain => 0,
        }
    }
}

/// Dispatch owner of a [`Port`].
///
/// The handler is invoked exactly once per message, one message at a time, in the order messages were posted. With
/// [`DispatchMode::Shared`], each message is dispatched as its own job on the scheduler's pool, so the executing
/// thread may differ between messages but two messages are never handled concurrently. With
/// [`DispatchMode::Exclusive`], every message is handled on one dedicated thread.
///
/// A handler that panics is logged, and dispatch continues with the next message.
///
/// Dropping the receiver tears it down using its configured [`TeardownMode`] (draining by default).
pub struct Receiver {
    dispatcher: Arc<Dispatcher>,
    teardown: TeardownMode,
}

impl Receiver {
    fn bind<F>(port: Port, executor: Arc<dyn Executor>, mode: DispatchMode, handler: F) -> Self
    where
        F: FnMut(Message) + Send + 'static,
    {
        let dispatcher = Arc::new(Dispatcher {
            id: NEXT_RECEIVER_ID.fetch_add(1, Ordering::Relaxed),
            port: port.clone(),
            handler: Mutex::new(Box::new(handler)),
            executor,
            mode,
            scheduled: AtomicBool::new(false),
            state: AtomicU8::new(OPEN),
        });

        port.bind(&dispatcher);
        debug!(receiver = dispatcher.id, ?mode, "Receiver bound.");

        Self {
            dispatcher,
            teardown: TeardownMode::default(),
        }
    }

    /// Creates a receiver which dispatches each message as a job on the scheduler's shared pool.
    ///
    /// # Panics
    ///
    /// Panics if another live receiver is already bound to `port`.
    pub fn shared<F>(port: Port, scheduler: &Scheduler, handler: F) -> Self
    where
        F: FnMut(Message) + Send + 'static,
    {
        Self::bind(port, Arc::new(scheduler.clone()), DispatchMode::Shared, handler)
    }

    /// Creates a receiver which owns a new exclusive thread for its lifetime.
    ///
    /// # Errors
    ///
    /// If the exclusive thread could not be spawned, an error is returned.
    ///
    /// # Panics
    ///
    /// Panics if another live receiver is already bound to `port`.
    pub fn exclusive<F>(port: Port, scheduler: &Scheduler, handler: F) -> Result<Self, SchedulerError>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let thread = scheduler.exclusive_thread()?;
        Ok(Self::on_thread(port, &thread, handler))
    }

    /// Creates a receiver which dispatches every message on the given exclusive thread.
    ///
    /// The thread can be shared with other receivers, in which case their messages are interleaved on it.
    ///
    /// # Panics
    ///
    /// Panics if another live receiver is already bound to `port`.
    pub fn on_thread<F>(port: Port, thread: &ExclusiveThread, handler: F) -> Self
    where
        F: FnMut(Message) + Send + 'static,
    {
        Self::bind(port, Arc::new(thread.clone()), DispatchMode::Exclusive, handler)
    }

    /// Sets what happens to pending messages when this receiver is dropped.
    pub fn with_teardown(mut self, mode: TeardownMode) -> Self {
        self.teardown = mode;
        self
    }

    /// Returns the port this receiver is bound to.
    pub fn port(&self) -> &Port {
        &self.dispatcher.port
    }

    /// Returns the dispatch mode of this receiver.
    pub fn mode(&self) -> DispatchMode {
        self.dispatcher.mode
    }

    /// Returns `true` if this receiver has been closed.
    pub fn is_closed(&self) -> bool {
        self.dispatcher.closing().is_some()
    }

    /// Stops intake and tears the receiver down.
    ///
    /// Returns the number of pending messages that were drained or discarded by this call. When draining while a
    /// dispatch job is in flight, that job drains the remaining messages once its current message is handled, and
    /// zero is returned. Closing an already-closed receiver does nothing and returns zero.
    pub fn close(&self, mode: TeardownMode) -> usize {
        self.dispatcher.close(mode)
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.dispatcher.close(self.teardown);
    }
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("id", &self.dispatcher.id)
            .field("mode", &self.dispatcher.mode)
            .field("teardown", &self.teardown)
            .finish()
    }
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

    use super::*;
    use crate::RuntimeConfiguration;

    fn scheduler() -> Scheduler {
        Scheduler::new(RuntimeConfiguration {
            min_threads: 1,
            max_threads: 4,
            thread_name: "receiver-test".to_string(),
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

    #[test]
    fn shared_dispatch_is_serialized_and_ordered() {
        let scheduler = scheduler();
        let port = Port::new();
        let in_handler = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let receiver = {
            let in_handler = Arc::clone(&in_handler);
            let overlaps = Arc::clone(&overlaps);
            let seen = Arc::clone(&seen);
            Receiver::shared(port.clone(), &scheduler, move |message| {
                if in_handler.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                seen.lock().unwrap().push(message.what());
                in_handler.fetch_sub(1, Ordering::SeqCst);
            })
        };
        assert_eq!(receiver.mode(), DispatchMode::Shared);
        assert!(port.has_receiver());

        for i in 0..500 {
            port.post(Message::new(i));
        }

        assert!(wait_until(|| seen.lock().unwrap().len() == 500));
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(*seen.lock().unwrap(), (0..500).collect::<Vec<_>>());
        scheduler.shutdown();
    }

    #[test]
    fn messages_posted_before_binding_are_delivered() {
        let scheduler = scheduler();
        let port = Port::new();
        port.post(Message::new(1));
        port.post(Message::new(2));

        let (tx, rx) = mpsc::channel();
        let _receiver = Receiver::shared(port.clone(), &scheduler, move |message| {
            tx.send(message.what()).expect("test alive");
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), 2);
    }

    #[test]
    fn exclusive_receiver_stays_on_one_thread() {
        let scheduler = scheduler();
        let port = Port::new();
        let (tx, rx) = mpsc::channel();
        let receiver = Receiver::exclusive(port.clone(), &scheduler, move |_| {
            tx.send(thread::current().id()).expect("test alive");
        })
        .expect("should spawn exclusive thread");
        assert_eq!(receiver.mode(), DispatchMode::Exclusive);

        for i in 0..20 {
            port.post(Message::new(i));
        }
        let threads = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(10)).unwrap())
            .collect::<Vec<_>>();
        assert!(threads.iter().all(|id| *id == threads[0]));
        assert_ne!(threads[0], thread::current().id());
    }

    #[test]
    fn panicking_handler_does_not_stop_dispatch() {
        let scheduler = scheduler();
        let port = Port::new();
        let (tx, rx) = mpsc::channel();
        let _receiver = Receiver::shared(port.clone(), &scheduler, move |message| {
            if message.what() == 0 {
                panic!("bad message");
            }
            tx.send(message.what()).expect("test alive");
        });

        port.post(Message::new(0));
        port.post(Message::new(1));
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), 1);
    }

    #[test]
    fn close_discards_pending_messages() {
        let scheduler = scheduler();
        let port = Port::new();
        let thread = scheduler.exclusive_thread().expect("should spawn");
        let (block_tx, block_rx) = mpsc::channel::<()>();
        thread.queue(move || {
            let _ = block_rx.recv_timeout(Duration::from_secs(10));
        });

        let handled = Arc::new(AtomicUsize::new(0));
        let receiver = {
            let handled = Arc::clone(&handled);
            Receiver::on_thread(port.clone(), &thread, move |_| {
                handled.fetch_add(1, Ordering::SeqCst);
            })
        };

        // Nothing else can run until the blocker returns, so both messages stay pending.
        let message = Message::new(1);
        let weak = message.downgrade();
        port.post(message);
        port.post(Message::new(2));

        assert_eq!(receiver.close(TeardownMode::Discard), 2);
        assert_eq!(receiver.close(TeardownMode::Drain), 0);
        assert!(receiver.is_closed());
        assert!(!port.has_receiver());
        block_tx.send(()).expect("blocker alive");

        assert!(wait_until(|| !weak.is_alive()));
        assert_eq!(handled.load(Ordering::SeqCst), 0);
        assert!(port.is_empty());
    }

    #[test]
    fn close_drains_pending_messages() {
        let scheduler = scheduler();
        let thread = scheduler.exclusive_thread().expect("should spawn");
        let port = Port::new();
        let handled = Arc::new(AtomicUsize::new(0));
        let (block_tx, block_rx) = mpsc::channel::<()>();
        thread.queue(move || {
            let _ = block_rx.recv_timeout(Duration::from_secs(10));
        });

        let receiver = {
            let handled = Arc::clone(&handled);
            Receiver::on_thread(port.clone(), &thread, move |_| {
                handled.fetch_add(1, Ordering::SeqCst);
            })
        };
        for i in 0..3 {
            port.post(Message::new(i));
        }

        drop(receiver);
        block_tx.send(()).expect("blocker alive");
        assert!(wait_until(|| handled.load(Ordering::SeqCst) == 3));
        assert!(port.is_empty());
    }

    #[test]
    #[should_panic(expected = "already owned")]
    fn port_has_single_owner() {
        let scheduler = scheduler();
        let port = Port::new();
        let _first = Receiver::shared(port.clone(), &scheduler, |_| {});
        let _second = Receiver::shared(port, &scheduler, |_| {});
    }
}
