//! A task and actor runtime.
//!
//! Work is expressed as [`Message`]s posted to [`Port`]s, and handled by [`Receiver`]s that a [`Scheduler`] dispatches
//! one message at a time, either on a shared thread pool or on an exclusive thread. On top of this sit [`Task`], a
//! one-shot unit of work with dependencies and callbacks whose every state change is itself a message, and
//! [`Process`], a task consuming a stream of work items that can be chained into pipelines and reports progress.
#![deny(warnings)]
#![deny(missing_docs)]

mod config;
pub use self::config::RuntimeConfiguration;

mod coordinator;
pub use self::coordinator::{CoordinationMode, Coordinator, CoordinatorBuilder};

mod message;
pub use self::message::{FramingError, Handle, Message, Value, WeakMessage};

mod metrics;

mod port;
pub use self::port::Port;

pub mod process;
pub use self::process::{connect, ConnectError, EnqueueError, Process, ProcessBuilder, ProcessFn};

pub mod progress;
pub use self::progress::{watch_chain, ProgressEvent, ProgressMonitor, ProgressWatch, WatchMode};

mod receiver;
pub use self::receiver::{DispatchMode, Receiver, TeardownMode};

mod scheduler;
pub use self::scheduler::{ExclusiveThread, Executor, Job, SchedulerError, Scheduler};

mod task;
pub use self::task::{Task, TaskBuilder, TaskError, TaskFn, TaskId, TaskState};
