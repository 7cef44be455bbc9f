//! Progress reporting.
//!
//! Tasks and processes report progress to any number of watchers, each identified by a [`Port`]. Events are plain
//! [`Message`]s, so a watcher can be anything that drains a port: a receiver, a UI loop, or a [`ProgressMonitor`]
//! pumped by hand.
//!
//! Every watch receives exactly one terminal event ([`ProgressEvent::Complete`] or [`ProgressEvent::Cancelled`]), and
//! nothing after it.
use std::fmt;

use indexmap::IndexMap;

use crate::{Message, Port, Process, Task, TaskId, Value};

const SOURCE_FIELD: &str = "source";

mod code {
    pub const COMPLETE: i32 = 0;
    pub const CANCELLED: i32 = 1;
    pub const PROCESSED_ITEMS: i32 = 2;
    pub const TOTAL_ITEMS: i32 = 3;
    pub const FRACTION: i32 = 4;
    pub const TITLE: i32 = 5;
}

/// A progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// The source finished.
    Complete,

    /// The source was canceled.
    Cancelled,

    /// Number of items processed so far.
    ProcessedItems(usize),

    /// Number of items enqueued so far.
    TotalItems(usize),

    /// Completed fraction, between 0 and 1.
    Fraction(f32),

    /// New title of the source.
    Title(String),
}

impl ProgressEvent {
    /// Returns `true` if this is a terminal event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Complete | ProgressEvent::Cancelled)
    }

    /// Encodes the event, emitted by `source`, as a message.
    pub fn into_message(self, source: TaskId) -> Message {
        let mut message = match self {
            ProgressEvent::Complete => Message::new(code::COMPLETE),
            ProgressEvent::Cancelled => Message::new(code::CANCELLED),
            ProgressEvent::ProcessedItems(n) => Message::with_data(code::PROCESSED_ITEMS, n as i64),
            ProgressEvent::TotalItems(n) => Message::with_data(code::TOTAL_ITEMS, n as i64),
            ProgressEvent::Fraction(f) => Message::with_data(code::FRACTION, f),
            ProgressEvent::Title(title) => Message::with_data(code::TITLE, title),
        };
        message.set_long(SOURCE_FIELD, source.as_u64() as i64);
        message
    }

    /// Decodes a message produced by [`into_message`][Self::into_message].
    ///
    /// Returns `None` if the message is not a progress event.
    pub fn from_message(message: &Message) -> Option<(TaskId, ProgressEvent)> {
        let source = match message.get_value(SOURCE_FIELD)? {
            Value::Long(id) => TaskId::from_u64(*id as u64),
            _ => return None,
        };

        let event = match (message.what(), message.get_data()) {
            (code::COMPLETE, _) => ProgressEvent::Complete,
            (code::CANCELLED, _) => ProgressEvent::Cancelled,
            (code::PROCESSED_ITEMS, Some(Value::Long(n))) => ProgressEvent::ProcessedItems(*n as usize),
            (code::TOTAL_ITEMS, Some(Value::Long(n))) => ProgressEvent::TotalItems(*n as usize),
            (code::FRACTION, Some(Value::Float(f))) => ProgressEvent::Fraction(*f),
            (code::TITLE, Some(Value::String(title))) => ProgressEvent::Title(title.clone()),
            _ => return None,
        };

        Some((source, event))
    }
}

/// What status updates a watch receives.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WatchMode {
    /// Processed and total item counts.
    #[default]
    ItemCount,

    /// Completed fraction.
    Percentage,
}

/// Point-in-time item counts of a process.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct Snapshot {
    pub processed: usize,
    pub total: usize,
    pub fraction: Option<f32>,
}

impl Snapshot {
    pub fn fraction(&self) -> f32 {
        let fraction = self.fraction.unwrap_or_else(|| {
            if self.total == 0 {
                0.0
            } else {
                self.processed as f32 / self.total as f32
            }
        });
        fraction.clamp(0.0, 1.0)
    }
}

/// A registered watcher.
#[derive(Clone, Debug)]
pub(crate) struct Watch {
    port: Port,
    mode: WatchMode,
    title: Option<String>,
}

impl Watch {
    pub fn new(port: Port, mode: WatchMode) -> Self {
        Self { port, mode, title: None }
    }

    /// Sets the title reported when the watch is registered.
    ///
    /// Captured when the watch is requested, so later title changes reach the watch as updates instead.
    pub fn with_title(mut self, title: String) -> Self {
        self.title = Some(title).filter(|title| !title.is_empty());
        self
    }

    pub fn send_initial_title(&self, source: TaskId) {
        if let Some(title) = &self.title {
            self.send(source, ProgressEvent::Title(title.clone()));
        }
    }

    pub fn send(&self, source: TaskId, event: ProgressEvent) {
        self.port.post(event.into_message(source));
    }

    pub fn send_status(&self, source: TaskId, snapshot: &Snapshot) {
        match self.mode {
            WatchMode::ItemCount => {
                self.send(source, ProgressEvent::ProcessedItems(snapshot.processed));
                self.send(source, ProgressEvent::TotalItems(snapshot.total));
            }
            WatchMode::Percentage => self.send(source, ProgressEvent::Fraction(snapshot.fraction())),
        }
    }
}

/// Registers a watch on `process` and every process downstream of it.
///
/// Returns the number of processes watched.
pub fn watch_chain(process: &Process, port: &Port, mode: WatchMode) -> usize {
    let mut count = 0;
    let mut current = Some(process.clone());
    while let Some(process) = current {
        process.add_watch(port, mode);
        count += 1;
        current = process.successor();
    }
    count
}

/// Accumulated progress of one source.
///
/// Applying events is idempotent, and everything after the first terminal event is ignored.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressWatch {
    source: TaskId,
    title: Option<String>,
    processed: usize,
    total: usize,
    fraction: Option<f32>,
    complete: bool,
    cancelled: bool,
}

impl ProgressWatch {
    /// Creates an empty watch of `source`.
    pub fn new(source: TaskId) -> Self {
        Self {
            source,
            title: None,
            processed: 0,
            total: 0,
            fraction: None,
            complete: false,
            cancelled: false,
        }
    }

    /// Applies an event.
    ///
    /// Returns `false` if the event was ignored because the watch already saw a terminal event.
    pub fn apply(&mut self, event: &ProgressEvent) -> bool {
        if self.is_terminal() {
            return false;
        }

        match event {
            ProgressEvent::Complete => self.complete = true,
            ProgressEvent::Cancelled => self.cancelled = true,
            ProgressEvent::ProcessedItems(n) => self.processed = *n,
            ProgressEvent::TotalItems(n) => self.total = *n,
            ProgressEvent::Fraction(f) => self.fraction = Some(*f),
            ProgressEvent::Title(title) => self.title = Some(title.clone()),
        }
        true
    }

    /// Returns the source of the events.
    pub fn source(&self) -> TaskId {
        self.source
    }

    /// Returns the last reported title.
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Returns the last reported number of processed items.
    pub fn processed_items(&self) -> usize {
        self.processed
    }

    /// Returns the last reported number of total items.
    pub fn total_items(&self) -> usize {
        self.total
    }

    /// Returns the completed fraction.
    ///
    /// A completed source is always at 1. Otherwise, an explicitly reported fraction wins over the item counts.
    pub fn fraction(&self) -> f32 {
        if self.complete {
            return 1.0;
        }
        Snapshot {
            processed: self.processed,
            total: self.total,
            fraction: self.fraction,
        }
        .fraction()
    }

    /// Returns `true` if the source finished.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Returns `true` if the source was canceled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Returns `true` if a terminal event was seen.
    pub fn is_terminal(&self) -> bool {
        self.complete || self.cancelled
    }
}

impl fmt::Display for ProgressWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.complete {
            "complete"
        } else if self.cancelled {
            "cancelled"
        } else {
            "running"
        };
        write!(
            f,
            "{} [{}/{}] {:.0}% {}",
            self.title.as_deref().unwrap_or("task"),
            self.processed,
            self.total,
            self.fraction() * 100.0,
            state
        )
    }
}

/// Tracks the progress of a set of tasks and processes through a single port.
///
/// The monitor does not run on its own: call [`pump`][Self::pump] to apply pending events.
pub struct ProgressMonitor {
    port: Port,
    mode: WatchMode,
    watches: IndexMap<TaskId, ProgressWatch>,
    tasks: Vec<Task>,
}

impl ProgressMonitor {
    /// Creates a monitor whose watches report in the given mode.
    pub fn new(mode: WatchMode) -> Self {
        Self {
            port: Port::new(),
            mode,
            watches: IndexMap::new(),
            tasks: Vec::new(),
        }
    }

    /// Returns the port events are posted to.
    pub fn port(&self) -> &Port {
        &self.port
    }

    /// Starts watching a task.
    pub fn watch_task(&mut self, task: &Task) {
        if self.watches.contains_key(&task.id()) {
            return;
        }
        self.watches.insert(task.id(), ProgressWatch::new(task.id()));
        self.tasks.push(task.clone());
        task.add_watch(&self.port, self.mode);
    }

    /// Starts watching a process.
    pub fn watch_process(&mut self, process: &Process) {
        self.watch_task(process.as_task());
    }

    /// Starts watching a process and every process downstream of it.
    pub fn watch_process_chain(&mut self, process: &Process) {
        let mut current = Some(process.clone());
        while let Some(process) = current {
            self.watch_process(&process);
            current = process.successor();
        }
    }

    /// Applies every pending event, returning how many were applied.
    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        while let Some(message) = self.port.pop() {
            let Some((source, event)) = ProgressEvent::from_message(&message) else {
                continue;
            };
            let watch = self
                .watches
                .entry(source)
                .or_insert_with(|| ProgressWatch::new(source));
            if watch.apply(&event) {
                applied += 1;
            }
        }
        applied
    }

    /// Returns every watch, in registration order.
    pub fn watches(&self) -> impl Iterator<Item = &ProgressWatch> {
        self.watches.values()
    }

    /// Returns the watch of the given source.
    pub fn watch(&self, source: TaskId) -> Option<&ProgressWatch> {
        self.watches.get(&source)
    }

    /// Returns `true` if every watched source reached a terminal state, and no watched process still has a
    /// successor running.
    pub fn is_finished(&self) -> bool {
        self.watches.values().all(ProgressWatch::is_terminal)
            && self
                .tasks
                .iter()
                .filter_map(Task::as_process)
                .all(|process| process.successor().map_or(true, |successor| successor.is_terminal()))
    }

    /// Cancels every watched source.
    pub fn cancel(&self) {
        for task in &self.tasks {
            task.cancel();
        }
    }
}

impl fmt::Debug for ProgressMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressMonitor")
            .field("mode", &self.mode)
            .field("watches", &self.watches.len())
            .finish()
    }
}
