//! Mailboxes.
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use crossbeam_queue::SegQueue;

use crate::{receiver::Dispatcher, Message};

struct PortInner {
    queue: SegQueue<Message>,
    receiver: Mutex<Option<Weak<Dispatcher>>>,
}

/// An unbounded, multi-producer mailbox of messages.
///
/// A port is bound to at most one [`Receiver`][crate::Receiver] at a time. Posting never blocks: the message is
/// appended to the queue and the bound receiver, if any, is woken up. Messages posted while no receiver is bound are
/// retained, and delivered once one binds. Ports can also be polled directly with [`pop`][Self::pop].
///
/// `Port` is a cheap, cloneable handle. The port holds only a weak reference to its receiver.
#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

impl Port {
    /// Creates a new, empty port.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PortInner {
                queue: SegQueue::new(),
                receiver: Mutex::new(None),
            }),
        }
    }

    /// Posts a message to the port.
    pub fn post(&self, message: Message) {
        self.inner.queue.push(message);
        if let Some(dispatcher) = self.bound() {
            dispatcher.notify();
        }
    }

    /// Removes the oldest message from the port, if any.
    pub fn pop(&self) -> Option<Message> {
        self.inner.queue.pop()
    }

    /// Returns the number of messages waiting in the port.
    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Returns `true` if no messages are waiting in the port.
    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    /// Returns `true` if a live receiver is bound to this port.
    pub fn has_receiver(&self) -> bool {
        self.bound().is_some()
    }

    /// Returns `true` if both handles refer to the same port.
    pub fn same_port(&self, other: &Port) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn bound(&self) -> Option<Arc<Dispatcher>> {
        self.inner
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Binds the dispatcher to this port and wakes it up if messages are already waiting.
    ///
    /// # Panics
    ///
    /// Panics if another live receiver is already bound.
    pub(crate) fn bind(&self, dispatcher: &Arc<Dispatcher>) {
        {
            let mut receiver = self.inner.receiver.lock().unwrap_or_else(PoisonError::into_inner);
            if receiver.as_ref().is_some_and(|existing| existing.strong_count() > 0) {
                panic!("port is already owned by another receiver");
            }
            *receiver = Some(Arc::downgrade(dispatcher));
        }

        if !self.is_empty() {
            dispatcher.notify();
        }
    }

    /// Unbinds the given dispatcher, if it is the one bound to this port.
    pub(crate) fn unbind(&self, dispatcher: &Dispatcher) {
        let mut receiver = self.inner.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        if receiver
            .as_ref()
            .is_some_and(|existing| std::ptr::eq(existing.as_ptr(), dispatcher))
        {
            *receiver = None;
        }
    }
}

impl Default for Port {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("len", &self.len())
            .field("has_receiver", &self.has_receiver())
            .finish()
    }
}
