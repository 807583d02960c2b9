//! Order-preserving queues buffering work between the caller and the driver.
//!
//! The SendQueue owns descriptors awaiting flush; the RecvQueue owns
//! callbacks awaiting an incoming descriptor. Both hand out their entries
//! strictly in arrival order, and both know how to fail everything they hold
//! during teardown.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::error::PasserError;

/// Completion callback for a queued send: invoked once, after the kernel
/// send completed and the source descriptor was closed, or with the failure
/// that abandoned the entry.
pub type SendCompletion = Box<dyn FnOnce(Result<(), PasserError>) + Send + 'static>;

/// Delivery callback for a queued receive: invoked exactly once, with an
/// owned descriptor or with the failure that ended the passer.
pub type RecvDelivery = Box<dyn FnOnce(Result<OwnedFd, PasserError>) + Send + 'static>;

/// Why queued work is being failed wholesale.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FailReason {
    /// Local teardown (explicit shutdown or fatal transport error).
    ShutDown,
    /// The peer closed its endpoint.
    Closed,
}

impl FailReason {
    fn to_error(self) -> PasserError {
        match self {
            FailReason::ShutDown => PasserError::ShutDown,
            FailReason::Closed => PasserError::Closed,
        }
    }
}

struct SendEntry {
    fd: OwnedFd,
    done: Option<SendCompletion>,
}

/// FIFO of descriptors awaiting transmission.
pub(crate) struct SendQueue {
    entries: VecDeque<SendEntry>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Append an entry. The queue owns `fd` from here on.
    pub fn push(&mut self, fd: OwnedFd, done: Option<SendCompletion>) {
        self.entries.push_back(SendEntry { fd, done });
    }

    /// The next descriptor to transmit, if any.
    pub fn head_fd(&self) -> Option<RawFd> {
        self.entries.front().map(|e| e.fd.as_raw_fd())
    }

    /// The head was transmitted: close its source descriptor and invoke its
    /// completion.
    pub fn complete_head(&mut self) {
        if let Some(entry) = self.entries.pop_front() {
            drop(entry.fd);
            if let Some(done) = entry.done {
                done(Ok(()));
            }
        }
    }

    /// Abandon the head: close its descriptor and fail its completion.
    pub fn fail_head(&mut self, reason: FailReason) {
        if let Some(entry) = self.entries.pop_front() {
            drop(entry.fd);
            if let Some(done) = entry.done {
                done(Err(reason.to_error()));
            }
        }
    }

    /// Abandon everything still queued.
    pub fn fail_all(&mut self, reason: FailReason) {
        while !self.entries.is_empty() {
            self.fail_head(reason);
        }
    }
}

/// FIFO of delivery callbacks awaiting an incoming descriptor.
pub(crate) struct RecvQueue {
    waiters: VecDeque<RecvDelivery>,
}

impl RecvQueue {
    pub fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn push(&mut self, deliver: RecvDelivery) {
        self.waiters.push_back(deliver);
    }

    pub fn pop(&mut self) -> Option<RecvDelivery> {
        self.waiters.pop_front()
    }

    /// Notify every pending waiter of the failure.
    pub fn fail_all(&mut self, reason: FailReason) {
        while let Some(deliver) = self.waiters.pop_front() {
            deliver(Err(reason.to_error()));
        }
    }
}
