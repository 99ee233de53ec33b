//! Error taxonomy and the callback-failure reporting channel.

use std::io;
use std::sync::Arc;

use concurrent_queue::ConcurrentQueue;
use thiserror::Error;

use crate::watcher::WatcherId;

/// Errors surfaced by the dispatcher and platform backends.
///
/// Everything except [`Error::PlatformLoopInvalid`] is scoped to a single
/// watcher and leaves the loop usable.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    #[error("event source is closed or unsupported: {0}")]
    InvalidSource(#[source] io::Error),
    #[error("event source is already registered")]
    AlreadyRegistered,
    #[error("unknown watcher {0}")]
    UnknownWatcher(WatcherId),
    #[error("platform registration capacity exhausted: {0}")]
    ResourceExhausted(#[source] io::Error),
    #[error("platform notification handle is no longer valid: {0}")]
    PlatformLoopInvalid(#[source] io::Error),
    #[error("dispatcher is already running on this thread")]
    Reentrant,
}

impl Error {
    /// Returns true if the loop cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::PlatformLoopInvalid(_))
    }

    /// Classify an OS error raised while (de)registering a source.
    pub(crate) fn from_registration(err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(libc::EEXIST) => Error::AlreadyRegistered,
            Some(libc::ENOMEM | libc::ENOSPC | libc::EMFILE | libc::ENFILE) => {
                Error::ResourceExhausted(err)
            }
            _ => Error::InvalidSource(err),
        }
    }

    /// Classify an OS error raised while acquiring the notification handle.
    pub(crate) fn from_create(err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(libc::ENOMEM | libc::EMFILE | libc::ENFILE) => Error::ResourceExhausted(err),
            _ => Error::PlatformLoopInvalid(err),
        }
    }
}

/// Error type callbacks may return.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type callbacks return.
pub type CallbackResult = Result<(), CallbackError>;

/// Why a watcher was reported on the error channel.
#[derive(Debug)]
pub enum FailureReason {
    /// The callback returned an error.
    Returned(CallbackError),
    /// The callback panicked; holds the panic message when it was a string.
    Panicked(String),
    /// A deferred platform update for the watcher failed; the watcher was
    /// destroyed.
    Platform(Error),
}

/// A failure isolated to one watcher.
#[derive(Debug)]
pub struct CallbackFailure {
    pub watcher: WatcherId,
    pub reason: FailureReason,
}

/// Receiving side of a dispatcher's error channel.
///
/// Cloning is cheap and every clone drains the same queue. The queue is
/// `Send + Sync`, so a supervisor on another thread may drain it while the
/// dispatcher keeps running.
#[derive(Clone)]
pub struct ErrorReports {
    queue: Arc<ConcurrentQueue<CallbackFailure>>,
}

impl ErrorReports {
    pub(crate) fn new() -> Self {
        ErrorReports {
            queue: Arc::new(ConcurrentQueue::unbounded()),
        }
    }

    pub(crate) fn report(&self, failure: CallbackFailure) {
        // Unbounded and never closed while a dispatcher holds a clone.
        let _ = self.queue.push(failure);
    }

    /// Pop the oldest unread failure.
    pub fn try_recv(&self) -> Option<CallbackFailure> {
        self.queue.pop().ok()
    }

    /// Take every unread failure, oldest first.
    pub fn drain(&self) -> Vec<CallbackFailure> {
        self.queue.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
