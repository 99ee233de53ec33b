//! Platform backends.
//!
//! A backend wraps exactly one OS notification handle behind five
//! operations. The dispatcher is generic over the backend, so the choice is
//! made at compile time and the hot path has no virtual dispatch. Adding an
//! OS means implementing [`Platform`] and nothing else.
//!
//! Timers are not OS sources here: deadlines are kept in a [`TimerQueue`]
//! next to the backend and only bound the time passed to [`Platform::wait`].

pub mod poller;
pub mod timers;

#[cfg(test)]
pub(crate) mod mock;

use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::Error;
use crate::event::{EventMask, EventRecord};

pub use poller::PlatformLoop;
pub use timers::TimerQueue;

/// An OS-level event source as seen by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsSource {
    Fd(RawFd),
    Signal(i32),
}

/// The five-operation backend contract.
///
/// `key` identifies a registration; every [`EventRecord`] produced by
/// [`wait`](Platform::wait) carries the key of the source it reports on.
pub trait Platform: Sized {
    /// Acquire the OS notification handle.
    fn create() -> Result<Self, Error>;

    /// Start watching `source` for `mask`. An empty mask registers the
    /// source without interest.
    fn register(&mut self, key: usize, source: OsSource, mask: EventMask) -> Result<(), Error>;

    /// Replace the interest of an existing registration. Once this returns,
    /// no record for the old mask is produced by a later `wait`.
    fn modify(&mut self, key: usize, source: OsSource, mask: EventMask) -> Result<(), Error>;

    /// Stop watching `source`. Tolerates descriptors the caller already
    /// closed.
    fn deregister(&mut self, key: usize, source: OsSource);

    /// Block for at most `timeout` (forever if `None`, not at all if zero)
    /// and append the observed records to `records`.
    fn wait(&mut self, timeout: Option<Duration>, records: &mut Vec<EventRecord>)
        -> Result<(), Error>;
}
