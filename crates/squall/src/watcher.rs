//! Watcher identities, event sources and the arm/disarm state machine.

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::Error;
use crate::event::EventMask;
use crate::platform::OsSource;

/// Opaque handle to a registered watcher.
///
/// `slot` indexes the dispatcher's arena and doubles as the platform key.
/// `serial` is unique for the dispatcher's lifetime, so a handle kept after
/// its watcher was destroyed never resolves to a newer watcher reusing the
/// same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId {
    pub(crate) slot: usize,
    pub(crate) serial: u64,
}

impl WatcherId {
    /// The per-dispatcher unique serial number of this watcher.
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watcher#{}@{}", self.serial, self.slot)
    }
}

/// Lifecycle of a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Eligible to receive events.
    Armed,
    /// Excluded from polling; resources still held.
    Disarmed,
    /// Terminal. Resources are released at the end of the current cycle.
    Destroyed,
}

/// Timer schedule: first expiry `after` the arming instant, then every
/// `repeat` if set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSpec {
    pub after: Duration,
    pub repeat: Option<Duration>,
}

impl TimerSpec {
    pub fn new(after: Duration, repeat: Option<Duration>) -> Self {
        TimerSpec {
            after,
            repeat: repeat.filter(|interval| !interval.is_zero()),
        }
    }

    /// Fires once, `after` from now.
    pub fn once(after: Duration) -> Self {
        TimerSpec::new(after, None)
    }

    /// Fires every `interval`, first expiry one interval from now.
    pub fn repeating(interval: Duration) -> Self {
        TimerSpec::new(interval, Some(interval))
    }
}

/// What a watcher watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// A file descriptor (socket, pipe, eventfd, ...). The caller keeps
    /// ownership and must unregister before closing it.
    ///
    /// The descriptor number stays reserved until the watcher is
    /// unregistered: a descriptor closed while still watched and then
    /// reused by the OS fails to register with
    /// [`Error::AlreadyRegistered`](crate::Error::AlreadyRegistered).
    Io(RawFd),
    Timer(TimerSpec),
    /// A POSIX signal number.
    Signal(i32),
}

impl Source {
    /// Flags this kind of source can be armed for.
    pub fn supported(&self) -> EventMask {
        match self {
            Source::Io(_) => EventMask::IO,
            Source::Timer(_) => EventMask::TIMER,
            Source::Signal(_) => EventMask::SIGNAL,
        }
    }

    /// Clip `requested` to what this source supports.
    ///
    /// A non-empty request that shares nothing with the supported set is
    /// rejected; an empty request stays empty (disarm).
    pub(crate) fn clip(&self, requested: EventMask) -> Result<EventMask, Error> {
        let mask = requested & self.supported();
        if mask.is_empty() && !requested.is_empty() {
            return Err(Error::InvalidSource(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{requested:?} is not supported by {self:?}"),
            )));
        }
        Ok(mask)
    }

    /// The OS-level source to hand to the platform, if any.
    pub(crate) fn os_source(&self) -> Option<OsSource> {
        match *self {
            Source::Io(fd) => Some(OsSource::Fd(fd)),
            Source::Signal(signum) => Some(OsSource::Signal(signum)),
            Source::Timer(_) => None,
        }
    }
}

/// One registry entry. Owned by the dispatcher's arena; client code only
/// ever sees the [`WatcherId`].
pub(crate) struct Watcher<C> {
    pub(crate) id: WatcherId,
    pub(crate) source: Source,
    pub(crate) mask: EventMask,
    pub(crate) state: WatcherState,
    /// Taken out while the callback runs.
    pub(crate) callback: Option<C>,
}

impl<C> Watcher<C> {
    pub(crate) fn new(id: WatcherId, source: Source, mask: EventMask, callback: C) -> Self {
        Watcher {
            id,
            source,
            mask,
            state: WatcherState::Armed,
            callback: Some(callback),
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.state == WatcherState::Armed
    }

    pub(crate) fn is_live(&self) -> bool {
        self.state != WatcherState::Destroyed
    }

    /// Mask the platform should poll for: empty unless armed.
    pub(crate) fn effective_mask(&self) -> EventMask {
        if self.is_armed() {
            self.mask
        } else {
            EventMask::empty()
        }
    }

    /// `Armed → Disarmed`. Returns false if the watcher was not armed.
    pub(crate) fn disarm(&mut self) -> bool {
        if self.state != WatcherState::Armed {
            return false;
        }
        self.state = WatcherState::Disarmed;
        true
    }

    /// `Disarmed → Armed`. Returns false if the watcher was not disarmed or
    /// has nothing to arm for.
    pub(crate) fn arm(&mut self) -> bool {
        if self.state != WatcherState::Disarmed || self.mask.is_empty() {
            return false;
        }
        self.state = WatcherState::Armed;
        true
    }

    /// `* → Destroyed`. Returns false if already destroyed.
    pub(crate) fn destroy(&mut self) -> bool {
        if self.state == WatcherState::Destroyed {
            return false;
        }
        self.state = WatcherState::Destroyed;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watcher(source: Source, mask: EventMask) -> Watcher<()> {
        Watcher::new(WatcherId { slot: 0, serial: 1 }, source, mask, ())
    }

    #[test]
    fn clip_keeps_supported_bits() {
        let mask = Source::Io(3)
            .clip(EventMask::READABLE | EventMask::TIMER)
            .unwrap();
        assert_eq!(mask, EventMask::READABLE);
    }

    #[test]
    fn clip_rejects_foreign_mask() {
        let err = Source::Signal(2).clip(EventMask::READABLE).unwrap_err();
        assert!(matches!(err, Error::InvalidSource(_)));
    }

    #[test]
    fn clip_allows_empty_request() {
        assert!(Source::Io(3).clip(EventMask::empty()).unwrap().is_empty());
    }

    #[test]
    fn zero_repeat_is_one_shot() {
        let spec = TimerSpec::new(Duration::from_millis(5), Some(Duration::ZERO));
        assert_eq!(spec.repeat, None);
        assert_eq!(TimerSpec::repeating(Duration::from_millis(5)).after, Duration::from_millis(5));
    }

    #[test]
    fn state_machine_transitions() {
        let mut w = watcher(Source::Io(3), EventMask::READABLE);
        assert!(w.is_armed());
        assert!(!w.arm());
        assert!(w.disarm());
        assert_eq!(w.effective_mask(), EventMask::empty());
        assert!(!w.disarm());
        assert!(w.arm());
        assert_eq!(w.effective_mask(), EventMask::READABLE);
        assert!(w.destroy());
        assert!(!w.destroy());
        assert!(!w.arm());
        assert!(!w.is_live());
    }

    #[test]
    fn empty_mask_cannot_arm() {
        let mut w = watcher(Source::Io(3), EventMask::READABLE);
        w.disarm();
        w.mask = EventMask::empty();
        assert!(!w.arm());
    }
}
