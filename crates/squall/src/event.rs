//! Event masks and normalized event records.

use bitflags::bitflags;

bitflags! {
    /// Set of interest / readiness flags.
    ///
    /// The same type describes what a watcher asks for and what the platform
    /// observed. `ERROR` and `HANG_UP` are only ever observed; `CLEANUP` is
    /// delivered once to every watcher when its dispatcher is released.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventMask: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const TIMER = 1 << 2;
        const SIGNAL = 1 << 3;
        const ERROR = 1 << 4;
        const HANG_UP = 1 << 5;
        const CLEANUP = 1 << 6;
    }
}

impl EventMask {
    /// Interest flags an I/O source can be registered for.
    pub const IO: EventMask = EventMask::READABLE.union(EventMask::WRITABLE);

    /// Conditions reported by the OS whether or not they were requested.
    pub const CONDITIONS: EventMask = EventMask::ERROR.union(EventMask::HANG_UP);

    /// Returns true if the read flag is set.
    pub fn is_readable(self) -> bool {
        self.contains(EventMask::READABLE)
    }

    /// Returns true if the write flag is set.
    pub fn is_writable(self) -> bool {
        self.contains(EventMask::WRITABLE)
    }
}

/// One normalized readiness notification produced by a platform wait.
///
/// `key` is the registration key the source was registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub key: usize,
    pub mask: EventMask,
}

impl EventRecord {
    pub fn new(key: usize, mask: EventMask) -> Self {
        EventRecord { key, mask }
    }
}
