//! The default backend: `polling` for descriptor readiness, `signal-hook`
//! self-pipes for signal delivery.
//!
//! Sources are added in one-shot mode and re-armed with `modify()` after each
//! report, which gives persistent registrations on every OS `polling`
//! supports (epoll, kqueue, event ports, IOCP, poll).

use std::collections::HashMap;
use std::io::{self, Read};
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use polling::{Event, Events, Poller};
use signal_hook::low_level::pipe;
use signal_hook::SigId;
use tracing::{debug, error, trace};

use super::{OsSource, Platform};
use crate::error::Error;
use crate::event::{EventMask, EventRecord};

const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Read end of a signal self-pipe; the write end belongs to the signal
/// handler installed by `signal-hook`.
struct SignalPipe {
    reader: UnixStream,
    sig_id: SigId,
}

impl SignalPipe {
    fn open(signum: i32) -> Result<Self, Error> {
        if signum <= 0 || signal_hook::consts::FORBIDDEN.contains(&signum) {
            return Err(Error::InvalidSource(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("signal {signum} cannot be watched"),
            )));
        }
        let (reader, writer) = UnixStream::pair().map_err(Error::from_registration)?;
        reader.set_nonblocking(true).map_err(Error::from_registration)?;
        let sig_id = pipe::register(signum, writer).map_err(Error::InvalidSource)?;
        Ok(SignalPipe { reader, sig_id })
    }

    /// Swallow every pending wakeup byte. The count is meaningless: POSIX
    /// coalesces repeated deliveries of the same signal.
    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    fn close(self) {
        signal_hook::low_level::unregister(self.sig_id);
    }
}

/// One live OS registration.
struct Registration {
    source: OsSource,
    /// Descriptor handed to the poller: the source itself or the read end
    /// of its signal pipe.
    fd: RawFd,
    interest: Event,
    signal: Option<SignalPipe>,
}

impl Registration {
    fn borrowed(&self) -> BorrowedFd<'_> {
        // The descriptor is either owned by `signal` or guaranteed open by
        // the caller until deregistration.
        unsafe { BorrowedFd::borrow_raw(self.fd) }
    }
}

/// Builds the poller interest for `key`. HANG_UP/ERROR are always
/// reported by the OS and need no interest.
fn interest(key: usize, source: OsSource, mask: EventMask) -> Event {
    match source {
        OsSource::Fd(_) => Event::new(key, mask.is_readable(), mask.is_writable()),
        OsSource::Signal(_) => Event::new(key, mask.contains(EventMask::SIGNAL), false),
    }
}

fn unknown_registration() -> Error {
    Error::InvalidSource(io::Error::from_raw_os_error(libc::ENOENT))
}

fn has_interest(event: &Event) -> bool {
    event.readable || event.writable
}

/// OS notification handle plus the bookkeeping needed to translate raw
/// readiness into [`EventRecord`]s.
pub struct PlatformLoop {
    poller: Poller,
    events: Events,
    registrations: HashMap<usize, Registration>,
    /// Registered descriptors, for duplicate detection.
    fds: HashMap<RawFd, usize>,
    /// Registered signal numbers, for duplicate detection.
    signals: HashMap<i32, usize>,
}

impl PlatformLoop {
    /// Create a backend whose event buffer holds up to `capacity` reports
    /// per wait.
    pub fn with_capacity(capacity: usize) -> Result<Self, Error> {
        let poller = Poller::new().map_err(Error::from_create)?;
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        debug!(capacity, "platform loop created");
        Ok(PlatformLoop {
            poller,
            events: Events::with_capacity(capacity),
            registrations: HashMap::new(),
            fds: HashMap::new(),
            signals: HashMap::new(),
        })
    }

    /// Number of live OS registrations.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    fn register_fd(&mut self, key: usize, fd: RawFd, mask: EventMask) -> Result<(), Error> {
        if fd < 0 {
            return Err(Error::InvalidSource(io::Error::from_raw_os_error(
                libc::EBADF,
            )));
        }
        if self.fds.contains_key(&fd) {
            return Err(Error::AlreadyRegistered);
        }
        let source = OsSource::Fd(fd);
        let interest = interest(key, source, mask);
        // SAFETY: the caller keeps `fd` open until it is deregistered.
        unsafe { self.poller.add(fd, interest) }.map_err(Error::from_registration)?;
        self.fds.insert(fd, key);
        self.registrations.insert(
            key,
            Registration {
                source,
                fd,
                interest,
                signal: None,
            },
        );
        Ok(())
    }

    fn register_signal(&mut self, key: usize, signum: i32, mask: EventMask) -> Result<(), Error> {
        if self.signals.contains_key(&signum) {
            return Err(Error::AlreadyRegistered);
        }
        let pipe = SignalPipe::open(signum)?;
        let fd = pipe.reader.as_raw_fd();
        let source = OsSource::Signal(signum);
        let interest = interest(key, source, mask);
        // SAFETY: the reader is owned by the registration and deleted from
        // the poller before it is dropped.
        if let Err(e) = unsafe { self.poller.add(fd, interest) } {
            pipe.close();
            return Err(Error::from_registration(e));
        }
        self.signals.insert(signum, key);
        self.registrations.insert(
            key,
            Registration {
                source,
                fd,
                interest,
                signal: Some(pipe),
            },
        );
        Ok(())
    }

    fn observed(event: &Event, reg: &Registration) -> EventMask {
        if let Some(pipe) = &reg.signal {
            pipe.drain();
            return EventMask::SIGNAL;
        }
        let mut mask = EventMask::empty();
        if event.readable {
            mask |= EventMask::READABLE;
        }
        if event.writable {
            mask |= EventMask::WRITABLE;
        }
        if event.is_interrupt() {
            mask |= EventMask::HANG_UP;
        }
        if event.is_err() == Some(true) {
            mask |= EventMask::ERROR;
        }
        mask
    }
}

impl Platform for PlatformLoop {
    fn create() -> Result<Self, Error> {
        Self::with_capacity(DEFAULT_EVENTS_CAPACITY)
    }

    fn register(&mut self, key: usize, source: OsSource, mask: EventMask) -> Result<(), Error> {
        match source {
            OsSource::Fd(fd) => self.register_fd(key, fd, mask)?,
            OsSource::Signal(signum) => self.register_signal(key, signum, mask)?,
        }
        trace!(key, ?source, ?mask, "source registered");
        Ok(())
    }

    fn modify(&mut self, key: usize, source: OsSource, mask: EventMask) -> Result<(), Error> {
        let new_interest = interest(key, source, mask);
        let reg = match self.registrations.get_mut(&key) {
            Some(reg) if reg.source == source => reg,
            _ => return Err(unknown_registration()),
        };
        // Deliveries while there was no interest belong to no one.
        if let Some(pipe) = &reg.signal {
            if !has_interest(&reg.interest) && has_interest(&new_interest) {
                pipe.drain();
            }
        }
        self.poller
            .modify(reg.borrowed(), new_interest)
            .map_err(Error::from_registration)?;
        reg.interest = new_interest;
        trace!(key, ?source, ?mask, "source modified");
        Ok(())
    }

    fn deregister(&mut self, key: usize, source: OsSource) {
        if !matches!(self.registrations.get(&key), Some(reg) if reg.source == source) {
            return;
        }
        let Some(reg) = self.registrations.remove(&key) else {
            return;
        };
        // Ignore errors: the caller may already have closed the descriptor.
        let _ = self.poller.delete(reg.borrowed());
        match reg.source {
            OsSource::Fd(fd) => {
                self.fds.remove(&fd);
            }
            OsSource::Signal(signum) => {
                self.signals.remove(&signum);
            }
        }
        if let Some(pipe) = reg.signal {
            pipe.close();
        }
        trace!(key, ?source, "source deregistered");
    }

    fn wait(
        &mut self,
        timeout: Option<Duration>,
        records: &mut Vec<EventRecord>,
    ) -> Result<(), Error> {
        self.events.clear();
        match self.poller.wait(&mut self.events, timeout) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => {
                error!(error = %e, "platform wait failed");
                return Err(Error::PlatformLoopInvalid(e));
            }
        }

        for event in self.events.iter() {
            let Some(reg) = self.registrations.get(&event.key) else {
                continue;
            };
            let mask = Self::observed(&event, reg);

            // Re-arm the one-shot registration with its current interest.
            if has_interest(&reg.interest) {
                if let Err(e) = self.poller.modify(reg.borrowed(), reg.interest) {
                    trace!(key = event.key, error = %e, "re-arm failed");
                }
            }
            if !mask.is_empty() {
                records.push(EventRecord::new(event.key, mask));
            }
        }
        Ok(())
    }
}

impl Drop for PlatformLoop {
    fn drop(&mut self) {
        for (_, reg) in self.registrations.drain() {
            let _ = self.poller.delete(reg.borrowed());
            if let Some(pipe) = reg.signal {
                pipe.close();
            }
        }
    }
}
