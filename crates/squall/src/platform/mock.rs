//! Crate-local test-only backend with scripted readiness.
//!
//! Tests queue whole wait results with [`MockPlatform::push_batch`]; each
//! `wait` pops one batch and delivers its records in the queued order, which
//! real pollers do not let a test control.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::Duration;

use super::{OsSource, Platform};
use crate::error::Error;
use crate::event::{EventMask, EventRecord};

#[derive(Default)]
pub(crate) struct MockPlatform {
    batches: VecDeque<Vec<EventRecord>>,
    pub(crate) registrations: HashMap<usize, (OsSource, EventMask)>,
    pub(crate) waits: usize,
    pub(crate) timeouts: Vec<Option<Duration>>,
    fail_next_wait: bool,
    fail_next_modify: bool,
}

impl MockPlatform {
    pub(crate) fn push_batch(&mut self, records: Vec<EventRecord>) {
        self.batches.push_back(records);
    }

    pub(crate) fn fail_next_wait(&mut self) {
        self.fail_next_wait = true;
    }

    pub(crate) fn fail_next_modify(&mut self) {
        self.fail_next_modify = true;
    }

    pub(crate) fn interest(&self, key: usize) -> Option<EventMask> {
        self.registrations.get(&key).map(|&(_, mask)| mask)
    }
}

impl Platform for MockPlatform {
    fn create() -> Result<Self, Error> {
        Ok(Self::default())
    }

    fn register(&mut self, key: usize, source: OsSource, mask: EventMask) -> Result<(), Error> {
        if let OsSource::Fd(fd) = source {
            if fd < 0 {
                return Err(Error::InvalidSource(io::Error::from_raw_os_error(
                    libc::EBADF,
                )));
            }
        }
        if self.registrations.values().any(|&(s, _)| s == source) {
            return Err(Error::AlreadyRegistered);
        }
        self.registrations.insert(key, (source, mask));
        Ok(())
    }

    fn modify(&mut self, key: usize, source: OsSource, mask: EventMask) -> Result<(), Error> {
        if std::mem::take(&mut self.fail_next_modify) {
            return Err(Error::InvalidSource(io::Error::from_raw_os_error(
                libc::EBADF,
            )));
        }
        match self.registrations.get_mut(&key) {
            Some(entry) if entry.0 == source => {
                entry.1 = mask;
                Ok(())
            }
            _ => Err(Error::InvalidSource(io::Error::from_raw_os_error(
                libc::ENOENT,
            ))),
        }
    }

    fn deregister(&mut self, key: usize, _source: OsSource) {
        self.registrations.remove(&key);
    }

    fn wait(
        &mut self,
        timeout: Option<Duration>,
        records: &mut Vec<EventRecord>,
    ) -> Result<(), Error> {
        self.waits += 1;
        self.timeouts.push(timeout);
        if std::mem::take(&mut self.fail_next_wait) {
            return Err(Error::PlatformLoopInvalid(io::Error::from_raw_os_error(
                libc::EBADF,
            )));
        }
        let Some(batch) = self.batches.pop_front() else {
            if let Some(timeout) = timeout {
                std::thread::sleep(timeout);
            }
            return Ok(());
        };
        // Mirror the OS: only sources with live interest are reported.
        records.extend(batch.into_iter().filter(|record| {
            self.registrations
                .get(&record.key)
                .is_some_and(|&(_, interest)| {
                    interest.intersects(record.mask)
                        || record.mask.intersects(EventMask::CONDITIONS)
                })
        }));
        Ok(())
    }
}
