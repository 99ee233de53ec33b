//! The reactor: watcher registry, deferred mutations and the run loop.
//!
//! One iteration of the loop:
//!
//! 1. compute the wait timeout from the caller's bound and the nearest
//!    timer deadline,
//! 2. wait on the platform,
//! 3. invoke the callback of every armed watcher a record resolves to, in
//!    the order the platform returned them,
//! 4. apply the actions callbacks queued, first in first out,
//! 5. fire expired timers (then apply what their callbacks queued).
//!
//! Watchers live in a slab; a slot freed by unregistration is only returned
//! to the slab between cycles, so a record collected in a cycle can never
//! reach a watcher registered later in that cycle.

use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use slab::Slab;
use tracing::{debug, trace, warn};

use crate::error::{CallbackFailure, CallbackResult, Error, ErrorReports, FailureReason};
use crate::event::{EventMask, EventRecord};
use crate::options::{RunOptions, RunOutcome};
use crate::platform::{Platform, PlatformLoop, TimerQueue};
use crate::watcher::{Source, TimerSpec, Watcher, WatcherId, WatcherState};

/// A watcher callback. Receives the dispatcher it runs on, so it may
/// register, modify or unregister watchers (its own included).
pub type Callback<P = PlatformLoop> =
    Box<dyn FnMut(&mut Dispatcher<P>, WatcherId, EventMask) -> CallbackResult>;

/// A mutation requested while a cycle was dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingAction {
    /// Arm a freshly registered timer.
    Register(WatcherId),
    /// Push the watcher's current mask and state to the platform.
    Rearm(WatcherId),
    /// Release the watcher's slot.
    Unregister(WatcherId),
}

/// Single-threaded reactor.
///
/// Not `Clone`, not `Send`: one dispatcher per thread, driven by that
/// thread. Callbacks must not block; a blocking callback stalls every other
/// watcher.
pub struct Dispatcher<P: Platform = PlatformLoop> {
    platform: P,
    registry: Slab<Watcher<Callback<P>>>,
    timers: TimerQueue,
    pending: VecDeque<PendingAction>,
    /// Reused wait buffer.
    records: Vec<EventRecord>,
    /// Reused timer expiry buffer.
    expired: Vec<(WatcherId, Instant)>,
    next_serial: u64,
    /// True while callbacks of a cycle are being invoked.
    dispatching: bool,
    running: bool,
    stop_requested: bool,
    reports: ErrorReports,
}

impl Dispatcher<PlatformLoop> {
    /// Create a dispatcher on the default OS backend.
    pub fn new() -> Result<Self, Error> {
        Self::create()
    }
}

impl<P: Platform> Dispatcher<P> {
    /// Create a dispatcher, acquiring a fresh backend.
    pub fn create() -> Result<Self, Error> {
        P::create().map(Self::with_platform)
    }

    pub fn with_platform(platform: P) -> Self {
        Dispatcher {
            platform,
            registry: Slab::new(),
            timers: TimerQueue::new(),
            pending: VecDeque::new(),
            records: Vec::new(),
            expired: Vec::new(),
            next_serial: 1,
            dispatching: false,
            running: false,
            stop_requested: false,
            reports: ErrorReports::new(),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Channel on which isolated callback failures are reported.
    pub fn error_reports(&self) -> ErrorReports {
        self.reports.clone()
    }

    // ── Registry ────────────────────────────────────────────────────

    /// Register interest in `source` and return the new watcher's id.
    ///
    /// `mask` is clipped to what the source supports; it must not end up
    /// empty. The watcher starts armed. Called from a callback, the OS
    /// registration happens immediately (so errors reach the caller) but a
    /// timer only starts counting once the current cycle ends.
    pub fn register<F>(
        &mut self,
        source: Source,
        mask: EventMask,
        callback: F,
    ) -> Result<WatcherId, Error>
    where
        F: FnMut(&mut Dispatcher<P>, WatcherId, EventMask) -> CallbackResult + 'static,
    {
        let mask = source.clip(mask)?;
        if mask.is_empty() {
            return Err(Error::InvalidSource(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty interest mask",
            )));
        }

        let entry = self.registry.vacant_entry();
        let id = WatcherId {
            slot: entry.key(),
            serial: self.next_serial,
        };
        if let Some(os_source) = source.os_source() {
            self.platform.register(id.slot, os_source, mask)?;
        }
        self.next_serial += 1;
        let callback: Callback<P> = Box::new(callback);
        entry.insert(Watcher::new(id, source, mask, callback));
        debug!(%id, ?source, ?mask, "watcher registered");

        if let Source::Timer(_) = source {
            self.defer_or_apply(PendingAction::Register(id));
        }
        Ok(id)
    }

    /// Convenience for an I/O watcher.
    pub fn watch_io<F>(&mut self, fd: RawFd, mask: EventMask, callback: F) -> Result<WatcherId, Error>
    where
        F: FnMut(&mut Dispatcher<P>, WatcherId, EventMask) -> CallbackResult + 'static,
    {
        self.register(Source::Io(fd), mask, callback)
    }

    /// Convenience for a timer watcher.
    pub fn watch_timer<F>(&mut self, spec: TimerSpec, callback: F) -> Result<WatcherId, Error>
    where
        F: FnMut(&mut Dispatcher<P>, WatcherId, EventMask) -> CallbackResult + 'static,
    {
        self.register(Source::Timer(spec), EventMask::TIMER, callback)
    }

    /// Convenience for a signal watcher.
    pub fn watch_signal<F>(&mut self, signum: i32, callback: F) -> Result<WatcherId, Error>
    where
        F: FnMut(&mut Dispatcher<P>, WatcherId, EventMask) -> CallbackResult + 'static,
    {
        self.register(Source::Signal(signum), EventMask::SIGNAL, callback)
    }

    /// Destroy a watcher. Returns false if `id` was already destroyed or
    /// never existed; that is not an error.
    ///
    /// The platform stops reporting the source right away and no later
    /// record of the current cycle reaches the callback. The slot itself is
    /// released at the end of the cycle.
    pub fn unregister(&mut self, id: WatcherId) -> bool {
        let Some(watcher) = self.live_mut(id) else {
            return false;
        };
        watcher.destroy();
        let source = watcher.source;
        if let Some(os_source) = source.os_source() {
            self.platform.deregister(id.slot, os_source);
        }
        self.timers.remove(id);
        debug!(%id, "watcher unregistered");
        self.defer_or_apply(PendingAction::Unregister(id));
        true
    }

    /// Replace the interest mask of a live watcher.
    ///
    /// An empty mask disarms the watcher. A non-empty mask leaves the
    /// armed/disarmed state alone; use [`resume`](Self::resume) to re-arm.
    pub fn modify(&mut self, id: WatcherId, mask: EventMask) -> Result<(), Error> {
        let watcher = self.live_mut(id).ok_or(Error::UnknownWatcher(id))?;
        let mask = watcher.source.clip(mask)?;
        let before = (watcher.mask, watcher.state);
        watcher.mask = mask;
        if mask.is_empty() {
            watcher.disarm();
        }
        if (watcher.mask, watcher.state) != before {
            trace!(%id, ?mask, "watcher modified");
            self.defer_or_apply(PendingAction::Rearm(id));
        }
        Ok(())
    }

    /// `Armed → Disarmed`. A no-op for an already disarmed watcher.
    pub fn pause(&mut self, id: WatcherId) -> Result<(), Error> {
        let watcher = self.live_mut(id).ok_or(Error::UnknownWatcher(id))?;
        if watcher.disarm() {
            self.defer_or_apply(PendingAction::Rearm(id));
        }
        Ok(())
    }

    /// `Disarmed → Armed`. A no-op for an already armed watcher. A timer
    /// restarts its schedule from now.
    pub fn resume(&mut self, id: WatcherId) -> Result<(), Error> {
        let watcher = self.live_mut(id).ok_or(Error::UnknownWatcher(id))?;
        if watcher.mask.is_empty() {
            return Err(Error::InvalidSource(io::Error::new(
                io::ErrorKind::InvalidInput,
                "watcher has an empty interest mask",
            )));
        }
        if watcher.arm() {
            self.defer_or_apply(PendingAction::Rearm(id));
        }
        Ok(())
    }

    /// Replace a timer's schedule. An armed timer restarts from now.
    pub fn update_timer(&mut self, id: WatcherId, spec: TimerSpec) -> Result<(), Error> {
        let watcher = self.live_mut(id).ok_or(Error::UnknownWatcher(id))?;
        let Source::Timer(_) = watcher.source else {
            return Err(Error::InvalidSource(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a timer watcher",
            )));
        };
        watcher.source = Source::Timer(spec);
        if watcher.is_armed() {
            self.defer_or_apply(PendingAction::Rearm(id));
        }
        Ok(())
    }

    /// State of `id`, `None` once its slot was released.
    pub fn state(&self, id: WatcherId) -> Option<WatcherState> {
        self.get(id).map(|watcher| watcher.state)
    }

    /// Interest mask of a live watcher.
    pub fn mask(&self, id: WatcherId) -> Option<EventMask> {
        self.get(id)
            .filter(|watcher| watcher.is_live())
            .map(|watcher| watcher.mask)
    }

    /// Next expiry of an armed timer watcher.
    pub fn deadline(&self, id: WatcherId) -> Option<Instant> {
        self.timers.deadline(id)
    }

    pub fn contains(&self, id: WatcherId) -> bool {
        self.get(id).is_some_and(|watcher| watcher.is_live())
    }

    /// Number of live watchers.
    pub fn len(&self) -> usize {
        self.registry.iter().filter(|(_, w)| w.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when nothing is armed and nothing is queued.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && !self.registry.iter().any(|(_, w)| w.is_armed())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn get(&self, id: WatcherId) -> Option<&Watcher<Callback<P>>> {
        self.registry.get(id.slot).filter(|watcher| watcher.id == id)
    }

    fn live_mut(&mut self, id: WatcherId) -> Option<&mut Watcher<Callback<P>>> {
        self.registry
            .get_mut(id.slot)
            .filter(|watcher| watcher.id == id && watcher.is_live())
    }

    // ── Deferred actions ────────────────────────────────────────────

    fn defer_or_apply(&mut self, action: PendingAction) {
        if self.dispatching {
            self.pending.push_back(action);
        } else {
            self.apply(action);
        }
    }

    fn apply_pending(&mut self) {
        while let Some(action) = self.pending.pop_front() {
            self.apply(action);
        }
    }

    fn apply(&mut self, action: PendingAction) {
        match action {
            PendingAction::Register(id) | PendingAction::Rearm(id) => self.sync(id),
            PendingAction::Unregister(id) => self.release_slot(id),
        }
    }

    /// Bring the platform and the timer queue in line with the watcher.
    fn sync(&mut self, id: WatcherId) {
        let Some(watcher) = self.get(id).filter(|watcher| watcher.is_live()) else {
            return;
        };
        let armed = watcher.is_armed();
        let mask = watcher.effective_mask();
        let source = watcher.source;
        match source {
            Source::Timer(spec) => {
                if armed {
                    self.timers.insert(id, Instant::now() + spec.after);
                } else {
                    self.timers.remove(id);
                }
            }
            source => {
                let Some(os_source) = source.os_source() else {
                    return;
                };
                if let Err(e) = self.platform.modify(id.slot, os_source, mask) {
                    warn!(%id, error = %e, "deferred platform update failed");
                    self.unregister(id);
                    self.reports.report(CallbackFailure {
                        watcher: id,
                        reason: FailureReason::Platform(e),
                    });
                }
            }
        }
    }

    fn release_slot(&mut self, id: WatcherId) {
        if self.get(id).is_some_and(|watcher| !watcher.is_live()) {
            self.registry.remove(id.slot);
            trace!(%id, "slot released");
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Resolve one record and invoke the watcher if it is armed. Records
    /// for watchers disarmed or destroyed earlier in the cycle are dropped.
    fn dispatch(&mut self, record: EventRecord) {
        let Some(watcher) = self.registry.get(record.key) else {
            trace!(key = record.key, "event for empty slot dropped");
            return;
        };
        if !watcher.is_armed() {
            trace!(id = %watcher.id, state = ?watcher.state, "event for inactive watcher dropped");
            return;
        }
        let observed = record.mask & (watcher.mask | EventMask::CONDITIONS);
        if observed.is_empty() {
            return;
        }
        let id = watcher.id;
        self.invoke(id, observed);
    }

    /// Run a callback with failures isolated to it.
    fn invoke(&mut self, id: WatcherId, mask: EventMask) {
        let Some(mut callback) = self
            .registry
            .get_mut(id.slot)
            .filter(|watcher| watcher.id == id)
            .and_then(|watcher| watcher.callback.take())
        else {
            return;
        };

        trace!(%id, ?mask, "invoking callback");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(self, id, mask)));

        if let Some(watcher) = self.registry.get_mut(id.slot) {
            if watcher.id == id {
                watcher.callback = Some(callback);
            }
        }

        let reason = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => FailureReason::Returned(e),
            Err(payload) => FailureReason::Panicked(panic_message(payload)),
        };
        warn!(%id, ?reason, "watcher callback failed");
        self.reports.report(CallbackFailure { watcher: id, reason });
    }

    fn fire_timers(&mut self) {
        let mut expired = std::mem::take(&mut self.expired);
        expired.clear();
        self.timers.expire(Instant::now(), &mut expired);
        if expired.is_empty() {
            self.expired = expired;
            return;
        }

        self.dispatching = true;
        for &(id, deadline) in &expired {
            let Some(watcher) = self
                .registry
                .get_mut(id.slot)
                .filter(|watcher| watcher.id == id && watcher.is_armed())
            else {
                continue;
            };
            let Source::Timer(spec) = watcher.source else {
                continue;
            };
            match spec.repeat {
                // Scheduled from the previous deadline, not from now, so
                // wait latency never accumulates.
                Some(interval) => self.timers.insert(id, deadline + interval),
                None => {
                    watcher.disarm();
                }
            }
            self.invoke(id, EventMask::TIMER);
        }
        self.dispatching = false;
        self.apply_pending();
        self.expired = expired;
    }

    /// One loop iteration.
    fn turn(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        let timeout = match (timeout, self.timers.next_timeout(Instant::now())) {
            (None, None) => None,
            (Some(t), None) | (None, Some(t)) => Some(t),
            (Some(a), Some(b)) => Some(a.min(b)),
        };

        let mut records = std::mem::take(&mut self.records);
        records.clear();
        if let Err(e) = self.platform.wait(timeout, &mut records) {
            self.records = records;
            return Err(e);
        }

        self.dispatching = true;
        for &record in &records {
            self.dispatch(record);
        }
        self.dispatching = false;
        self.apply_pending();
        self.records = records;

        self.fire_timers();
        Ok(())
    }

    // ── Running ─────────────────────────────────────────────────────

    /// Drive the loop until `options` says to stop, a callback calls
    /// [`stop`](Self::stop), or nothing is left armed.
    ///
    /// Only [`Error::PlatformLoopInvalid`] ends the loop with an error;
    /// callback failures go to [`error_reports`](Self::error_reports).
    pub fn run(&mut self, options: &RunOptions) -> Result<RunOutcome, Error> {
        if self.running {
            return Err(Error::Reentrant);
        }
        self.running = true;
        self.stop_requested = false;
        let result = self.run_loop(options);
        self.running = false;
        result
    }

    fn run_loop(&mut self, options: &RunOptions) -> Result<RunOutcome, Error> {
        let mut iterations = 0usize;
        loop {
            if self.stop_requested {
                self.stop_requested = false;
                debug!(iterations, "run stopped");
                return Ok(RunOutcome::Stopped);
            }
            // With nothing armed, no wait can end early. Keep turning only
            // when both a timeout and an iteration budget bound the loop.
            let bounded = options.timeout.is_some() && options.max_iterations.is_some();
            if (options.run_until_idle || !bounded) && self.is_idle() {
                debug!(iterations, "run idle");
                return Ok(RunOutcome::Idle);
            }
            if options.max_iterations.is_some_and(|max| iterations >= max) {
                return Ok(RunOutcome::IterationsExhausted);
            }
            self.turn(options.timeout)?;
            iterations += 1;
        }
    }

    /// Run exactly one iteration, blocking for at most `timeout` (bounded
    /// further by the nearest timer).
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        if self.running {
            return Err(Error::Reentrant);
        }
        self.running = true;
        let result = self.turn(timeout);
        self.running = false;
        result
    }

    /// Ask a running loop to return after the current iteration. Ignored
    /// when the loop is not running.
    pub fn stop(&mut self) {
        if self.running {
            self.stop_requested = true;
        }
    }

    /// Destroy every watcher, delivering [`EventMask::CLEANUP`] once to
    /// each one that was live. Watchers registered by those callbacks are
    /// dropped without notification.
    ///
    /// Fails with [`Error::Reentrant`] while the loop is running.
    pub fn release(&mut self) -> Result<(), Error> {
        if self.running || self.dispatching {
            return Err(Error::Reentrant);
        }
        let live: Vec<WatcherId> = self
            .registry
            .iter()
            .filter(|(_, w)| w.is_live())
            .map(|(_, w)| w.id)
            .collect();

        self.dispatching = true;
        for &id in &live {
            self.unregister(id);
        }
        for &id in &live {
            self.invoke(id, EventMask::CLEANUP);
        }
        self.dispatching = false;
        self.pending.clear();

        for watcher in self.registry.drain() {
            if watcher.is_live() {
                if let Some(os_source) = watcher.source.os_source() {
                    self.platform.deregister(watcher.id.slot, os_source);
                }
            }
        }
        self.timers = TimerQueue::new();
        debug!(released = live.len(), "dispatcher released");
        Ok(())
    }
}

impl<P: Platform> Drop for Dispatcher<P> {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
