//! squall: a single-threaded reactor core.
//!
//! A [`Dispatcher`] multiplexes I/O readiness, timers and POSIX signals
//! behind one callback contract. It is the layer beneath an async runtime,
//! not a runtime itself: no tasks, no futures, no buffering.
//!
//! Callbacks run synchronously on the thread driving [`Dispatcher::run`]
//! and receive the dispatcher, so they may register, modify or unregister
//! watchers (their own included). Such mutations never disturb the cycle in
//! progress: a watcher unregistered mid-cycle receives no further events,
//! and its slot is only recycled once the cycle ends.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use squall::{Dispatcher, EventMask, RunOptions, TimerSpec};
//!
//! let mut dispatcher = Dispatcher::new()?;
//! dispatcher.watch_timer(TimerSpec::once(Duration::from_millis(50)), |_, id, mask| {
//!     assert!(mask.contains(EventMask::TIMER));
//!     println!("{id} fired");
//!     Ok(())
//! })?;
//! dispatcher.run(&RunOptions::until_idle())?;
//! # Ok::<(), squall::Error>(())
//! ```

mod dispatcher;
mod error;
mod event;
mod options;
pub mod platform;
mod watcher;

pub use dispatcher::{Callback, Dispatcher};
pub use error::{CallbackError, CallbackFailure, CallbackResult, Error, ErrorReports, FailureReason};
pub use event::{EventMask, EventRecord};
pub use options::{RunOptions, RunOutcome};
pub use platform::{OsSource, Platform, PlatformLoop};
pub use watcher::{Source, TimerSpec, WatcherId, WatcherState};
