//! io-reactor - per-thread readiness event loop.
//!
//! A reactor owns one epoll instance, a set of one-shot timers, and the
//! registrations of any number of pollable objects. It multiplexes fd
//! readiness on a single loop thread and dispatches `readable`, `writable`
//! and `on_timer` callbacks to the registered sinks.
//!
//! # Quick start
//!
//! ```ignore
//! use io_reactor::Reactor;
//!
//! let reactor = Reactor::spawn(|r| {
//!     // Runs on the loop thread: create sinks and register them here.
//!     Ok(())
//! })?;
//!
//! // ... hand the reactor connections through your own plumbing ...
//!
//! reactor.stop(); // cooperative; Drop joins the worker
//! ```
//!
//! # Threading model
//!
//! All registration and dispatch state is confined to the loop thread;
//! sinks are `Rc`-shared and never cross threads. The only state visible
//! from outside is the load counter (for balancing connections across
//! reactors), the stop flag, and the eventfd [`Waker`].
//!
//! # Removal during dispatch
//!
//! Removing an fd from inside a callback is safe at any point: the poll
//! entry is stamped retired and kept alive until the end of the current
//! dispatch pass, so stale kernel events referencing it are skipped rather
//! than delivered. A sink may remove the very registration whose callback
//! is executing; the entry (which owns the sink) is reclaimed only after
//! the callback frame has returned.

pub mod metrics;

mod pollable;
mod poller;
mod reactor;
mod timer;

pub use pollable::{IoObject, Pollable};
pub use poller::{Event, Handle, Poller, RETIRED_FD, Sink};
pub use reactor::{Reactor, ReactorThread, Waker};
pub use timer::{TimerSink, Timers};
