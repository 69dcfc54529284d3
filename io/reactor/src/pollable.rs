//! Registration base for event sinks.

use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::poller::{Handle, Sink};
use crate::reactor::Reactor;
use crate::timer::TimerSink;

/// Callbacks a registered object receives from its reactor.
///
/// All methods run on the reactor's loop thread, serialized with each
/// other and with themselves. The `reactor` argument is the thread-local
/// half of the reactor; sinks use it to change interest masks, manage
/// timers, or retire their own registration mid-callback.
///
/// The default bodies panic: a sink only receives events it armed, so an
/// unimplemented callback being reached is a bug.
pub trait Pollable {
    /// The fd is readable. Error and hangup conditions are also delivered
    /// here, so the sink's read path observes end-of-stream uniformly.
    fn readable(&mut self, reactor: &mut Reactor, fd: RawFd) {
        let _ = (reactor, fd);
        panic!("unexpected readable event");
    }

    /// The fd is writable.
    fn writable(&mut self, reactor: &mut Reactor, fd: RawFd) {
        let _ = (reactor, fd);
        panic!("unexpected writable event");
    }

    /// The timer registered under `id` expired.
    fn on_timer(&mut self, reactor: &mut Reactor, id: u32) {
        let _ = (reactor, id);
        panic!("unexpected timer event");
    }
}

/// Plug-state for one fd-bearing sink: the poll handle plus the identity
/// used for timer bookkeeping. Embed one per registered fd.
#[derive(Default)]
pub struct IoObject {
    handle: Option<Handle>,
    this: Option<TimerSink>,
}

impl IoObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `sink` (the embedding object) to `reactor` and register `fd`
    /// with an empty interest mask. At most one registration may exist at
    /// a time.
    pub fn plug(&mut self, reactor: &mut Reactor, fd: RawFd, sink: Sink) {
        assert!(self.handle.is_none(), "sink plugged twice");
        self.this = Some(Rc::downgrade(&sink));
        self.handle = Some(reactor.add_fd(fd, sink));
    }

    /// Cancel the fd registration. Pending timers owned by this sink die
    /// with the sink itself.
    pub fn unplug(&mut self, reactor: &mut Reactor) {
        let handle = self.handle.take().expect("sink not plugged");
        self.this = None;
        reactor.rm_fd(handle);
    }

    pub fn is_plugged(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Handle {
        self.handle.expect("sink not plugged")
    }

    pub fn set_pollin(&self, reactor: &mut Reactor) {
        reactor.set_pollin(self.handle());
    }

    pub fn reset_pollin(&self, reactor: &mut Reactor) {
        reactor.reset_pollin(self.handle());
    }

    pub fn set_pollout(&self, reactor: &mut Reactor) {
        reactor.set_pollout(self.handle());
    }

    pub fn reset_pollout(&self, reactor: &mut Reactor) {
        reactor.reset_pollout(self.handle());
    }

    /// Schedule a one-shot timer owned by this sink.
    pub fn add_timer(&self, reactor: &mut Reactor, after: Duration, id: u32) {
        let this = self.this.clone().expect("sink not plugged");
        reactor.add_timer(after, id, this);
    }

    pub fn cancel_timer(&self, reactor: &mut Reactor, id: u32) {
        let this = self.this.as_ref().expect("sink not plugged");
        reactor.cancel_timer(id, this);
    }
}
