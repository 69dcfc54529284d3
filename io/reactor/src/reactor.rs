//! The reactor: one loop thread multiplexing fd readiness and timers.

use std::cell::RefCell;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::metrics::TIMERS_FIRED;
use crate::pollable::Pollable;
use crate::poller::{Event, Handle, Poller, Sink};
use crate::timer::{TimerSink, Timers};

/// Cross-thread wakeup handle for a reactor.
///
/// The only part of a reactor other threads may poke. Sessions use it to
/// rendezvous with the loop thread; [`ReactorThread::stop`] uses it to get
/// the loop out of a blocking wait.
#[derive(Clone)]
pub struct Waker {
    fd: Arc<OwnedFd>,
}

impl Waker {
    /// Force the reactor out of its wait. Wakeups coalesce; waking an
    /// already-pending reactor is a no-op.
    pub fn wake(&self) {
        let val: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                (&val as *const u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if rc == -1 {
            let err = io::Error::last_os_error();
            // A saturated eventfd counter already carries a pending wakeup.
            assert!(
                err.raw_os_error() == Some(libc::EAGAIN),
                "eventfd write failed: {err}"
            );
        }
    }
}

/// Internal sink draining the wakeup eventfd.
struct WakerSink {
    fd: Arc<OwnedFd>,
}

impl Pollable for WakerSink {
    fn readable(&mut self, _reactor: &mut Reactor, _fd: RawFd) {
        let mut val = 0u64;
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                (&mut val as *mut u64).cast(),
                std::mem::size_of::<u64>(),
            );
        }
    }
}

/// A per-thread event loop: owns the poller, the timer set, and every
/// registered sink.
///
/// Sinks receive `&mut Reactor` in their callbacks and may re-enter any
/// registration or timer operation, including removing the registration
/// whose callback is currently executing.
pub struct Reactor {
    poller: Poller,
    timers: Timers,
    stopping: Arc<AtomicBool>,
    waker_fd: Arc<OwnedFd>,
    events: Vec<Event>,
}

impl Reactor {
    /// Build a reactor for use on the current thread.
    pub fn new() -> io::Result<Self> {
        Self::with_shared(
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicUsize::new(0)),
            new_eventfd()?,
        )
    }

    fn with_shared(
        stopping: Arc<AtomicBool>,
        load: Arc<AtomicUsize>,
        waker_fd: Arc<OwnedFd>,
    ) -> io::Result<Self> {
        let mut reactor = Self {
            poller: Poller::with_load(load)?,
            timers: Timers::new(),
            stopping,
            waker_fd: Arc::clone(&waker_fd),
            events: Vec::with_capacity(256),
        };

        let raw = waker_fd.as_raw_fd();
        let sink: Sink = Rc::new(RefCell::new(WakerSink { fd: waker_fd }));
        let handle = reactor.add_fd(raw, sink);
        reactor.set_pollin(handle);
        Ok(reactor)
    }

    /// Spawn the loop on a dedicated worker thread.
    ///
    /// `init` runs on that thread before the first dispatch pass and is the
    /// place to create and plug sinks: sinks are confined to the loop
    /// thread and cannot be moved in from outside. Construction or `init`
    /// failure is reported here.
    pub fn spawn<F>(init: F) -> io::Result<ReactorThread>
    where
        F: FnOnce(&mut Reactor) -> io::Result<()> + Send + 'static,
    {
        let stopping = Arc::new(AtomicBool::new(false));
        let load = Arc::new(AtomicUsize::new(0));
        let waker_fd = new_eventfd()?;
        let waker = Waker {
            fd: Arc::clone(&waker_fd),
        };

        let (tx, rx) = mpsc::channel();
        let thread_stopping = Arc::clone(&stopping);
        let thread_load = Arc::clone(&load);
        let thread = thread::Builder::new()
            .name("io-reactor".to_string())
            .spawn(move || {
                let built = Reactor::with_shared(thread_stopping, thread_load, waker_fd)
                    .and_then(|mut reactor| init(&mut reactor).map(|_| reactor));
                match built {
                    Ok(mut reactor) => {
                        tx.send(Ok(())).ok();
                        if let Err(e) = reactor.run() {
                            tracing::error!("reactor loop failed: {e}");
                        }
                    }
                    Err(e) => {
                        tx.send(Err(e)).ok();
                    }
                }
            })?;

        match rx.recv() {
            Ok(Ok(())) => Ok(ReactorThread {
                thread: Some(thread),
                stopping,
                load,
                waker,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(io::Error::other("reactor thread died during startup"))
            }
        }
    }

    /// Register `fd` with an empty interest mask; the entry owns `sink`.
    pub fn add_fd(&mut self, fd: RawFd, sink: Sink) -> Handle {
        self.poller.add_fd(fd, sink)
    }

    /// Retire the registration. The entry and the sink it owns are freed
    /// at the end of the current dispatch pass.
    pub fn rm_fd(&mut self, handle: Handle) {
        self.poller.rm_fd(handle)
    }

    pub fn set_pollin(&mut self, handle: Handle) {
        self.poller.set_pollin(handle)
    }

    pub fn reset_pollin(&mut self, handle: Handle) {
        self.poller.reset_pollin(handle)
    }

    pub fn set_pollout(&mut self, handle: Handle) {
        self.poller.set_pollout(handle)
    }

    pub fn reset_pollout(&mut self, handle: Handle) {
        self.poller.reset_pollout(handle)
    }

    /// Schedule a one-shot timer for `after` from now.
    pub fn add_timer(&mut self, after: Duration, id: u32, sink: TimerSink) {
        self.timers.add(Instant::now() + after, id, sink);
    }

    pub fn cancel_timer(&mut self, id: u32, sink: &TimerSink) {
        self.timers.cancel(id, sink);
    }

    /// Number of fds currently registered, including the internal waker.
    pub fn load(&self) -> usize {
        self.poller.load()
    }

    /// Wakeup handle usable from any thread.
    pub fn waker(&self) -> Waker {
        Waker {
            fd: Arc::clone(&self.waker_fd),
        }
    }

    /// Ask the loop to exit after the current pass.
    pub fn stop(&mut self) {
        self.stopping.store(true, Ordering::Release);
    }

    /// Fire every timer due at `now`, in deadline order; returns the delay
    /// to the nearest timer still pending. A callback may add or cancel
    /// timers, including one that becomes due within this same pass.
    pub fn execute_timers(&mut self, now: Instant) -> Option<Duration> {
        while let Some((id, sink)) = self.timers.pop_due(now) {
            let Some(sink) = sink.upgrade() else { continue };
            TIMERS_FIRED.increment();
            sink.borrow_mut().on_timer(self, id);
        }
        self.timers.next_delay(now)
    }

    /// One dispatch pass: due timers, a single wait bounded by `max_wait`
    /// and the nearest timer, ordered delivery, then reclamation of retired
    /// entries. Returns the number of kernel events received.
    ///
    /// For each event record, error/hangup and readable conditions are
    /// delivered through `readable`, and writable is delivered first so a
    /// sink that detects outbound failure does not waste a read cycle on a
    /// doomed connection. Liveness is re-checked after every nested
    /// callback, so an entry removed mid-batch receives nothing further.
    pub fn turn(&mut self, max_wait: Option<Duration>) -> io::Result<usize> {
        let next_timer = self.execute_timers(Instant::now());
        let timeout = match (next_timer, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        };

        let mut events = std::mem::take(&mut self.events);
        let n = self.poller.wait(timeout, &mut events)?;

        for ev in &events {
            let Some((fd, sink)) = self.poller.live(ev.handle) else {
                continue;
            };
            if ev.hangup {
                sink.borrow_mut().readable(self, fd);
            }
            if !self.poller.is_live(ev.handle) {
                continue;
            }
            if ev.writable {
                sink.borrow_mut().writable(self, fd);
            }
            if !self.poller.is_live(ev.handle) {
                continue;
            }
            if ev.readable {
                sink.borrow_mut().readable(self, fd);
            }
        }

        self.poller.reap_retired();
        self.events = events;
        Ok(n)
    }

    /// Run until [`Reactor::stop`] or [`ReactorThread::stop`] is requested.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.stopping.load(Ordering::Acquire) {
            self.turn(None)?;
        }
        tracing::debug!("reactor loop exiting");
        Ok(())
    }
}

/// Owning handle for a spawned reactor worker.
pub struct ReactorThread {
    thread: Option<JoinHandle<()>>,
    stopping: Arc<AtomicBool>,
    load: Arc<AtomicUsize>,
    waker: Waker,
}

impl ReactorThread {
    /// Request cooperative termination; the loop exits after its current
    /// pass. `Drop` joins the worker.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.waker.wake();
    }

    /// Current number of registered fds. The containing context reads this
    /// to pick the least-loaded reactor for a new connection.
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }
}

impl Drop for ReactorThread {
    fn drop(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn new_eventfd() -> io::Result<Arc<OwnedFd>> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(Arc::new(unsafe { OwnedFd::from_raw_fd(fd) }))
}
