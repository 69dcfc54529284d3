//! epoll-backed readiness poller.
//!
//! One `Poller` per reactor. Registration hands out generation-tagged
//! [`Handle`]s, and the kernel-side event record carries the same token, so
//! a handle can never alias an entry that was removed and re-registered in
//! the same arena slot.
//!
//! Removal is deferred: [`Poller::rm_fd`] unregisters the fd with the
//! kernel and stamps the entry with [`RETIRED_FD`], but the entry (and the
//! sink it owns) stays in the arena until [`Poller::reap_retired`] runs at
//! the end of the current dispatch batch. Any later dispatch step in the
//! same batch can therefore detect a dead entry by identity before
//! touching it.
//!
//! Registration is level-triggered: a sink that leaves data in the socket
//! is notified again on the next wait.

use std::cell::RefCell;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use slab::Slab;

use crate::metrics::REGISTERED_FDS;
use crate::pollable::Pollable;

/// Sentinel stamped into a poll entry that has been removed but not yet
/// reclaimed.
pub const RETIRED_FD: RawFd = -1;

/// Maximum number of kernel events drained per wait.
const MAX_IO_EVENTS: usize = 256;

/// A registered event sink. The poll entry owns it; everyone else holds
/// weak or temporary references.
pub type Sink = Rc<RefCell<dyn Pollable>>;

/// Identity of one registered poll entry.
///
/// Encodes the arena slot and a generation counter, so removing an fd and
/// registering another one into the same slot yields a distinct identity.
/// Every operation validates the generation; a stale handle is a caller
/// bug and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    slot: u32,
    generation: u32,
}

impl Handle {
    #[inline]
    fn token(self) -> u64 {
        ((self.generation as u64) << 32) | self.slot as u64
    }

    #[inline]
    fn from_token(token: u64) -> Self {
        Self {
            slot: (token & 0xFFFF_FFFF) as u32,
            generation: (token >> 32) as u32,
        }
    }
}

/// One readiness record decoded from the kernel.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub handle: Handle,
    pub readable: bool,
    pub writable: bool,
    /// `EPOLLERR | EPOLLHUP`. Reported to sinks through the read path so
    /// end-of-stream is observed uniformly.
    pub hangup: bool,
}

struct PollEntry {
    fd: RawFd,
    interest: u32,
    generation: u32,
    sink: Sink,
}

/// The epoll backend: registrations, interest masks, and the wait call.
pub struct Poller {
    epfd: OwnedFd,
    entries: Slab<PollEntry>,
    retired: Vec<usize>,
    next_generation: u32,
    load: Arc<AtomicUsize>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Self::with_load(Arc::new(AtomicUsize::new(0)))
    }

    pub(crate) fn with_load(load: Arc<AtomicUsize>) -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
            entries: Slab::with_capacity(64),
            retired: Vec::new(),
            next_generation: 0,
            load,
        })
    }

    /// Register `fd` with an empty interest mask. The new entry takes
    /// ownership of `sink`; the caller keeps only the returned handle.
    pub fn add_fd(&mut self, fd: RawFd, sink: Sink) -> Handle {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        let slot = self.entries.insert(PollEntry {
            fd,
            interest: 0,
            generation,
            sink,
        });
        let handle = Handle {
            slot: slot as u32,
            generation,
        };

        let mut ev = libc::epoll_event {
            events: 0,
            u64: handle.token(),
        };
        let rc = unsafe {
            libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev)
        };
        assert!(
            rc == 0,
            "epoll_ctl(ADD) failed: {}",
            io::Error::last_os_error()
        );

        self.load.fetch_add(1, Ordering::Relaxed);
        REGISTERED_FDS.increment();
        tracing::trace!(fd, slot, "fd registered");
        handle
    }

    /// Unregister the entry with the kernel and park it for reclamation at
    /// the end of the current dispatch batch.
    pub fn rm_fd(&mut self, handle: Handle) {
        let entry = self.entry_mut(handle);
        let fd = entry.fd;
        assert!(fd != RETIRED_FD, "fd removed twice");
        entry.fd = RETIRED_FD;
        entry.interest = 0;

        let rc = unsafe {
            libc::epoll_ctl(
                self.epfd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        assert!(
            rc == 0,
            "epoll_ctl(DEL) failed: {}",
            io::Error::last_os_error()
        );

        self.retired.push(handle.slot as usize);
        self.load.fetch_sub(1, Ordering::Relaxed);
        REGISTERED_FDS.decrement();
        tracing::trace!(fd, "fd retired");
    }

    pub fn set_pollin(&mut self, handle: Handle) {
        self.update(handle, libc::EPOLLIN as u32, 0);
    }

    pub fn reset_pollin(&mut self, handle: Handle) {
        self.update(handle, 0, libc::EPOLLIN as u32);
    }

    pub fn set_pollout(&mut self, handle: Handle) {
        self.update(handle, libc::EPOLLOUT as u32, 0);
    }

    pub fn reset_pollout(&mut self, handle: Handle) {
        self.update(handle, 0, libc::EPOLLOUT as u32);
    }

    fn update(&mut self, handle: Handle, set: u32, clear: u32) {
        let epfd = self.epfd.as_raw_fd();
        let entry = self.entry_mut(handle);
        assert!(
            entry.fd != RETIRED_FD,
            "interest change on a retired entry"
        );
        entry.interest = (entry.interest | set) & !clear;

        let mut ev = libc::epoll_event {
            events: entry.interest,
            u64: handle.token(),
        };
        let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_MOD, entry.fd, &mut ev) };
        assert!(
            rc == 0,
            "epoll_ctl(MOD) failed: {}",
            io::Error::last_os_error()
        );
    }

    /// Block for up to `timeout` and decode the ready set into `events`.
    ///
    /// `None` blocks until an event arrives. Sub-millisecond timeouts round
    /// up so a pending timer cannot spin the loop. An interrupted wait
    /// returns an empty batch.
    pub fn wait(
        &mut self,
        timeout: Option<Duration>,
        events: &mut Vec<Event>,
    ) -> io::Result<usize> {
        events.clear();

        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) => {
                let ms = d.as_millis().min(i32::MAX as u128) as libc::c_int;
                if ms == 0 && !d.is_zero() { 1 } else { ms }
            }
        };

        let mut buf: [libc::epoll_event; MAX_IO_EVENTS] = unsafe { std::mem::zeroed() };
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                buf.as_mut_ptr(),
                MAX_IO_EVENTS as libc::c_int,
                timeout_ms,
            )
        };
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }

        for ev in &buf[..n as usize] {
            let flags = ev.events;
            events.push(Event {
                handle: Handle::from_token(ev.u64),
                readable: flags & libc::EPOLLIN as u32 != 0,
                writable: flags & libc::EPOLLOUT as u32 != 0,
                hangup: flags & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0,
            });
        }
        Ok(events.len())
    }

    /// Whether `handle` still names a live (non-retired) entry.
    pub fn is_live(&self, handle: Handle) -> bool {
        self.entries
            .get(handle.slot as usize)
            .is_some_and(|e| e.generation == handle.generation && e.fd != RETIRED_FD)
    }

    /// Fetch the fd and sink of a live entry.
    pub(crate) fn live(&self, handle: Handle) -> Option<(RawFd, Sink)> {
        let entry = self.entries.get(handle.slot as usize)?;
        if entry.generation != handle.generation || entry.fd == RETIRED_FD {
            return None;
        }
        Some((entry.fd, Rc::clone(&entry.sink)))
    }

    /// Free every entry retired during the current batch, dropping the
    /// sinks they own.
    pub fn reap_retired(&mut self) {
        for slot in self.retired.drain(..) {
            self.entries.remove(slot);
        }
    }

    /// Number of currently registered fds.
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    fn entry_mut(&mut self, handle: Handle) -> &mut PollEntry {
        let entry = self
            .entries
            .get_mut(handle.slot as usize)
            .expect("poll handle does not name a registered entry");
        assert!(entry.generation == handle.generation, "stale poll handle");
        entry
    }
}
