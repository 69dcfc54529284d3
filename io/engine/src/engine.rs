//! Connection-oriented byte-stream driver.
//!
//! A `StreamEngine` owns one non-blocking stream socket and shuttles bytes
//! between it and a codec pair on behalf of an upstream session, entirely
//! on its reactor's loop thread. The reactor delivers `readable` and
//! `writable`; the session re-arms a parked direction through
//! `activate_in` / `activate_out`; every transfer is a single speculative
//! non-blocking syscall.
//!
//! Before the first payload byte the engine performs the symmetric
//! greeting exchange from [`crate::greeting`]. Any peer failure - reset,
//! orderly close, short or mismatched greeting, framing error - detaches
//! the session exactly once and retires the engine from its reactor.

use std::cell::RefCell;
use std::io;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use io_reactor::{IoObject, Pollable, Reactor, Sink};
use socket2::SockRef;

use crate::codec::{Decoder, Encoder};
use crate::greeting::{GREETING_SIZE, Handshake};
use crate::metrics::{
    BYTES_RECEIVED, BYTES_SENT, ENGINES_ACTIVE, HANDSHAKE_FAILURES, PEER_DISCONNECTS,
};
use crate::options::Options;
use crate::session::SessionRef;

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

/// Outcome of one non-blocking transfer attempt. `Bytes(0)` covers
/// would-block and interruption; `Gone` covers every peer-failure errno
/// plus orderly shutdown. Anything else panics at the syscall site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    Bytes(usize),
    Gone,
}

/// Drives one stream socket on behalf of a session.
pub struct StreamEngine {
    stream: TcpStream,
    io: IoObject,
    handshake: Handshake,

    inpos: usize,
    insize: usize,
    decoder: Box<dyn Decoder>,

    outpos: usize,
    outsize: usize,
    encoder: Box<dyn Encoder>,

    session: Option<SessionRef>,
    leftover_session: Option<SessionRef>,
    plugged: bool,
    options: Options,
}

impl StreamEngine {
    /// Take ownership of a connected stream socket: switch it to
    /// non-blocking mode and apply the kernel buffer options.
    pub fn new(
        stream: TcpStream,
        encoder: Box<dyn Encoder>,
        decoder: Box<dyn Decoder>,
        options: Options,
    ) -> io::Result<Rc<RefCell<Self>>> {
        stream.set_nonblocking(true)?;

        let sock = SockRef::from(&stream);
        if options.sndbuf > 0 {
            sock.set_send_buffer_size(options.sndbuf)?;
        }
        if options.rcvbuf > 0 {
            sock.set_recv_buffer_size(options.rcvbuf)?;
        }
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        sock.set_nosigpipe(true)?;

        Ok(Rc::new(RefCell::new(Self {
            handshake: Handshake::new(&options),
            stream,
            io: IoObject::new(),
            inpos: 0,
            insize: 0,
            decoder,
            outpos: 0,
            outsize: 0,
            encoder,
            session: None,
            leftover_session: None,
            plugged: false,
            options,
        })))
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Attach to `reactor` on behalf of `session` and start pumping.
    ///
    /// Connects the codecs, registers the socket, arms both directions,
    /// and runs the read path once to pick up anything the kernel buffered
    /// before the engine existed.
    pub fn plug(this: &Rc<RefCell<Self>>, reactor: &mut Reactor, session: SessionRef) {
        let mut engine = this.borrow_mut();
        assert!(!engine.plugged, "engine plugged twice");
        assert!(engine.session.is_none());
        engine.plugged = true;
        engine.leftover_session = None;

        engine.encoder.set_session(Some(Rc::clone(&session)));
        engine.decoder.set_session(Some(Rc::clone(&session)));
        engine.session = Some(session);

        let fd = engine.stream.as_raw_fd();
        let sink: Sink = Rc::clone(this) as Sink;
        engine.io.plug(reactor, fd, sink);
        engine.io.set_pollin(reactor);
        engine.io.set_pollout(reactor);
        ENGINES_ACTIVE.increment();
        tracing::trace!(fd, "engine plugged");

        engine.readable(reactor, fd);
    }

    /// Detach from the reactor and schedule destruction.
    ///
    /// The retired poll entry holds the engine's owning reference; the
    /// reactor drops it at the end of its current dispatch pass. Callers
    /// should release their own clones afterwards.
    pub fn terminate(this: &Rc<RefCell<Self>>, reactor: &mut Reactor) {
        this.borrow_mut().unplug(reactor);
    }

    /// Re-arm the read direction and run the read path once, speculatively.
    pub fn activate_in(&mut self, reactor: &mut Reactor) {
        self.io.set_pollin(reactor);
        self.readable(reactor, self.stream.as_raw_fd());
    }

    /// Re-arm the write direction and run the write path once. Writing at
    /// activation time skips one poll round-trip: right after the session
    /// produced data the socket is almost always writable, which shortens
    /// the request/reply critical path by a wait.
    pub fn activate_out(&mut self, reactor: &mut Reactor) {
        self.io.set_pollout(reactor);
        self.writable(reactor, self.stream.as_raw_fd());
    }

    fn unplug(&mut self, reactor: &mut Reactor) {
        assert!(self.plugged, "engine not plugged");
        self.plugged = false;

        self.io.unplug(reactor);

        self.encoder.set_session(None);
        self.decoder.set_session(None);
        self.leftover_session = self.session.take();
        ENGINES_ACTIVE.decrement();
    }

    /// Peer failure: detach the session exactly once, then retire.
    fn error(&mut self, reactor: &mut Reactor) {
        PEER_DISCONNECTS.increment();
        let session = self
            .session
            .clone()
            .expect("engine error without a session");
        session.borrow_mut().detach();
        self.unplug(reactor);
        tracing::debug!(fd = self.stream.as_raw_fd(), "engine detached after peer failure");
    }

    /// Flush decoded messages upstream. After a mid-callback unplug the
    /// parked session still gets its final flush.
    fn flush_session(&self) {
        let session = if self.plugged {
            self.session.clone()
        } else {
            self.leftover_session.clone()
        };
        session
            .expect("no session to flush")
            .borrow_mut()
            .flush();
    }
}

impl Pollable for StreamEngine {
    fn readable(&mut self, reactor: &mut Reactor, _fd: RawFd) {
        let fd = self.stream.as_raw_fd();
        let mut disconnection = false;

        // Finish the greeting exchange before any payload byte.
        if self.handshake.ingress_pending() {
            let step = read_transfer(fd, self.handshake.ingress_buf());
            let nbytes = match step {
                Transfer::Gone => {
                    self.error(reactor);
                    return;
                }
                Transfer::Bytes(n) => n,
            };
            if !self.handshake.advance_ingress(nbytes) {
                return;
            }
            if !self.handshake.verify() {
                tracing::debug!(fd, "greeting mismatch");
                HANDSHAKE_FAILURES.increment();
                self.error(reactor);
                return;
            }
        }

        if self.insize == 0 {
            self.inpos = 0;
            let step = {
                let buf = self.decoder.get_buffer();
                read_transfer(fd, buf)
            };
            match step {
                Transfer::Bytes(n) => {
                    BYTES_RECEIVED.add(n as u64);
                    self.insize = n;
                }
                Transfer::Gone => {
                    // Already-buffered bytes still go to the decoder before
                    // the loss is reported.
                    self.insize = 0;
                    disconnection = true;
                }
            }
        }

        match self.decoder.process_buffer(self.inpos, self.insize) {
            Err(_) => disconnection = true,
            Ok(processed) => {
                debug_assert!(processed <= self.insize);
                if processed < self.insize {
                    // Downstream queue is full; stop reading until the
                    // session re-arms us through activate_in.
                    if self.plugged {
                        self.io.reset_pollin(reactor);
                    }
                }
                self.inpos += processed;
                self.insize -= processed;
            }
        }

        self.flush_session();

        if disconnection && self.session.is_some() {
            self.error(reactor);
        }
    }

    fn writable(&mut self, reactor: &mut Reactor, _fd: RawFd) {
        let fd = self.stream.as_raw_fd();
        let mut more_data = true;

        if self.handshake.egress_pending() {
            // A fresh socket takes the whole greeting in one write;
            // anything less means the peer is already gone.
            let step = write_transfer(fd, self.handshake.outgoing_bytes());
            match step {
                Transfer::Bytes(n) if n == GREETING_SIZE => self.handshake.mark_sent(),
                _ => {
                    HANDSHAKE_FAILURES.increment();
                    self.error(reactor);
                    return;
                }
            }
        }

        if self.outsize == 0 {
            self.outpos = 0;
            more_data = self.encoder.get_data();
            self.outsize = self.encoder.chunk().len();

            // The session may have unplugged us while supplying data.
            if !self.plugged {
                self.flush_session();
                return;
            }

            if self.outsize == 0 {
                self.io.reset_pollout(reactor);
                return;
            }
        }

        let step = {
            let chunk = &self.encoder.chunk()[self.outpos..self.outpos + self.outsize];
            write_transfer(fd, chunk)
        };
        let nbytes = match step {
            Transfer::Gone => {
                self.error(reactor);
                return;
            }
            Transfer::Bytes(n) => n,
        };
        BYTES_SENT.add(nbytes as u64);
        self.outpos += nbytes;
        self.outsize -= nbytes;

        // Nothing further queued in the encoder: park the write direction
        // until the session activates it again.
        if !more_data && self.outsize == 0 {
            self.io.reset_pollout(reactor);
        }
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        debug_assert!(!self.plugged, "engine dropped while plugged");
    }
}

/// One non-blocking read, classified at the syscall site.
fn read_transfer(fd: RawFd, buf: &mut [u8]) -> Transfer {
    if buf.is_empty() {
        return Transfer::Bytes(0);
    }
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
    if n > 0 {
        return Transfer::Bytes(n as usize);
    }
    if n == 0 {
        // Orderly shutdown by the peer.
        return Transfer::Gone;
    }

    let err = io::Error::last_os_error();
    let errno = err.raw_os_error().unwrap_or(0);
    if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::EINTR {
        Transfer::Bytes(0)
    } else if errno == libc::ECONNRESET
        || errno == libc::ECONNREFUSED
        || errno == libc::ETIMEDOUT
        || errno == libc::EHOSTUNREACH
        || errno == libc::ENOTCONN
    {
        Transfer::Gone
    } else {
        panic!("recv failed: {err}");
    }
}

/// One non-blocking write, classified at the syscall site.
fn write_transfer(fd: RawFd, buf: &[u8]) -> Transfer {
    let n = unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), SEND_FLAGS) };
    if n >= 0 {
        return Transfer::Bytes(n as usize);
    }

    let err = io::Error::last_os_error();
    let errno = err.raw_os_error().unwrap_or(0);
    if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::EINTR {
        Transfer::Bytes(0)
    } else if errno == libc::ECONNRESET || errno == libc::EPIPE || errno == libc::ETIMEDOUT {
        Transfer::Gone
    } else {
        panic!("send failed: {err}");
    }
}
