//! Reactor integration: dispatch order, in-flight removal, timers,
//! lifecycle. All tests drive the loop manually with `turn` over real
//! loopback sockets.

use std::cell::RefCell;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use io_reactor::{IoObject, Pollable, Reactor, Sink};

const TURN: Duration = Duration::from_millis(10);
const DEADLINE: Duration = Duration::from_secs(2);

fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

#[derive(Default)]
struct RecorderState {
    events: Vec<&'static str>,
    timer_ids: Vec<u32>,
    unplug_on_writable: bool,
    rearm_timer: Option<(Duration, u32)>,
}

/// Records callback order; can retire itself from `writable` and re-arm a
/// timer from `on_timer`.
struct Recorder {
    io: IoObject,
    state: Rc<RefCell<RecorderState>>,
}

impl Pollable for Recorder {
    fn readable(&mut self, _reactor: &mut Reactor, _fd: RawFd) {
        self.state.borrow_mut().events.push("readable");
    }

    fn writable(&mut self, reactor: &mut Reactor, _fd: RawFd) {
        let unplug = {
            let mut state = self.state.borrow_mut();
            state.events.push("writable");
            state.unplug_on_writable
        };
        if unplug {
            self.io.unplug(reactor);
        }
    }

    fn on_timer(&mut self, reactor: &mut Reactor, id: u32) {
        let rearm = {
            let mut state = self.state.borrow_mut();
            state.timer_ids.push(id);
            state.rearm_timer.take()
        };
        if let Some((after, id)) = rearm {
            self.io.add_timer(reactor, after, id);
        }
    }
}

fn plug_recorder(
    reactor: &mut Reactor,
    fd: RawFd,
    state: Rc<RefCell<RecorderState>>,
) -> Rc<RefCell<Recorder>> {
    let recorder = Rc::new(RefCell::new(Recorder {
        io: IoObject::new(),
        state,
    }));
    let sink: Sink = Rc::clone(&recorder) as Sink;
    recorder.borrow_mut().io.plug(reactor, fd, sink);
    recorder
}

fn pump_until(reactor: &mut Reactor, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + DEADLINE;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        reactor.turn(Some(TURN)).unwrap();
    }
}

#[test]
fn writable_dispatched_before_readable() {
    let mut reactor = Reactor::new().unwrap();
    let (local, mut peer) = tcp_pair();
    peer.write_all(b"x").unwrap();

    let state = Rc::new(RefCell::new(RecorderState::default()));
    let recorder = plug_recorder(&mut reactor, local.as_raw_fd(), Rc::clone(&state));
    {
        let r = recorder.borrow();
        r.io.set_pollin(&mut reactor);
        r.io.set_pollout(&mut reactor);
    }

    let observed = Rc::clone(&state);
    pump_until(&mut reactor, || observed.borrow().events.len() >= 2);
    assert_eq!(&state.borrow().events[..2], &["writable", "readable"]);
}

#[test]
fn removal_inside_writable_suppresses_readable_in_same_batch() {
    let mut reactor = Reactor::new().unwrap();
    let base_load = reactor.load();
    let (local, mut peer) = tcp_pair();
    peer.write_all(b"x").unwrap();

    let state = Rc::new(RefCell::new(RecorderState {
        unplug_on_writable: true,
        ..Default::default()
    }));
    let recorder = plug_recorder(&mut reactor, local.as_raw_fd(), Rc::clone(&state));
    {
        let r = recorder.borrow();
        r.io.set_pollin(&mut reactor);
        r.io.set_pollout(&mut reactor);
    }
    assert_eq!(reactor.load(), base_load + 1);

    let observed = Rc::clone(&state);
    pump_until(&mut reactor, || !observed.borrow().events.is_empty());
    for _ in 0..3 {
        reactor.turn(Some(TURN)).unwrap();
    }

    // The pending readable in the same batch was dropped with the entry,
    // and no further events arrive after retirement.
    assert_eq!(state.borrow().events, vec!["writable"]);
    assert_eq!(reactor.load(), base_load);
}

#[test]
fn error_condition_reported_through_readable() {
    let mut reactor = Reactor::new().unwrap();
    let (mut local, peer) = tcp_pair();

    let state = Rc::new(RefCell::new(RecorderState::default()));
    let _recorder = plug_recorder(&mut reactor, local.as_raw_fd(), Rc::clone(&state));
    // No interest armed: only the error/hangup condition can surface.

    drop(peer);
    let _ = local.write_all(b"x");
    std::thread::sleep(Duration::from_millis(20));
    let _ = local.write_all(b"x");

    let observed = Rc::clone(&state);
    pump_until(&mut reactor, || !observed.borrow().events.is_empty());
    assert_eq!(state.borrow().events[0], "readable");
    assert!(!state.borrow().events.contains(&"writable"));
}

#[test]
fn plug_unplug_round_trip_restores_load() {
    let mut reactor = Reactor::new().unwrap();
    let base_load = reactor.load();
    let (local, _peer) = tcp_pair();

    let state = Rc::new(RefCell::new(RecorderState::default()));
    let recorder = plug_recorder(&mut reactor, local.as_raw_fd(), state);
    assert_eq!(reactor.load(), base_load + 1);
    assert!(recorder.borrow().io.is_plugged());

    recorder.borrow_mut().io.unplug(&mut reactor);
    assert_eq!(reactor.load(), base_load);
    assert!(!recorder.borrow().io.is_plugged());

    reactor.turn(Some(TURN)).unwrap();
    assert_eq!(reactor.load(), base_load);
}

#[test]
fn timer_fires_and_may_rearm_from_its_callback() {
    let mut reactor = Reactor::new().unwrap();
    let (local, _peer) = tcp_pair();

    let state = Rc::new(RefCell::new(RecorderState {
        rearm_timer: Some((Duration::from_millis(1), 2)),
        ..Default::default()
    }));
    let recorder = plug_recorder(&mut reactor, local.as_raw_fd(), Rc::clone(&state));
    recorder
        .borrow()
        .io
        .add_timer(&mut reactor, Duration::from_millis(5), 1);

    let observed = Rc::clone(&state);
    pump_until(&mut reactor, || observed.borrow().timer_ids.len() >= 2);
    assert_eq!(state.borrow().timer_ids, vec![1, 2]);
}

#[test]
fn cancelled_timer_never_fires() {
    let mut reactor = Reactor::new().unwrap();
    let (local, _peer) = tcp_pair();

    let state = Rc::new(RefCell::new(RecorderState::default()));
    let recorder = plug_recorder(&mut reactor, local.as_raw_fd(), Rc::clone(&state));
    recorder
        .borrow()
        .io
        .add_timer(&mut reactor, Duration::from_millis(5), 1);
    recorder.borrow().io.cancel_timer(&mut reactor, 1);

    let deadline = Instant::now() + Duration::from_millis(50);
    while Instant::now() < deadline {
        reactor.turn(Some(TURN)).unwrap();
    }
    assert!(state.borrow().timer_ids.is_empty());
}

#[test]
fn spawn_reports_load_and_stops_cleanly() {
    let thread = Reactor::spawn(|_reactor| Ok(())).unwrap();
    // Only the internal waker is registered so far.
    assert_eq!(thread.load(), 1);
    thread.stop();
    drop(thread); // joins
}

#[test]
fn spawn_propagates_init_failure() {
    let err = Reactor::spawn(|_reactor| Err(std::io::Error::other("boom")))
        .err()
        .expect("init failure must surface");
    assert_eq!(err.to_string(), "boom");
}

#[test]
fn dead_timer_sink_is_skipped() {
    let thread = Reactor::spawn(|reactor| {
        let weak = {
            let sink: Sink = Rc::new(RefCell::new(Recorder {
                io: IoObject::new(),
                state: Rc::new(RefCell::new(RecorderState::default())),
            }));
            Rc::downgrade(&sink)
        };
        // The sink is gone before its deadline; the loop must tolerate it.
        reactor.add_timer(Duration::from_millis(1), 1, weak);
        Ok(())
    })
    .unwrap();
    std::thread::sleep(Duration::from_millis(30));
    thread.stop();
    drop(thread);
}
