//! One-shot deadline timers.
//!
//! Entries are ordered by deadline, with insertion order breaking ties.
//! Each due entry is removed from the set before its callback runs, so a
//! sink may add or cancel timers from inside `on_timer` without upsetting
//! the iteration. Timers hold their sink weakly; a dropped sink cancels
//! its timers implicitly.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Weak;
use std::time::{Duration, Instant};

use crate::pollable::Pollable;

/// Weak sink reference kept by a timer entry.
pub type TimerSink = Weak<RefCell<dyn Pollable>>;

struct TimerEntry {
    id: u32,
    sink: TimerSink,
}

/// The pending timer set of one reactor.
#[derive(Default)]
pub struct Timers {
    entries: BTreeMap<(Instant, u64), TimerEntry>,
    seq: u64,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `id` for `deadline` on behalf of `sink`.
    pub fn add(&mut self, deadline: Instant, id: u32, sink: TimerSink) {
        let seq = self.seq;
        self.seq += 1;
        self.entries.insert((deadline, seq), TimerEntry { id, sink });
    }

    /// Remove every pending timer matching `(id, sink)`.
    pub fn cancel(&mut self, id: u32, sink: &TimerSink) {
        self.entries
            .retain(|_, e| !(e.id == id && Weak::ptr_eq(&e.sink, sink)));
    }

    /// Remove and return the earliest entry due at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(u32, TimerSink)> {
        let (&(deadline, _), _) = self.entries.first_key_value()?;
        if deadline > now {
            return None;
        }
        self.entries.pop_first().map(|(_, e)| (e.id, e.sink))
    }

    /// Delay from `now` to the nearest pending deadline.
    pub fn next_delay(&self, now: Instant) -> Option<Duration> {
        self.entries
            .first_key_value()
            .map(|(&(deadline, _), _)| deadline.saturating_duration_since(now))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    struct NopSink;

    impl Pollable for NopSink {}

    fn sink() -> (Rc<RefCell<dyn Pollable>>, TimerSink) {
        let strong: Rc<RefCell<dyn Pollable>> = Rc::new(RefCell::new(NopSink));
        let weak = Rc::downgrade(&strong);
        (strong, weak)
    }

    #[test]
    fn due_entries_fire_in_deadline_then_insertion_order() {
        let mut timers = Timers::new();
        let base = Instant::now();
        let (_keep, weak) = sink();

        timers.add(base + Duration::from_millis(10), 1, weak.clone());
        timers.add(base + Duration::from_millis(10), 2, weak.clone());
        timers.add(base + Duration::from_millis(12), 3, weak.clone());

        let at = base + Duration::from_millis(11);
        let mut fired = Vec::new();
        while let Some((id, _)) = timers.pop_due(at) {
            fired.push(id);
        }
        assert_eq!(fired, vec![1, 2]);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.next_delay(at), Some(Duration::from_millis(1)));
    }

    #[test]
    fn nothing_due_before_the_first_deadline() {
        let mut timers = Timers::new();
        let base = Instant::now();
        let (_keep, weak) = sink();

        timers.add(base + Duration::from_millis(50), 1, weak);
        assert!(timers.pop_due(base).is_none());
        assert_eq!(timers.next_delay(base), Some(Duration::from_millis(50)));
    }

    #[test]
    fn cancel_matches_id_and_sink_identity() {
        let mut timers = Timers::new();
        let base = Instant::now();
        let (_keep_a, weak_a) = sink();
        let (_keep_b, weak_b) = sink();

        timers.add(base, 1, weak_a.clone());
        timers.add(base, 1, weak_b.clone());
        timers.add(base, 2, weak_a.clone());

        timers.cancel(1, &weak_a);
        assert_eq!(timers.len(), 2);

        let mut fired = Vec::new();
        while let Some((id, s)) = timers.pop_due(base) {
            fired.push((id, s.ptr_eq(&weak_b)));
        }
        assert_eq!(fired, vec![(1, true), (2, false)]);
    }

    #[test]
    fn empty_set_reports_no_delay() {
        let timers = Timers::new();
        assert!(timers.is_empty());
        assert_eq!(timers.next_delay(Instant::now()), None);
    }
}
