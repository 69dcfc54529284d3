//! Reactor metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "reactor_fds_registered",
    description = "Number of fds currently registered across all reactors"
)]
pub static REGISTERED_FDS: Gauge = Gauge::new();

#[metric(
    name = "reactor_timers_fired",
    description = "Total timer callbacks dispatched"
)]
pub static TIMERS_FIRED: Counter = Counter::new();
