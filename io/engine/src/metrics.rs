//! Engine metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "engine_connections_active",
    description = "Engines currently plugged into a reactor"
)]
pub static ENGINES_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "engine_bytes_received",
    description = "Payload bytes read from peer sockets"
)]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(
    name = "engine_bytes_sent",
    description = "Payload bytes written to peer sockets"
)]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "engine_handshake_failures",
    description = "Connections dropped for a bad or short greeting"
)]
pub static HANDSHAKE_FAILURES: Counter = Counter::new();

#[metric(
    name = "engine_peer_disconnects",
    description = "Connections dropped after peer failure"
)]
pub static PEER_DISCONNECTS: Counter = Counter::new();
