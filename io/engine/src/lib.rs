//! stream-engine - connection-oriented byte-stream driver for io-reactor.
//!
//! A [`StreamEngine`] owns one non-blocking stream socket and moves framed
//! bytes between it and an in-process session at line rate, sharing its
//! reactor's thread with any number of other connections. It performs a
//! short symmetric greeting exchange, then pumps bytes through a codec
//! pair - a [`Decoder`] on ingress, an [`Encoder`] on egress - while
//! coordinating flow control with the upstream [`Session`].
//!
//! Message semantics, framing formats and reconnection policy live in the
//! collaborators; the engine's job is speculative non-blocking I/O,
//! handshake enforcement, backpressure propagation, and clean teardown on
//! peer failure.

pub mod metrics;

mod codec;
mod engine;
mod greeting;
mod options;
mod session;

pub use codec::{Decoder, Encoder, FrameError};
pub use engine::StreamEngine;
pub use greeting::{GREETING_SIZE, Greeting};
pub use options::Options;
pub use session::{Session, SessionRef};
