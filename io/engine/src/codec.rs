//! Framing codec seams.
//!
//! The engine does not understand message boundaries; it pumps bytes
//! between its socket and these two interfaces. Both codecs own the memory
//! the engine's cursors point into, so a codec can frame in place without
//! copies.

use thiserror::Error;

use crate::session::SessionRef;

/// The byte stream violated the framing rules.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed byte stream")]
pub struct FrameError;

/// Turns raw bytes back into messages.
pub trait Decoder {
    /// Plumb decoded messages to `session`; `None` disconnects.
    fn set_session(&mut self, session: Option<SessionRef>);

    /// The scratch region the engine should read into. The region must
    /// stay stable until every byte handed out has been processed.
    fn get_buffer(&mut self) -> &mut [u8];

    /// Decode `len` bytes starting at `offset` inside the scratch region.
    /// Returns how many were consumed; fewer than `len` means the
    /// downstream queue is full and the engine should stop reading until
    /// it drains.
    fn process_buffer(&mut self, offset: usize, len: usize) -> Result<usize, FrameError>;
}

/// Turns messages into raw bytes.
pub trait Encoder {
    /// Plumb message intake from `session`; `None` disconnects.
    fn set_session(&mut self, session: Option<SessionRef>);

    /// Refill the current chunk from pending messages. Returns whether
    /// more encoded data can follow without new input from the session.
    fn get_data(&mut self) -> bool;

    /// The current chunk. Empty when the encoder has nothing to send.
    fn chunk(&self) -> &[u8];
}
