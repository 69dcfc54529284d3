//! Fixed-length connection greeting.
//!
//! Both peers exchange one greeting before the first message byte. The
//! layout is fixed: pattern, protocol revision and role as little-endian
//! `u16` fields, zero-padded to [`GREETING_SIZE`]. The exchange is
//! symmetric: each side also knows the exact greeting it requires from the
//! peer (the complement of its own role), and anything else on the wire -
//! including a short greeting - is a protocol failure.

use crate::options::Options;

/// Greeting length on the wire. Both peers must agree exactly.
pub const GREETING_SIZE: usize = 8;

/// One fully-formed greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Greeting {
    bytes: [u8; GREETING_SIZE],
}

impl Greeting {
    pub fn new(pattern: u16, version: u16, role: u16) -> Self {
        let mut bytes = [0u8; GREETING_SIZE];
        bytes[0..2].copy_from_slice(&pattern.to_le_bytes());
        bytes[2..4].copy_from_slice(&version.to_le_bytes());
        bytes[4..6].copy_from_slice(&role.to_le_bytes());
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; GREETING_SIZE] {
        &self.bytes
    }
}

/// Handshake progress for one connection.
///
/// Egress is all-or-nothing: a freshly connected socket accepts the small
/// greeting atomically, so a short write means the peer is already gone.
/// Ingress accumulates byte-wise and is verified byte-exact once complete.
pub(crate) struct Handshake {
    outgoing: Greeting,
    expected: Greeting,
    incoming: [u8; GREETING_SIZE],
    received: usize,
    sent: bool,
    verified: bool,
}

impl Handshake {
    pub fn new(options: &Options) -> Self {
        let done = options.legacy_protocol;
        Self {
            outgoing: Greeting::new(options.sp_pattern, options.sp_version, options.sp_role),
            expected: Greeting::new(options.sp_pattern, options.sp_version, options.sp_complement),
            incoming: [0u8; GREETING_SIZE],
            received: if done { GREETING_SIZE } else { 0 },
            sent: done,
            verified: done,
        }
    }

    /// Whether the outgoing greeting still has to be written.
    pub fn egress_pending(&self) -> bool {
        !self.sent
    }

    pub fn outgoing_bytes(&self) -> &[u8] {
        &self.outgoing.bytes
    }

    pub fn mark_sent(&mut self) {
        self.sent = true;
    }

    /// Whether the peer's greeting is still outstanding.
    pub fn ingress_pending(&self) -> bool {
        !self.verified
    }

    /// The unfilled remainder of the incoming greeting buffer.
    pub fn ingress_buf(&mut self) -> &mut [u8] {
        &mut self.incoming[self.received..]
    }

    /// Record `n` freshly received greeting bytes; true once the greeting
    /// is complete.
    pub fn advance_ingress(&mut self, n: usize) -> bool {
        self.received += n;
        debug_assert!(self.received <= GREETING_SIZE);
        self.received == GREETING_SIZE
    }

    /// Compare the complete incoming greeting against the expected one.
    pub fn verify(&mut self) -> bool {
        debug_assert_eq!(self.received, GREETING_SIZE);
        self.verified = self.incoming == self.expected.bytes;
        self.verified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(role: u16, complement: u16) -> Options {
        Options {
            sp_pattern: 1,
            sp_version: 0,
            sp_role: role,
            sp_complement: complement,
            ..Options::default()
        }
    }

    #[test]
    fn initiator_greeting_bytes() {
        let greeting = Greeting::new(1, 0, 1);
        assert_eq!(greeting.as_bytes(), &[1, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn responder_greeting_bytes() {
        let greeting = Greeting::new(1, 0, 2);
        assert_eq!(greeting.as_bytes(), &[1, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn ingress_completes_in_single_byte_increments() {
        let mut handshake = Handshake::new(&options(1, 2));
        let peer = [1u8, 0, 0, 0, 2, 0, 0, 0];

        for (i, byte) in peer.iter().enumerate() {
            assert!(handshake.ingress_pending());
            handshake.ingress_buf()[0] = *byte;
            let complete = handshake.advance_ingress(1);
            assert_eq!(complete, i == GREETING_SIZE - 1);
        }
        assert!(handshake.verify());
        assert!(!handshake.ingress_pending());
    }

    #[test]
    fn same_role_greeting_is_rejected() {
        let mut handshake = Handshake::new(&options(1, 2));
        handshake
            .ingress_buf()
            .copy_from_slice(&[1, 0, 0, 0, 1, 0, 0, 0]);
        assert!(handshake.advance_ingress(GREETING_SIZE));
        assert!(!handshake.verify());
    }

    #[test]
    fn legacy_handshake_starts_complete() {
        let handshake = Handshake::new(&Options {
            legacy_protocol: true,
            ..Options::default()
        });
        assert!(!handshake.egress_pending());
        assert!(!handshake.ingress_pending());
    }
}
