//! Per-engine options.

use serde::Deserialize;

/// Tuning and protocol identity for one engine. Immutable after
/// construction; loadable from a TOML table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// `SO_SNDBUF` for the underlying socket; 0 leaves the kernel default.
    pub sndbuf: usize,

    /// `SO_RCVBUF` for the underlying socket; 0 leaves the kernel default.
    pub rcvbuf: usize,

    /// Skip the greeting exchange entirely.
    pub legacy_protocol: bool,

    /// Pattern identifier carried in the greeting.
    pub sp_pattern: u16,

    /// Protocol revision carried in the greeting.
    pub sp_version: u16,

    /// Role announced to the peer (initiator/responder).
    pub sp_role: u16,

    /// Role the peer is required to announce.
    pub sp_complement: u16,

    /// Upper bound on message size, passed through to codec constructors;
    /// -1 means unlimited. The engine itself does not interpret it.
    pub maxmsgsize: i64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sndbuf: 0,
            rcvbuf: 0,
            legacy_protocol: false,
            sp_pattern: 0,
            sp_version: 0,
            sp_role: 0,
            sp_complement: 0,
            maxmsgsize: -1,
        }
    }
}
