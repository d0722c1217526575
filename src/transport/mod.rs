//! Client-facing transport.
//!
//! Queries arrive over UDP; each one is resolved on its own task so slow
//! upstreams never hold up the listener.

pub mod udp;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;
