//! A reliable request/reply transport on top of UDP datagrams.
//!
//! ## Design goals
//!
//! * Thousands of concurrent in-flight transactions between hosts without
//!   per-peer connection state - no connect/close handshake, which makes it
//!   cheap to talk to many machines at once
//! * Each transaction lives in a *slot*, a pre-allocated record that plays the
//!   role of a short-lived socket. Slots are keyed by transaction id plus the
//!   peer's endpoint plus direction, so incoming replies can be matched to the
//!   requests that initiated them
//! * Reliability via application-level acknowledgments: a sender may have up
//!   to a fixed window of unacknowledged dgrams in flight per slot, and
//!   unacknowledged dgrams are re-sent with per-slot backoff until the peer
//!   acknowledges them or the transaction fails
//! * Requests are routed to handlers on the receiving side by a small message
//!   type carried in every dgram; completion of an outgoing request is
//!   delivered through a callback invoked exactly once
//! * The dgram format is pluggable: the default format carries checksums and
//!   ACK bitmaps, and a DNS-compatible variant maps the same capability set
//!   onto plain DNS headers
//! * Cooperative scheduling: all transport state is serialized by a single
//!   mutex, socket I/O is non-blocking, and the state machine is driven by
//!   three signals only (socket readable, socket writable, periodic tick)
//!
//! Explicitly *not* goals: congestion control beyond per-slot backoff, ordered
//! streams across transactions, encryption, and NAT traversal.

pub mod protocol;
pub mod server;
pub mod util;
