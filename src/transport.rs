//! Reliable transport adapter: one KCP engine per session, plus the shim that converts between the
//!  client's datagram layout (which carries the session token inside every segment header) and
//!  standard KCP segments.

pub mod channel;
pub mod wire_layout;

pub use channel::TransportChannel;
pub use wire_layout::WireLayout;
