//! ARQ engine implementing the KCP protocol.
//!
//! KCP turns an unreliable, unordered datagram channel into an ordered, duplicate-free sequence of
//!  messages. Each message is split into segments of at most `mss` bytes; segments carry a sequence
//!  number (`sn`), the fragment countdown (`frg`, 0 for the last fragment of a message), the
//!  sender's cumulative ack (`una`) and its free receive window (`wnd`).
//!
//! The engine is sans-I/O: datagrams go in through [KcpEngine::input], reassembled messages come
//!  out through [KcpEngine::recv], and everything that should go on the wire accumulates in an
//!  outbox that the owner drains with [KcpEngine::take_output]. Time is passed in explicitly as a
//!  wrapping millisecond counter.
//!
//! ## Segment header
//!
//! All numbers little-endian:
//! ```ascii
//! 0:  conv (u32)
//! 4:  cmd (u8): 81 PUSH, 82 ACK, 83 WASK (window probe), 84 WINS (window size)
//! 5:  frg (u8)
//! 6:  wnd (u16)
//! 8:  ts (u32)
//! 12: sn (u32)
//! 16: una (u32)
//! 20: len (u32)
//! 24: data (len bytes)
//! ```

pub mod engine;
pub mod segment;

pub use engine::{KcpConfig, KcpEngine};
pub use segment::{KcpCommand, Segment};
