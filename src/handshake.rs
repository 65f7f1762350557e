//! Out-of-band control datagrams that precede (and end) a reliable session.
//!
//! ```ascii
//! 0:  magic1 (u32 BE) - identifies the kind of handshake
//! 4:  conv (u32 BE)
//! 8:  token (u32 BE)
//! 12: data (u32 BE)
//! 16: magic2 (u32 BE)
//! ```
//!
//! Every datagram of at most [HandshakePacket::SERIALIZED_LEN] bytes is a handshake, and every
//!  handshake gets exactly one reply. Longer datagrams are never handshakes.

use bytes::{BufMut, BytesMut};
use tracing::debug;

use crate::util::random::Random;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HandshakePacket {
    pub magic1: u32,
    pub conv: u32,
    pub token: u32,
    pub data: u32,
    pub magic2: u32,
}

impl HandshakePacket {
    pub const SERIALIZED_LEN: usize = 20;

    pub const MAGIC_CONNECT: (u32, u32) = (0xFF, 0xFFFF_FFFF);
    pub const MAGIC_SEND_BACK_CONV: (u32, u32) = (0x145, 0x1451_4545);
    pub const MAGIC_DISCONNECT: (u32, u32) = (0x194, 0x1941_9494);

    /// combined with random bits to make the token for a new conversation
    pub const TOKEN_XOR: u32 = 0xFFCC_EEBB;

    pub fn new(magic: (u32, u32), conv: u32, token: u32, data: u32) -> HandshakePacket {
        HandshakePacket {
            magic1: magic.0,
            conv,
            token,
            data,
            magic2: magic.1,
        }
    }

    /// the all-zero reply for handshakes of unknown kind
    pub fn empty() -> HandshakePacket {
        Self::new((0, 0), 0, 0, 0)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.magic1);
        buf.put_u32(self.conv);
        buf.put_u32(self.token);
        buf.put_u32(self.data);
        buf.put_u32(self.magic2);
    }

    /// Parses a control datagram. Datagrams shorter than 20 bytes are treated as if they were
    ///  zero-padded, so that even a truncated handshake can be answered.
    pub fn deser(buf: &[u8]) -> anyhow::Result<HandshakePacket> {
        if buf.len() > Self::SERIALIZED_LEN {
            anyhow::bail!("{} bytes is too long for a handshake", buf.len());
        }

        let mut padded = [0u8; Self::SERIALIZED_LEN];
        padded[..buf.len()].copy_from_slice(buf);

        let word = |offs: usize| u32::from_be_bytes([padded[offs], padded[offs+1], padded[offs+2], padded[offs+3]]);
        Ok(HandshakePacket {
            magic1: word(0),
            conv: word(4),
            token: word(8),
            data: word(12),
            magic2: word(16),
        })
    }

    pub fn kind(&self) -> HandshakeKind {
        match self.magic1 {
            m if m == Self::MAGIC_CONNECT.0 => HandshakeKind::Connect,
            m if m == Self::MAGIC_SEND_BACK_CONV.0 => HandshakeKind::SendBackConv,
            m if m == Self::MAGIC_DISCONNECT.0 => HandshakeKind::Disconnect,
            other => HandshakeKind::Unknown(other),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandshakeKind {
    Connect,
    SendBackConv,
    Disconnect,
    Unknown(u32),
}

/// Lifecycle of a client's pseudo-connection as seen by the server
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingConnect,
    /// CONNECT was answered, no data datagram arrived yet
    ConvAssigned { conv: u32, token: u32 },
    /// a session exists for the conversation
    Established { conv: u32, token: u32 },
    Disconnected,
}

/// What the server has to do in addition to sending the reply
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandshakeAction {
    AssignConv { conv: u32, token: u32 },
    Disconnect { conv: u32 },
    None,
}

#[derive(Debug)]
pub struct HandshakeOutcome {
    pub reply: HandshakePacket,
    pub action: HandshakeAction,
}

/// Processes one control datagram. `is_conv_taken` lets the caller reject conversation ids that
///  are currently in use.
pub fn on_control_datagram(buf: &[u8], random: &dyn Random, is_conv_taken: impl Fn(u32) -> bool) -> HandshakeOutcome {
    let request = match HandshakePacket::deser(buf) {
        Ok(p) => p,
        Err(e) => {
            // callers route only short datagrams here, so this is a bug rather than noise
            debug!("not a handshake: {}", e);
            return HandshakeOutcome { reply: HandshakePacket::empty(), action: HandshakeAction::None };
        }
    };

    match request.kind() {
        HandshakeKind::Connect => {
            let conv = allocate_conv(random, is_conv_taken);
            let token = HandshakePacket::TOKEN_XOR ^ random.next_u32();
            debug!("CONNECT: assigning conv {:08x}", conv);

            HandshakeOutcome {
                reply: HandshakePacket::new(HandshakePacket::MAGIC_SEND_BACK_CONV, conv, token, request.data),
                action: HandshakeAction::AssignConv { conv, token },
            }
        }
        HandshakeKind::Disconnect => {
            debug!("DISCONNECT for conv {:08x}", request.conv);
            HandshakeOutcome {
                reply: HandshakePacket::new(HandshakePacket::MAGIC_DISCONNECT, request.conv, request.token, request.data),
                action: HandshakeAction::Disconnect { conv: request.conv },
            }
        }
        kind => {
            debug!("unknown handshake kind {:?} - replying with an empty handshake", kind);
            HandshakeOutcome { reply: HandshakePacket::empty(), action: HandshakeAction::None }
        }
    }
}

fn allocate_conv(random: &dyn Random, is_conv_taken: impl Fn(u32) -> bool) -> u32 {
    loop {
        let conv = random.next_u32();
        if conv != 0 && !is_conv_taken(conv) {
            return conv;
        }
    }
}
