use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::kcp::Segment;

const TOKEN_LEN: usize = 4;

/// Byte layout of a client segment. The client inserts the session token into the standard KCP
///  header, so its segment header is 4 bytes longer:
///
/// ```ascii
/// 0:  conv (4)
/// 4:  token (4, big endian)
/// 8:  rest of the KCP header (20), with the data length (u32 LE) at `length_offset`
/// 28: data
/// ```
///
/// The offsets depend on the client build, so they are configuration rather than constants.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireLayout {
    pub client_header_len: usize,
    pub token_offset: usize,
    pub length_offset: usize,
}

impl Default for WireLayout {
    fn default() -> Self {
        WireLayout {
            client_header_len: 28,
            token_offset: 4,
            length_offset: 24,
        }
    }
}

impl WireLayout {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.client_header_len != Segment::HEADER_LEN + TOKEN_LEN {
            bail!("client header length must be {}, is {}", Segment::HEADER_LEN + TOKEN_LEN, self.client_header_len);
        }
        if self.token_offset < 4 || self.token_offset + TOKEN_LEN > self.client_header_len {
            bail!("token offset {} is outside the client header", self.token_offset);
        }
        let token_range = self.token_offset..self.token_offset + TOKEN_LEN;
        if self.length_offset + 4 > self.client_header_len
            || token_range.contains(&self.length_offset)
            || token_range.contains(&(self.length_offset + 3))
        {
            bail!("length offset {} is outside the client header or overlaps the token", self.length_offset);
        }
        Ok(())
    }

    /// conversation id and token of the first segment in a client datagram, `None` if the datagram
    ///  is too short to hold a segment header
    pub fn peek_conv_and_token(&self, datagram: &[u8]) -> Option<(u32, u32)> {
        if datagram.len() < self.client_header_len {
            return None;
        }
        let conv = (&datagram[..4]).get_u32_le();
        let token = (&datagram[self.token_offset..self.token_offset + TOKEN_LEN]).get_u32();
        Some((conv, token))
    }

    /// Converts a client datagram (possibly several segments) into standard KCP segments, returning
    ///  them together with the token they carried. All segments in a datagram must carry the same
    ///  token, and a truncated trailing segment invalidates the whole datagram.
    pub fn split_inbound(&self, datagram: &[u8]) -> anyhow::Result<(BytesMut, u32)> {
        let mut result = BytesMut::with_capacity(datagram.len());
        let mut token = None;

        let mut remaining = datagram;
        while !remaining.is_empty() {
            if remaining.len() < self.client_header_len {
                bail!("trailing {} bytes are too short for a segment header", remaining.len());
            }

            let data_len = (&remaining[self.length_offset..self.length_offset + 4]).get_u32_le() as usize;
            let segment_len = self.client_header_len + data_len;
            if remaining.len() < segment_len {
                bail!("segment announces {} data bytes, only {} available", data_len, remaining.len() - self.client_header_len);
            }

            let segment_token = (&remaining[self.token_offset..self.token_offset + TOKEN_LEN]).get_u32();
            match token {
                None => token = Some(segment_token),
                Some(t) if t != segment_token => bail!("segments in one datagram carry different tokens"),
                Some(_) => {}
            }

            result.put_slice(&remaining[..self.token_offset]);
            result.put_slice(&remaining[self.token_offset + TOKEN_LEN..segment_len]);
            remaining = &remaining[segment_len..];
        }

        match token {
            Some(token) => Ok((result, token)),
            None => bail!("empty datagram"),
        }
    }

    /// Converts a datagram produced by the KCP engine into client datagrams, one per segment, each
    ///  with `token` inserted into the header.
    pub fn tag_outbound(&self, kcp_datagram: &[u8], token: u32) -> anyhow::Result<Vec<Bytes>> {
        // standard header: data length at offset 20
        const KCP_LENGTH_OFFSET: usize = 20;

        let mut result = Vec::new();
        let mut remaining = kcp_datagram;
        while !remaining.is_empty() {
            if remaining.len() < Segment::HEADER_LEN {
                bail!("trailing {} bytes are too short for a KCP segment", remaining.len());
            }
            let data_len = (&remaining[KCP_LENGTH_OFFSET..KCP_LENGTH_OFFSET + 4]).get_u32_le() as usize;
            let segment_len = Segment::HEADER_LEN + data_len;
            if remaining.len() < segment_len {
                bail!("KCP segment announces {} data bytes, only {} available", data_len, remaining.len() - Segment::HEADER_LEN);
            }

            let mut buf = BytesMut::with_capacity(segment_len + TOKEN_LEN);
            buf.put_slice(&remaining[..self.token_offset]);
            buf.put_u32(token);
            buf.put_slice(&remaining[self.token_offset..segment_len]);
            result.push(buf.freeze());

            remaining = &remaining[segment_len..];
        }
        Ok(result)
    }
}
