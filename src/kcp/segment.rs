use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum KcpCommand {
    Push = 81,
    Ack = 82,
    WindowAsk = 83,
    WindowTell = 84,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub conv: u32,
    pub cmd: KcpCommand,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub data: Vec<u8>,

    // sender-side bookkeeping, not serialized
    pub resend_ts: u32,
    pub rto: u32,
    pub fast_ack: u32,
    pub xmit: u32,
}

impl Segment {
    pub const HEADER_LEN: usize = 24;

    pub fn new(conv: u32, cmd: KcpCommand) -> Segment {
        Segment {
            conv,
            cmd,
            frg: 0,
            wnd: 0,
            ts: 0,
            sn: 0,
            una: 0,
            data: Vec::new(),
            resend_ts: 0,
            rto: 0,
            fast_ack: 0,
            xmit: 0,
        }
    }

    pub fn serialized_len(&self) -> usize {
        Self::HEADER_LEN + self.data.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd.into());
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
    }

    /// Parses one segment from the start of `buf`, advancing it past the segment
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Segment> {
        if buf.remaining() < Self::HEADER_LEN {
            bail!("{} bytes is too short for a segment header", buf.remaining());
        }

        let conv = buf.get_u32_le();
        let raw_cmd = buf.get_u8();
        let cmd = KcpCommand::try_from(raw_cmd)
            .map_err(|_| anyhow!("invalid segment command {}", raw_cmd))?;
        let frg = buf.get_u8();
        let wnd = buf.get_u16_le();
        let ts = buf.get_u32_le();
        let sn = buf.get_u32_le();
        let una = buf.get_u32_le();
        let len = buf.get_u32_le() as usize;

        if len > buf.remaining() {
            bail!("segment declares {} data bytes, but only {} are left", len, buf.remaining());
        }
        let mut data = vec![0u8; len];
        buf.copy_to_slice(&mut data);

        Ok(Segment {
            conv,
            cmd,
            frg,
            wnd,
            ts,
            sn,
            una,
            data,
            resend_ts: 0,
            rto: 0,
            fast_ack: 0,
            xmit: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_ser() {
        let mut segment = Segment::new(0x0403_0201, KcpCommand::Push);
        segment.frg = 1;
        segment.wnd = 0x0102;
        segment.ts = 5;
        segment.sn = 6;
        segment.una = 7;
        segment.data = vec![9, 9];

        let mut buf = BytesMut::new();
        segment.ser(&mut buf);

        assert_eq!(buf.as_ref(), &[
            1,2,3,4, 81, 1, 2,1, 5,0,0,0, 6,0,0,0, 7,0,0,0, 2,0,0,0, 9,9,
        ]);
        assert_eq!(segment.serialized_len(), buf.len());
    }

    #[test]
    fn test_deser_two_segments() {
        let mut a = Segment::new(1, KcpCommand::Ack);
        a.sn = 3;
        let mut b = Segment::new(1, KcpCommand::Push);
        b.data = vec![1, 2, 3];

        let mut buf = BytesMut::new();
        a.ser(&mut buf);
        b.ser(&mut buf);

        let mut parse_buf: &[u8] = &buf;
        assert_eq!(Segment::deser(&mut parse_buf).unwrap(), a);
        assert_eq!(Segment::deser(&mut parse_buf).unwrap(), b);
        assert!(parse_buf.is_empty());
    }

    #[rstest]
    #[case::short_header(vec![1,2,3])]
    #[case::bad_cmd(vec![1,0,0,0, 99, 0, 0,0, 0,0,0,0, 0,0,0,0, 0,0,0,0, 0,0,0,0])]
    #[case::truncated_data(vec![1,0,0,0, 81, 0, 0,0, 0,0,0,0, 0,0,0,0, 0,0,0,0, 5,0,0,0, 1,2])]
    fn test_deser_invalid(#[case] buf: Vec<u8>) {
        let mut parse_buf: &[u8] = &buf;
        assert!(Segment::deser(&mut parse_buf).is_err());
    }
}
