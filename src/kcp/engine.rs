use std::cmp::{max, min};
use std::collections::VecDeque;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::kcp::segment::{KcpCommand, Segment};

const RTO_NODELAY_MIN: u32 = 30;
const RTO_MIN: u32 = 100;
const RTO_DEFAULT: u32 = 200;
const RTO_MAX: u32 = 60_000;

const ASK_SEND: u32 = 1;
const ASK_TELL: u32 = 2;

/// Upper bound for the number of fragments of a single message - the peer must be able to hold
///  all of them in its receive queue
const MAX_FRAGMENTS: usize = 128;

const THRESH_INIT: u32 = 2;
const THRESH_MIN: u32 = 2;
const PROBE_INIT: u32 = 7_000;
const PROBE_LIMIT: u32 = 120_000;
const FAST_ACK_LIMIT: u32 = 5;

/// Engine tuning. The defaults are the low-latency profile: no-delay retransmission, a short
///  update interval, fast resend after two skipping acks and no congestion window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KcpConfig {
    pub nodelay: bool,
    pub interval_ms: u32,
    /// number of acks for later segments after which a segment is resent without waiting for its
    ///  timeout; 0 disables fast resend
    pub fast_resend: u32,
    pub no_congestion_control: bool,
    pub send_window: u16,
    pub receive_window: u16,
    /// maximum size of a datagram produced by the engine, including segment headers
    pub mtu: usize,
    /// number of transmissions of a single segment after which the link is considered dead
    pub dead_link: u32,
}

impl Default for KcpConfig {
    fn default() -> Self {
        KcpConfig {
            nodelay: true,
            interval_ms: 10,
            fast_resend: 2,
            no_congestion_control: true,
            send_window: 256,
            receive_window: 256,
            mtu: 1200,
            dead_link: 20,
        }
    }
}

impl KcpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < 50 || self.mtu > 65_535 {
            bail!("KCP mtu must be between 50 and 65535, is {}", self.mtu);
        }
        if self.send_window == 0 || (self.receive_window as usize) < MAX_FRAGMENTS {
            bail!("KCP windows must be positive and the receive window at least {}", MAX_FRAGMENTS);
        }
        Ok(())
    }
}

/// wrap-around aware difference of two timestamps or sequence numbers
fn time_diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// The state of one KCP conversation
pub struct KcpEngine {
    conv: u32,
    mtu: usize,
    mss: usize,
    dead: bool,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    ssthresh: u32,
    rx_rttval: i32,
    rx_srtt: i32,
    rx_rto: u32,
    rx_minrto: u32,

    snd_wnd: u32,
    rcv_wnd: u32,
    rmt_wnd: u32,
    cwnd: u32,
    incr: u32,
    probe: u32,
    ts_probe: u32,
    probe_wait: u32,

    current: u32,
    interval: u32,
    ts_flush: u32,
    updated: bool,

    nodelay: bool,
    fast_resend: u32,
    no_cwnd: bool,
    dead_link: u32,
    retransmissions: u64,

    /// messages split into segments, not yet in the send window
    snd_queue: VecDeque<Segment>,
    /// sent but unacknowledged segments
    snd_buf: VecDeque<Segment>,
    /// in-sequence segments ready for [KcpEngine::recv]
    rcv_queue: VecDeque<Segment>,
    /// out-of-sequence segments waiting for a gap to be filled, ordered by sn
    rcv_buf: VecDeque<Segment>,
    /// (sn, ts) of received PUSH segments to be acknowledged in the next flush
    ack_list: Vec<(u32, u32)>,

    output: Vec<Bytes>,
}

impl KcpEngine {
    pub fn new(conv: u32, config: &KcpConfig) -> KcpEngine {
        KcpEngine {
            conv,
            mtu: config.mtu,
            mss: config.mtu - Segment::HEADER_LEN,
            dead: false,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            ssthresh: THRESH_INIT,
            rx_rttval: 0,
            rx_srtt: 0,
            rx_rto: RTO_DEFAULT,
            rx_minrto: if config.nodelay { RTO_NODELAY_MIN } else { RTO_MIN },
            snd_wnd: config.send_window as u32,
            rcv_wnd: config.receive_window as u32,
            rmt_wnd: config.receive_window as u32,
            cwnd: 0,
            incr: 0,
            probe: 0,
            ts_probe: 0,
            probe_wait: 0,
            current: 0,
            interval: config.interval_ms.clamp(10, 5000),
            ts_flush: 0,
            updated: false,
            nodelay: config.nodelay,
            fast_resend: config.fast_resend,
            no_cwnd: config.no_congestion_control,
            dead_link: config.dead_link,
            retransmissions: 0,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            ack_list: Vec::new(),
            output: Vec::new(),
        }
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    /// true once some segment was transmitted `dead_link` times without being acknowledged
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// number of segments that are queued or in flight
    pub fn wait_send(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }

    /// Queues a message for sending, splitting it into fragments. Nothing goes on the wire before
    ///  the next [KcpEngine::update] or [KcpEngine::flush].
    pub fn send(&mut self, message: &[u8]) -> anyhow::Result<()> {
        let count = if message.len() <= self.mss {
            1
        }
        else {
            message.len().div_ceil(self.mss)
        };

        if count >= MAX_FRAGMENTS {
            bail!("message of {} bytes needs {} fragments, the maximum is {}", message.len(), count, MAX_FRAGMENTS - 1);
        }

        for (i, chunk) in message.chunks(self.mss).enumerate() {
            let mut segment = Segment::new(self.conv, KcpCommand::Push);
            segment.data = chunk.to_vec();
            segment.frg = (count - i - 1) as u8;
            self.snd_queue.push_back(segment);
        }
        if message.is_empty() {
            self.snd_queue.push_back(Segment::new(self.conv, KcpCommand::Push));
        }

        trace!("conv {:08x}: queued message of {} bytes in {} fragments", self.conv, message.len(), count);
        Ok(())
    }

    /// size of the next complete message in the receive queue, if there is one
    pub fn peek_size(&self) -> Option<usize> {
        let first = self.rcv_queue.front()?;
        if first.frg == 0 {
            return Some(first.data.len());
        }
        if self.rcv_queue.len() < first.frg as usize + 1 {
            return None;
        }

        let mut len = 0;
        for segment in &self.rcv_queue {
            len += segment.data.len();
            if segment.frg == 0 {
                break;
            }
        }
        Some(len)
    }

    /// Returns the next reassembled message, or `None` if no complete message is available
    pub fn recv(&mut self) -> Option<Vec<u8>> {
        let size = self.peek_size()?;
        let recover = self.rcv_queue.len() >= self.rcv_wnd as usize;

        let mut message = Vec::with_capacity(size);
        while let Some(segment) = self.rcv_queue.pop_front() {
            message.extend_from_slice(&segment.data);
            if segment.frg == 0 {
                break;
            }
        }

        self.move_receive_buffer_to_queue();

        if recover && self.rcv_queue.len() < self.rcv_wnd as usize {
            // the peer saw a zero window and is waiting to be told it opened up again
            self.probe |= ASK_TELL;
        }

        Some(message)
    }

    /// Processes a datagram holding one or more segments (standard 24 byte headers). Segments
    ///  before a malformed one are still processed.
    pub fn input(&mut self, datagram: &[u8]) -> anyhow::Result<()> {
        if datagram.len() < Segment::HEADER_LEN {
            bail!("datagram of {} bytes is too short for a segment", datagram.len());
        }

        let prev_una = self.snd_una;
        let mut max_ack: Option<(u32, u32)> = None;

        let mut buf = datagram;
        while buf.len() >= Segment::HEADER_LEN {
            let segment = Segment::deser(&mut buf)?;
            if segment.conv != self.conv {
                bail!("segment for conv {:08x} received by conv {:08x}", segment.conv, self.conv);
            }

            self.rmt_wnd = segment.wnd as u32;
            self.parse_una(segment.una);
            self.shrink_send_buffer();

            match segment.cmd {
                KcpCommand::Ack => {
                    let rtt = time_diff(self.current, segment.ts);
                    if rtt >= 0 {
                        self.update_rtt(rtt);
                    }
                    self.parse_ack(segment.sn);
                    self.shrink_send_buffer();

                    max_ack = match max_ack {
                        Some((sn, _)) if time_diff(segment.sn, sn) <= 0 => max_ack,
                        _ => Some((segment.sn, segment.ts)),
                    };
                }
                KcpCommand::Push => {
                    if time_diff(segment.sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) < 0 {
                        self.ack_list.push((segment.sn, segment.ts));
                        if time_diff(segment.sn, self.rcv_nxt) >= 0 {
                            self.parse_data(segment);
                        }
                        else {
                            trace!("conv {:08x}: duplicate of delivered segment #{}", self.conv, segment.sn);
                        }
                    }
                    else {
                        debug!("conv {:08x}: segment #{} is beyond the receive window - dropping", self.conv, segment.sn);
                    }
                }
                KcpCommand::WindowAsk => {
                    self.probe |= ASK_TELL;
                }
                KcpCommand::WindowTell => {}
            }
        }

        if let Some((sn, _ts)) = max_ack {
            self.parse_fast_ack(sn);
        }

        if time_diff(self.snd_una, prev_una) > 0 && self.cwnd < self.rmt_wnd {
            self.grow_congestion_window();
        }

        Ok(())
    }

    /// Advances the engine clock to `current` and flushes if the update interval has elapsed
    pub fn update(&mut self, current: u32) {
        self.current = current;

        if !self.updated {
            self.updated = true;
            self.ts_flush = current;
        }

        let mut slap = time_diff(current, self.ts_flush);
        if !(-10_000..10_000).contains(&slap) {
            self.ts_flush = current;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if time_diff(current, self.ts_flush) >= 0 {
                self.ts_flush = current.wrapping_add(self.interval);
            }
            self.flush();
        }
    }

    /// Datagrams produced since the last call, in the order they must be sent
    pub fn take_output(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.output)
    }

    /// Writes pending acks, window probes and due (re)transmissions to the outbox
    pub fn flush(&mut self) {
        if !self.updated {
            return;
        }

        let current = self.current;
        let mut buf = BytesMut::with_capacity(self.mtu);

        let mut control = Segment::new(self.conv, KcpCommand::Ack);
        control.wnd = self.unused_window();
        control.una = self.rcv_nxt;

        for (sn, ts) in std::mem::take(&mut self.ack_list) {
            if buf.len() + Segment::HEADER_LEN > self.mtu {
                self.output.push(buf.split().freeze());
            }
            control.sn = sn;
            control.ts = ts;
            control.ser(&mut buf);
        }

        // probe the remote window if it is closed
        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT;
                self.ts_probe = current.wrapping_add(self.probe_wait);
            }
            else if time_diff(current, self.ts_probe) >= 0 {
                self.probe_wait = max(self.probe_wait, PROBE_INIT);
                self.probe_wait += self.probe_wait / 2;
                self.probe_wait = min(self.probe_wait, PROBE_LIMIT);
                self.ts_probe = current.wrapping_add(self.probe_wait);
                self.probe |= ASK_SEND;
            }
        }
        else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }

        for (flag, cmd) in [(ASK_SEND, KcpCommand::WindowAsk), (ASK_TELL, KcpCommand::WindowTell)] {
            if self.probe & flag != 0 {
                control.cmd = cmd;
                control.sn = 0;
                control.ts = 0;
                if buf.len() + Segment::HEADER_LEN > self.mtu {
                    self.output.push(buf.split().freeze());
                }
                control.ser(&mut buf);
            }
        }
        self.probe = 0;

        let mut cwnd = min(self.snd_wnd, self.rmt_wnd);
        if !self.no_cwnd {
            cwnd = min(self.cwnd, cwnd);
        }

        // move segments from the queue into the send window
        while time_diff(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) < 0 {
            let Some(mut segment) = self.snd_queue.pop_front() else {
                break;
            };
            segment.conv = self.conv;
            segment.cmd = KcpCommand::Push;
            segment.wnd = control.wnd;
            segment.ts = current;
            segment.sn = self.snd_nxt;
            segment.una = self.rcv_nxt;
            segment.resend_ts = current;
            segment.rto = self.rx_rto;
            segment.fast_ack = 0;
            segment.xmit = 0;

            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_buf.push_back(segment);
        }

        let resent = if self.fast_resend > 0 { self.fast_resend } else { u32::MAX };
        let rto_min = if self.nodelay { 0 } else { self.rx_rto >> 3 };

        let mut lost = false;
        let mut change = false;

        for segment in self.snd_buf.iter_mut() {
            let mut need_send = false;

            if segment.xmit == 0 {
                need_send = true;
                segment.xmit += 1;
                segment.rto = self.rx_rto;
                segment.resend_ts = current.wrapping_add(segment.rto).wrapping_add(rto_min);
            }
            else if time_diff(current, segment.resend_ts) >= 0 {
                need_send = true;
                segment.xmit += 1;
                self.retransmissions += 1;
                if self.nodelay {
                    segment.rto += segment.rto / 2;
                }
                else {
                    segment.rto += max(segment.rto, self.rx_rto);
                }
                segment.resend_ts = current.wrapping_add(segment.rto);
                lost = true;
            }
            else if segment.fast_ack >= resent && segment.xmit <= FAST_ACK_LIMIT {
                need_send = true;
                segment.xmit += 1;
                segment.fast_ack = 0;
                segment.resend_ts = current.wrapping_add(segment.rto);
                change = true;
            }

            if need_send {
                segment.ts = current;
                segment.wnd = control.wnd;
                segment.una = self.rcv_nxt;

                if buf.len() + segment.serialized_len() > self.mtu {
                    self.output.push(buf.split().freeze());
                }
                segment.ser(&mut buf);

                if segment.xmit >= self.dead_link {
                    self.dead = true;
                }
            }
        }

        if !buf.is_empty() {
            self.output.push(buf.freeze());
        }

        if change {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.ssthresh = max(inflight / 2, THRESH_MIN);
            self.cwnd = self.ssthresh.saturating_add(resent);
            self.incr = self.cwnd.saturating_mul(self.mss as u32);
        }
        if lost {
            self.ssthresh = max(cwnd / 2, THRESH_MIN);
            self.cwnd = 1;
            self.incr = self.mss as u32;
        }
        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = self.mss as u32;
        }
    }

    /// number of messages the receive queue can still take, as advertised to the peer
    pub fn unused_window(&self) -> u16 {
        let used = self.rcv_queue.len() as u32;
        if used < self.rcv_wnd {
            (self.rcv_wnd - used) as u16
        }
        else {
            0
        }
    }

    fn update_rtt(&mut self, rtt: i32) {
        // the peer echoes `ts`, so the sample can be anything up to i32::MAX
        let rtt = rtt.clamp(0, RTO_MAX as i32);

        if self.rx_srtt == 0 {
            self.rx_srtt = rtt;
            self.rx_rttval = rtt / 2;
        }
        else {
            let delta = (rtt - self.rx_srtt).abs();
            self.rx_rttval = (3 * self.rx_rttval + delta) / 4;
            self.rx_srtt = max((7 * self.rx_srtt + rtt) / 8, 1);
        }

        let rto = (self.rx_srtt as u32).saturating_add(max(self.interval, 4 * self.rx_rttval as u32));
        self.rx_rto = rto.clamp(self.rx_minrto, RTO_MAX);
    }

    fn shrink_send_buffer(&mut self) {
        self.snd_una = self.snd_buf.front()
            .map(|s| s.sn)
            .unwrap_or(self.snd_nxt);
    }

    fn parse_ack(&mut self, sn: u32) {
        if time_diff(sn, self.snd_una) < 0 || time_diff(sn, self.snd_nxt) >= 0 {
            return;
        }

        for i in 0..self.snd_buf.len() {
            let segment_sn = self.snd_buf[i].sn;
            if segment_sn == sn {
                self.snd_buf.remove(i);
                break;
            }
            if time_diff(sn, segment_sn) < 0 {
                break;
            }
        }
    }

    fn parse_una(&mut self, una: u32) {
        while let Some(first) = self.snd_buf.front() {
            if time_diff(una, first.sn) > 0 {
                self.snd_buf.pop_front();
            }
            else {
                break;
            }
        }
    }

    fn parse_fast_ack(&mut self, sn: u32) {
        if time_diff(sn, self.snd_una) < 0 || time_diff(sn, self.snd_nxt) >= 0 {
            return;
        }

        for segment in self.snd_buf.iter_mut() {
            if time_diff(sn, segment.sn) < 0 {
                break;
            }
            if sn != segment.sn {
                segment.fast_ack += 1;
            }
        }
    }

    fn parse_data(&mut self, segment: Segment) {
        let sn = segment.sn;
        if time_diff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) >= 0 || time_diff(sn, self.rcv_nxt) < 0 {
            return;
        }

        let mut insert_at = 0;
        let mut repeat = false;
        for i in (0..self.rcv_buf.len()).rev() {
            let buffered_sn = self.rcv_buf[i].sn;
            if buffered_sn == sn {
                repeat = true;
                break;
            }
            if time_diff(sn, buffered_sn) > 0 {
                insert_at = i + 1;
                break;
            }
        }

        if repeat {
            trace!("conv {:08x}: duplicate of buffered segment #{}", self.conv, sn);
        }
        else {
            self.rcv_buf.insert(insert_at, segment);
        }

        self.move_receive_buffer_to_queue();
    }

    fn move_receive_buffer_to_queue(&mut self) {
        while let Some(first) = self.rcv_buf.front() {
            if first.sn != self.rcv_nxt || self.rcv_queue.len() >= self.rcv_wnd as usize {
                break;
            }
            if let Some(segment) = self.rcv_buf.pop_front() {
                self.rcv_queue.push_back(segment);
            }
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        }
    }

    fn grow_congestion_window(&mut self) {
        let mss = self.mss as u32;
        if self.cwnd < self.ssthresh {
            self.cwnd += 1;
            self.incr += mss;
        }
        else {
            if self.incr < mss {
                self.incr = mss;
            }
            self.incr += (mss * mss) / self.incr + mss / 16;
            if (self.cwnd + 1) * mss <= self.incr {
                self.cwnd = self.incr.div_ceil(max(mss, 1));
            }
        }
        if self.cwnd > self.rmt_wnd {
            self.cwnd = self.rmt_wnd;
            self.incr = self.rmt_wnd * mss;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config(mtu: usize) -> KcpConfig {
        KcpConfig {
            mtu,
            ..KcpConfig::default()
        }
    }

    /// delivers all datagrams from `from` to `to` in the given order
    fn deliver(to: &mut KcpEngine, datagrams: &[Bytes]) {
        for d in datagrams {
            to.input(d).unwrap();
        }
    }

    fn ack(conv: u32, sn: u32, ts: u32) -> Bytes {
        let mut ack = Segment::new(conv, KcpCommand::Ack);
        ack.sn = sn;
        ack.ts = ts;
        ack.wnd = 128;
        let mut buf = BytesMut::new();
        ack.ser(&mut buf);
        buf.freeze()
    }

    fn drain(engine: &mut KcpEngine) -> Vec<Vec<u8>> {
        let mut result = Vec::new();
        while let Some(msg) = engine.recv() {
            result.push(msg);
        }
        result
    }

    #[rstest]
    #[case::empty(0, 1)]
    #[case::small(10, 1)]
    #[case::exactly_mss(76, 1)]
    #[case::mss_plus_one(77, 2)]
    #[case::three(200, 3)]
    fn test_send_fragments(#[case] len: usize, #[case] expected_fragments: usize) {
        let mut engine = KcpEngine::new(1, &config(100));
        engine.send(&vec![7u8; len]).unwrap();

        assert_eq!(engine.snd_queue.len(), expected_fragments);
        let frgs = engine.snd_queue.iter().map(|s| s.frg as usize).collect::<Vec<_>>();
        assert_eq!(frgs, (0..expected_fragments).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_send_too_many_fragments() {
        let mut engine = KcpEngine::new(1, &config(100));
        assert!(engine.send(&vec![0u8; 76 * 200]).is_err());
    }

    #[test]
    fn test_nothing_is_sent_before_update() {
        let mut engine = KcpEngine::new(1, &config(100));
        engine.send(&[1, 2, 3]).unwrap();
        engine.flush();
        assert!(engine.take_output().is_empty());
    }

    #[rstest]
    #[case::one_small(vec![vec![1, 2, 3]])]
    #[case::several(vec![vec![1], vec![2, 2], vec![3, 3, 3]])]
    #[case::fragmented(vec![(0..250u8).collect()])]
    #[case::mixed(vec![vec![9; 150], vec![1], vec![8; 77]])]
    fn test_in_order_delivery(#[case] messages: Vec<Vec<u8>>) {
        let mut a = KcpEngine::new(5, &config(100));
        let mut b = KcpEngine::new(5, &config(100));

        for m in &messages {
            a.send(m).unwrap();
        }
        a.update(0);
        deliver(&mut b, &a.take_output());

        assert_eq!(drain(&mut b), messages);
    }

    #[test]
    fn test_reordered_duplicated_and_lost_datagrams() {
        let mut a = KcpEngine::new(9, &config(100));
        let mut b = KcpEngine::new(9, &config(100));

        // 50 byte messages produce one 74 byte segment per datagram
        let messages = (0..6u8).map(|i| vec![i; 50]).collect::<Vec<_>>();
        for m in &messages {
            a.send(m).unwrap();
        }
        a.update(0);
        let sent = a.take_output();
        assert_eq!(sent.len(), 6);

        // reverse order, duplicate #4 and #1, drop #2
        let mangled = vec![
            sent[5].clone(), sent[4].clone(), sent[4].clone(), sent[3].clone(),
            sent[1].clone(), sent[0].clone(), sent[1].clone(),
        ];
        deliver(&mut b, &mangled);

        assert_eq!(drain(&mut b), messages[..2].to_vec());

        // acks flow back, the sender retransmits the missing segment once its timeout expires
        b.update(10);
        deliver(&mut a, &b.take_output());
        a.update(500);
        let resent = a.take_output();
        assert!(!resent.is_empty());
        deliver(&mut b, &resent);

        assert_eq!(drain(&mut b), messages[2..].to_vec());
        assert!(drain(&mut b).is_empty());
        assert_eq!(a.retransmissions(), 1);
    }

    #[test]
    fn test_acks_clear_send_buffer() {
        let mut a = KcpEngine::new(3, &config(100));
        let mut b = KcpEngine::new(3, &config(100));

        a.send(&[1, 2, 3]).unwrap();
        a.update(0);
        deliver(&mut b, &a.take_output());
        assert_eq!(a.wait_send(), 1);

        b.update(20);
        deliver(&mut a, &b.take_output());
        assert_eq!(a.wait_send(), 0);
    }

    #[test]
    fn test_fragments_are_not_delivered_partially() {
        let mut a = KcpEngine::new(3, &config(100));
        let mut b = KcpEngine::new(3, &config(100));

        a.send(&[5u8; 200]).unwrap();
        a.update(0);
        let sent = a.take_output();
        assert_eq!(sent.len(), 3);

        deliver(&mut b, &sent[..2]);
        assert_eq!(b.peek_size(), None);
        assert!(b.recv().is_none());

        deliver(&mut b, &sent[2..]);
        assert_eq!(b.recv(), Some(vec![5u8; 200]));
    }

    #[rstest]
    #[case::too_short(vec![1, 2, 3])]
    #[case::wrong_conv(vec![2,0,0,0, 81, 0, 0,1, 0,0,0,0, 0,0,0,0, 0,0,0,0, 0,0,0,0])]
    fn test_input_rejects_invalid(#[case] datagram: Vec<u8>) {
        let mut engine = KcpEngine::new(1, &config(100));
        assert!(engine.input(&datagram).is_err());
        assert!(engine.recv().is_none());
    }

    #[test]
    fn test_link_dies_without_acks() {
        let mut engine = KcpEngine::new(1, &KcpConfig { dead_link: 3, ..config(100) });
        engine.send(&[1]).unwrap();

        let mut now = 0;
        for _ in 0..100 {
            engine.update(now);
            engine.take_output();
            now += 1000;
            if engine.is_dead() {
                break;
            }
        }
        assert!(engine.is_dead());
    }

    #[rstest]
    #[case::default(KcpConfig::default(), true)]
    #[case::tiny_mtu(KcpConfig { mtu: 10, ..KcpConfig::default() }, false)]
    #[case::small_receive_window(KcpConfig { receive_window: 16, ..KcpConfig::default() }, false)]
    fn test_config_validate(#[case] config: KcpConfig, #[case] expected_ok: bool) {
        assert_eq!(config.validate().is_ok(), expected_ok);
    }

    #[rstest]
    #[case::far_past(0x7FFF_FFF0)]
    #[case::just_beyond_max(RTO_MAX + 1)]
    #[case::regular(40)]
    fn test_echoed_timestamp_keeps_rto_in_range(#[case] age: u32) {
        let now = 0x7000_0000;
        let mut engine = KcpEngine::new(1, &KcpConfig::default());
        engine.send(b"x").unwrap();
        engine.update(now);
        engine.take_output();

        engine.input(&ack(1, 0, now.wrapping_sub(age))).unwrap();
        assert!(engine.rx_rto >= engine.rx_minrto && engine.rx_rto <= RTO_MAX);

        // a second sample goes through the smoothing path
        engine.send(b"y").unwrap();
        engine.flush();
        engine.input(&ack(1, 1, now.wrapping_sub(age))).unwrap();
        assert!(engine.rx_rto >= engine.rx_minrto && engine.rx_rto <= RTO_MAX);
        assert!(engine.rx_srtt <= RTO_MAX as i32);
        assert_eq!(engine.wait_send(), 0);
    }
}
