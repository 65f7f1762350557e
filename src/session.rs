use std::cmp::max;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::bail;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, trace};

use crate::crypto::Keystream;
use crate::frame::FrameCodec;
use crate::handshake::HandshakeState;
use crate::kcp::KcpConfig;
use crate::server::send_socket::SendSocket;
use crate::transport::{TransportChannel, WireLayout};
use crate::util::clock::EngineClock;

/// Identifies a client across datagrams: the peer's address plus the conversation id in the
///  datagram's first four bytes
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NetworkId {
    pub addr: SocketAddr,
    pub conv: u32,
}

impl Display for NetworkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:08x}", self.addr, self.conv)
    }
}

/// One client's session: its reliable transport channel and keystream.
///
/// Inbound frames are handed to a per-session worker through a queue holding at most one receive
///  window of frames, so the receive loop never waits for a handler. While the queue is full,
///  frames stay in the transport and the window advertised to the peer closes. Sends may come
///  from any task.
pub struct Session {
    network_id: NetworkId,
    token: u32,
    channel: Mutex<TransportChannel>,
    /// `None` until the session keystream is installed; the initial keystream applies until then.
    ///  Lock order: keystream before channel.
    keystream: RwLock<Option<Keystream>>,
    initial_keystream: Keystream,
    codec: FrameCodec,
    socket: Arc<dyn SendSocket>,
    clock: EngineClock,
    last_activity: AtomicU32,
    closed: AtomicBool,
    frames: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        network_id: NetworkId,
        token: u32,
        kcp_config: &KcpConfig,
        layout: WireLayout,
        codec: FrameCodec,
        initial_keystream: Keystream,
        socket: Arc<dyn SendSocket>,
        clock: EngineClock,
    ) -> (Arc<Session>, mpsc::Receiver<Vec<u8>>) {
        let now = clock.now_ms();
        let (send, recv) = mpsc::channel(max(kcp_config.receive_window as usize, 1));

        let session = Session {
            network_id,
            token,
            channel: Mutex::new(TransportChannel::new(network_id.conv, token, kcp_config, layout, now)),
            keystream: RwLock::new(None),
            initial_keystream,
            codec,
            socket,
            clock,
            last_activity: AtomicU32::new(now),
            closed: AtomicBool::new(false),
            frames: Mutex::new(Some(send)),
        };
        (Arc::new(session), recv)
    }

    pub fn network_id(&self) -> NetworkId {
        self.network_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.network_id.addr
    }

    pub fn conv(&self) -> u32 {
        self.network_id.conv
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn state(&self) -> HandshakeState {
        if self.is_closed() {
            HandshakeState::Disconnected
        }
        else {
            HandshakeState::Established { conv: self.conv(), token: self.token }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// the session-specific keystream, `None` while the session is still bootstrapping
    pub async fn session_keystream(&self) -> Option<Keystream> {
        self.keystream.read().await.clone()
    }

    /// the keystream inbound frames are decoded with, and whether it is the initial one
    pub async fn receive_keystream(&self) -> (Keystream, bool) {
        match self.keystream.read().await.as_ref() {
            Some(k) => (k.clone(), false),
            None => (self.initial_keystream.clone(), true),
        }
    }

    /// Feeds a client datagram into the transport, sends resulting acks and passes reassembled
    ///  frames to the session's worker as far as its queue has room. Returns the number of frames
    ///  passed on.
    pub async fn ingest(&self, datagram: &[u8]) -> anyhow::Result<usize> {
        if self.is_closed() {
            bail!("session {} is closed", self.network_id);
        }

        let now = self.clock.now_ms();
        self.last_activity.store(now, Ordering::Release);

        let sender = self.frames.lock().await.clone();
        let (num_frames, datagrams) = {
            let mut channel = self.channel.lock().await;
            channel.ingest(datagram, now)?;
            let num_frames = self.pass_frames_to_worker(&mut channel, sender.as_ref());
            (num_frames, channel.take_datagrams())
        };
        self.transmit(datagrams).await;
        Ok(num_frames)
    }

    /// Moves reassembled frames from the transport to the worker's queue until either runs empty
    ///  or the queue is full
    fn pass_frames_to_worker(&self, channel: &mut TransportChannel, sender: Option<&mpsc::Sender<Vec<u8>>>) -> usize {
        let Some(sender) = sender else {
            return 0;
        };

        let mut num_frames = 0;
        loop {
            let permit = match sender.try_reserve() {
                Ok(permit) => permit,
                Err(TrySendError::Full(())) => {
                    trace!("session {}: worker queue is full, leaving frames in the receive window", self.network_id);
                    break;
                }
                Err(TrySendError::Closed(())) => {
                    debug!("session {}: worker is gone", self.network_id);
                    break;
                }
            };
            let Some(frame) = channel.drain() else {
                break;
            };
            trace!("session {}: received frame of {} bytes", self.network_id, frame.len());
            permit.send(frame);
            num_frames += 1;
        }
        num_frames
    }

    /// Encodes a message under the session's current keystream and sends it
    pub async fn send(&self, name: &str, payload: &Value) -> anyhow::Result<()> {
        let keystream = self.keystream.read().await;
        let (_, frame) = self.codec.encode_named(name, payload, keystream.as_ref().unwrap_or(&self.initial_keystream))?;
        trace!("session {}: sending {}", self.network_id, name);
        self.send_frame(frame).await
    }

    /// Sends a message under the current keystream and installs `new_keystream` for all later
    ///  traffic in both directions. No other message of this session can be encoded in between.
    pub async fn send_and_rekey(&self, name: &str, payload: &Value, new_keystream: Keystream) -> anyhow::Result<()> {
        let mut keystream = self.keystream.write().await;
        let (_, frame) = self.codec.encode_named(name, payload, keystream.as_ref().unwrap_or(&self.initial_keystream))?;
        debug!("session {}: sending {} and installing session keystream", self.network_id, name);
        *keystream = Some(new_keystream);
        self.send_frame(frame).await
    }

    async fn send_frame(&self, frame: Bytes) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("session {} is closed", self.network_id);
        }

        let datagrams = {
            let mut channel = self.channel.lock().await;
            channel.send(&frame)?;
            channel.take_datagrams()
        };
        self.transmit(datagrams).await;
        Ok(())
    }

    /// Clock tick: passes frames that were held back to the worker if its queue has room again,
    ///  and fires retransmissions and window probes
    pub async fn update(&self, now: u32) {
        if self.is_closed() {
            return;
        }

        let sender = self.frames.lock().await.clone();
        let datagrams = {
            let mut channel = self.channel.lock().await;
            self.pass_frames_to_worker(&mut channel, sender.as_ref());
            channel.update(now);
            channel.take_datagrams()
        };
        self.transmit(datagrams).await;
    }

    async fn transmit(&self, datagrams: Vec<Bytes>) {
        for datagram in datagrams {
            self.socket.do_send_packet(self.peer_addr(), &datagram).await;
        }
    }

    pub async fn is_dead(&self) -> bool {
        self.channel.lock().await.is_dead()
    }

    /// milliseconds since the last inbound datagram
    pub fn idle_ms(&self, now: u32) -> u32 {
        now.wrapping_sub(self.last_activity.load(Ordering::Acquire))
    }

    /// Stops the session: no further datagrams are ingested or sent, and the worker terminates
    ///  after the frames it already received
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("closing session {}", self.network_id);
        }
        self.frames.lock().await.take();
    }
}
