use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace};

use crate::crypto::Keystream;
use crate::handshake::HandshakePacket;
use crate::kcp::KcpConfig;
use crate::server::dispatcher::Dispatcher;
use crate::server::registry::SessionRegistry;
use crate::server::send_socket::SendSocket;
use crate::session::{NetworkId, Session};
use crate::transport::WireLayout;
use crate::util::clock::EngineClock;
use crate::util::random::Random;

const PURGE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct EndPointConfig {
    pub listen_addr: SocketAddr,
    pub max_datagram_size: usize,
    pub tick_interval: Duration,
    pub session_idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub kcp: KcpConfig,
    pub wire: WireLayout,
}

impl EndPointConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size <= HandshakePacket::SERIALIZED_LEN {
            bail!("max datagram size {} is too small", self.max_datagram_size);
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must be positive");
        }
        // idle times are measured on the wrapping millisecond engine clock
        if self.session_idle_timeout.is_zero() || self.session_idle_timeout.as_millis() > i32::MAX as u128 {
            bail!("session idle timeout must be positive and at most {} ms, is {:?}", i32::MAX, self.session_idle_timeout);
        }
        self.kcp.validate()?;
        self.wire.validate()?;
        Ok(())
    }

    pub fn session_idle_timeout_ms(&self) -> u32 {
        u32::try_from(self.session_idle_timeout.as_millis()).unwrap_or(u32::MAX)
    }
}

/// The UDP side of the server: a receive loop that demultiplexes datagrams into handshakes and
///  session traffic, and a clock tick that drives retransmission for all sessions.
pub struct EndPoint {
    socket: Arc<UdpSocket>,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
    initial_keystream: Keystream,
    random: Arc<dyn Random>,
    clock: EngineClock,
    config: EndPointConfig,
}

impl EndPoint {
    pub async fn new(
        config: EndPointConfig,
        dispatcher: Arc<Dispatcher>,
        initial_keystream: Keystream,
        random: Arc<dyn Random>,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.listen_addr).await?);
        info!("bound UDP socket to {:?}", socket.local_addr()?);

        Ok(EndPoint {
            socket,
            registry: Arc::new(SessionRegistry::new(config.handshake_timeout)),
            dispatcher,
            initial_keystream,
            random,
            clock: EngineClock::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        SendSocket::local_addr(self.socket.as_ref())
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Runs the receive loop and the clock tick until `shutdown` completes, then closes all
    ///  sessions
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) {
        tokio::select! {
            _ = self.recv_loop() => {}
            _ = self.tick_loop() => {}
            _ = shutdown => info!("shutting down"),
        }
        self.registry.close_all().await;
    }

    pub async fn recv_loop(&self) {
        info!("starting receive loop");

        let mut buf = vec![0u8; self.config.max_datagram_size];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };
            self.on_datagram(from, &buf[..num_read]).await;
        }
    }

    async fn on_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        trace!("received {} bytes from {:?}", datagram.len(), from);

        if datagram.len() <= HandshakePacket::SERIALIZED_LEN {
            let reply = self.registry.on_control_datagram(from, datagram, self.random.as_ref()).await;
            let mut buf = BytesMut::with_capacity(HandshakePacket::SERIALIZED_LEN);
            reply.ser(&mut buf);
            self.socket.do_send_packet(from, &buf).await;
            return;
        }

        let Some((conv, token)) = self.config.wire.peek_conv_and_token(datagram) else {
            trace!("datagram of {} bytes from {:?} is neither a handshake nor a segment - dropping", datagram.len(), from);
            return;
        };

        let network_id = NetworkId { addr: from, conv };
        let Some(session) = self.registry.resolve_or_create(network_id, token, |id, token| self.create_session(id, token)).await else {
            return;
        };

        if let Err(e) = session.ingest(datagram).await {
            debug!("session {}: dropping datagram: {}", network_id, e);
        }
    }

    fn create_session(&self, network_id: NetworkId, token: u32) -> Arc<Session> {
        let (session, frames) = Session::new(
            network_id,
            token,
            &self.config.kcp,
            self.config.wire,
            self.dispatcher.codec().clone(),
            self.initial_keystream.clone(),
            self.socket.clone(),
            self.clock,
        );
        tokio::spawn(self.dispatcher.clone().run_worker(session.clone(), frames));
        session
    }

    pub async fn tick_loop(&self) {
        let mut ticks = tokio::time::interval(self.config.tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_purge = Instant::now();

        loop {
            ticks.tick().await;

            let now = self.clock.now_ms();
            for session in self.registry.sessions().await {
                session.update(now).await;
            }

            if last_purge.elapsed() >= PURGE_INTERVAL {
                last_purge = Instant::now();
                let purged = self.registry.purge(now, self.config.session_idle_timeout_ms()).await;
                if !purged.is_empty() {
                    debug!("purged {} sessions", purged.len());
                }
            }
        }
    }
}
