use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crate::handshake::{on_control_datagram, HandshakeAction, HandshakePacket, HandshakeState};
use crate::session::{NetworkId, Session};
use crate::util::random::Random;

struct PendingHandshake {
    token: u32,
    since: Instant,
}

#[derive(Default)]
struct Inner {
    sessions: FxHashMap<NetworkId, Arc<Session>>,
    /// conversations assigned by CONNECT for which no data datagram arrived yet
    pending: FxHashMap<NetworkId, PendingHandshake>,
    /// conversation ids of all sessions and pending handshakes
    convs: FxHashSet<u32>,
}

impl Inner {
    fn is_conv_taken(&self, conv: u32) -> bool {
        self.convs.contains(&conv)
    }

    fn remove_pending(&mut self, network_id: &NetworkId) {
        if self.pending.remove(network_id).is_some() {
            self.convs.remove(&network_id.conv);
        }
    }

    fn remove_session(&mut self, network_id: &NetworkId) -> Option<Arc<Session>> {
        let session = self.sessions.remove(network_id)?;
        self.convs.remove(&network_id.conv);
        Some(session)
    }
}

/// All sessions and pending handshakes of a server. This is the only state shared between
///  sessions; every operation is serialized through one lock.
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    handshake_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(handshake_timeout: Duration) -> SessionRegistry {
        SessionRegistry {
            inner: Default::default(),
            handshake_timeout,
        }
    }

    /// Processes a control datagram from `from` and returns the reply. A DISCONNECT closes and
    ///  removes the peer's session before returning.
    pub async fn on_control_datagram(&self, from: SocketAddr, buf: &[u8], random: &dyn Random) -> HandshakePacket {
        let mut inner = self.inner.lock().await;

        let outcome = on_control_datagram(buf, random, |conv| inner.is_conv_taken(conv));
        match outcome.action {
            HandshakeAction::AssignConv { conv, token } => {
                info!("{:?}: assigned conv {:08x}", from, conv);
                inner.pending.insert(NetworkId { addr: from, conv }, PendingHandshake { token, since: Instant::now() });
                inner.convs.insert(conv);
            }
            HandshakeAction::Disconnect { conv } => {
                let network_id = NetworkId { addr: from, conv };
                inner.remove_pending(&network_id);
                if let Some(session) = inner.remove_session(&network_id) {
                    info!("session {} disconnected by peer", network_id);
                    session.close().await;
                }
                else {
                    debug!("DISCONNECT for unknown session {}", network_id);
                }
            }
            HandshakeAction::None => {}
        }
        outcome.reply
    }

    /// Looks up the session for a data datagram. A session is created (by calling `create`) only
    ///  for a conversation that a CONNECT handshake assigned to this peer, and only if the
    ///  datagram carries the assigned token. Returns `None` for anything else.
    pub async fn resolve_or_create(
        &self,
        network_id: NetworkId,
        token: u32,
        create: impl FnOnce(NetworkId, u32) -> Arc<Session>,
    ) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock().await;

        if let Some(session) = inner.sessions.get(&network_id) {
            if session.token() == token {
                return Some(session.clone());
            }
            trace!("datagram for session {} with wrong token {:08x} - dropping", network_id, token);
            return None;
        }

        match inner.pending.entry(network_id) {
            Entry::Occupied(e) => {
                let pending = e.get();
                if pending.token != token {
                    trace!("datagram for pending conversation {} with wrong token - dropping", network_id);
                    return None;
                }
                if pending.since.elapsed() > self.handshake_timeout {
                    debug!("handshake for {} timed out", network_id);
                    e.remove();
                    inner.convs.remove(&network_id.conv);
                    return None;
                }
                e.remove();
            }
            Entry::Vacant(_) => {
                trace!("datagram for unknown conversation {} - dropping", network_id);
                return None;
            }
        }

        info!("creating session {}", network_id);
        let session = create(network_id, token);
        inner.sessions.insert(network_id, session.clone());
        Some(session)
    }

    pub async fn get(&self, network_id: NetworkId) -> Option<Arc<Session>> {
        self.inner.lock().await
            .sessions.get(&network_id)
            .cloned()
    }

    pub async fn state_of(&self, network_id: NetworkId) -> HandshakeState {
        let inner = self.inner.lock().await;
        if let Some(session) = inner.sessions.get(&network_id) {
            return session.state();
        }
        match inner.pending.get(&network_id) {
            Some(p) => HandshakeState::ConvAssigned { conv: network_id.conv, token: p.token },
            None => HandshakeState::AwaitingConnect,
        }
    }

    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.lock().await
            .sessions.values()
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    /// Removes and closes sessions that were idle for longer than `idle_timeout_ms` or whose link
    ///  is dead, and drops expired pending handshakes
    pub async fn purge(&self, now: u32, idle_timeout_ms: u32) -> Vec<NetworkId> {
        let mut inner = self.inner.lock().await;

        let handshake_timeout = self.handshake_timeout;
        let Inner { pending, convs, .. } = &mut *inner;
        pending.retain(|id, p| {
            let alive = p.since.elapsed() <= handshake_timeout;
            if !alive {
                convs.remove(&id.conv);
            }
            alive
        });

        let mut stale = Vec::new();
        for (id, session) in &inner.sessions {
            if session.idle_ms(now) > idle_timeout_ms {
                info!("session {} is idle - purging", id);
                stale.push(*id);
            }
            else if session.is_dead().await {
                info!("session {}: peer stopped acknowledging - purging", id);
                stale.push(*id);
            }
        }

        for id in &stale {
            if let Some(session) = inner.remove_session(id) {
                session.close().await;
            }
        }
        stale
    }

    pub async fn close_all(&self) {
        let mut inner = self.inner.lock().await;
        inner.pending.clear();
        inner.convs.clear();
        for (_, session) in inner.sessions.drain() {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kcp::KcpConfig;
    use crate::session::tests::{initial_keystream, peer, recording_socket, test_codec};
    use crate::transport::WireLayout;
    use crate::util::clock::EngineClock;
    use crate::util::random::MockRandom;
    use bytes::BytesMut;
    use mockall::Sequence;

    fn random_returning(values: Vec<u32>) -> MockRandom {
        let mut random = MockRandom::new();
        let mut seq = Sequence::new();
        for v in values {
            random.expect_next_u32()
                .times(1)
                .in_sequence(&mut seq)
                .return_const(v);
        }
        random
    }

    fn control(magic: (u32, u32), conv: u32, token: u32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        HandshakePacket::new(magic, conv, token, 0).ser(&mut buf);
        buf.to_vec()
    }

    fn create(network_id: NetworkId, token: u32) -> Arc<Session> {
        let (socket, _) = recording_socket();
        Session::new(network_id, token, &KcpConfig::default(), WireLayout::default(), test_codec(), initial_keystream(), socket, EngineClock::new()).0
    }

    async fn connect(registry: &SessionRegistry, conv: u32, token_random: u32) -> HandshakePacket {
        connect_with(registry, vec![conv, token_random]).await
    }

    async fn connect_with(registry: &SessionRegistry, random_values: Vec<u32>) -> HandshakePacket {
        let random = random_returning(random_values);
        registry.on_control_datagram(peer(), &control(HandshakePacket::MAGIC_CONNECT, 0, 0), &random).await
    }

    #[tokio::test]
    async fn test_connect_then_data_creates_session() {
        let registry = SessionRegistry::new(Duration::from_secs(30));
        let reply = connect(&registry, 77, 0).await;
        assert_eq!(reply.conv, 77);
        assert_eq!(reply.token, HandshakePacket::TOKEN_XOR);

        let id = NetworkId { addr: peer(), conv: 77 };
        assert_eq!(registry.state_of(id).await, HandshakeState::ConvAssigned { conv: 77, token: HandshakePacket::TOKEN_XOR });

        let session = registry.resolve_or_create(id, HandshakePacket::TOKEN_XOR, create).await.unwrap();
        assert_eq!(session.conv(), 77);
        assert_eq!(registry.state_of(id).await, HandshakeState::Established { conv: 77, token: HandshakePacket::TOKEN_XOR });

        let again = registry.resolve_or_create(id, HandshakePacket::TOKEN_XOR, |_, _| panic!("must not create")).await.unwrap();
        assert!(Arc::ptr_eq(&session, &again));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_no_session_without_handshake() {
        let registry = SessionRegistry::new(Duration::from_secs(30));
        let id = NetworkId { addr: peer(), conv: 5 };
        assert!(registry.resolve_or_create(id, 1, |_, _| panic!("must not create")).await.is_none());
        assert_eq!(registry.state_of(id).await, HandshakeState::AwaitingConnect);
    }

    #[tokio::test]
    async fn test_wrong_token_or_peer() {
        let registry = SessionRegistry::new(Duration::from_secs(30));
        connect(&registry, 77, 0).await;

        let wrong_peer = NetworkId { addr: "127.0.0.1:40001".parse().unwrap(), conv: 77 };
        assert!(registry.resolve_or_create(wrong_peer, HandshakePacket::TOKEN_XOR, |_, _| panic!()).await.is_none());

        let id = NetworkId { addr: peer(), conv: 77 };
        assert!(registry.resolve_or_create(id, 1234, |_, _| panic!()).await.is_none());

        // the pending entry survives a datagram with a wrong token
        assert!(registry.resolve_or_create(id, HandshakePacket::TOKEN_XOR, create).await.is_some());
    }

    #[tokio::test]
    async fn test_conv_collision_is_avoided() {
        let registry = SessionRegistry::new(Duration::from_secs(30));
        connect(&registry, 77, 0).await;

        let random = random_returning(vec![77, 0, 78, 5]);
        let reply = registry.on_control_datagram(peer(), &control(HandshakePacket::MAGIC_CONNECT, 0, 0), &random).await;
        assert_eq!(reply.conv, 78);
    }

    #[tokio::test]
    async fn test_disconnect_prevents_resurrection() {
        let registry = SessionRegistry::new(Duration::from_secs(30));
        let reply = connect(&registry, 77, 0).await;
        let id = NetworkId { addr: peer(), conv: 77 };
        let session = registry.resolve_or_create(id, reply.token, create).await.unwrap();

        let random = MockRandom::new();
        let reply = registry.on_control_datagram(peer(), &control(HandshakePacket::MAGIC_DISCONNECT, 77, reply.token), &random).await;
        assert_eq!((reply.magic1, reply.magic2), HandshakePacket::MAGIC_DISCONNECT);
        assert!(session.is_closed());
        assert_eq!(registry.len().await, 0);

        assert!(registry.resolve_or_create(id, HandshakePacket::TOKEN_XOR, |_, _| panic!("resurrected")).await.is_none());
    }

    #[tokio::test]
    async fn test_pending_handshake_expires() {
        let registry = SessionRegistry::new(Duration::ZERO);
        connect(&registry, 77, 0).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let id = NetworkId { addr: peer(), conv: 77 };
        assert!(registry.resolve_or_create(id, HandshakePacket::TOKEN_XOR, |_, _| panic!()).await.is_none());
    }

    #[tokio::test]
    async fn test_purge_idle() {
        let registry = SessionRegistry::new(Duration::from_secs(30));
        let reply = connect(&registry, 77, 0).await;
        let id = NetworkId { addr: peer(), conv: 77 };
        let session = registry.resolve_or_create(id, reply.token, create).await.unwrap();

        assert!(registry.purge(100, 60_000).await.is_empty());
        assert_eq!(registry.purge(1_000_000, 60_000).await, vec![id]);
        assert!(session.is_closed());
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_conv_is_released_when_session_ends() {
        let registry = SessionRegistry::new(Duration::from_secs(30));
        let reply = connect(&registry, 77, 0).await;
        let id = NetworkId { addr: peer(), conv: 77 };
        registry.resolve_or_create(id, reply.token, create).await.unwrap();

        // still taken by the established session
        assert_eq!(connect_with(&registry, vec![77, 0, 78, 0]).await.conv, 78);

        registry.on_control_datagram(peer(), &control(HandshakePacket::MAGIC_DISCONNECT, 77, reply.token), &MockRandom::new()).await;
        assert_eq!(connect(&registry, 77, 0).await.conv, 77);
    }

    #[tokio::test]
    async fn test_conv_is_released_when_pending_handshake_expires() {
        let registry = SessionRegistry::new(Duration::ZERO);
        connect(&registry, 77, 0).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(registry.purge(0, 60_000).await.is_empty());

        assert_eq!(connect(&registry, 77, 0).await.conv, 77);
    }
}
