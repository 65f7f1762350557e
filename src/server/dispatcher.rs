use std::collections::hash_map::Entry;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use base64::Engine;
use bytes::BytesMut;
use futures::FutureExt;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, trace, warn};

use crate::frame::{DecodedMessage, FrameCodec, FrameError, RawFrame};
use crate::session::Session;

/// Business logic for one message type. Handlers for one session run one at a time, in the
///  order the messages arrived; handlers for different sessions run concurrently.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, session: Arc<Session>, message: DecodedMessage) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Arc<Session>, DecodedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn on_message(&self, session: Arc<Session>, message: DecodedMessage) -> anyhow::Result<()> {
        (self.0)(session, message).await
    }
}

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// the only message type accepted before a session has its own keystream
    pub bootstrap_message: String,
    /// message types whose receipt is logged at trace level only
    pub quiet_message_ids: FxHashSet<u16>,
    /// container message whose `cmdList` entries (`messageId`, base64 `body`) are dispatched
    ///  individually
    pub union_message: Option<String>,
    /// if set, frames of unregistered message types are written there as `{id}.packet` (base64)
    pub unknown_dump_dir: Option<PathBuf>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            bootstrap_message: "GetPlayerTokenReq".to_string(),
            quiet_message_ids: Default::default(),
            union_message: Some("UnionCmdNotify".to_string()),
            unknown_dump_dir: None,
        }
    }
}

/// Decodes a session's frames and routes the messages to the handlers registered for their
///  schema names
pub struct Dispatcher {
    codec: FrameCodec,
    config: DispatcherConfig,
    handlers: FxHashMap<String, Arc<dyn MessageHandler>>,
    /// message type ids that were received without a registered handler
    unhandled: Mutex<FxHashSet<u16>>,
}

impl Dispatcher {
    pub fn new(codec: FrameCodec, config: DispatcherConfig) -> Dispatcher {
        Dispatcher {
            codec,
            config,
            handlers: Default::default(),
            unhandled: Default::default(),
        }
    }

    pub fn register(&mut self, name: &str, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        if self.codec.registry().id_of(name).is_none() {
            warn!("registering a handler for {}, which is not in the message type table", name);
        }
        match self.handlers.entry(name.to_string()) {
            Entry::Occupied(_) => Err(anyhow!("registering a second handler for {}", name)),
            Entry::Vacant(e) => {
                e.insert(handler);
                Ok(())
            }
        }
    }

    pub fn register_fn<F, Fut>(&mut self, name: &str, handler: F) -> anyhow::Result<()>
    where
        F: Fn(Arc<Session>, DecodedMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler(handler)))
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Processes a session's frames in order until the session is closed
    pub async fn run_worker(self: Arc<Self>, session: Arc<Session>, mut frames: mpsc::Receiver<Vec<u8>>) {
        while let Some(frame) = frames.recv().await {
            self.on_frame(&session, frame).await;
        }
        debug!("worker for session {} terminated", session.network_id());
    }

    /// Decodes one frame and routes it. Nothing that is wrong with a frame escapes this method.
    pub async fn on_frame(&self, session: &Arc<Session>, frame: Vec<u8>) {
        let (keystream, is_initial) = session.receive_keystream().await;

        let raw = match RawFrame::decode(frame, &keystream) {
            Ok(raw) => raw,
            Err(e) => {
                trace!("session {}: discarding frame: {}", session.network_id(), e);
                return;
            }
        };

        if is_initial && self.codec.registry().name_of(raw.message_type) != Some(self.config.bootstrap_message.as_str()) {
            debug!("session {}: message type {} before the session keystream is installed - discarding", session.network_id(), raw.message_type);
            return;
        }

        match self.codec.decode_raw(&raw) {
            Ok(message) => self.route(session, message).await,
            Err(FrameError::UnknownMessageType(id)) => {
                self.note_unhandled(id, None).await;
                self.dump_unknown(&raw).await;
            }
            Err(e) => debug!("session {}: {}", session.network_id(), e),
        }
    }

    /// Passes a decoded message to its handler, unpacking union messages
    pub async fn route(&self, session: &Arc<Session>, message: DecodedMessage) {
        if self.config.quiet_message_ids.contains(&message.message_type) {
            trace!("session {}: received {} ({})", session.network_id(), message.name, message.message_type);
        }
        else {
            debug!("session {}: received {} ({})", session.network_id(), message.name, message.message_type);
        }

        if self.config.union_message.as_deref() == Some(message.name.as_str()) {
            for inner in self.unpack_union(&message).await {
                self.dispatch(session, inner).await;
            }
        }
        else {
            self.dispatch(session, message).await;
        }
    }

    async fn dispatch(&self, session: &Arc<Session>, message: DecodedMessage) {
        let Some(handler) = self.handlers.get(&message.name) else {
            self.note_unhandled(message.message_type, Some(&message.name)).await;
            return;
        };

        let id = message.message_type;
        let name = message.name.clone();
        match AssertUnwindSafe(handler.on_message(session.clone(), message)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("session {}: handler for {} ({}) failed: {}", session.network_id(), name, id, e),
            Err(_) => error!("session {}: handler for {} ({}) panicked", session.network_id(), name, id),
        }
    }

    async fn unpack_union(&self, message: &DecodedMessage) -> Vec<DecodedMessage> {
        let Some(cmds) = message.payload.get("cmdList").and_then(Value::as_array) else {
            debug!("{} without cmdList", message.name);
            return Vec::new();
        };

        let mut result = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            let Some(id) = cmd.get("messageId").and_then(Value::as_u64).and_then(|id| u16::try_from(id).ok()) else {
                debug!("{} entry without valid messageId", message.name);
                continue;
            };
            let body = match cmd.get("body").and_then(Value::as_str) {
                None => Vec::new(),
                Some(encoded) => match base64::engine::general_purpose::STANDARD.decode(encoded) {
                    Ok(body) => body,
                    Err(e) => {
                        debug!("{} entry for {}: invalid body: {}", message.name, id, e);
                        continue;
                    }
                },
            };

            match self.codec.decode_payload(id, &body) {
                Ok(inner) => result.push(inner),
                Err(FrameError::UnknownMessageType(id)) => {
                    self.note_unhandled(id, None).await;
                }
                Err(e) => debug!("{} entry: {}", message.name, e),
            }
        }
        result
    }

    /// Records a message type without handler. Returns `true` the first time a type is recorded;
    ///  only that occurrence is logged above trace level.
    pub async fn note_unhandled(&self, id: u16, name: Option<&str>) -> bool {
        let first = self.unhandled.lock().await.insert(id);
        match (first, name) {
            (true, Some(name)) => warn!("no handler for message type {} ({})", name, id),
            (true, None) => warn!("unknown message type {}", id),
            (false, _) => trace!("unhandled message type {}", id),
        }
        first
    }

    pub async fn unhandled_ids(&self) -> Vec<u16> {
        let mut result = self.unhandled.lock().await
            .iter()
            .copied()
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    async fn dump_unknown(&self, raw: &RawFrame) {
        let Some(dir) = &self.config.unknown_dump_dir else {
            return;
        };

        let mut buf = BytesMut::new();
        if raw.ser(&mut buf).is_err() {
            return;
        }
        let path = dir.join(format!("{}.packet", raw.message_type));
        let encoded = base64::engine::general_purpose::STANDARD.encode(&buf);
        if let Err(e) = tokio::fs::write(&path, encoded).await {
            debug!("could not write {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_session_keystream;
    use crate::kcp::KcpConfig;
    use crate::session::tests::{initial_keystream, peer, recording_socket, test_codec};
    use crate::session::NetworkId;
    use crate::transport::WireLayout;
    use crate::util::clock::EngineClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn session() -> Arc<Session> {
        let (socket, _) = recording_socket();
        Session::new(NetworkId { addr: peer(), conv: 1 }, 2, &KcpConfig::default(), WireLayout::default(), test_codec(), initial_keystream(), socket, EngineClock::new()).0
    }

    fn message(id: u16, name: &str, payload: Value) -> DecodedMessage {
        DecodedMessage { message_type: id, name: name.to_string(), sent_ms: None, payload }
    }

    fn counting_dispatcher(name: &str) -> (Dispatcher, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let mut dispatcher = Dispatcher::new(test_codec(), DispatcherConfig::default());
        dispatcher.register_fn(name, move |_, _| {
            let count = count2.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        }).unwrap();
        (dispatcher, count)
    }

    #[tokio::test]
    async fn test_route_to_handler() {
        let (dispatcher, count) = counting_dispatcher("PingReq");
        dispatcher.route(&session(), message(7, "PingReq", json!({}))).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(dispatcher.unhandled_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_register_twice() {
        let (mut dispatcher, _) = counting_dispatcher("PingReq");
        assert!(dispatcher.register_fn("PingReq", |_, _| async { anyhow::Ok(()) }).is_err());
    }

    #[tokio::test]
    async fn test_unhandled_is_recorded_once() {
        let dispatcher = Dispatcher::new(test_codec(), DispatcherConfig::default());
        let session = session();

        assert!(dispatcher.note_unhandled(4242, None).await);
        for _ in 0..100 {
            dispatcher.route(&session, message(21, "PingRsp", json!({}))).await;
        }
        assert!(!dispatcher.note_unhandled(4242, None).await);
        assert_eq!(dispatcher.unhandled_ids().await, vec![21, 4242]);
    }

    #[tokio::test]
    async fn test_handler_failures_are_isolated() {
        let mut dispatcher = Dispatcher::new(test_codec(), DispatcherConfig::default());
        dispatcher.register_fn("PingReq", |_, _| async { Err::<(), _>(anyhow!("failing")) }).unwrap();
        dispatcher.register_fn("PingRsp", |_, message: DecodedMessage| async move {
            if message.payload.is_object() {
                panic!("panicking");
            }
            anyhow::Ok(())
        }).unwrap();
        let session = session();

        dispatcher.route(&session, message(7, "PingReq", json!({}))).await;
        dispatcher.route(&session, message(21, "PingRsp", json!({}))).await;
        dispatcher.route(&session, message(21, "PingRsp", json!({}))).await;
        assert!(dispatcher.unhandled_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_on_frame_bootstrap_rule() {
        let (mut dispatcher, pings) = counting_dispatcher("PingReq");
        let tokens = Arc::new(AtomicUsize::new(0));
        let tokens2 = tokens.clone();
        dispatcher.register_fn("GetPlayerTokenReq", move |_, _| {
            let tokens = tokens2.clone();
            async move {
                tokens.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        }).unwrap();
        let codec = test_codec();
        let session = session();

        // only the bootstrap message is accepted under the initial keystream
        let ping = codec.encode(7, &json!({}), &initial_keystream()).unwrap();
        dispatcher.on_frame(&session, ping.to_vec()).await;
        let token_req = codec.encode(101, &json!({"accountUid": "1"}), &initial_keystream()).unwrap();
        dispatcher.on_frame(&session, token_req.to_vec()).await;
        assert_eq!(pings.load(Ordering::SeqCst), 0);
        assert_eq!(tokens.load(Ordering::SeqCst), 1);

        let k2 = derive_session_keystream(2);
        session.send_and_rekey("GetPlayerTokenRsp", &json!({}), k2.clone()).await.unwrap();

        // after rekeying, the initial keystream is rejected for all message types
        let token_req = codec.encode(101, &json!({}), &initial_keystream()).unwrap();
        dispatcher.on_frame(&session, token_req.to_vec()).await;
        assert_eq!(tokens.load(Ordering::SeqCst), 1);

        let ping = codec.encode(7, &json!({}), &k2).unwrap();
        dispatcher.on_frame(&session, ping.to_vec()).await;
        assert_eq!(pings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_on_frame_garbage_and_unknown_type() {
        let dispatcher = Dispatcher::new(test_codec(), DispatcherConfig { bootstrap_message: "PingReq".to_string(), ..Default::default() });
        let session = session();

        dispatcher.on_frame(&session, vec![1, 2, 3]).await;
        assert!(dispatcher.unhandled_ids().await.is_empty());

        let k2 = derive_session_keystream(2);
        session.send_and_rekey("PingRsp", &json!({}), k2.clone()).await.unwrap();
        let unknown = RawFrame { message_type: 999, metadata: Default::default(), payload: Default::default() }
            .encode(&k2).unwrap();
        for _ in 0..100 {
            dispatcher.on_frame(&session, unknown.to_vec()).await;
        }
        assert_eq!(dispatcher.unhandled_ids().await, vec![999]);
    }

    #[tokio::test]
    async fn test_union_message() {
        let (dispatcher, count) = counting_dispatcher("PingReq");

        let ping_body = base64::engine::general_purpose::STANDARD.encode(br#"{"seq":1}"#);
        let union = message(55, "UnionCmdNotify", json!({"cmdList": [
            {"messageId": 7, "body": ping_body},
            {"messageId": 7, "body": ""},
            {"messageId": 4711, "body": ""},
            {"messageId": 7, "body": "%%% not base64"},
        ]}));

        dispatcher.route(&session(), union).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.unhandled_ids().await, vec![4711]);
    }

    #[tokio::test]
    async fn test_dump_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::new(test_codec(), DispatcherConfig {
            bootstrap_message: "PingReq".to_string(),
            unknown_dump_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        });
        let session = session();
        let k2 = derive_session_keystream(2);
        session.send_and_rekey("PingRsp", &json!({}), k2.clone()).await.unwrap();

        let unknown = RawFrame { message_type: 999, metadata: Default::default(), payload: Default::default() };
        dispatcher.on_frame(&session, unknown.encode(&k2).unwrap().to_vec()).await;

        let dumped = std::fs::read_to_string(dir.path().join("999.packet")).unwrap();
        let mut expected = BytesMut::new();
        unknown.ser(&mut expected).unwrap();
        assert_eq!(base64::engine::general_purpose::STANDARD.decode(dumped).unwrap(), expected.to_vec());
    }
}
