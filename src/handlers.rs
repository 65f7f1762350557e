//! Built-in message handlers: the token exchange that bootstraps a session's keystream, and ping.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::crypto::{derive_session_keystream, KeystreamCache};
use crate::frame::DecodedMessage;
use crate::server::dispatcher::{Dispatcher, MessageHandler};
use crate::session::Session;
use crate::util::random::Random;

pub const TOKEN_EXCHANGE_RESPONSE: &str = "GetPlayerTokenRsp";
pub const PING_REQUEST: &str = "PingReq";
pub const PING_RESPONSE: &str = "PingRsp";

/// Handles the bootstrap message: replies (still under the initial keystream) with the seed of the
///  session keystream, and installs that keystream for everything that follows.
pub struct TokenExchangeHandler {
    random: Arc<dyn Random>,
    keystreams: KeystreamCache,
    /// fixed seed for all sessions; a random seed per session if `None`
    key_seed: Option<u64>,
}

impl TokenExchangeHandler {
    pub fn new(random: Arc<dyn Random>, key_seed: Option<u64>) -> TokenExchangeHandler {
        TokenExchangeHandler {
            random,
            keystreams: Default::default(),
            key_seed,
        }
    }
}

#[async_trait]
impl MessageHandler for TokenExchangeHandler {
    async fn on_message(&self, session: Arc<Session>, message: DecodedMessage) -> anyhow::Result<()> {
        let (seed, keystream) = match self.key_seed {
            Some(seed) => (seed, self.keystreams.get_or_derive(seed)),
            None => {
                let seed = self.random.next_u64();
                (seed, derive_session_keystream(seed))
            }
        };

        let mut response = Map::new();
        for (from, to) in [("accountUid", "accountUid"), ("accountToken", "token"), ("accountType", "accountType"), ("uid", "uid")] {
            if let Some(value) = message.payload.get(from) {
                response.insert(to.to_string(), value.clone());
            }
        }
        response.insert("retcode".to_string(), json!(0));
        response.insert("secretKeySeed".to_string(), json!(seed));

        let account = message.payload.get("accountUid").cloned().unwrap_or_default();
        info!("session {}: token exchange for account {}", session.network_id(), account);
        session.send_and_rekey(TOKEN_EXCHANGE_RESPONSE, &Value::Object(response), keystream).await
    }
}

/// Replies to a ping, echoing the client's time and sequence number
pub struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    async fn on_message(&self, session: Arc<Session>, message: DecodedMessage) -> anyhow::Result<()> {
        let mut response = Map::new();
        for field in ["clientTime", "seq"] {
            if let Some(value) = message.payload.get(field) {
                response.insert(field.to_string(), value.clone());
            }
        }
        session.send(PING_RESPONSE, &Value::Object(response)).await
    }
}

/// Registers the built-in handlers; `bootstrap_message` is the name the token exchange is
///  registered for
pub fn register_builtin_handlers(
    dispatcher: &mut Dispatcher,
    bootstrap_message: &str,
    random: Arc<dyn Random>,
    key_seed: Option<u64>,
) -> anyhow::Result<()> {
    debug!("registering built-in handlers");
    dispatcher.register(bootstrap_message, Arc::new(TokenExchangeHandler::new(random, key_seed)))?;
    dispatcher.register(PING_REQUEST, Arc::new(PingHandler))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keystream;
    use crate::kcp::KcpConfig;
    use crate::session::tests::{initial_keystream, peer, recording_socket, test_codec, TestClient, CONV, TOKEN};
    use crate::session::NetworkId;
    use crate::transport::WireLayout;
    use crate::util::clock::EngineClock;
    use crate::util::random::MockRandom;
    use std::sync::Mutex as StdMutex;

    type Sent = Arc<StdMutex<Vec<(std::net::SocketAddr, Vec<u8>)>>>;

    fn session() -> (Arc<Session>, Sent) {
        let (socket, sent) = recording_socket();
        let session = Session::new(NetworkId { addr: peer(), conv: CONV }, TOKEN, &KcpConfig::default(), WireLayout::default(), test_codec(), initial_keystream(), socket, EngineClock::new()).0;
        (session, sent)
    }

    fn received_frames(sent: &Sent) -> Vec<Vec<u8>> {
        let datagrams = sent.lock().unwrap().iter()
            .map(|(_, d)| d.clone())
            .collect::<Vec<_>>();
        TestClient::new(CONV).receive(&datagrams)
    }

    fn request(name: &str, payload: Value) -> DecodedMessage {
        DecodedMessage { message_type: 0, name: name.to_string(), sent_ms: None, payload }
    }

    #[tokio::test]
    async fn test_token_exchange_random_seed() {
        let mut random = MockRandom::new();
        random.expect_next_u64().times(1).return_const(2u64);
        let handler = TokenExchangeHandler::new(Arc::new(random), None);
        let (session, sent) = session();

        handler.on_message(session.clone(), request("GetPlayerTokenReq", json!({"accountUid": "42", "accountToken": "abc"}))).await.unwrap();

        let frames = received_frames(&sent);
        assert_eq!(frames.len(), 1);
        let rsp = test_codec().decode(frames[0].clone(), &initial_keystream()).unwrap();
        assert_eq!(rsp.name, TOKEN_EXCHANGE_RESPONSE);
        assert_eq!(rsp.payload, json!({"accountUid": "42", "token": "abc", "retcode": 0, "secretKeySeed": 2}));

        assert_eq!(session.session_keystream().await, Some(derive_session_keystream(2)));
    }

    #[tokio::test]
    async fn test_token_exchange_fixed_seed() {
        let handler = TokenExchangeHandler::new(Arc::new(MockRandom::new()), Some(7));
        let (session, sent) = session();

        // no account fields at all
        handler.on_message(session.clone(), request("GetPlayerTokenReq", json!({}))).await.unwrap();
        let keystream: Option<Keystream> = session.session_keystream().await;
        assert_eq!(keystream, Some(derive_session_keystream(7)));

        let frames = received_frames(&sent);
        let rsp = test_codec().decode(frames[0].clone(), &initial_keystream()).unwrap();
        assert_eq!(rsp.payload, json!({"retcode": 0, "secretKeySeed": 7}));
    }

    #[tokio::test]
    async fn test_ping() {
        let (session, sent) = session();
        PingHandler.on_message(session, request(PING_REQUEST, json!({"clientTime": 99, "seq": 4, "other": 1}))).await.unwrap();

        let frames = received_frames(&sent);
        let rsp = test_codec().decode(frames[0].clone(), &initial_keystream()).unwrap();
        assert_eq!(rsp.name, PING_RESPONSE);
        assert_eq!(rsp.payload, json!({"clientTime": 99, "seq": 4}));
    }

    #[tokio::test]
    async fn test_register_builtin_handlers() {
        let mut dispatcher = Dispatcher::new(test_codec(), Default::default());
        register_builtin_handlers(&mut dispatcher, "GetPlayerTokenReq", Arc::new(MockRandom::new()), None).unwrap();
        assert!(register_builtin_handlers(&mut dispatcher, "GetPlayerTokenReq", Arc::new(MockRandom::new()), None).is_err());
    }
}
