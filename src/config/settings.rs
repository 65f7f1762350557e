use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::Args;
use crate::kcp::KcpConfig;
use crate::server::{DispatcherConfig, EndPointConfig};
use crate::transport::WireLayout;

/// Contents of the configuration file. Every section and field is optional and falls back to its
///  default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub protocol: ProtocolSettings,
    pub kcp: KcpConfig,
    pub wire: WireLayout,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub listen_addr: String,
    /// interval of the clock tick that drives retransmission
    pub tick_interval_ms: u64,
    /// sessions without inbound traffic for this long are purged
    pub session_idle_timeout_secs: u64,
    /// a conversation assigned by CONNECT must see its first data datagram within this time
    pub handshake_timeout_secs: u64,
    pub max_datagram_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            listen_addr: "0.0.0.0:22102".to_string(),
            tick_interval_ms: 10,
            session_idle_timeout_secs: 60,
            handshake_timeout_secs: 30,
            max_datagram_size: 1500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    pub client_version: String,
    /// holds the message type tables as `{client_version}.json`
    pub versions_dir: PathBuf,
    /// base64 text file with the keystream shared by all sessions during bootstrap
    pub initial_key_path: PathBuf,
    pub bootstrap_message: String,
    /// container message whose entries are dispatched individually; empty to turn unpacking off
    pub union_message: String,
    /// fixed seed for session keystreams instead of a random one per session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_seed: Option<u64>,
    pub quiet_message_ids: Vec<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unknown_dump_dir: Option<PathBuf>,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        ProtocolSettings {
            client_version: "2.7.0".to_string(),
            versions_dir: PathBuf::from("versions"),
            initial_key_path: PathBuf::from("resources/initial_key.b64"),
            bootstrap_message: "GetPlayerTokenReq".to_string(),
            union_message: "UnionCmdNotify".to_string(),
            key_seed: None,
            quiet_message_ids: Vec::new(),
            unknown_dump_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub json_format: bool,
}

impl Settings {
    /// command line flags take precedence over the file
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(listen) = &args.listen {
            self.server.listen_addr = listen.clone();
        }
        if let Some(client_version) = &args.client_version {
            self.protocol.client_version = client_version.clone();
        }
    }

    pub fn end_point_config(&self) -> anyhow::Result<EndPointConfig> {
        let listen_addr: SocketAddr = self.server.listen_addr.parse()
            .with_context(|| format!("invalid listen address {:?}", self.server.listen_addr))?;

        let config = EndPointConfig {
            listen_addr,
            max_datagram_size: self.server.max_datagram_size,
            tick_interval: Duration::from_millis(self.server.tick_interval_ms),
            session_idle_timeout: Duration::from_secs(self.server.session_idle_timeout_secs),
            handshake_timeout: Duration::from_secs(self.server.handshake_timeout_secs),
            kcp: self.kcp.clone(),
            wire: self.wire,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            bootstrap_message: self.protocol.bootstrap_message.clone(),
            quiet_message_ids: self.protocol.quiet_message_ids.iter().copied().collect(),
            union_message: Some(self.protocol.union_message.clone())
                .filter(|name| !name.is_empty()),
            unknown_dump_dir: self.protocol.unknown_dump_dir.clone(),
        }
    }
}
