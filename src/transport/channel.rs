use anyhow::bail;
use bytes::Bytes;
use tracing::trace;

use crate::kcp::{KcpConfig, KcpEngine};
use crate::transport::wire_layout::WireLayout;

/// One session's reliable transport: a KCP engine plus the client wire layout shim. The channel
///  is sans-I/O; the owner feeds it client datagrams and sends whatever
///  [TransportChannel::take_datagrams] returns.
pub struct TransportChannel {
    engine: KcpEngine,
    layout: WireLayout,
    token: u32,
}

impl TransportChannel {
    pub fn new(conv: u32, token: u32, config: &KcpConfig, layout: WireLayout, now: u32) -> TransportChannel {
        let mut engine = KcpEngine::new(conv, config);
        engine.update(now);
        TransportChannel {
            engine,
            layout,
            token,
        }
    }

    pub fn conv(&self) -> u32 {
        self.engine.conv()
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    /// Feeds a client datagram into the engine and advances the engine clock
    pub fn ingest(&mut self, datagram: &[u8], now: u32) -> anyhow::Result<()> {
        let (segments, token) = self.layout.split_inbound(datagram)?;
        if token != self.token {
            bail!("datagram carries token {:08x}, session token is {:08x}", token, self.token);
        }

        self.engine.input(&segments)?;
        self.engine.update(now);
        Ok(())
    }

    /// One reassembled message, if a complete one is available
    pub fn drain(&mut self) -> Option<Vec<u8>> {
        self.engine.recv()
    }

    /// Hands a message to the engine and flushes it, so that the resulting datagrams are available
    ///  from [TransportChannel::take_datagrams] right away
    pub fn send(&mut self, message: &[u8]) -> anyhow::Result<()> {
        self.engine.send(message)?;
        self.engine.flush();
        Ok(())
    }

    pub fn update(&mut self, now: u32) {
        self.engine.update(now);
    }

    /// Client datagrams (token-tagged, one segment each) that should go on the wire now
    pub fn take_datagrams(&mut self) -> Vec<Bytes> {
        let mut result = Vec::new();
        for kcp_datagram in self.engine.take_output() {
            match self.layout.tag_outbound(&kcp_datagram, self.token) {
                Ok(datagrams) => result.extend(datagrams),
                // the engine only produces complete segments
                Err(e) => trace!("conv {:08x}: skipping malformed engine output: {}", self.conv(), e),
            }
        }
        result
    }

    pub fn is_dead(&self) -> bool {
        self.engine.is_dead()
    }

    pub fn wait_send(&self) -> usize {
        self.engine.wait_send()
    }

    /// room left in the receive window, as advertised to the peer
    pub fn unused_window(&self) -> u16 {
        self.engine.unused_window()
    }
}
