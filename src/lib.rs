pub mod config;
pub mod crypto;
pub mod frame;
pub mod handlers;
pub mod handshake;
pub mod kcp;
pub mod logging;
pub mod schema;
pub mod server;
pub mod session;
pub mod transport;
pub mod util;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
