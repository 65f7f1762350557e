use rand::RngCore;

/// Source of server-chosen random values (conversation ids, handshake tokens, key seeds).
///
/// This is a trait so tests can pin the values that end up on the wire.
#[cfg_attr(test, mockall::automock)]
pub trait Random: Send + Sync {
    fn next_u32(&self) -> u32;
    fn next_u64(&self) -> u64;
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn next_u32(&self) -> u32 {
        rand::rng().next_u32()
    }

    fn next_u64(&self) -> u64 {
        rand::rng().next_u64()
    }
}
