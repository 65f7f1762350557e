use std::time::Instant;

/// Millisecond clock for the ARQ engines.
///
/// KCP works on a wrapping 32 bit millisecond counter, so the absolute value is meaningless - only
///  differences are. All engines of one server share a clock so that their timestamps are comparable.
#[derive(Clone, Copy, Debug)]
pub struct EngineClock {
    epoch: Instant,
}

impl EngineClock {
    pub fn new() -> EngineClock {
        EngineClock { epoch: Instant::now() }
    }

    pub fn now_ms(&self) -> u32 {
        // wrap-around after ~49 days is part of the KCP contract
        self.epoch.elapsed().as_millis() as u32
    }
}

impl Default for EngineClock {
    fn default() -> Self {
        Self::new()
    }
}

/// wall clock milliseconds since the Unix epoch, as carried in frame metadata
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
