use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::crypto::mt64::Mt19937_64;

/// Size of a derived session keystream in bytes
pub const KEYSTREAM_LEN: usize = 4096;

/// An immutable XOR keystream. Cloning is cheap, the bytes are shared.
#[derive(Clone, PartialEq, Eq)]
pub struct Keystream(Arc<[u8]>);

impl Debug for Keystream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // never dump key material into logs
        write!(f, "Keystream({} bytes)", self.0.len())
    }
}

impl Keystream {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> anyhow::Result<Keystream> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            bail!("a keystream must not be empty");
        }
        Ok(Keystream(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// XOR `buf` in place, repeating the keystream modulo its length. Applying this twice restores
    ///  the original buffer.
    pub fn apply(&self, buf: &mut [u8]) {
        for (b, k) in buf.iter_mut().zip(self.0.iter().cycle()) {
            *b ^= *k;
        }
    }
}

/// Expands a key seed into a session keystream.
///
/// The seed initializes a first generator; that generator's first output seeds a second one. The
///  second generator's first word is discarded, and the following words are written big-endian
///  into the keystream.
pub fn derive_session_keystream(seed: u64) -> Keystream {
    let mut first = Mt19937_64::new(seed);
    let mut second = Mt19937_64::new(first.next_u64());
    second.next_u64();

    let mut bytes = Vec::with_capacity(KEYSTREAM_LEN);
    while bytes.len() < KEYSTREAM_LEN {
        bytes.extend_from_slice(&second.next_u64().to_be_bytes());
    }

    Keystream(bytes.into())
}

/// Memoizes [derive_session_keystream] by seed. Deriving is pure, so the cache never needs
///  invalidation.
#[derive(Default)]
pub struct KeystreamCache {
    by_seed: Mutex<FxHashMap<u64, Keystream>>,
}

impl KeystreamCache {
    pub fn get_or_derive(&self, seed: u64) -> Keystream {
        let mut by_seed = self.by_seed.lock()
            .expect("keystream cache lock poisoned");
        by_seed.entry(seed)
            .or_insert_with(|| {
                trace!("deriving keystream for new seed");
                derive_session_keystream(seed)
            })
            .clone()
    }
}
