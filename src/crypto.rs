//! Session keystream derivation and XOR obfuscation.
//!
//! NB: This is obfuscation for compatibility with a fixed client-side algorithm, not cryptography.
//!      Anybody who knows the (public) generator and the seed can reproduce the keystream.

pub mod keystream;
pub mod mt64;

pub use keystream::{derive_session_keystream, Keystream, KeystreamCache, KEYSTREAM_LEN};
