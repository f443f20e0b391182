//! Secret generation for slot passwords and server pre-shared keys.
//!
//! SS2022 ciphers take base64-encoded keys; a 32-byte value covers the
//! widest method (`2022-blake3-aes-256-gcm`) and the shorter methods
//! derive from the same material.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;

/// Raw length of every generated secret, in bytes.
pub const SECRET_LEN: usize = 32;

/// Generate a fresh secret: 32 random bytes from the OS CSPRNG,
/// standard-base64 encoded.
pub fn generate_secret() -> String {
    let mut buf = [0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut buf);
    STANDARD.encode(buf)
}
