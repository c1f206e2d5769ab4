//! Segment-key rotation and the XOR envelope transform.
//!
//! The rotating AES-128 segment key never leaves the process in the clear.
//! What the segmenter embeds in the playlist is the *envelope key*:
//!
//! ```text
//! envelope = master XOR segment
//! ```
//!
//! XOR is its own inverse, so the same transform recovers the segment key
//! from an envelope key. An envelope key is meaningless to anyone who does
//! not hold the 16-byte master secret.
//!
//! On every rotation two files are handed off to the external segmenter:
//! the key-info file (`{{HLS_KEY_URL,<envelope hex>}}` line, key path, IV)
//! and the raw segment key file it points at.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use rand_core::{OsRng, RngCore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// AES-128 key length; master, segment and envelope keys are all this size.
pub const SEGMENT_KEY_LEN: usize = 16;

/// Hex length of an envelope key on the wire.
pub const ENVELOPE_KEY_HEX_LEN: usize = SEGMENT_KEY_LEN * 2;

/// Placeholder token name the segmenter embeds in key-info URIs.
pub const KEY_URL_PLACEHOLDER: &str = "HLS_KEY_URL";

/// Fixed leading bytes of every segment key this rotator produces. Marks
/// key files written by us when inspecting the handoff directory.
const SEGMENT_KEY_TAG: [u8; 4] = [0xff, 0x3d, 0x66, 0x88];

/// Key handling errors. The `EnvelopeKey*` variants are request-validation
/// failures; `KeyInfoWrite` is a per-tick rotation failure.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("envelope key must be {ENVELOPE_KEY_HEX_LEN} hex characters, got {0}")]
    EnvelopeKeyLength(usize),

    #[error("envelope key is not valid hex: {0}")]
    EnvelopeKeyEncoding(#[from] hex::FromHexError),

    #[error("failed to write key material: {0}")]
    KeyInfoWrite(#[from] std::io::Error),
}

/// XOR two 16-byte keys. Self-inverse: `xor_keys(m, xor_keys(m, s)) == s`.
pub fn xor_keys(
    a: &[u8; SEGMENT_KEY_LEN],
    b: &[u8; SEGMENT_KEY_LEN],
) -> [u8; SEGMENT_KEY_LEN] {
    let mut out = [0u8; SEGMENT_KEY_LEN];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// Strict envelope-key validation: exactly 32 hex characters decoding to
/// 16 bytes. Pure input validation, no key material is derived here.
pub fn decode_envelope_key(envelope_hex: &str) -> Result<[u8; SEGMENT_KEY_LEN], KeyError> {
    if envelope_hex.len() != ENVELOPE_KEY_HEX_LEN {
        return Err(KeyError::EnvelopeKeyLength(envelope_hex.len()));
    }
    let bytes = hex::decode(envelope_hex)?;
    let mut key = [0u8; SEGMENT_KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Owns the master secret and the rotation handoff paths.
///
/// The master key is loaded once at startup and immutable for the process
/// lifetime; nothing outside this struct ever sees it.
pub struct KeyRotationManager {
    master_key: [u8; SEGMENT_KEY_LEN],
    key_info_path: PathBuf,
    key_path: PathBuf,
}

impl KeyRotationManager {
    pub fn new(
        master_key: [u8; SEGMENT_KEY_LEN],
        key_info_path: PathBuf,
        key_path: PathBuf,
    ) -> Self {
        KeyRotationManager {
            master_key,
            key_info_path,
            key_path,
        }
    }

    /// Generate a fresh segment key and IV and hand both off to the
    /// segmenter: the key-info file carries the envelope-key placeholder and
    /// the IV, the key file carries the raw segment key.
    pub fn rotate(&self) -> Result<(), KeyError> {
        let mut segment_key = [0u8; SEGMENT_KEY_LEN];
        segment_key[..SEGMENT_KEY_TAG.len()].copy_from_slice(&SEGMENT_KEY_TAG);
        OsRng.fill_bytes(&mut segment_key[SEGMENT_KEY_TAG.len()..]);

        let mut iv = [0u8; SEGMENT_KEY_LEN];
        OsRng.fill_bytes(&mut iv);

        let envelope_key = xor_keys(&self.master_key, &segment_key);
        let key_info = format!(
            "{{{{{},{}}}}}\n{}\n{}",
            KEY_URL_PLACEHOLDER,
            hex::encode(envelope_key),
            self.key_path.display(),
            hex::encode(iv),
        );

        fs::write(&self.key_info_path, key_info)?;
        fs::write(&self.key_path, segment_key)?;

        info!(
            "Rotated segment key, envelope {}",
            hex::encode(envelope_key)
        );
        Ok(())
    }

    /// Recover the segment key masked by `envelope_hex`.
    ///
    /// Pure and cheap; payment policy is enforced by the access gate, never
    /// here.
    pub fn resolve_segment_key(
        &self,
        envelope_hex: &str,
    ) -> Result<[u8; SEGMENT_KEY_LEN], KeyError> {
        let envelope_key = decode_envelope_key(envelope_hex)?;
        Ok(xor_keys(&self.master_key, &envelope_key))
    }

    /// Run `rotate` on a fixed timer. A failed rotation is logged and
    /// retried on the next tick; it never takes the process down.
    pub fn spawn_rotation(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately; the startup rotation already ran
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = manager.rotate() {
                    error!("Key rotation failed, retrying next tick: {}", e);
                }
            }
        })
    }
}
