//! Per-request key release decision and playlist rewriting.
//!
//! The gate is the only place payment policy meets key material. Order
//! matters on every key request: validate the envelope key, look up the
//! session, check health, and only then derive the segment key. An
//! unhealthy viewer must never cause key material to be computed, logged
//! or timed.

use std::sync::Arc;

use super::keyring::{decode_envelope_key, KeyError, KeyRotationManager, SEGMENT_KEY_LEN};
use super::session::{SessionError, SessionRegistry};

/// Key-request failures. `Key` covers malformed envelope keys (rejected
/// before any session state is touched); `Session` covers unknown viewers.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Outcome of a well-formed key request. `PaymentRequired` is an expected
/// business outcome, not an error: the caller surfaces it as HTTP 402.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDecision {
    Granted([u8; SEGMENT_KEY_LEN]),
    PaymentRequired { unpaid: usize },
}

pub struct AccessGate {
    registry: SessionRegistry,
    keys: Arc<KeyRotationManager>,
    public_base_url: String,
}

impl AccessGate {
    pub fn new(
        registry: SessionRegistry,
        keys: Arc<KeyRotationManager>,
        public_base_url: String,
    ) -> Self {
        AccessGate {
            registry,
            keys,
            public_base_url,
        }
    }

    /// Decide a key request for `(viewer, envelope_hex)`.
    pub async fn release_key(
        &self,
        viewer: &str,
        envelope_hex: &str,
    ) -> Result<KeyDecision, GateError> {
        // input validation strictly before any session lookup
        decode_envelope_key(envelope_hex)?;

        let health = self.registry.health(viewer).await?;
        if !health.healthy {
            // no key material is derived on this path
            return Ok(KeyDecision::PaymentRequired {
                unpaid: health.unpaid,
            });
        }

        let segment_key = self.keys.resolve_segment_key(envelope_hex)?;
        Ok(KeyDecision::Granted(segment_key))
    }

    /// Rewrite the segmenter's playlist for one viewer: envelope-key
    /// placeholders become per-viewer key URLs carrying the literal
    /// envelope hex, and bare segment references become viewer-scoped
    /// fetch URLs. Comment lines are otherwise left untouched.
    pub fn rewrite_playlist(&self, playlist: &str, viewer: &str) -> String {
        let mut out = String::with_capacity(playlist.len());
        for line in playlist.lines() {
            if let Some(rewritten) = self.rewrite_key_line(line, viewer) {
                out.push_str(&rewritten);
            } else if !line.starts_with('#') && !line.trim().is_empty() {
                out.push_str(&format!(
                    "{}/viewer_segment?viewerName={}&file={}",
                    self.public_base_url,
                    viewer,
                    line.trim()
                ));
            } else {
                out.push_str(line);
            }
            out.push('\n');
        }
        out
    }

    /// Substitute a `{{HLS_KEY_URL,<hex>}}` placeholder, if the line has
    /// one, with the viewer-scoped key retrieval URL.
    fn rewrite_key_line(&self, line: &str, viewer: &str) -> Option<String> {
        const OPEN: &str = "{{HLS_KEY_URL,";
        const CLOSE: &str = "}}";

        let start = line.find(OPEN)?;
        let rest = &line[start + OPEN.len()..];
        let end = rest.find(CLOSE)?;
        let envelope_hex = &rest[..end];

        let key_url = format!(
            "{}/viewer_key?viewerName={}&envKey={}",
            self.public_base_url, viewer, envelope_hex
        );
        let mut rewritten = String::with_capacity(line.len() + key_url.len());
        rewritten.push_str(&line[..start]);
        rewritten.push_str(&key_url);
        rewritten.push_str(&rest[end + CLOSE.len()..]);
        Some(rewritten)
    }
}
