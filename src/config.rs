//! Server settings loaded once from the environment at startup.
//!
//! Every field is either explicitly defaulted or mandatory; a mandatory
//! field that is missing or malformed aborts startup before any session
//! is accepted.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::modules::keyring::SEGMENT_KEY_LEN;

/// Fatal configuration errors. The process must not serve requests after
/// any of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error("environment variable {name} has invalid value {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("master key must be {expected} hex-encoded bytes, got {actual}")]
    MasterKeyLength { expected: usize, actual: usize },

    #[error("master key is not valid hex: {0}")]
    MasterKeyEncoding(#[from] hex::FromHexError),
}

/// Which payment provider backs invoice creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentBackend {
    /// ZBD REST API (requires `ZBD_API_KEY`).
    Zbd,
    /// In-memory provider for local development without a wallet.
    Memory,
}

/// Immutable server settings.
#[derive(Debug, Clone)]
pub struct StreamerSettings {
    pub port: u16,
    /// Base URL viewers reach this server under; embedded in playlist URLs.
    pub public_base_url: String,
    /// Process-wide master secret masking every segment key.
    pub master_key: [u8; SEGMENT_KEY_LEN],
    /// Key-info file the external segmenter polls (`-hls_key_info_file`).
    pub key_info_path: PathBuf,
    /// Raw segment key file referenced from the key-info file.
    pub key_path: PathBuf,
    /// Playlist the segmenter produces; rewritten per viewer on fetch.
    pub hls_playlist_path: PathBuf,
    /// Directory holding the produced media segments.
    pub hls_output_dir: PathBuf,
    pub rotation_interval: Duration,
    pub reconcile_interval: Duration,
    /// Minimum gap between two invoices for the same viewer.
    pub invoice_interval: Duration,
    /// Ping age beyond which a viewer stops receiving new invoices.
    pub stale_timeout: Duration,
    /// Unpaid invoices tolerated before access is suspended (strict `<`).
    pub unhealthy_invoice_count: usize,
    pub sats_per_invoice: u64,
    pub payment_backend: PaymentBackend,
    pub zbd_api_key: Option<String>,
    pub zbd_api_base: String,
    /// Bound on every provider HTTP call so a hung provider cannot stall
    /// the reconciliation tick indefinitely.
    pub provider_timeout: Duration,
}

/// Parse the hex-encoded 16-byte master key.
pub fn parse_master_key(hex_str: &str) -> Result<[u8; SEGMENT_KEY_LEN], ConfigError> {
    let bytes = hex::decode(hex_str.trim())?;
    if bytes.len() != SEGMENT_KEY_LEN {
        return Err(ConfigError::MasterKeyLength {
            expected: SEGMENT_KEY_LEN,
            actual: bytes.len(),
        });
    }
    let mut key = [0u8; SEGMENT_KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn env_or<F>(name: &'static str, default: F) -> String
where
    F: FnOnce() -> String,
{
    env::var(name).unwrap_or_else(|_| default())
}

fn env_parsed<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        Err(_) => Ok(default),
    }
}

fn env_duration_ms(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(env_parsed(name, default_ms)?))
}

pub fn load_config() -> Result<StreamerSettings, ConfigError> {
    let master_key_hex = env::var("MASTER_KEY").map_err(|_| ConfigError::MissingEnv("MASTER_KEY"))?;
    let master_key = parse_master_key(&master_key_hex)?;

    let port: u16 = env_parsed("PORT", 8083)?;

    let payment_backend = match env_or("PAYMENT_BACKEND", || "zbd".to_string()).as_str() {
        "zbd" => PaymentBackend::Zbd,
        "memory" => PaymentBackend::Memory,
        other => {
            return Err(ConfigError::InvalidValue {
                name: "PAYMENT_BACKEND",
                value: other.to_string(),
            })
        }
    };

    let zbd_api_key = env::var("ZBD_API_KEY").ok();
    if payment_backend == PaymentBackend::Zbd && zbd_api_key.is_none() {
        return Err(ConfigError::MissingEnv("ZBD_API_KEY"));
    }

    Ok(StreamerSettings {
        port,
        public_base_url: env_or("PUBLIC_BASE_URL", || format!("http://localhost:{}", port)),
        master_key,
        key_info_path: PathBuf::from(env_or("KEY_INFO_PATH", || "/tmp/hls_enc.keyinfo".to_string())),
        key_path: PathBuf::from(env_or("KEY_PATH", || "/tmp/hls_enc.key".to_string())),
        hls_playlist_path: PathBuf::from(env_or("HLS_PLAYLIST_PATH", || {
            "/tmp/hls/output.m3u8".to_string()
        })),
        hls_output_dir: PathBuf::from(env_or("HLS_OUTPUT_DIR", || "/tmp/hls".to_string())),
        rotation_interval: env_duration_ms("ROTATION_INTERVAL_MS", 30_000)?,
        reconcile_interval: env_duration_ms("RECONCILE_INTERVAL_MS", 5_000)?,
        invoice_interval: env_duration_ms("INVOICE_INTERVAL_MS", 30_000)?,
        stale_timeout: env_duration_ms("STALE_TIMEOUT_MS", 60_000)?,
        unhealthy_invoice_count: env_parsed("UNHEALTHY_INVOICE_COUNT", 1)?,
        sats_per_invoice: env_parsed("SATS_PER_INVOICE", 10)?,
        payment_backend,
        zbd_api_key,
        zbd_api_base: env_or("ZBD_API_BASE", || "https://api.zebedee.io".to_string()),
        provider_timeout: env_duration_ms("PROVIDER_TIMEOUT_MS", 10_000)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_master_key() {
        let key = parse_master_key("ecd0d06eaf884d8226c33928e87efa33").unwrap();
        assert_eq!(key.len(), 16);
        assert_eq!(key[0], 0xec);
        assert_eq!(key[15], 0x33);
    }

    #[test]
    fn test_master_key_wrong_length() {
        // 15 bytes
        let err = parse_master_key("ecd0d06eaf884d8226c33928e87efa").unwrap_err();
        match err {
            ConfigError::MasterKeyLength { expected, actual } => {
                assert_eq!(expected, 16);
                assert_eq!(actual, 15);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_master_key_not_hex() {
        assert!(matches!(
            parse_master_key("zzd0d06eaf884d8226c33928e87efa33"),
            Err(ConfigError::MasterKeyEncoding(_))
        ));
    }
}
