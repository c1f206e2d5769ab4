//! Payment-gated stream access
//!
//! - `keyring.rs` - segment-key rotation and the XOR envelope transform
//! - `session.rs` - per-viewer payment sessions and invoice lists
//! - `payment.rs` - Lightning payment provider interface (ZBD + in-memory)
//! - `reconciler.rs` - periodic invoice issuance and settlement polling
//! - `gate.rs` - per-request key release decision and playlist rewriting
//! - `api.rs` - HTTP surface for viewers
//! - `services.rs` - data-driven component start ordering

pub mod api;
pub mod gate;
pub mod keyring;
pub mod payment;
pub mod reconciler;
pub mod services;
pub mod session;
