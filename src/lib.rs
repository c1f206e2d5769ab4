//! satstream: payment-gated key delivery for a paid HLS live stream.
//!
//! A broadcaster sells access to a live stream in small increments: viewers
//! must keep settling Lightning micro-invoices to keep receiving the
//! decryption key for the current encrypted segment batch. This crate owns
//! the key-rotation, viewer-session and payment-reconciliation state;
//! transcoding and segmenting happen in an external ffmpeg/nginx pipeline
//! that consumes the key-info file this crate writes.

pub mod config;
pub mod modules;
