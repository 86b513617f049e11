#![forbid(unsafe_code)]

// SFU signaling library - session state and signaling for mediasoup-style video calls

pub mod config;
pub mod error;
pub mod media;
pub mod metrics;
pub mod room;
pub mod signaling;
