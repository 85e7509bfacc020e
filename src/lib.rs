//! Drishti - VR tracking-device daemon
//!
//! This library provides the building blocks of the daemon: a
//! single-threaded event dispatcher, the versioned tracking protocol, the
//! device manager with its driver seam, and the TCP server that ties them
//! together.

pub mod config;
pub mod devices;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod server;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
