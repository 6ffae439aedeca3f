//! External Control Protocol: the HTTP API every device serves on port 8060.

pub mod client;
pub mod worker;
pub mod xml;

use thiserror::Error;

pub use client::EcpClient;
pub use worker::DeviceRequest;

/// Why a device request failed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProbeError {
    /// No network response at all
    #[error("host unreachable: {0}")]
    Unreachable(String),
    /// Something answered but the API call failed
    #[error("{0}")]
    Other(String),
}
