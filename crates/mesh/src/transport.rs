//! Collaborator seams for links and the radio.
//!
//! The engine never opens sockets or touches the radio itself. A platform
//! layer implements these traits and reports link activity back through
//! the engine's `on_*` entry points.

use crate::error::{RadioError, TransportError};
use canopy_core::Rssi;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier the transport hands out for one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinkHandle(pub u64);

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Narrow capability interface over the asynchronous transport.
///
/// `connect` only starts an attempt; the outcome arrives later through
/// `MeshEngine::on_connected` or `MeshEngine::on_error`.
pub trait Transport {
    /// Start connecting to `addr`
    fn connect(&mut self, addr: &str) -> Result<LinkHandle, TransportError>;

    /// Queue bytes on an open link
    fn send(&mut self, link: LinkHandle, bytes: &[u8]) -> Result<(), TransportError>;

    /// Begin closing a link. The handle stays valid until released.
    fn close(&mut self, link: LinkHandle);

    /// Free every transport-side resource tied to the handle.
    ///
    /// Only called from a deferred cleanup task, never from inside a
    /// callback the transport made for the same link.
    fn release(&mut self, link: LinkHandle);
}

/// One access point seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    /// Network name
    pub ssid: String,
    /// Received signal strength in dBm
    pub rssi: Rssi,
    /// Wi-Fi channel the access point is on
    pub channel: u8,
}

/// Radio and link-layer control.
pub trait Radio {
    /// Blocking-free snapshot of visible access points
    fn scan(&mut self) -> Vec<ScanRecord>;

    /// Join the upstream router as a station
    fn associate(&mut self, ssid: &str, password: &str, channel: u8) -> Result<(), RadioError>;

    /// Leave the upstream router
    fn disassociate(&mut self);
}

/// Radio for nodes that never act as a station.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRadio;

impl Radio for NoRadio {
    fn scan(&mut self) -> Vec<ScanRecord> {
        Vec::new()
    }

    fn associate(&mut self, _ssid: &str, _password: &str, _channel: u8) -> Result<(), RadioError> {
        Err(RadioError::Unsupported)
    }

    fn disassociate(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_radio_refuses_association() {
        let mut radio = NoRadio;
        assert!(radio.scan().is_empty());
        assert_eq!(
            radio.associate("hq", "secret", 6),
            Err(RadioError::Unsupported)
        );
    }

    #[test]
    fn test_link_handle_display() {
        assert_eq!(LinkHandle(12).to_string(), "link#12");
    }
}
