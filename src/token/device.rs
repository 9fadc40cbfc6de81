//! Abstract device layer.
//!
//! Concrete transports (HID, NFC, a simulator) implement [`TokenFactory`]
//! and [`DeviceHandle`]. Everything above this module talks to tokens only
//! through these two traits and [`StatusCode`] results.

use super::challenge::KeyHandle;
use super::status::StatusCode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Stable identity of an enumerated token (e.g. a HID path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// One open connection to a token.
#[async_trait]
pub trait DeviceHandle: Send + Sync {
    fn id(&self) -> &DeviceId;

    /// Protocol version string reported by the device (e.g. `U2F_V2`).
    async fn version(&self) -> Result<String, StatusCode>;

    /// Ask the device to sign `challenge_hash` with the credential behind `key_handle`.
    async fn sign(
        &self,
        challenge_hash: &[u8],
        app_id_hash: &[u8],
        key_handle: &KeyHandle,
        no_wink: bool,
    ) -> Result<Vec<u8>, StatusCode>;

    /// Create a new credential; returns the registration data.
    async fn enroll(&self, challenge_hash: &[u8], app_id_hash: &[u8])
        -> Result<Vec<u8>, StatusCode>;

    /// Release the connection. Safe to call more than once.
    fn close(&self);
}

/// Enumerates and opens tokens.
#[async_trait]
pub trait TokenFactory: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<DeviceId>, StatusCode>;

    async fn open(
        &self,
        id: &DeviceId,
        for_enroll: bool,
    ) -> Result<Box<dyn DeviceHandle>, StatusCode>;
}
