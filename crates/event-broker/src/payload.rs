//! Encoded event payloads.
//!
//! A payload is serialized once at publish time. Handlers receive the raw
//! bytes and decode lazily into whatever shape they need, so a decode
//! failure stays local to the handler that asked for it.

use crate::error::{BrokerError, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// MIME type of the reference encoding.
pub const CONTENT_TYPE: &str = "application/json";

/// Opaque encoded payload. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    bytes: Bytes,
}

impl Payload {
    /// Serialize `value` with the reference encoding.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(value).map_err(BrokerError::Encode)?;
        Ok(Self {
            bytes: Bytes::from(bytes),
        })
    }

    /// Wrap bytes received from a transport.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Decode into `T`.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Decode`] if the bytes are not a valid `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.bytes).map_err(BrokerError::Decode)
    }

    /// The encoded bytes, as sent on the wire.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Take the encoded bytes without copying.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// Encoded size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for a payload with no bytes, which no encoded value produces.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self { bytes }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(bytes)
    }
}
