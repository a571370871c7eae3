//! Serialization error types for VaultMesh wire formats.

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire payloads.
#[derive(Debug, Error)]
pub enum WireError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// JSON (QR payload) parse failure
    #[error("invalid json payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Unknown schema/wire version
    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    /// Structurally valid but semantically unusable data
    #[error("invalid data: {0}")]
    InvalidData(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = WireError::UnsupportedVersion(3);
        assert_eq!(err.to_string(), "unsupported wire version: 3");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WireError>();
    }
}
