use crate::protocol::{MAX_BLOCK_SIZE, OpKind, UpdateCharacteristic};

use thiserror::Error;

/// Reasons an update session ends without installing the image
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum UpdateError {
    #[error("firmware image is empty")]
    EmptyImage,
    #[error("firmware image of {0} bytes does not fit the 32-bit size field")]
    ImageTooLarge(usize),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("update service not found on device")]
    ServiceNotFound,
    #[error("update service has no {0} characteristic")]
    MissingCharacteristic(UpdateCharacteristic),
    #[error("service discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("device declined image size {proposed} (read back {answered})")]
    SizeRejected { proposed: u32, answered: u32 },
    #[error("{characteristic} {op} failed: {reason}")]
    TransportFailure {
        characteristic: UpdateCharacteristic,
        op: OpKind,
        reason: String,
    },
    #[error("device disconnected during the update")]
    UnexpectedDisconnect,
    #[error("device reported a checksum mismatch")]
    ChecksumMismatch,
    #[error("device reported failure code {0:#04x}")]
    DeviceReportedFailure(u32),
    #[error("malformed {characteristic} value ({len} bytes)")]
    MalformedValue {
        characteristic: UpdateCharacteristic,
        len: usize,
    },
}

impl UpdateError {
    /// Whether a fresh session has a reasonable chance of succeeding
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            UpdateError::TransportFailure { .. } | UpdateError::UnexpectedDisconnect | UpdateError::DiscoveryFailed(_)
        )
    }
}

/// Invalid [`UpdateConfig`](crate::config::UpdateConfig) values
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    #[error("block size {0} outside 1..={max}", max = MAX_BLOCK_SIZE)]
    BlockSize(usize),
    #[error("{0} timeout must be non-zero")]
    ZeroTimeout(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_are_retriable() {
        assert!(UpdateError::UnexpectedDisconnect.is_retriable());
        assert!(
            UpdateError::TransportFailure {
                characteristic: UpdateCharacteristic::Data,
                op: OpKind::Write,
                reason: "timed out".into(),
            }
            .is_retriable()
        );
        assert!(!UpdateError::SizeRejected { proposed: 10, answered: 0 }.is_retriable());
        assert!(!UpdateError::ChecksumMismatch.is_retriable());
        assert!(!UpdateError::ServiceNotFound.is_retriable());
    }

    #[test]
    fn messages_name_the_operation() {
        let err = UpdateError::TransportFailure {
            characteristic: UpdateCharacteristic::TotalSize,
            op: OpKind::Read,
            reason: "timed out".into(),
        };
        assert_eq!(err.to_string(), "TotalSize read failed: timed out");
        assert_eq!(UpdateError::DeviceReportedFailure(5).to_string(), "device reported failure code 0x05");
    }
}
