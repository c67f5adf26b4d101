use crate::error::ConfigError;
use crate::protocol::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE};

use std::time::Duration;

/// How the final Result code is collected
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResultMode {
    /// Read the Result characteristic once the checksum is acknowledged
    Read,
    /// Subscribe to Result before starting and accept a notification in place of the read
    ReadAndNotify,
}

/// Tunables for one update session
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UpdateConfig {
    pub block_size: usize,
    /// Limit for every GATT operation except the Result read
    pub op_timeout: Duration,
    /// The device verifies the image before answering, so this one gets longer
    pub result_timeout: Duration,
    pub result_mode: ResultMode,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            op_timeout: Duration::from_secs(5),
            result_timeout: Duration::from_secs(30),
            result_mode: ResultMode::ReadAndNotify,
        }
    }
}

impl UpdateConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(ConfigError::BlockSize(self.block_size));
        }
        if self.op_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("operation"));
        }
        if self.result_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("result"));
        }
        Ok(())
    }
}
