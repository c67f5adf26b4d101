//! Over-the-air firmware update over the mesh software-update BLE service.
//!
//! The device exposes four characteristics. An update proposes the image
//! size on TotalSize and reads it back for acceptance, streams the image to
//! Data one block per write, writes the CRC32 of the image to Checksum and
//! finally collects the device's verdict from Result.
//!
//! [`session::UpdateSession`] holds the protocol state machine,
//! [`coordinator::Coordinator`] bridges transport events to it and
//! [`driver::run_update`] executes the resulting requests on an
//! [`transport::UpdateTransport`].

pub mod block;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod image;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod transport_btleplug;

pub use config::{ResultMode, UpdateConfig};
pub use coordinator::{Command, Coordinator, UpdateProgress};
pub use error::{ConfigError, UpdateError};
pub use session::{Outcome, SessionState, UpdateSession};
