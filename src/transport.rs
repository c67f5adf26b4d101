use anyhow::Result;
use futures::stream::BoxStream;
use thiserror::Error;

/// A GATT service and the characteristic UUIDs it exposes
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DiscoveredService {
    pub uuid: uuid::Uuid,
    pub characteristics: Vec<uuid::Uuid>,
}

/// Values pushed by the device on subscribed characteristics
pub type NotificationStream = BoxStream<'static, (uuid::Uuid, Vec<u8>)>;

/// Returned (possibly wrapped in context) by a transport whose link went down
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
#[error("connection to the device was lost")]
pub struct LinkLost;

pub fn is_link_lost(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<LinkLost>())
}

/// Software update transport interface
#[allow(async_fn_in_trait)]
pub trait UpdateTransport {
    /// Discover services and their characteristics
    async fn discover_services(&self) -> Result<Vec<DiscoveredService>>;
    /// Write with response
    async fn write(&self, char: uuid::Uuid, bytes: &[u8]) -> Result<()>;
    /// Read the current value of the given characteristic
    async fn read(&self, char: uuid::Uuid) -> Result<Vec<u8>>;
    /// Subscribe to the given characteristic
    async fn subscribe(&self, char: uuid::Uuid) -> Result<()>;
    /// Stream of notifications for every subscribed characteristic
    async fn notifications(&self) -> Result<NotificationStream>;
    async fn disconnect(&self) -> Result<()>;
}

/// Software update transport manager interface
#[allow(async_fn_in_trait)]
pub trait UpdateTransportManager {
    type Transport: UpdateTransport;

    /// Connect to the device with the given name or address, or to the first
    /// one advertising the update service when `target` is `None`
    async fn connect(&self, target: Option<&str>) -> Result<Self::Transport>;
}
