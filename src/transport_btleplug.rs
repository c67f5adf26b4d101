use crate::protocol::update_uuids;
use crate::transport::{DiscoveredService, LinkLost, NotificationStream, UpdateTransport, UpdateTransportManager};

use anyhow::{Context, Result, anyhow, bail};
use btleplug::api::{BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties};
use btleplug::api::{ScanFilter, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::StreamExt;
use indicatif::ProgressBar;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// How the device to update is picked out of the advertisements
#[derive(Debug, Clone, PartialEq, Eq)]
enum DeviceSelector {
    Address(BDAddr),
    Name(String),
    /// First device advertising the update service
    UpdateService,
}

impl DeviceSelector {
    fn from_target(target: Option<&str>) -> Self {
        match target {
            None => DeviceSelector::UpdateService,
            Some(target) => match target.parse::<BDAddr>() {
                Ok(addr) => DeviceSelector::Address(addr),
                Err(_) => DeviceSelector::Name(target.to_owned()),
            },
        }
    }

    fn scan_filter(&self) -> ScanFilter {
        match self {
            DeviceSelector::UpdateService => ScanFilter {
                services: vec![update_uuids::SERVICE],
            },
            _ => ScanFilter::default(),
        }
    }

    fn matches(&self, props: &PeripheralProperties) -> bool {
        match self {
            DeviceSelector::Address(addr) => props.address_type.is_some() && props.address == *addr,
            DeviceSelector::Name(name) => props.local_name.as_deref() == Some(name.as_str()),
            DeviceSelector::UpdateService => props.services.contains(&update_uuids::SERVICE),
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Address(addr) => write!(f, "address {addr}"),
            DeviceSelector::Name(name) => write!(f, "name `{name}`"),
            DeviceSelector::UpdateService => f.write_str("a device offering software update"),
        }
    }
}

fn describe(props: &PeripheralProperties) -> String {
    format!(
        "{} ({}) rssi {}",
        props.local_name.as_deref().unwrap_or("unnamed"),
        props.address,
        props.rssi.map_or_else(|| "?".to_owned(), |rssi| rssi.to_string()),
    )
}

pub struct UpdateTransportManagerBtleplug {
    adapter: Adapter,
}

impl UpdateTransportManagerBtleplug {
    pub async fn new() -> Result<Self> {
        let manager = btleplug::platform::Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        Ok(UpdateTransportManagerBtleplug { adapter })
    }

    async fn scan_for(&self, selector: &DeviceSelector, pb: &ProgressBar) -> Result<Peripheral> {
        if cfg!(target_os = "macos") && matches!(selector, DeviceSelector::Address(_)) {
            bail!("BLE MAC addresses are not supported on macOS");
        }

        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(selector.scan_filter()).await?;
        while let Some(event) = events.next().await {
            let CentralEvent::DeviceDiscovered(id) = event else {
                continue;
            };
            let peripheral = self.adapter.peripheral(&id).await?;
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            pb.set_message(describe(&props));
            if selector.matches(&props) {
                self.adapter.stop_scan().await?;
                info!(device = %describe(&props), "device found");
                return Ok(peripheral);
            }
        }
        bail!("Scan ended before {selector} was found")
    }
}

impl UpdateTransportManager for UpdateTransportManagerBtleplug {
    type Transport = UpdateTransportBtleplug;

    async fn connect(&self, target: Option<&str>) -> Result<Self::Transport> {
        let selector = DeviceSelector::from_target(target);
        let pb = ProgressBar::new_spinner();
        pb.enable_steady_tick(Duration::from_millis(64));
        pb.println(format!("Looking for {selector}..."));

        let peripheral = self.scan_for(&selector, &pb).await?;
        peripheral.connect().await.context("Failed to establish a connection")?;
        pb.finish_and_clear();
        Ok(UpdateTransportBtleplug { peripheral })
    }
}

pub struct UpdateTransportBtleplug {
    peripheral: Peripheral,
}

impl UpdateTransportBtleplug {
    fn characteristic(&self, uuid: uuid::Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| anyhow!("characteristic {uuid} not found"))
    }
}

/// Surface a dropped link as [`LinkLost`] so the session sees a disconnect
fn gatt_error(err: btleplug::Error) -> anyhow::Error {
    match err {
        btleplug::Error::NotConnected => anyhow::Error::new(LinkLost),
        other => other.into(),
    }
}

impl UpdateTransport for UpdateTransportBtleplug {
    async fn discover_services(&self) -> Result<Vec<DiscoveredService>> {
        self.peripheral.discover_services().await.map_err(gatt_error).context("Service discovery failed")?;
        let services = self
            .peripheral
            .services()
            .into_iter()
            .map(|service| DiscoveredService {
                uuid: service.uuid,
                characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect::<Vec<_>>();
        debug!(count = services.len(), "services discovered");
        Ok(services)
    }

    async fn write(&self, uuid: uuid::Uuid, value: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(uuid)?;
        self.peripheral
            .write(&characteristic, value, WriteType::WithResponse)
            .await
            .map_err(gatt_error)
    }

    async fn read(&self, uuid: uuid::Uuid) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(uuid)?;
        self.peripheral.read(&characteristic).await.map_err(gatt_error)
    }

    async fn subscribe(&self, uuid: uuid::Uuid) -> Result<()> {
        let characteristic = self.characteristic(uuid)?;
        self.peripheral.subscribe(&characteristic).await.map_err(gatt_error)
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let notifications = self.peripheral.notifications().await.map_err(gatt_error)?;
        Ok(notifications.map(|ntf| (ntf.uuid, ntf.value)).boxed())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
