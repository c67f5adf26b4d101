use crate::config::UpdateConfig;
use crate::coordinator::{Command, Coordinator, UpdateProgress};
use crate::protocol::{OpKind, UpdateCharacteristic};
use crate::session::{GattStatus, Outcome};
use crate::transport::{NotificationStream, UpdateTransport, UpdateTransportManager, is_link_lost};

use anyhow::Result;
use futures::StreamExt;
use futures::stream::Fuse;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Connect to a device and run one update session on it.
///
/// Errors are only returned for failures before a connection exists; once
/// connected, every failure is reported through the [`Outcome`].
pub async fn update_device<M, F>(
    manager: &M,
    target: Option<&str>,
    image: Arc<[u8]>,
    config: &UpdateConfig,
    on_progress: F,
) -> Result<Outcome>
where
    M: UpdateTransportManager,
    F: FnMut(&UpdateProgress),
{
    let coordinator = Coordinator::new(image, config)?;
    let transport = manager.connect(target).await?;
    Ok(run_update(&transport, coordinator, config, on_progress).await)
}

/// Execute the coordinator's commands on an already connected transport
/// until the session reaches an outcome.
pub async fn run_update<T, F>(transport: &T, mut coordinator: Coordinator, config: &UpdateConfig, mut on_progress: F) -> Outcome
where
    T: UpdateTransport,
    F: FnMut(&UpdateProgress),
{
    let mut notifications = match transport.notifications().await {
        Ok(stream) => stream.fuse(),
        Err(err) => {
            warn!(error = %err, "notifications unavailable, relying on reads");
            futures::stream::empty().boxed().fuse()
        }
    };

    let mut next = coordinator.on_connected();
    while let Some(command) = next.take() {
        debug!(?command, "issuing");
        next = match command {
            Command::Disconnect => {
                if let Err(err) = transport.disconnect().await {
                    debug!(error = %err, "disconnect failed");
                }
                None
            }
            Command::DiscoverServices => match timeout(config.op_timeout, transport.discover_services()).await {
                Ok(Ok(services)) => coordinator.on_service_resolved(&services),
                Ok(Err(err)) if is_link_lost(&err) => coordinator.on_disconnected(),
                Ok(Err(err)) => coordinator.on_discovery_failed(format!("{err:#}")),
                Err(_) => coordinator.on_discovery_failed("timed out".into()),
            },
            command => execute(transport, &mut notifications, &mut coordinator, command, config).await,
        };
        on_progress(coordinator.progress());
    }

    coordinator.take_outcome().unwrap_or_else(|| {
        // the coordinator stopped asking for work without deciding; treat it like a lost link
        warn!("session stalled without an outcome");
        Outcome::Failed(crate::error::UpdateError::UnexpectedDisconnect)
    })
}

/// Run one characteristic operation, feeding any notifications that arrive
/// meanwhile to the coordinator.
async fn execute<T: UpdateTransport>(
    transport: &T,
    notifications: &mut Fuse<NotificationStream>,
    coordinator: &mut Coordinator,
    command: Command,
    config: &UpdateConfig,
) -> Option<Command> {
    let (characteristic, kind) = command.operation()?;
    let Some(uuid) = coordinator.uuid(characteristic) else {
        warn!(%characteristic, "no target resolved for operation");
        return coordinator.on_disconnected();
    };
    let limit = op_timeout(config, characteristic, kind);

    let op = async {
        match &command {
            Command::Write { value, .. } => transport.write(uuid, value).await.map(|()| Vec::new()),
            Command::Read(_) => transport.read(uuid).await,
            Command::Subscribe(_) => transport.subscribe(uuid).await.map(|()| Vec::new()),
            Command::DiscoverServices | Command::Disconnect => Ok(Vec::new()),
        }
    };
    let op = timeout(limit, op);
    tokio::pin!(op);

    loop {
        tokio::select! {
            biased;
            res = &mut op => {
                let status = match res {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) if is_link_lost(&err) => return coordinator.on_disconnected(),
                    Ok(Err(err)) => Err(GattStatus::Error(format!("{err:#}"))),
                    Err(_) => Err(GattStatus::TimedOut),
                };
                return coordinator.on_characteristic_op_complete(characteristic, kind, status);
            }
            Some((notified_uuid, value)) = notifications.next() => {
                let Some(notified) = coordinator.characteristic(notified_uuid) else {
                    continue;
                };
                let next = coordinator.on_notification(notified, value);
                if coordinator.is_finished() {
                    // the pending operation is abandoned; the session is already over
                    return next;
                }
            }
        }
    }
}

fn op_timeout(config: &UpdateConfig, characteristic: UpdateCharacteristic, kind: OpKind) -> Duration {
    match (characteristic, kind) {
        (UpdateCharacteristic::Result, OpKind::Read) => config.result_timeout,
        _ => config.op_timeout,
    }
}
