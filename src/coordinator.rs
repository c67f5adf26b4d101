//! Session coordinator.
//!
//! Turns connection-level events into [`UpdateSession`] events and session
//! effects into [`Command`]s for the transport. It performs no I/O itself; see
//! [`crate::driver`] for the loop that executes the commands.

use crate::config::{ResultMode, UpdateConfig};
use crate::error::{ConfigError, UpdateError};
use crate::protocol::{OpKind, UpdateCharacteristic, UpdateTarget};
use crate::session::{Effect, Event, GattStatus, Outcome, SessionState, UpdateSession};
use crate::transport::DiscoveredService;

use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A request for the transport
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Command {
    DiscoverServices,
    Subscribe(UpdateCharacteristic),
    Write {
        characteristic: UpdateCharacteristic,
        value: Vec<u8>,
    },
    Read(UpdateCharacteristic),
    Disconnect,
}

impl Command {
    /// The characteristic operation this command starts, if any
    pub fn operation(&self) -> Option<(UpdateCharacteristic, OpKind)> {
        match self {
            Command::Subscribe(c) => Some((*c, OpKind::Subscribe)),
            Command::Write { characteristic, .. } => Some((*characteristic, OpKind::Write)),
            Command::Read(c) => Some((*c, OpKind::Read)),
            Command::DiscoverServices | Command::Disconnect => None,
        }
    }
}

/// Snapshot handed to progress observers
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UpdateProgress {
    pub state: SessionState,
    pub bytes_sent: u32,
    pub image_len: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Phase {
    Connecting,
    Discovering,
    Subscribing,
    Updating,
    Finished,
}

#[derive(Debug)]
pub struct Coordinator {
    image: Arc<[u8]>,
    block_size: NonZeroUsize,
    result_mode: ResultMode,
    phase: Phase,
    target: Option<UpdateTarget>,
    session: Option<UpdateSession>,
    progress: UpdateProgress,
    outcome: Option<Outcome>,
}

impl Coordinator {
    pub fn new(image: Arc<[u8]>, config: &UpdateConfig) -> Result<Self, UpdateError> {
        config.validate()?;
        let block_size = NonZeroUsize::new(config.block_size).ok_or(ConfigError::BlockSize(config.block_size))?;
        if image.is_empty() {
            return Err(UpdateError::EmptyImage);
        }
        let image_len = u32::try_from(image.len()).map_err(|_| UpdateError::ImageTooLarge(image.len()))?;
        Ok(Self {
            image,
            block_size,
            result_mode: config.result_mode,
            phase: Phase::Connecting,
            target: None,
            session: None,
            progress: UpdateProgress {
                state: SessionState::Idle,
                bytes_sent: 0,
                image_len,
            },
            outcome: None,
        })
    }

    pub fn on_connected(&mut self) -> Option<Command> {
        if self.phase != Phase::Connecting {
            debug!(phase = ?self.phase, "ignoring connection event");
            return None;
        }
        info!("connected, discovering services");
        self.phase = Phase::Discovering;
        Some(Command::DiscoverServices)
    }

    /// Services reported by discovery. A device without the update service is
    /// dropped.
    pub fn on_service_resolved(&mut self, services: &[DiscoveredService]) -> Option<Command> {
        if self.phase != Phase::Discovering {
            debug!(phase = ?self.phase, "ignoring discovery result");
            return None;
        }
        let target = match UpdateTarget::resolve(services) {
            Ok(target) => target,
            Err(err) => {
                info!(error = %err, "device is not an update candidate");
                return self.finish(Outcome::Failed(err));
            }
        };
        let session = match UpdateSession::new(target.clone(), self.image.clone(), self.block_size) {
            Ok(session) => session,
            Err(err) => return self.finish(Outcome::Failed(err)),
        };
        self.target = Some(target);
        self.session = Some(session);
        match self.result_mode {
            ResultMode::ReadAndNotify => {
                self.phase = Phase::Subscribing;
                Some(Command::Subscribe(UpdateCharacteristic::Result))
            }
            ResultMode::Read => self.begin(),
        }
    }

    pub fn on_discovery_failed(&mut self, reason: String) -> Option<Command> {
        if self.phase != Phase::Discovering {
            return None;
        }
        self.finish(Outcome::Failed(UpdateError::DiscoveryFailed(reason)))
    }

    pub fn on_characteristic_op_complete(
        &mut self,
        characteristic: UpdateCharacteristic,
        kind: OpKind,
        status: Result<Vec<u8>, GattStatus>,
    ) -> Option<Command> {
        match self.phase {
            Phase::Subscribing if (characteristic, kind) == (UpdateCharacteristic::Result, OpKind::Subscribe) => {
                match status {
                    Ok(_) => self.begin(),
                    Err(status) => self.finish(Outcome::Failed(UpdateError::TransportFailure {
                        characteristic,
                        op: kind,
                        reason: status.to_string(),
                    })),
                }
            }
            Phase::Updating => self.dispatch(Event::OpCompleted {
                characteristic,
                kind,
                status,
            }),
            _ => {
                debug!(%characteristic, %kind, phase = ?self.phase, "ignoring completion");
                None
            }
        }
    }

    pub fn on_notification(&mut self, characteristic: UpdateCharacteristic, value: Vec<u8>) -> Option<Command> {
        if self.phase != Phase::Updating {
            return None;
        }
        self.dispatch(Event::Notification { characteristic, value })
    }

    /// The link dropped. Any active session fails and is released.
    pub fn on_disconnected(&mut self) -> Option<Command> {
        if self.phase == Phase::Finished {
            return None;
        }
        if let Some(session) = self.session.as_mut() {
            session.handle(Event::Disconnected);
            self.progress.state = session.state().clone();
        }
        if !self.progress.state.is_terminal() {
            self.progress.state = SessionState::Failed(UpdateError::UnexpectedDisconnect);
        }
        self.session = None;
        self.phase = Phase::Finished;
        self.outcome = Some(Outcome::Failed(UpdateError::UnexpectedDisconnect));
        warn!("device disconnected before the update finished");
        None
    }

    fn begin(&mut self) -> Option<Command> {
        let session = self.session.as_mut()?;
        self.phase = Phase::Updating;
        let effect = session.begin_update();
        self.apply(effect)
    }

    fn dispatch(&mut self, event: Event) -> Option<Command> {
        let session = self.session.as_mut()?;
        let effect = session.handle(event);
        self.apply(effect)
    }

    fn apply(&mut self, effect: Effect) -> Option<Command> {
        if let Some(session) = &self.session {
            self.progress.state = session.state().clone();
            self.progress.bytes_sent = session.bytes_sent();
        }
        match effect {
            Effect::Write { characteristic, value } => Some(Command::Write { characteristic, value }),
            Effect::Read { characteristic } => Some(Command::Read(characteristic)),
            Effect::Finished(outcome) => self.finish(outcome),
            Effect::None => None,
        }
    }

    fn finish(&mut self, outcome: Outcome) -> Option<Command> {
        info!(?outcome, "update session finished");
        if let Outcome::Failed(err) = &outcome {
            if !self.progress.state.is_terminal() {
                self.progress.state = SessionState::Failed(err.clone());
            }
        }
        self.session = None;
        self.phase = Phase::Finished;
        self.outcome = Some(outcome);
        Some(Command::Disconnect)
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn take_outcome(&mut self) -> Option<Outcome> {
        self.outcome.take()
    }

    pub fn progress(&self) -> &UpdateProgress {
        &self.progress
    }

    pub fn session(&self) -> Option<&UpdateSession> {
        self.session.as_ref()
    }

    /// Maps a notification UUID back to an update characteristic
    pub fn characteristic(&self, uuid: uuid::Uuid) -> Option<UpdateCharacteristic> {
        self.target.as_ref()?.characteristic(uuid)
    }

    pub fn uuid(&self, characteristic: UpdateCharacteristic) -> Option<uuid::Uuid> {
        Some(self.target.as_ref()?.uuid(characteristic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{self, update_uuids};
    use UpdateCharacteristic::*;

    fn update_service() -> DiscoveredService {
        DiscoveredService {
            uuid: update_uuids::SERVICE,
            characteristics: UpdateCharacteristic::ALL.iter().map(|c| c.uuid()).collect(),
        }
    }

    fn coordinator(mode: ResultMode) -> Coordinator {
        let config = UpdateConfig {
            result_mode: mode,
            ..Default::default()
        };
        Coordinator::new(vec![0xAB; 1000].into(), &config).unwrap()
    }

    fn ok(c: &mut Coordinator, characteristic: UpdateCharacteristic, kind: OpKind) -> Option<Command> {
        c.on_characteristic_op_complete(characteristic, kind, Ok(Vec::new()))
    }

    #[test]
    fn rejects_empty_image_and_bad_config() {
        let err = Coordinator::new(Vec::<u8>::new().into(), &UpdateConfig::default()).unwrap_err();
        assert_eq!(err, UpdateError::EmptyImage);

        let config = UpdateConfig {
            block_size: 0,
            ..Default::default()
        };
        let err = Coordinator::new(vec![1].into(), &config).unwrap_err();
        assert_eq!(err, UpdateError::Config(ConfigError::BlockSize(0)));
    }

    #[test]
    fn non_candidate_is_disconnected() {
        let mut c = coordinator(ResultMode::Read);
        assert_eq!(c.on_connected(), Some(Command::DiscoverServices));
        assert_eq!(c.on_connected(), None);
        let other = DiscoveredService {
            uuid: uuid::Uuid::from_u128(0x180A),
            characteristics: vec![],
        };
        assert_eq!(c.on_service_resolved(&[other]), Some(Command::Disconnect));
        assert!(c.is_finished());
        assert_eq!(c.outcome(), Some(&Outcome::Failed(UpdateError::ServiceNotFound)));
        assert!(c.session().is_none());
    }

    #[test]
    fn subscribes_to_result_before_proposing_size() {
        let mut c = coordinator(ResultMode::ReadAndNotify);
        c.on_connected();
        assert_eq!(c.on_service_resolved(&[update_service()]), Some(Command::Subscribe(Result)));
        assert_eq!(c.session().map(|s| s.state()), Some(&SessionState::Idle));
        // a write completion cannot arrive while subscribing
        assert_eq!(ok(&mut c, TotalSize, OpKind::Write), None);
        assert_eq!(
            ok(&mut c, Result, OpKind::Subscribe),
            Some(Command::Write {
                characteristic: TotalSize,
                value: protocol::encode_u32(1000)
            })
        );
        assert_eq!(c.progress().state, SessionState::SizeProposed);
    }

    #[test]
    fn failed_subscription_ends_the_session() {
        let mut c = coordinator(ResultMode::ReadAndNotify);
        c.on_connected();
        c.on_service_resolved(&[update_service()]);
        let next = c.on_characteristic_op_complete(Result, OpKind::Subscribe, Err(GattStatus::Error("denied".into())));
        assert_eq!(next, Some(Command::Disconnect));
        assert!(matches!(
            c.outcome(),
            Some(Outcome::Failed(UpdateError::TransportFailure {
                op: OpKind::Subscribe,
                ..
            }))
        ));
    }

    #[test]
    fn drives_session_to_completion() {
        let mut c = coordinator(ResultMode::Read);
        c.on_connected();
        assert!(matches!(c.on_service_resolved(&[update_service()]), Some(Command::Write { characteristic: TotalSize, .. })));
        assert_eq!(ok(&mut c, TotalSize, OpKind::Write), Some(Command::Read(TotalSize)));
        let next = c.on_characteristic_op_complete(TotalSize, OpKind::Read, Ok(protocol::encode_u32(1000)));
        assert!(matches!(next, Some(Command::Write { characteristic: Data, ref value }) if value.len() == 512));
        assert!(matches!(ok(&mut c, Data, OpKind::Write), Some(Command::Write { characteristic: Data, ref value }) if value.len() == 488));
        assert_eq!(c.progress().bytes_sent, 512);
        assert!(matches!(ok(&mut c, Data, OpKind::Write), Some(Command::Write { characteristic: Checksum, .. })));
        assert_eq!(ok(&mut c, Checksum, OpKind::Write), Some(Command::Read(Result)));
        let next = c.on_characteristic_op_complete(Result, OpKind::Read, Ok(vec![0]));
        assert_eq!(next, Some(Command::Disconnect));
        assert!(matches!(c.outcome(), Some(Outcome::Completed { bytes_sent: 1000, .. })));
        assert_eq!(c.progress().state, SessionState::Completed);
        assert_eq!(c.progress().bytes_sent, 1000);
    }

    #[test]
    fn disconnect_fails_and_releases_session() {
        let mut c = coordinator(ResultMode::Read);
        c.on_connected();
        c.on_service_resolved(&[update_service()]);
        assert_eq!(c.on_disconnected(), None);
        assert!(c.session().is_none());
        assert_eq!(c.progress().state, SessionState::Failed(UpdateError::UnexpectedDisconnect));
        assert_eq!(c.take_outcome(), Some(Outcome::Failed(UpdateError::UnexpectedDisconnect)));

        // nothing that arrives afterwards is acted upon
        assert_eq!(c.on_disconnected(), None);
        assert_eq!(ok(&mut c, TotalSize, OpKind::Write), None);
        assert_eq!(c.on_notification(Result, vec![0]), None);
        assert_eq!(c.outcome(), None);
    }

    #[test]
    fn maps_uuids_once_resolved() {
        let mut c = coordinator(ResultMode::Read);
        assert_eq!(c.uuid(Data), None);
        c.on_connected();
        c.on_service_resolved(&[update_service()]);
        assert_eq!(c.uuid(Data), Some(update_uuids::DATA));
        assert_eq!(c.characteristic(update_uuids::RESULT), Some(Result));
    }
}
