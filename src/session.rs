//! Update session state machine.
//!
//! [`UpdateSession`] knows nothing about the transport. It is fed [`Event`]s
//! and answers each one with an [`Effect`]: the single GATT operation to issue
//! next, the final [`Outcome`], or nothing when the event was stale.
//!
//! At most one operation is outstanding at any time. A completion is only
//! consumed when it names the characteristic and kind of that operation;
//! anything else is dropped without touching the state.

use crate::block::BlockSource;
use crate::error::UpdateError;
use crate::protocol::{self, DeviceResult, OpKind, Operation, UpdateCharacteristic, UpdateTarget};

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    /// TotalSize written, waiting for the write and then the read-back
    SizeProposed,
    SizeAccepted,
    Streaming,
    ChecksumSent,
    AwaitingResult,
    Completed,
    Rejected,
    Failed(UpdateError),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Failed(_))
    }

    /// Position in the protocol sequence; transitions never decrease it
    pub fn rank(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::SizeProposed => 1,
            Self::SizeAccepted => 2,
            Self::Streaming => 3,
            Self::ChecksumSent => 4,
            Self::AwaitingResult => 5,
            Self::Completed | Self::Rejected | Self::Failed(_) => 6,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::SizeProposed => f.write_str("size proposed"),
            Self::SizeAccepted => f.write_str("size accepted"),
            Self::Streaming => f.write_str("streaming"),
            Self::ChecksumSent => f.write_str("checksum sent"),
            Self::AwaitingResult => f.write_str("awaiting result"),
            Self::Completed => f.write_str("completed"),
            Self::Rejected => f.write_str("rejected"),
            Self::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

/// Non-success status of a GATT operation
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum GattStatus {
    TimedOut,
    Error(String),
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut => f.write_str("timed out"),
            Self::Error(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Event {
    /// A read, write or subscribe finished. Reads carry the value, writes an empty vec
    OpCompleted {
        characteristic: UpdateCharacteristic,
        kind: OpKind,
        status: Result<Vec<u8>, GattStatus>,
    },
    Notification {
        characteristic: UpdateCharacteristic,
        value: Vec<u8>,
    },
    Disconnected,
}

impl Event {
    pub fn write_ok(characteristic: UpdateCharacteristic) -> Self {
        Self::OpCompleted {
            characteristic,
            kind: OpKind::Write,
            status: Ok(Vec::new()),
        }
    }

    pub fn read_ok(characteristic: UpdateCharacteristic, value: Vec<u8>) -> Self {
        Self::OpCompleted {
            characteristic,
            kind: OpKind::Read,
            status: Ok(value),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Effect {
    Write {
        characteristic: UpdateCharacteristic,
        value: Vec<u8>,
    },
    Read {
        characteristic: UpdateCharacteristic,
    },
    Finished(Outcome),
    /// The event did not advance the session
    None,
}

impl Effect {
    pub fn operation(&self) -> Option<Operation> {
        match self {
            Effect::Write { characteristic, .. } => Some(Operation::new(*characteristic, OpKind::Write)),
            Effect::Read { characteristic } => Some(Operation::new(*characteristic, OpKind::Read)),
            Effect::Finished(_) | Effect::None => None,
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Outcome {
    Completed { bytes_sent: u32, checksum: u32 },
    Rejected { proposed: u32, answered: u32 },
    Failed(UpdateError),
}

impl Outcome {
    pub fn into_result(self) -> Result<(), UpdateError> {
        match self {
            Outcome::Completed { .. } => Ok(()),
            Outcome::Rejected { proposed, answered } => Err(UpdateError::SizeRejected { proposed, answered }),
            Outcome::Failed(err) => Err(err),
        }
    }
}

/// Protocol state for updating one connected device
pub struct UpdateSession {
    target: UpdateTarget,
    state: SessionState,
    image_len: u32,
    negotiated_size: Option<u32>,
    bytes_sent: u32,
    blocks: BlockSource,
    hasher: crc32fast::Hasher,
    running_checksum: u32,
    in_flight: Option<Operation>,
    in_flight_block: u32,
}

impl fmt::Debug for UpdateSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateSession")
            .field("state", &self.state)
            .field("image_len", &self.image_len)
            .field("negotiated_size", &self.negotiated_size)
            .field("bytes_sent", &self.bytes_sent)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl UpdateSession {
    pub fn new(target: UpdateTarget, image: Arc<[u8]>, block_size: NonZeroUsize) -> Result<Self, UpdateError> {
        if image.is_empty() {
            return Err(UpdateError::EmptyImage);
        }
        let image_len = u32::try_from(image.len()).map_err(|_| UpdateError::ImageTooLarge(image.len()))?;
        Ok(Self {
            target,
            state: SessionState::Idle,
            image_len,
            negotiated_size: None,
            bytes_sent: 0,
            blocks: BlockSource::new(image, block_size),
            hasher: crc32fast::Hasher::new(),
            running_checksum: 0,
            in_flight: None,
            in_flight_block: 0,
        })
    }

    /// Propose the image size to the device
    pub fn begin_update(&mut self) -> Effect {
        if self.state != SessionState::Idle {
            warn!(state = %self.state, "update already started");
            return Effect::None;
        }
        info!(image_len = self.image_len, blocks = self.blocks.total_blocks(), "proposing image size");
        self.transition(SessionState::SizeProposed);
        self.write(UpdateCharacteristic::TotalSize, protocol::encode_u32(self.image_len))
    }

    pub fn handle(&mut self, event: Event) -> Effect {
        if self.state.is_terminal() {
            trace!(?event, "session finished, ignoring event");
            return Effect::None;
        }
        match event {
            Event::Disconnected => self.fail(UpdateError::UnexpectedDisconnect),
            Event::Notification { characteristic, value } => {
                if characteristic == UpdateCharacteristic::Result && self.state == SessionState::AwaitingResult {
                    self.in_flight = None;
                    self.on_result(&value)
                } else {
                    debug!(%characteristic, state = %self.state, "ignoring notification");
                    Effect::None
                }
            }
            Event::OpCompleted {
                characteristic,
                kind,
                status,
            } => {
                let op = Operation::new(characteristic, kind);
                if self.in_flight != Some(op) {
                    debug!(%op, in_flight = ?self.in_flight, "ignoring stale completion");
                    return Effect::None;
                }
                self.in_flight = None;
                match status {
                    Ok(value) => self.advance(op, value),
                    Err(status) => self.fail(UpdateError::TransportFailure {
                        characteristic,
                        op: kind,
                        reason: status.to_string(),
                    }),
                }
            }
        }
    }

    fn advance(&mut self, op: Operation, value: Vec<u8>) -> Effect {
        use UpdateCharacteristic as C;
        match (&self.state, op.characteristic, op.kind) {
            (SessionState::SizeProposed, C::TotalSize, OpKind::Write) => self.read(C::TotalSize),
            (SessionState::SizeProposed, C::TotalSize, OpKind::Read) => self.on_size_read_back(&value),
            (SessionState::Streaming, C::Data, OpKind::Write) => self.on_block_written(),
            (SessionState::ChecksumSent, C::Checksum, OpKind::Write) => {
                self.transition(SessionState::AwaitingResult);
                self.read(C::Result)
            }
            (SessionState::AwaitingResult, C::Result, OpKind::Read) => self.on_result(&value),
            (state, _, _) => {
                warn!(%op, %state, "completion does not fit the current state");
                Effect::None
            }
        }
    }

    fn on_size_read_back(&mut self, value: &[u8]) -> Effect {
        let Some(answered) = protocol::decode_u32(value) else {
            return self.fail(UpdateError::MalformedValue {
                characteristic: UpdateCharacteristic::TotalSize,
                len: value.len(),
            });
        };
        if answered == 0 || answered != self.image_len {
            info!(proposed = self.image_len, answered, "device declined image size");
            self.transition(SessionState::Rejected);
            return Effect::Finished(Outcome::Rejected {
                proposed: self.image_len,
                answered,
            });
        }
        self.negotiated_size = Some(answered);
        self.transition(SessionState::SizeAccepted);
        self.transition(SessionState::Streaming);
        self.send_next_block()
    }

    fn send_next_block(&mut self) -> Effect {
        match self.blocks.next_block() {
            Some(block) => {
                trace!(index = block.index, offset = block.offset, len = block.len(), "sending block");
                self.hasher.update(&block.data);
                // blocks never exceed MAX_BLOCK_SIZE, the cast is lossless
                self.in_flight_block = block.len() as u32;
                self.write(UpdateCharacteristic::Data, block.data)
            }
            None => self.send_checksum(),
        }
    }

    fn on_block_written(&mut self) -> Effect {
        self.bytes_sent += self.in_flight_block;
        self.in_flight_block = 0;
        if self.bytes_sent == self.image_len {
            self.send_checksum()
        } else {
            self.send_next_block()
        }
    }

    fn send_checksum(&mut self) -> Effect {
        self.running_checksum = self.hasher.clone().finalize();
        info!(bytes_sent = self.bytes_sent, checksum = format_args!("{:#010x}", self.running_checksum), "image sent");
        self.transition(SessionState::ChecksumSent);
        self.write(UpdateCharacteristic::Checksum, protocol::encode_u32(self.running_checksum))
    }

    fn on_result(&mut self, value: &[u8]) -> Effect {
        let Some(code) = protocol::decode_result(value) else {
            return self.fail(UpdateError::MalformedValue {
                characteristic: UpdateCharacteristic::Result,
                len: value.len(),
            });
        };
        match DeviceResult::try_from(code) {
            Ok(DeviceResult::Success) => {
                info!(bytes_sent = self.bytes_sent, "device accepted the image");
                self.transition(SessionState::Completed);
                Effect::Finished(Outcome::Completed {
                    bytes_sent: self.bytes_sent,
                    checksum: self.running_checksum,
                })
            }
            Ok(DeviceResult::ChecksumMismatch) => self.fail(UpdateError::ChecksumMismatch),
            Err(_) => self.fail(UpdateError::DeviceReportedFailure(code)),
        }
    }

    fn fail(&mut self, err: UpdateError) -> Effect {
        warn!(state = %self.state, error = %err, "update failed");
        self.in_flight = None;
        self.transition(SessionState::Failed(err.clone()));
        Effect::Finished(Outcome::Failed(err))
    }

    fn write(&mut self, characteristic: UpdateCharacteristic, value: Vec<u8>) -> Effect {
        self.issue(Effect::Write { characteristic, value })
    }

    fn read(&mut self, characteristic: UpdateCharacteristic) -> Effect {
        self.issue(Effect::Read { characteristic })
    }

    fn issue(&mut self, effect: Effect) -> Effect {
        debug_assert!(self.in_flight.is_none(), "operation issued while {:?} is outstanding", self.in_flight);
        self.in_flight = effect.operation();
        effect
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(next.rank() >= self.state.rank(), "{} -> {} goes backwards", self.state, next);
        debug!(from = %self.state, to = %next, "session transition");
        self.state = next;
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn target(&self) -> &UpdateTarget {
        &self.target
    }

    pub fn image_len(&self) -> u32 {
        self.image_len
    }

    pub fn negotiated_size(&self) -> Option<u32> {
        self.negotiated_size
    }

    pub fn bytes_sent(&self) -> u32 {
        self.bytes_sent
    }

    /// CRC32 of the whole image, known once streaming has finished
    pub fn running_checksum(&self) -> u32 {
        self.running_checksum
    }

    pub fn in_flight(&self) -> Option<Operation> {
        self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::update_uuids;
    use crate::transport::DiscoveredService;
    use UpdateCharacteristic::*;

    fn target() -> UpdateTarget {
        UpdateTarget::resolve(&[DiscoveredService {
            uuid: update_uuids::SERVICE,
            characteristics: UpdateCharacteristic::ALL.iter().map(|c| c.uuid()).collect(),
        }])
        .unwrap()
    }

    fn image(len: usize) -> Arc<[u8]> {
        (0..len).map(|i| (i * 7) as u8).collect::<Vec<u8>>().into()
    }

    fn session(len: usize) -> UpdateSession {
        UpdateSession::new(target(), image(len), NonZeroUsize::new(512).unwrap()).unwrap()
    }

    /// Starts a session and gets it past size negotiation
    fn streaming(len: usize) -> (UpdateSession, Effect) {
        let mut s = session(len);
        s.begin_update();
        assert_eq!(s.handle(Event::write_ok(TotalSize)), Effect::Read { characteristic: TotalSize });
        let effect = s.handle(Event::read_ok(TotalSize, protocol::encode_u32(len as u32)));
        (s, effect)
    }

    #[test]
    fn rejects_empty_image() {
        let err = UpdateSession::new(target(), image(0), NonZeroUsize::new(512).unwrap()).unwrap_err();
        assert_eq!(err, UpdateError::EmptyImage);
    }

    #[test]
    fn begin_proposes_size_once() {
        let mut s = session(1000);
        assert_eq!(
            s.begin_update(),
            Effect::Write {
                characteristic: TotalSize,
                value: vec![0xE8, 0x03, 0, 0]
            }
        );
        assert_eq!(s.state(), &SessionState::SizeProposed);
        assert_eq!(s.begin_update(), Effect::None);
        assert_eq!(s.in_flight(), Some(Operation::new(TotalSize, OpKind::Write)));
    }

    #[test]
    fn full_update_of_two_blocks() {
        let img = image(1000);
        let (mut s, effect) = streaming(1000);
        assert_eq!(s.negotiated_size(), Some(1000));
        assert_eq!(
            effect,
            Effect::Write {
                characteristic: Data,
                value: img[..512].to_vec()
            }
        );
        assert_eq!(s.state(), &SessionState::Streaming);

        let effect = s.handle(Event::write_ok(Data));
        assert_eq!(
            effect,
            Effect::Write {
                characteristic: Data,
                value: img[512..].to_vec()
            }
        );
        assert_eq!(s.bytes_sent(), 512);

        let crc = protocol::crc32(&img);
        assert_eq!(
            s.handle(Event::write_ok(Data)),
            Effect::Write {
                characteristic: Checksum,
                value: crc.to_le_bytes().to_vec()
            }
        );
        assert_eq!(s.state(), &SessionState::ChecksumSent);
        assert_eq!(s.bytes_sent(), 1000);

        assert_eq!(s.handle(Event::write_ok(Checksum)), Effect::Read { characteristic: Result });
        assert_eq!(s.state(), &SessionState::AwaitingResult);

        assert_eq!(
            s.handle(Event::read_ok(Result, vec![0])),
            Effect::Finished(Outcome::Completed {
                bytes_sent: 1000,
                checksum: crc
            })
        );
        assert_eq!(s.state(), &SessionState::Completed);
        assert_eq!(s.in_flight(), None);
    }

    #[test]
    fn zero_read_back_rejects_without_further_writes() {
        let mut s = session(1000);
        s.begin_update();
        s.handle(Event::write_ok(TotalSize));
        assert_eq!(
            s.handle(Event::read_ok(TotalSize, vec![0, 0, 0, 0])),
            Effect::Finished(Outcome::Rejected {
                proposed: 1000,
                answered: 0
            })
        );
        assert_eq!(s.state(), &SessionState::Rejected);
        assert_eq!(s.in_flight(), None);
        assert_eq!(s.handle(Event::write_ok(Data)), Effect::None);
        assert_eq!(s.handle(Event::read_ok(TotalSize, protocol::encode_u32(1000))), Effect::None);
    }

    #[test]
    fn mismatched_read_back_rejects() {
        let mut s = session(1000);
        s.begin_update();
        s.handle(Event::write_ok(TotalSize));
        let effect = s.handle(Event::read_ok(TotalSize, protocol::encode_u32(999)));
        assert_eq!(
            effect,
            Effect::Finished(Outcome::Rejected {
                proposed: 1000,
                answered: 999
            })
        );
        assert_eq!(s.negotiated_size(), None);
    }

    #[test]
    fn short_read_back_is_malformed() {
        let mut s = session(1000);
        s.begin_update();
        s.handle(Event::write_ok(TotalSize));
        assert_eq!(
            s.handle(Event::read_ok(TotalSize, vec![1])),
            Effect::Finished(Outcome::Failed(UpdateError::MalformedValue {
                characteristic: TotalSize,
                len: 1
            }))
        );
    }

    #[test]
    fn stale_completions_are_ignored() {
        let (mut s, _) = streaming(1000);
        let before = s.state().clone();
        assert_eq!(s.handle(Event::write_ok(TotalSize)), Effect::None);
        assert_eq!(s.handle(Event::read_ok(TotalSize, vec![0, 0, 0, 0])), Effect::None);
        assert_eq!(s.handle(Event::write_ok(Checksum)), Effect::None);
        assert_eq!(s.handle(Event::read_ok(Data, vec![])), Effect::None);
        assert_eq!(
            s.handle(Event::Notification {
                characteristic: Result,
                value: vec![0]
            }),
            Effect::None
        );
        assert_eq!(s.state(), &before);
        assert_eq!(s.bytes_sent(), 0);
        assert_eq!(s.in_flight(), Some(Operation::new(Data, OpKind::Write)));
    }

    #[test]
    fn disconnect_fails_once() {
        let (mut s, _) = streaming(1000);
        assert_eq!(
            s.handle(Event::Disconnected),
            Effect::Finished(Outcome::Failed(UpdateError::UnexpectedDisconnect))
        );
        assert_eq!(s.state(), &SessionState::Failed(UpdateError::UnexpectedDisconnect));
        assert_eq!(s.handle(Event::Disconnected), Effect::None);
        assert_eq!(s.handle(Event::write_ok(Data)), Effect::None);
    }

    #[test]
    fn transport_error_fails_the_session() {
        let (mut s, _) = streaming(1000);
        let effect = s.handle(Event::OpCompleted {
            characteristic: Data,
            kind: OpKind::Write,
            status: Err(GattStatus::TimedOut),
        });
        assert_eq!(
            effect,
            Effect::Finished(Outcome::Failed(UpdateError::TransportFailure {
                characteristic: Data,
                op: OpKind::Write,
                reason: "timed out".into()
            }))
        );
    }

    fn awaiting_result() -> UpdateSession {
        let (mut s, _) = streaming(100);
        s.handle(Event::write_ok(Data));
        s.handle(Event::write_ok(Checksum));
        assert_eq!(s.state(), &SessionState::AwaitingResult);
        s
    }

    #[test]
    fn result_codes_map_to_outcomes() {
        let mut s = awaiting_result();
        assert_eq!(
            s.handle(Event::read_ok(Result, vec![0xE0])),
            Effect::Finished(Outcome::Failed(UpdateError::ChecksumMismatch))
        );

        let mut s = awaiting_result();
        assert_eq!(
            s.handle(Event::read_ok(Result, 7u32.to_le_bytes().to_vec())),
            Effect::Finished(Outcome::Failed(UpdateError::DeviceReportedFailure(7)))
        );

        let mut s = awaiting_result();
        assert!(matches!(
            s.handle(Event::read_ok(Result, vec![])),
            Effect::Finished(Outcome::Failed(UpdateError::MalformedValue { .. }))
        ));
    }

    #[test]
    fn result_notification_replaces_the_read() {
        let mut s = awaiting_result();
        let effect = s.handle(Event::Notification {
            characteristic: Result,
            value: vec![0, 0, 0, 0],
        });
        assert!(matches!(effect, Effect::Finished(Outcome::Completed { bytes_sent: 100, .. })));
        // the read issued earlier may still complete; it must not matter
        assert_eq!(s.handle(Event::read_ok(Result, vec![1])), Effect::None);
        assert_eq!(s.state(), &SessionState::Completed);
    }

    #[test]
    fn rank_is_monotonic_along_the_happy_path() {
        let path = [
            SessionState::Idle,
            SessionState::SizeProposed,
            SessionState::SizeAccepted,
            SessionState::Streaming,
            SessionState::ChecksumSent,
            SessionState::AwaitingResult,
            SessionState::Completed,
        ];
        assert!(path.windows(2).all(|w| w[0].rank() < w[1].rank()));
        assert!(SessionState::Failed(UpdateError::UnexpectedDisconnect).is_terminal());
        assert!(!SessionState::Streaming.is_terminal());
    }
}
