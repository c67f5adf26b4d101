use crate::error::UpdateError;
use crate::transport::DiscoveredService;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;
use uuid::Uuid;

/// Recommended number of image bytes per Data write
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Largest block a single ATT write can carry
pub const MAX_BLOCK_SIZE: usize = 512;

/// Result codes reported by the device after the checksum write
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum DeviceResult {
    Success = 0x00,
    ChecksumMismatch = 0xE0,
}

/// The four characteristics of the software update service
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum UpdateCharacteristic {
    TotalSize,
    Data,
    Checksum,
    Result,
}

impl UpdateCharacteristic {
    pub const ALL: [UpdateCharacteristic; 4] = [Self::TotalSize, Self::Data, Self::Checksum, Self::Result];

    pub fn uuid(self) -> Uuid {
        match self {
            Self::TotalSize => update_uuids::TOTAL_SIZE,
            Self::Data => update_uuids::DATA,
            Self::Checksum => update_uuids::CRC32,
            Self::Result => update_uuids::RESULT,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }
}

impl fmt::Display for UpdateCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TotalSize => "TotalSize",
            Self::Data => "Data",
            Self::Checksum => "Checksum",
            Self::Result => "Result",
        };
        f.write_str(name)
    }
}

/// Kind of GATT operation issued on a characteristic
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum OpKind {
    Read,
    Write,
    Subscribe,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Subscribe => "subscribe",
        };
        f.write_str(name)
    }
}

/// A GATT operation awaiting its completion event
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Operation {
    pub characteristic: UpdateCharacteristic,
    pub kind: OpKind,
}

impl Operation {
    pub fn new(characteristic: UpdateCharacteristic, kind: OpKind) -> Self {
        Self { characteristic, kind }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.characteristic, self.kind)
    }
}

/// The update service as found on a connected device.
///
/// Only built once discovery has shown the service together with all four of
/// its characteristics, so later lookups cannot fail.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UpdateTarget {
    service: Uuid,
    characteristics: [Uuid; 4],
}

impl UpdateTarget {
    pub fn resolve(services: &[DiscoveredService]) -> Result<Self, UpdateError> {
        let service = services
            .iter()
            .find(|s| s.uuid == update_uuids::SERVICE)
            .ok_or(UpdateError::ServiceNotFound)?;
        for c in UpdateCharacteristic::ALL {
            if !service.characteristics.contains(&c.uuid()) {
                return Err(UpdateError::MissingCharacteristic(c));
            }
        }
        Ok(Self {
            service: service.uuid,
            characteristics: UpdateCharacteristic::ALL.map(UpdateCharacteristic::uuid),
        })
    }

    pub fn service(&self) -> Uuid {
        self.service
    }

    pub fn uuid(&self, characteristic: UpdateCharacteristic) -> Uuid {
        self.characteristics[characteristic as usize]
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<UpdateCharacteristic> {
        UpdateCharacteristic::ALL.into_iter().find(|&c| self.uuid(c) == uuid)
    }
}

pub fn encode_u32(value: u32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

/// Decode a TotalSize read-back, which must be exactly four bytes
pub fn decode_u32(bytes: &[u8]) -> Option<u32> {
    let raw: [u8; 4] = bytes.try_into().ok()?;
    Some(u32::from_le_bytes(raw))
}

/// Decode a Result value, sent either as a single byte or as a u32
pub fn decode_result(bytes: &[u8]) -> Option<u32> {
    match bytes {
        [code] => Some(u32::from(*code)),
        _ => decode_u32(bytes),
    }
}

pub fn crc32(buf: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(buf);
    h.finalize()
}

/// Software update service & characteristic UUIDs
pub mod update_uuids {
    use uuid::Uuid;
    /// Software Update Service
    pub const SERVICE: Uuid = Uuid::from_u128(0xcb0b9a0b_a84c_4c0d_bdbb_442e3144ee30);
    /// Total image size, u32 LE. Write first, then read back: 0 means not accepted
    pub const TOTAL_SIZE: Uuid = Uuid::from_u128(0xe74dd9c0_a301_4a6f_95a1_f0e1dbea8e1e);
    /// Image data, one write per block
    pub const DATA: Uuid = Uuid::from_u128(0xe272ebac_d463_4b98_bc84_5cc1a39ee517);
    /// CRC32 of the whole image. Writing it completes the transfer
    pub const CRC32: Uuid = Uuid::from_u128(0x4826129c_c22a_43a3_b066_ce8f0d5bacc6);
    /// Result code, readable and notified once the device has checked the image
    pub const RESULT: Uuid = Uuid::from_u128(0x5e134862_7411_4424_ac4a_210937432c77);
}
