//! Reading `global/pg_control`.
//!
//! The control file is a fixed 8 KiB file whose leading bytes are a
//! version-dependent struct followed by a CRC32C over everything before
//! the CRC field. `pg_control_version` sits at byte offset 8 in every
//! layout and selects the struct: 1300 covers majors 13 through 16, 1700
//! is 17, 1800 is 18.

use bytes::{Buf, Bytes};
use utils::lsn::Lsn;

use crate::TimeLineID;

/// Fixed on-disk size of the control file.
pub const PG_CONTROL_FILE_SIZE: usize = 8192;

/// Database cluster state, from the `state` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    Startup,
    Shutdowned,
    ShutdownedInRecovery,
    ShuttingDown,
    InCrashRecovery,
    InArchiveRecovery,
    InProduction,
    Unknown(u32),
}

impl From<u32> for DbState {
    fn from(v: u32) -> Self {
        match v {
            0 => DbState::Startup,
            1 => DbState::Shutdowned,
            2 => DbState::ShutdownedInRecovery,
            3 => DbState::ShuttingDown,
            4 => DbState::InCrashRecovery,
            5 => DbState::InArchiveRecovery,
            6 => DbState::InProduction,
            other => DbState::Unknown(other),
        }
    }
}

/// The fields common to all supported layouts, hoisted out of the
/// version-specific structs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFileCommon {
    pub system_identifier: u64,
    pub pg_control_version: u32,
    pub catalog_version_no: u32,
    pub state: DbState,
    pub checkpoint: Lsn,
    /// From the checkpoint copy embedded in the control file.
    pub redo: Lsn,
    pub timeline_id: TimeLineID,
    pub prev_timeline_id: TimeLineID,
    pub next_oid: u32,
}

/// Version-discriminated control file contents. The variant is selected
/// once, when the file is read, from `pg_control_version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFileData {
    /// `pg_control_version` 1300: majors 13 through 16.
    V13(ControlFileCommon),
    /// `pg_control_version` 1700: major 17.
    V17(ControlFileCommon),
    /// `pg_control_version` 1800: major 18.
    V18(ControlFileCommon),
}

#[derive(Debug, thiserror::Error)]
pub enum ControlFileError {
    #[error("control file is {0} bytes, expected {PG_CONTROL_FILE_SIZE}")]
    BadSize(usize),
    #[error("unsupported pg_control version {0}")]
    UnsupportedVersion(u32),
    #[error("control file CRC mismatch")]
    BadCrc,
}

impl ControlFileData {
    pub fn common(&self) -> &ControlFileCommon {
        match self {
            ControlFileData::V13(c) | ControlFileData::V17(c) | ControlFileData::V18(c) => c,
        }
    }

    /// The major versions a layout variant can belong to.
    pub fn major_versions(&self) -> &'static [u32] {
        match self {
            ControlFileData::V13(_) => &[13, 14, 15, 16],
            ControlFileData::V17(_) => &[17],
            ControlFileData::V18(_) => &[18],
        }
    }

    /// Byte length of the version-specific payload; the CRC follows it.
    fn payload_len(pg_control_version: u32) -> Option<usize> {
        match pg_control_version {
            1300 => Some(288),
            1700 => Some(296),
            1800 => Some(304),
            _ => None,
        }
    }

    pub fn decode(buf: &[u8]) -> Result<ControlFileData, ControlFileError> {
        if buf.len() != PG_CONTROL_FILE_SIZE {
            return Err(ControlFileError::BadSize(buf.len()));
        }
        let pg_control_version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let payload_len = Self::payload_len(pg_control_version)
            .ok_or(ControlFileError::UnsupportedVersion(pg_control_version))?;

        let expected_crc = u32::from_le_bytes(buf[payload_len..payload_len + 4].try_into().unwrap());
        if crc32c::crc32c(&buf[..payload_len]) != expected_crc {
            return Err(ControlFileError::BadCrc);
        }

        let mut b = Bytes::copy_from_slice(&buf[..payload_len]);
        let common = ControlFileCommon {
            system_identifier: b.get_u64_le(),
            pg_control_version: b.get_u32_le(),
            catalog_version_no: b.get_u32_le(),
            state: DbState::from(b.get_u32_le()),
            checkpoint: {
                b.advance(4); // padding before the 8-byte checkpoint pointer
                Lsn(b.get_u64_le())
            },
            redo: Lsn(b.get_u64_le()),
            timeline_id: b.get_u32_le(),
            prev_timeline_id: b.get_u32_le(),
            next_oid: b.get_u32_le(),
        };

        Ok(match pg_control_version {
            1300 => ControlFileData::V13(common),
            1700 => ControlFileData::V17(common),
            1800 => ControlFileData::V18(common),
            _ => unreachable!(),
        })
    }

    /// Encode into a full 8 KiB control file image. Bytes past the known
    /// fields within the payload are zero; real control files carry more
    /// state there, none of which the backup manager reads.
    pub fn encode(&self) -> Vec<u8> {
        let c = self.common();
        let payload_len = Self::payload_len(c.pg_control_version).expect("known version");
        let mut out = vec![0u8; PG_CONTROL_FILE_SIZE];
        let mut cursor = 0;
        let mut put = |bytes: &[u8], cursor: &mut usize| {
            out[*cursor..*cursor + bytes.len()].copy_from_slice(bytes);
            *cursor += bytes.len();
        };
        put(&c.system_identifier.to_le_bytes(), &mut cursor);
        put(&c.pg_control_version.to_le_bytes(), &mut cursor);
        put(&c.catalog_version_no.to_le_bytes(), &mut cursor);
        let state: u32 = match c.state {
            DbState::Startup => 0,
            DbState::Shutdowned => 1,
            DbState::ShutdownedInRecovery => 2,
            DbState::ShuttingDown => 3,
            DbState::InCrashRecovery => 4,
            DbState::InArchiveRecovery => 5,
            DbState::InProduction => 6,
            DbState::Unknown(v) => v,
        };
        put(&state.to_le_bytes(), &mut cursor);
        put(&[0u8; 4], &mut cursor);
        put(&c.checkpoint.0.to_le_bytes(), &mut cursor);
        put(&c.redo.0.to_le_bytes(), &mut cursor);
        put(&c.timeline_id.to_le_bytes(), &mut cursor);
        put(&c.prev_timeline_id.to_le_bytes(), &mut cursor);
        put(&c.next_oid.to_le_bytes(), &mut cursor);

        let crc = crc32c::crc32c(&out[..payload_len]);
        out[payload_len..payload_len + 4].copy_from_slice(&crc.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(version: u32) -> ControlFileCommon {
        ControlFileCommon {
            system_identifier: 0x1234_5678_9abc_def0,
            pg_control_version: version,
            catalog_version_no: 202307071,
            state: DbState::InProduction,
            checkpoint: Lsn(0x1_6000_0028),
            redo: Lsn(0x1_6000_0000),
            timeline_id: 3,
            prev_timeline_id: 2,
            next_oid: 24576,
        }
    }

    #[test]
    fn roundtrip_all_versions() {
        for (version, wrap) in [
            (
                1300,
                ControlFileData::V13 as fn(ControlFileCommon) -> ControlFileData,
            ),
            (
                1700,
                ControlFileData::V17 as fn(ControlFileCommon) -> ControlFileData,
            ),
            (
                1800,
                ControlFileData::V18 as fn(ControlFileCommon) -> ControlFileData,
            ),
        ] {
            let data = wrap(sample(version));
            let encoded = data.encode();
            assert_eq!(encoded.len(), PG_CONTROL_FILE_SIZE);
            let decoded = ControlFileData::decode(&encoded).unwrap();
            assert_eq!(decoded, data);
        }
    }

    #[test]
    fn rejects_corruption() {
        let data = ControlFileData::V17(sample(1700));
        let mut encoded = data.encode();
        encoded[40] ^= 1;
        assert!(matches!(
            ControlFileData::decode(&encoded),
            Err(ControlFileError::BadCrc)
        ));

        let mut bad_version = data.encode();
        bad_version[8..12].copy_from_slice(&9999u32.to_le_bytes());
        assert!(matches!(
            ControlFileData::decode(&bad_version),
            Err(ControlFileError::UnsupportedVersion(9999))
        ));

        assert!(matches!(
            ControlFileData::decode(&encoded[..100]),
            Err(ControlFileError::BadSize(100))
        ));
    }
}
