//! Compact binary form of a single replicated mutation.
//!
//! ```text
//! CHECKIN: 0x01 | service_id u64 BE | last_checkin_time i64 BE (unix millis)
//! NEWREG:  0x02 | record
//!
//! record:  variant u8 (0x01 proxy, 0x02 service)
//!          | service_id u64 | created i64 | last_checkin i64
//!          | public_key str | nickname str | signature bytes
//!          [ | bandwidth i32 | exit_policy str | version str ]   proxy only
//! str / bytes: u32 BE length followed by the raw bytes
//! ```
//!
//! Decoding is strict: an unknown tag, a short buffer or leftover bytes are all errors,
//! so every accepted buffer re-encodes to itself.

use chrono::{DateTime, Utc};
use shared::protocol::{DELTA_CHECKIN, DELTA_NEWREG};
use shared::types::{DirectoryRecord, RecordKind, ServiceId};
use thiserror::Error;

const VARIANT_PROXY: u8 = 0x01;
const VARIANT_SERVICE: u8 = 0x02;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty delta")]
    Empty,
    #[error("unknown delta tag {0:#04x}")]
    UnknownTag(u8),
    #[error("unknown record variant {0:#04x}")]
    UnknownVariant(u8),
    #[error("truncated delta: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("{0} trailing bytes after delta")]
    TrailingBytes(usize),
    #[error("text field is not valid UTF-8")]
    InvalidUtf8,
    #[error("timestamp {0} is out of range")]
    Timestamp(i64),
}

/// A replication event: a freshness update or a full registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordDelta {
    CheckIn {
        service_id: ServiceId,
        last_checkin_time: DateTime<Utc>,
    },
    NewRegistration(DirectoryRecord),
}

impl RecordDelta {
    pub fn check_in(record: &DirectoryRecord) -> Self {
        Self::CheckIn {
            service_id: record.service_id,
            last_checkin_time: record.last_checkin_time,
        }
    }

    pub fn service_id(&self) -> ServiceId {
        match self {
            Self::CheckIn { service_id, .. } => *service_id,
            Self::NewRegistration(record) => record.service_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::CheckIn {
                service_id,
                last_checkin_time,
            } => {
                out.reserve_exact(17);
                out.push(DELTA_CHECKIN);
                out.extend_from_slice(&service_id.to_be_bytes());
                out.extend_from_slice(&last_checkin_time.timestamp_millis().to_be_bytes());
            }
            Self::NewRegistration(record) => {
                out.push(DELTA_NEWREG);
                write_record(&mut out, record);
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (&tag, body) = bytes.split_first().ok_or(DecodeError::Empty)?;
        let mut reader = Reader { buf: body };

        let delta = match tag {
            DELTA_CHECKIN => Self::CheckIn {
                service_id: reader.u64()?,
                last_checkin_time: reader.timestamp()?,
            },
            DELTA_NEWREG => Self::NewRegistration(read_record(&mut reader)?),
            other => return Err(DecodeError::UnknownTag(other)),
        };

        reader.finish()?;
        Ok(delta)
    }
}

fn write_record(out: &mut Vec<u8>, record: &DirectoryRecord) {
    let variant = match record.kind {
        RecordKind::Proxy { .. } => VARIANT_PROXY,
        RecordKind::Service => VARIANT_SERVICE,
    };
    out.push(variant);
    out.extend_from_slice(&record.service_id.to_be_bytes());
    out.extend_from_slice(&record.created_time.timestamp_millis().to_be_bytes());
    out.extend_from_slice(&record.last_checkin_time.timestamp_millis().to_be_bytes());
    write_bytes(out, record.public_key.as_bytes());
    write_bytes(out, record.nickname.as_bytes());
    write_bytes(out, &record.signature);

    if let RecordKind::Proxy {
        bandwidth,
        exit_policy,
        version,
    } = &record.kind
    {
        out.extend_from_slice(&bandwidth.to_be_bytes());
        write_bytes(out, exit_policy.as_bytes());
        write_bytes(out, version.as_bytes());
    }
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn read_record(reader: &mut Reader<'_>) -> Result<DirectoryRecord, DecodeError> {
    let variant = reader.u8()?;
    if variant != VARIANT_PROXY && variant != VARIANT_SERVICE {
        return Err(DecodeError::UnknownVariant(variant));
    }

    let service_id = reader.u64()?;
    let created_time = reader.timestamp()?;
    let last_checkin_time = reader.timestamp()?;
    let public_key = reader.string()?;
    let nickname = reader.string()?;
    let signature = reader.bytes()?.to_vec();

    let kind = if variant == VARIANT_PROXY {
        RecordKind::Proxy {
            bandwidth: i32::from_be_bytes(reader.array()?),
            exit_policy: reader.string()?,
            version: reader.string()?,
        }
    } else {
        RecordKind::Service
    };

    Ok(DirectoryRecord {
        service_id,
        public_key,
        nickname,
        signature,
        created_time,
        last_checkin_time,
        kind,
    })
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::Truncated {
                needed: n,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn timestamp(&mut self) -> Result<DateTime<Utc>, DecodeError> {
        let millis = i64::from_be_bytes(self.array()?);
        DateTime::<Utc>::from_timestamp_millis(millis).ok_or(DecodeError::Timestamp(millis))
    }

    fn bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = u32::from_be_bytes(self.array()?) as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    fn finish(self) -> Result<(), DecodeError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes(self.buf.len()))
        }
    }
}
