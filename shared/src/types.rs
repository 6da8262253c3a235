use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Externally supplied node identifier. Zero is never a valid id.
pub type ServiceId = u64;

/// Current wall-clock time at the millisecond resolution every wire format carries.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Variant-specific part of a directory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordKind {
    /// A proxy exit relay
    Proxy {
        bandwidth: i32,
        exit_policy: String,
        version: String,
    },
    /// A lightweight port-forwarding service endpoint
    Service,
}

/// A signed registration describing one node.
/// This is the canonical data model used by the directory daemon, its partners and node software.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub service_id: ServiceId,

    /// `"<algorithm>:<format>:<base64 key bytes>"`, e.g. `"RSA:X.509:MIGfMA0G..."`
    pub public_key: String,

    pub nickname: String,

    /// SHA1withRSA signature over [`DirectoryRecord::hash_base`]
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,

    pub created_time: DateTime<Utc>,

    /// Keep-alive timestamp, never earlier than `created_time`
    pub last_checkin_time: DateTime<Utc>,

    #[serde(flatten)]
    pub kind: RecordKind,
}

impl DirectoryRecord {
    /// Build a record of the given kind stamped with the current time.
    pub fn new(
        service_id: ServiceId,
        public_key: impl Into<String>,
        nickname: impl Into<String>,
        kind: RecordKind,
        signature: Vec<u8>,
    ) -> Self {
        let now = now_millis();
        Self {
            service_id,
            public_key: public_key.into(),
            nickname: nickname.into(),
            signature,
            created_time: now,
            last_checkin_time: now,
            kind,
        }
    }

    /// Short variant name used in listings and status responses.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            RecordKind::Proxy { .. } => "proxy",
            RecordKind::Service => "service",
        }
    }

    /// Canonical bytes covered by the owner's signature.
    ///
    /// Decimal and string fields are concatenated without separators, in declaration
    /// order. Signers and verifiers must agree on this byte-for-byte.
    pub fn hash_base(&self) -> Vec<u8> {
        let base = match &self.kind {
            RecordKind::Proxy {
                bandwidth,
                exit_policy,
                version,
            } => format!(
                "{}{}{}{}{}{}",
                self.service_id, self.public_key, self.nickname, bandwidth, exit_policy, version
            ),
            RecordKind::Service => {
                format!("{}{}{}", self.service_id, self.public_key, self.nickname)
            }
        };
        base.into_bytes()
    }

    /// Advance the keep-alive timestamp to now.
    pub fn check_in(&mut self) -> DateTime<Utc> {
        self.last_checkin_time = now_millis().max(self.created_time);
        self.last_checkin_time
    }
}

/// Root container for record listings and the persisted snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordList {
    pub records: Vec<DirectoryRecord>,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as B64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&B64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        B64.decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
