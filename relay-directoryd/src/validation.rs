use chrono::{DateTime, Utc};
use shared::types::{DirectoryRecord, RecordKind};
use thiserror::Error;
use crate::crypto::{self, KeyError, KeyString, SIGNATURE_LENGTH};

pub const MIN_NICKNAME_LENGTH: usize = 3;

/// One reason a record was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("broken timestamp: created at {created}, last check-in {last_checkin}")]
    BrokenTimestamp {
        created: DateTime<Utc>,
        last_checkin: DateTime<Utc>,
    },
    #[error("invalid service id")]
    ZeroServiceId,
    #[error("invalid RSA public key: {0}")]
    PublicKey(KeyError),
    #[error("invalid nickname, must be 3 or more characters")]
    Nickname,
    #[error("invalid advertised bandwidth")]
    Bandwidth,
    #[error("invalid exit policy")]
    ExitPolicy,
    #[error("invalid version string")]
    Version,
    #[error("invalid signature length {0}, must be 128 bytes")]
    SignatureLength(usize),
    #[error("signature verification failed")]
    SignatureMismatch,
}

/// Check a record against the registration rules.
///
/// The reduced rule set (`full_check == false`) is used for check-ins, which only
/// need a well-formed identity. Full checks add nickname, variant fields and the
/// cryptographic signature. Signature verification only runs once every other rule
/// has passed.
pub fn validate(record: &DirectoryRecord, full_check: bool) -> Vec<Violation> {
    let mut violations = Vec::new();

    if record.last_checkin_time < record.created_time {
        violations.push(Violation::BrokenTimestamp {
            created: record.created_time,
            last_checkin: record.last_checkin_time,
        });
    }
    if record.service_id == 0 {
        violations.push(Violation::ZeroServiceId);
    }
    let key = KeyString::parse(&record.public_key);
    if let Err(e) = &key {
        violations.push(Violation::PublicKey(e.clone()));
    }

    if !full_check {
        return violations;
    }

    if record.nickname.chars().count() < MIN_NICKNAME_LENGTH {
        violations.push(Violation::Nickname);
    }
    match &record.kind {
        RecordKind::Proxy {
            bandwidth,
            exit_policy,
            version,
        } => {
            if *bandwidth == 0 {
                violations.push(Violation::Bandwidth);
            }
            if exit_policy.is_empty() {
                violations.push(Violation::ExitPolicy);
            }
            if version.is_empty() {
                violations.push(Violation::Version);
            }
        }
        RecordKind::Service => {}
    }
    if record.signature.len() != SIGNATURE_LENGTH {
        violations.push(Violation::SignatureLength(record.signature.len()));
    }

    if violations.is_empty() {
        if let Ok(key) = key {
            match key.rsa_key() {
                Ok(public) => {
                    if !crypto::verify(&public, &record.hash_base(), &record.signature) {
                        violations.push(Violation::SignatureMismatch);
                    }
                }
                Err(e) => violations.push(Violation::PublicKey(e)),
            }
        }
    }

    violations
}
