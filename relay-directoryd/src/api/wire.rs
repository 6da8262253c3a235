//! JSON shapes of the node-facing endpoints.
//!
//! Submissions carry every field as a string so a malformed value can be reported
//! against its own record instead of failing the whole batch.

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use serde::{Deserialize, Serialize};
use shared::types::{DirectoryRecord, RecordKind};
use thiserror::Error;
use crate::registry::RegistryError;

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_BAD_REQUEST: &str = "bad_request";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("unparseable service id: {0:?}")]
    ServiceId(String),
    #[error("unknown record kind: {0:?}")]
    Kind(String),
    #[error("missing proxy field: {0}")]
    MissingField(&'static str),
    #[error("unparseable bandwidth: {0:?}")]
    Bandwidth(String),
    #[error("signature is not valid base64")]
    Signature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub kind: String,
    pub service_id: String,
    pub public_key: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub signature: String,
}

impl Submission {
    /// Parse into a record stamped with the current time.
    ///
    /// Registrations must carry every proxy field. Check-ins only identify a record,
    /// so absent proxy fields are left empty.
    pub fn into_record(self, registration: bool) -> Result<DirectoryRecord, SubmissionError> {
        let service_id = self
            .service_id
            .trim()
            .parse()
            .map_err(|_| SubmissionError::ServiceId(self.service_id.clone()))?;
        let signature = B64
            .decode(self.signature.trim())
            .map_err(|_| SubmissionError::Signature)?;

        let kind = match self.kind.as_str() {
            "service" => RecordKind::Service,
            "proxy" => {
                let field = |value: Option<String>, name| match value {
                    Some(value) => Ok(value),
                    None if registration => Err(SubmissionError::MissingField(name)),
                    None => Ok(String::new()),
                };
                let bandwidth = field(self.bandwidth, "bandwidth")?;
                let bandwidth = if bandwidth.is_empty() && !registration {
                    0
                } else {
                    bandwidth
                        .trim()
                        .parse()
                        .map_err(|_| SubmissionError::Bandwidth(bandwidth.clone()))?
                };
                RecordKind::Proxy {
                    bandwidth,
                    exit_policy: field(self.exit_policy, "exit_policy")?,
                    version: field(self.version, "version")?,
                }
            }
            other => return Err(SubmissionError::Kind(other.to_string())),
        };

        Ok(DirectoryRecord::new(
            service_id,
            self.public_key,
            self.nickname,
            kind,
            signature,
        ))
    }
}

impl From<&DirectoryRecord> for Submission {
    fn from(record: &DirectoryRecord) -> Self {
        let (bandwidth, exit_policy, version) = match &record.kind {
            RecordKind::Proxy {
                bandwidth,
                exit_policy,
                version,
            } => (
                Some(bandwidth.to_string()),
                Some(exit_policy.clone()),
                Some(version.clone()),
            ),
            RecordKind::Service => (None, None, None),
        };

        Self {
            kind: record.kind_name().to_string(),
            service_id: record.service_id.to_string(),
            public_key: record.public_key.clone(),
            nickname: record.nickname.clone(),
            bandwidth,
            exit_policy,
            version,
            signature: B64.encode(&record.signature),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchRequest {
    pub records: Vec<Submission>,
}

/// Outcome of one submitted record. `service_id` echoes the submitted text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordStatus {
    pub service_id: String,
    pub status: String,
    pub message: String,
}

impl RecordStatus {
    pub fn success(service_id: String, message: impl Into<String>) -> Self {
        Self {
            service_id,
            status: STATUS_SUCCESS.to_string(),
            message: message.into(),
        }
    }

    pub fn rejected(service_id: String, error: &RegistryError) -> Self {
        Self {
            service_id,
            status: error.code().to_string(),
            message: error.to_string(),
        }
    }

    pub fn bad_request(service_id: String, error: &SubmissionError) -> Self {
        Self {
            service_id,
            status: STATUS_BAD_REQUEST.to_string(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<RecordStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
