//! Public-key strings, SHA1withRSA signatures and the directory's signing identity.
//!
//! Node keys travel as `"<algorithm>:<format>:<base64 DER>"`. The directory itself
//! holds one RSA key that every coordination partner shares; it signs responses and
//! replication deltas.

use std::path::Path;
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use shared::protocol::{KEY_ALGORITHM, KEY_FORMAT};
use shared::types::DirectoryRecord;
use thiserror::Error;

/// Length of a DER-encoded 1024-bit RSA SubjectPublicKeyInfo
pub const PUBLIC_KEY_LENGTH: usize = 162;
/// Length of a SHA1withRSA signature made with a 1024-bit key
pub const SIGNATURE_LENGTH: usize = 128;

const AUTHORITY_KEY_BITS: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("key string must have 3 ':'-separated segments, found {0}")]
    Segments(usize),
    #[error("key bytes are not valid base64")]
    Base64,
    #[error("key must be 162 bytes, got {0}")]
    Length(usize),
    #[error("unsupported key algorithm: {0}")]
    Algorithm(String),
    #[error("malformed key encoding: {0}")]
    Encoding(String),
}

/// A decoded `"<algorithm>:<format>:<base64>"` key string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyString {
    pub algorithm: String,
    pub format: String,
    pub der: Vec<u8>,
}

impl KeyString {
    /// Split and decode a key string, checking only its shape and size.
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let parts: Vec<&str> = key.split(':').collect();
        let [algorithm, format, encoded] = parts.as_slice() else {
            return Err(KeyError::Segments(parts.len()));
        };

        let der = B64.decode(encoded.as_bytes()).map_err(|_| KeyError::Base64)?;
        if der.len() != PUBLIC_KEY_LENGTH {
            return Err(KeyError::Length(der.len()));
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            format: format.to_string(),
            der,
        })
    }

    /// Interpret the key bytes as an RSA public key.
    pub fn rsa_key(&self) -> Result<RsaPublicKey, KeyError> {
        if self.algorithm != KEY_ALGORITHM {
            return Err(KeyError::Algorithm(self.algorithm.clone()));
        }
        RsaPublicKey::from_public_key_der(&self.der)
            .map_err(|e| KeyError::Encoding(e.to_string()))
    }
}

/// Render a public key in the key-string form records carry.
pub fn encode_public_key(key: &RsaPublicKey) -> Result<String, KeyError> {
    let der = key
        .to_public_key_der()
        .map_err(|e| KeyError::Encoding(e.to_string()))?;
    Ok(format!("{KEY_ALGORITHM}:{KEY_FORMAT}:{}", B64.encode(der.as_bytes())))
}

pub fn sign(key: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>, rsa::signature::Error> {
    let signing_key = SigningKey::<Sha1>::new(key.clone());
    Ok(signing_key.try_sign(message)?.to_vec())
}

pub fn verify(key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(signature) = Signature::try_from(signature) else {
        return false;
    };
    VerifyingKey::<Sha1>::new(key.clone())
        .verify(message, &signature)
        .is_ok()
}

/// Fill in a record's public key and signature as node software does before registering.
pub fn sign_record(record: &mut DirectoryRecord, key: &RsaPrivateKey) -> Result<(), KeyError> {
    record.public_key = encode_public_key(&key.to_public_key())?;
    record.signature = sign(key, &record.hash_base())
        .map_err(|e| KeyError::Encoding(e.to_string()))?;
    Ok(())
}

/// The signing identity shared by every directory in a coordination group.
pub struct Authority {
    signing: SigningKey<Sha1>,
    verifying: VerifyingKey<Sha1>,
}

impl Authority {
    pub fn new(key: RsaPrivateKey) -> Self {
        let verifying = VerifyingKey::new(key.to_public_key());
        Self {
            signing: SigningKey::new(key),
            verifying,
        }
    }

    /// Load the PKCS#8 PEM key at `path`, generating and saving a new one if absent.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let pem = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read signing key: {}", path.display()))?;
            let key = RsaPrivateKey::from_pkcs8_pem(&pem)
                .with_context(|| format!("Failed to parse signing key: {}", path.display()))?;
            tracing::info!("Loaded signing key from {}", path.display());
            return Ok(Self::new(key));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, AUTHORITY_KEY_BITS)
            .context("Failed to generate signing key")?;
        let pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .context("Failed to encode signing key")?;
        std::fs::write(path, pem.as_bytes())
            .with_context(|| format!("Failed to write signing key: {}", path.display()))?;

        tracing::info!("Generated new signing key at {}", path.display());
        Ok(Self::new(key))
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signature = self
            .signing
            .try_sign(message)
            .context("Failed to sign with directory authority")?;
        Ok(signature.to_vec())
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        self.verifying.verify(message, &signature).is_ok()
    }
}
