use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shared::types::{DirectoryRecord, ServiceId};
use thiserror::Error;
use crate::config::RegistryConfig;
use crate::delta::RecordDelta;
use crate::registry::snapshot::SnapshotHandle;
use crate::validation::{validate, Violation};
use crate::verifier::{verify_within, NodeVerifier, Verdict};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid record: {}", describe(.0))]
    Validation(Vec<Violation>),
    #[error("service id {0} is already registered with a different key")]
    DuplicateServiceId(ServiceId),
    #[error("public key or signature does not match the registration of {0}")]
    InvalidSignature(ServiceId),
    #[error("service id {0} is not registered, register before checking in")]
    UnregisteredServiceId(ServiceId),
    #[error("service {0} did not pass node verification")]
    VerificationRejected(ServiceId),
    #[error("node verification of service {0} timed out")]
    VerificationTimeout(ServiceId),
}

impl RegistryError {
    /// Stable status code reported per record
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::DuplicateServiceId(_) => "duplicate_service_id",
            Self::InvalidSignature(_) => "invalid_signature",
            Self::UnregisteredServiceId(_) => "unregistered_service_id",
            Self::VerificationRejected(_) => "verification_rejected",
            Self::VerificationTimeout(_) => "verification_timeout",
        }
    }
}

fn describe(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Newest first; the id only separates records created in the same millisecond.
type OrderKey = (Reverse<DateTime<Utc>>, ServiceId);

fn order_key(record: &DirectoryRecord) -> OrderKey {
    (Reverse(record.created_time), record.service_id)
}

/// The authoritative set of live records.
///
/// Two independent locks guard the identity map and the creation-time index. Wherever
/// both are needed they are taken identities first, then order. Neither is held while
/// a node verifier runs.
pub struct Registry {
    config: RegistryConfig,
    identities: Mutex<HashMap<ServiceId, DirectoryRecord>>,
    order: Mutex<BTreeSet<OrderKey>>,
    verifier: Arc<dyn NodeVerifier>,
    replication: Option<flume::Sender<RecordDelta>>,
    snapshots: Option<SnapshotHandle>,
    /// Held from reading the records until the writer has saved them
    persisting: tokio::sync::Mutex<()>,
}

impl Registry {
    pub fn new(config: RegistryConfig, verifier: Arc<dyn NodeVerifier>) -> Self {
        Self {
            config,
            identities: Mutex::new(HashMap::new()),
            order: Mutex::new(BTreeSet::new()),
            verifier,
            replication: None,
            snapshots: None,
            persisting: tokio::sync::Mutex::new(()),
        }
    }

    /// Emit accepted local mutations on `tx` for partner replication
    pub fn with_replication(mut self, tx: flume::Sender<RecordDelta>) -> Self {
        self.replication = Some(tx);
        self
    }

    /// Persist snapshots through `handle`
    pub fn with_snapshots(mut self, handle: SnapshotHandle) -> Self {
        self.snapshots = Some(handle);
        self
    }

    /// Register a fully signed record, replacing an earlier registration with the same key.
    pub async fn register(&self, record: DirectoryRecord) -> Result<(), RegistryError> {
        self.admit(record, true).await
    }

    async fn admit(&self, record: DirectoryRecord, replicate: bool) -> Result<(), RegistryError> {
        let service_id = record.service_id;
        let violations = validate(&record, true);
        if violations == [Violation::SignatureMismatch] {
            return Err(RegistryError::InvalidSignature(service_id));
        }
        if !violations.is_empty() {
            return Err(RegistryError::Validation(violations));
        }

        {
            let mut identities = self.identities.lock();
            if let Some(existing) = identities.get(&service_id) {
                if existing.public_key != record.public_key {
                    return Err(RegistryError::DuplicateServiceId(service_id));
                }
                let mut order = self.order.lock();
                remove_locked(&mut identities, &mut order, service_id);
                tracing::debug!("Re-registration of service {}", service_id);
            }
        }

        // A replacement that fails verification stays removed.
        match verify_within(&self.verifier, &record, self.config.verify_timeout()).await {
            Verdict::Accepted => {}
            Verdict::Rejected => return Err(RegistryError::VerificationRejected(service_id)),
            Verdict::TimedOut => return Err(RegistryError::VerificationTimeout(service_id)),
        }

        {
            let mut identities = self.identities.lock();
            if let Some(existing) = identities.get(&service_id) {
                if existing.public_key != record.public_key {
                    return Err(RegistryError::DuplicateServiceId(service_id));
                }
            }
            let mut order = self.order.lock();
            insert_locked(&mut identities, &mut order, record.clone());
        }

        tracing::info!(
            "Registered {} {} ({})",
            record.kind_name(),
            service_id,
            record.nickname
        );

        if replicate {
            self.replicate(RecordDelta::NewRegistration(record));
        }
        Ok(())
    }

    /// Refresh the keep-alive of an existing registration.
    ///
    /// The presented public key and signature must match the stored record exactly.
    pub fn check_in(&self, record: &DirectoryRecord) -> Result<DateTime<Utc>, RegistryError> {
        let violations = validate(record, false);
        if !violations.is_empty() {
            return Err(RegistryError::Validation(violations));
        }
        let service_id = record.service_id;

        let (last_checkin_time, delta) = {
            let mut identities = self.identities.lock();
            let existing = identities
                .get_mut(&service_id)
                .ok_or(RegistryError::UnregisteredServiceId(service_id))?;

            if existing.signature != record.signature || existing.public_key != record.public_key {
                return Err(RegistryError::InvalidSignature(service_id));
            }
            (existing.check_in(), RecordDelta::check_in(existing))
        };

        self.replicate(delta);
        Ok(last_checkin_time)
    }

    /// Apply a delta received from a partner.
    ///
    /// Skips verification and is never re-replicated. Check-ins apply in arrival order,
    /// clamped so a record's check-in never precedes its creation. Returns whether
    /// anything changed.
    pub fn merge(&self, delta: RecordDelta) -> bool {
        match delta {
            RecordDelta::NewRegistration(mut record) => {
                let service_id = record.service_id;
                record.last_checkin_time = record.last_checkin_time.max(record.created_time);
                let mut identities = self.identities.lock();
                let mut order = self.order.lock();
                insert_locked(&mut identities, &mut order, record);
                tracing::debug!("Merged registration of service {}", service_id);
                true
            }
            RecordDelta::CheckIn {
                service_id,
                last_checkin_time,
            } => {
                let mut identities = self.identities.lock();
                match identities.get_mut(&service_id) {
                    Some(existing) => {
                        existing.last_checkin_time = last_checkin_time.max(existing.created_time);
                        true
                    }
                    None => {
                        tracing::debug!("Ignoring check-in for unknown service {}", service_id);
                        false
                    }
                }
            }
        }
    }

    /// Records created after `since`, newest first.
    ///
    /// Only the matching index keys are copied under the order lock. Entries removed or
    /// replaced before they are resolved are skipped.
    pub fn snapshot(&self, since: DateTime<Utc>) -> Vec<DirectoryRecord> {
        let keys: Vec<OrderKey> = self
            .order
            .lock()
            .iter()
            .take_while(|(Reverse(created), _)| *created > since)
            .copied()
            .collect();

        let identities = self.identities.lock();
        keys.iter()
            .filter_map(|key| {
                identities
                    .get(&key.1)
                    .filter(|record| order_key(record) == *key)
                    .cloned()
            })
            .collect()
    }

    /// Every registered record, newest first
    pub fn all(&self) -> Vec<DirectoryRecord> {
        self.snapshot(DateTime::<Utc>::MIN_UTC)
    }

    pub fn get(&self, service_id: ServiceId) -> Option<DirectoryRecord> {
        self.identities.lock().get(&service_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.identities.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove records whose last check-in is older than max age plus grace period.
    pub fn evict_at(&self, now: DateTime<Utc>) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(self.config.max_age() + self.config.grace_period())
        else {
            return 0;
        };
        let Some(cutoff) = now.checked_sub_signed(ttl) else {
            return 0;
        };

        let mut identities = self.identities.lock();
        let mut order = self.order.lock();
        let expired: Vec<ServiceId> = identities
            .values()
            .filter(|record| record.last_checkin_time < cutoff)
            .map(|record| record.service_id)
            .collect();

        for service_id in &expired {
            remove_locked(&mut identities, &mut order, *service_id);
        }
        expired.len()
    }

    /// Evict against the wall clock and persist the result
    pub async fn evict(&self) -> Result<usize> {
        let removed = self.evict_at(Utc::now());
        if removed > 0 {
            tracing::info!("Evicted {} expired records", removed);
        }
        self.persist().await?;
        Ok(removed)
    }

    /// Drop every record
    pub async fn clear(&self) -> Result<()> {
        {
            let mut identities = self.identities.lock();
            let mut order = self.order.lock();
            identities.clear();
            order.clear();
        }
        tracing::info!("Cleared all records");
        self.persist().await
    }

    /// Register a batch through the normal path, then persist once.
    pub async fn import(
        &self,
        records: Vec<DirectoryRecord>,
    ) -> Vec<(ServiceId, Result<(), RegistryError>)> {
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let service_id = record.service_id;
            results.push((service_id, self.admit(record, true).await));
        }
        if let Err(e) = self.persist().await {
            tracing::error!("Failed to persist snapshot after import: {}", e);
        }
        results
    }

    /// Re-admit persisted records at startup without replicating them.
    pub async fn restore(&self, records: Vec<DirectoryRecord>) -> usize {
        let mut restored = 0;
        for record in records {
            let service_id = record.service_id;
            match self.admit(record, false).await {
                Ok(()) => restored += 1,
                Err(e) => tracing::warn!("Dropped persisted record {}: {}", service_id, e),
            }
        }
        restored
    }

    /// Write the full record set to the snapshot file, if one is configured.
    pub async fn persist(&self) -> Result<()> {
        let Some(handle) = &self.snapshots else {
            return Ok(());
        };
        let _guard = self.persisting.lock().await;
        handle.save(self.all()).await
    }

    fn replicate(&self, delta: RecordDelta) {
        if let Some(tx) = &self.replication {
            if tx.send(delta).is_err() {
                tracing::warn!("Replication queue closed, dropping delta");
            }
        }
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let identities = self.identities.lock();
        let order = self.order.lock();
        assert_eq!(identities.len(), order.len());
        for record in identities.values() {
            assert!(order.contains(&order_key(record)));
        }
    }
}

fn remove_locked(
    identities: &mut HashMap<ServiceId, DirectoryRecord>,
    order: &mut BTreeSet<OrderKey>,
    service_id: ServiceId,
) -> Option<DirectoryRecord> {
    let old = identities.remove(&service_id)?;
    order.remove(&order_key(&old));
    Some(old)
}

fn insert_locked(
    identities: &mut HashMap<ServiceId, DirectoryRecord>,
    order: &mut BTreeSet<OrderKey>,
    record: DirectoryRecord,
) {
    let key = order_key(&record);
    if let Some(old) = identities.insert(record.service_id, record) {
        order.remove(&order_key(&old));
    }
    order.insert(key);
}
