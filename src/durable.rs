use std::sync::Arc;

use serde_json::Value;

use crate::config::SyncConfig;
use crate::engine::StoreError;
use crate::model::{HoldKey, Ms, PersistedHoldRecord, StayQuery, now_ms};
use crate::storage::KvStorage;

/// Capped, newest-first list of confirmed holds kept under one storage key.
///
/// Records are never edited or actively deleted: expiry and scoping happen
/// at read time, and the cap drops the oldest entries on append.
pub struct DurableHoldStore {
    storage: Arc<dyn KvStorage>,
    key: String,
    max_records: usize,
    ttl_ms: Ms,
}

impl DurableHoldStore {
    pub fn new(storage: Arc<dyn KvStorage>, config: &SyncConfig) -> Self {
        Self {
            storage,
            key: config.storage_key.clone(),
            max_records: config.max_records,
            ttl_ms: config.hold_ttl_ms,
        }
    }

    /// The stored array as raw entries. Only a value that is not a JSON array is `Corrupt`.
    fn load_entries(&self) -> Result<Vec<Value>, StoreError> {
        match self.storage.get(&self.key)? {
            None => Ok(Vec::new()),
            Some(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Array(entries)) => Ok(entries),
                Ok(_) => Err(StoreError::Corrupt("stored hold list is not an array".into())),
                Err(e) => Err(StoreError::Corrupt(e.to_string())),
            },
        }
    }

    /// Entries that decode as records. Malformed entries are skipped, not removed.
    fn load(&self) -> Result<Vec<PersistedHoldRecord>, StoreError> {
        let entries = self.load_entries()?;
        let total = entries.len();
        let records: Vec<PersistedHoldRecord> = entries
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        if records.len() < total {
            tracing::warn!(
                "skipped {} malformed hold records under {}",
                total - records.len(),
                self.key
            );
        }
        Ok(records)
    }

    /// All decodable records, newest first, regardless of validity.
    pub fn records(&self) -> Result<Vec<PersistedHoldRecord>, StoreError> {
        self.load()
    }

    pub fn record_confirmed_hold(&self, query: &StayQuery, key: &HoldKey) -> Result<(), StoreError> {
        self.record_confirmed_hold_at(query, key, now_ms())
    }

    /// Prepend a record and drop the oldest entries past the cap. Entries that
    /// don't decode are carried along untouched; they age out through the cap.
    pub fn record_confirmed_hold_at(
        &self,
        query: &StayQuery,
        key: &HoldKey,
        now: Ms,
    ) -> Result<(), StoreError> {
        let mut entries = match self.load_entries() {
            Ok(entries) => entries,
            Err(StoreError::Corrupt(e)) => {
                tracing::warn!("discarding corrupt hold list under {}: {e}", self.key);
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        let record = serde_json::to_value(PersistedHoldRecord::new(query, key, now))
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        entries.insert(0, record);
        entries.truncate(self.max_records);

        let raw = serde_json::to_string(&entries).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.storage.set(&self.key, &raw)
    }

    pub fn reconstruct_holds(&self, query: &StayQuery) -> Result<Vec<HoldKey>, StoreError> {
        self.reconstruct_holds_at(query, now_ms())
    }

    /// Keys of records for exactly this unit and date range that have not expired.
    pub fn reconstruct_holds_at(&self, query: &StayQuery, now: Ms) -> Result<Vec<HoldKey>, StoreError> {
        let mut keys: Vec<HoldKey> = Vec::new();
        for record in self.load()? {
            if !record.is_valid_for(query, now, self.ttl_ms) {
                continue;
            }
            if let Some(key) = record.key()
                && !keys.contains(&key)
            {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}
