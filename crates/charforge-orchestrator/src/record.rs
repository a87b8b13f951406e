//! Generation records and their stores.
//!
//! A [`GenerationRecord`] is created `PENDING` when a request is accepted
//! and moves exactly once to `COMPLETE` or `FAILED`. Stores treat any
//! further status update for a terminal record as a no-op so that
//! at-least-once delivery of updates is safe.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use charforge_prompt::ParameterSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::{ForgeError, Result};

/// Version of the records file format.
pub const RECORDS_VERSION: u32 = 1;

/// Message stored when a failure arrives without one.
const FALLBACK_ERROR_MESSAGE: &str = "generation failed without an error message";

// ============================================================================
// Status
// ============================================================================

/// Lifecycle status of a generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationStatus {
    /// Accepted, provider work in progress.
    #[default]
    Pending,
    /// Image stored and available.
    Complete,
    /// Generation or storage failed.
    Failed,
}

impl GenerationStatus {
    /// Returns `true` for `COMPLETE` and `FAILED`.
    ///
    /// # Examples
    ///
    /// ```
    /// use charforge_orchestrator::GenerationStatus;
    ///
    /// assert!(GenerationStatus::Complete.is_terminal());
    /// assert!(!GenerationStatus::Pending.is_terminal());
    /// ```
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

// ============================================================================
// Record
// ============================================================================

/// One generation request and its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRecord {
    /// Unique image id.
    pub image_id: String,
    /// Owner of the request.
    pub user_id: String,
    /// Normalized parameters the image was requested with.
    pub parameters: ParameterSet,
    /// Hash of `parameters`.
    pub parameters_hash: String,
    /// Current status.
    pub status: GenerationStatus,
    /// When the request was accepted.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
    /// Storage key of the image, once stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    /// Public URL of the image, once stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    /// Provider that produced the image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_used: Option<String>,
    /// Wall time from acceptance to the terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_time_ms: Option<u64>,
    /// Why the generation failed. Never empty on a `FAILED` record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl GenerationRecord {
    /// Creates a `PENDING` record.
    #[must_use]
    pub fn pending(
        image_id: impl Into<String>,
        user_id: impl Into<String>,
        parameters: ParameterSet,
    ) -> Self {
        let parameters = parameters.normalized();
        let parameters_hash = parameters.hash();
        let now = Utc::now();
        Self {
            image_id: image_id.into(),
            user_id: user_id.into(),
            parameters,
            parameters_hash,
            status: GenerationStatus::Pending,
            created_at: now,
            updated_at: now,
            object_key: None,
            public_url: None,
            service_used: None,
            generation_time_ms: None,
            error_message: None,
        }
    }

    /// Applies `update` unless the record is already terminal.
    ///
    /// Returns `true` if the record changed.
    pub fn apply(&mut self, update: RecordUpdate) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        match update {
            RecordUpdate::Complete {
                object_key,
                public_url,
                service_used,
                generation_time_ms,
            } => {
                self.status = GenerationStatus::Complete;
                self.object_key = Some(object_key);
                self.public_url = Some(public_url);
                self.service_used = Some(service_used);
                self.generation_time_ms = Some(generation_time_ms);
            }
            RecordUpdate::Failed {
                error_message,
                service_used,
                generation_time_ms,
            } => {
                let message = if error_message.trim().is_empty() {
                    FALLBACK_ERROR_MESSAGE.to_string()
                } else {
                    error_message
                };
                self.status = GenerationStatus::Failed;
                self.error_message = Some(message);
                self.service_used = service_used;
                self.generation_time_ms = Some(generation_time_ms);
            }
        }
        self.updated_at = Utc::now();
        true
    }
}

/// A terminal status update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordUpdate {
    /// The image was generated and stored.
    Complete {
        /// Storage key.
        object_key: String,
        /// Public URL.
        public_url: String,
        /// Provider that produced the image.
        service_used: String,
        /// Wall time since acceptance.
        generation_time_ms: u64,
    },
    /// The generation failed.
    Failed {
        /// Failure description.
        error_message: String,
        /// Provider that produced an image before a later step failed.
        service_used: Option<String>,
        /// Wall time since acceptance.
        generation_time_ms: u64,
    },
}

impl RecordUpdate {
    /// Target status of this update.
    #[must_use]
    pub const fn status(&self) -> GenerationStatus {
        match self {
            Self::Complete { .. } => GenerationStatus::Complete,
            Self::Failed { .. } => GenerationStatus::Failed,
        }
    }
}

/// Filter for [`RecordStore::list_by_user`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// Only return records in this status.
    pub status: Option<GenerationStatus>,
}

impl RecordFilter {
    fn matches(&self, record: &GenerationRecord) -> bool {
        self.status.map_or(true, |s| record.status == s)
    }
}

/// Offset/limit window over a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// Records to skip.
    pub offset: usize,
    /// Maximum records to return.
    pub limit: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Persistence for generation records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts a new record.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateRecord` if the id exists, or a persistence error.
    async fn insert(&self, record: GenerationRecord) -> Result<()>;

    /// Moves a record to a terminal status.
    ///
    /// Returns `Ok(false)` without changing anything if the record is
    /// already terminal.
    ///
    /// # Errors
    ///
    /// Returns `RecordNotFound` for an unknown id, or a persistence error.
    async fn update_status(&self, image_id: &str, update: RecordUpdate) -> Result<bool>;

    /// Looks up one record.
    async fn get_by_id(&self, image_id: &str) -> Result<Option<GenerationRecord>>;

    /// Lists a user's records, newest first.
    async fn list_by_user(
        &self,
        user_id: &str,
        filter: RecordFilter,
        page: Pagination,
    ) -> Result<Vec<GenerationRecord>>;
}

fn select(
    records: &HashMap<String, GenerationRecord>,
    user_id: &str,
    filter: RecordFilter,
    page: Pagination,
) -> Vec<GenerationRecord> {
    let mut matching: Vec<&GenerationRecord> = records
        .values()
        .filter(|r| r.user_id == user_id && filter.matches(r))
        .collect();
    matching.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.image_id.cmp(&b.image_id))
    });
    matching
        .into_iter()
        .skip(page.offset)
        .take(page.limit)
        .cloned()
        .collect()
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// Record store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<HashMap<String, GenerationRecord>>,
}

impl InMemoryRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert(&self, record: GenerationRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.image_id) {
            return Err(ForgeError::DuplicateRecord {
                image_id: record.image_id,
            });
        }
        records.insert(record.image_id.clone(), record);
        Ok(())
    }

    async fn update_status(&self, image_id: &str, update: RecordUpdate) -> Result<bool> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(image_id)
            .ok_or_else(|| ForgeError::record_not_found(image_id))?;
        Ok(record.apply(update))
    }

    async fn get_by_id(&self, image_id: &str) -> Result<Option<GenerationRecord>> {
        Ok(self.records.lock().await.get(image_id).cloned())
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        filter: RecordFilter,
        page: Pagination,
    ) -> Result<Vec<GenerationRecord>> {
        Ok(select(&*self.records.lock().await, user_id, filter, page))
    }
}

// ============================================================================
// JSON File Store
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct RecordsFile {
    version: u32,
    records: Vec<GenerationRecord>,
}

/// Record store persisted to a single JSON file.
///
/// The whole set is rewritten after every change, via a temporary file
/// and a rename so a crash never leaves a half-written file behind.
#[derive(Debug)]
pub struct JsonFileRecordStore {
    path: PathBuf,
    records: Mutex<HashMap<String, GenerationRecord>>,
}

impl JsonFileRecordStore {
    /// Opens the store at `path`, loading existing records if the file exists.
    ///
    /// # Errors
    ///
    /// Returns `RecordsFileCorrupted` if the file is not a valid records file.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let file: RecordsFile = serde_json::from_str(&content)
                    .map_err(|e| ForgeError::records_corrupted(&path, e.to_string()))?;
                if file.version > RECORDS_VERSION {
                    return Err(ForgeError::records_corrupted(
                        &path,
                        format!(
                            "file version {} is newer than supported version {RECORDS_VERSION}",
                            file.version
                        ),
                    ));
                }
                file.records
                    .into_iter()
                    .map(|r| (r.image_id.clone(), r))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(ForgeError::persistence(&path, e.to_string())),
        };
        info!(path = %path.display(), records = records.len(), "Opened records file");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Location of the records file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, records: &HashMap<String, GenerationRecord>) -> Result<()> {
        let mut sorted: Vec<GenerationRecord> = records.values().cloned().collect();
        sorted.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.image_id.cmp(&b.image_id))
        });
        let file = RecordsFile {
            version: RECORDS_VERSION,
            records: sorted,
        };
        let json = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ForgeError::persistence(&self.path, e.to_string()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| ForgeError::persistence(&tmp, e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ForgeError::persistence(&self.path, e.to_string()))?;
        debug!(path = %self.path.display(), records = file.records.len(), "Persisted records");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonFileRecordStore {
    #[instrument(skip(self, record), fields(image_id = %record.image_id))]
    async fn insert(&self, record: GenerationRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.image_id) {
            return Err(ForgeError::DuplicateRecord {
                image_id: record.image_id,
            });
        }
        let image_id = record.image_id.clone();
        records.insert(image_id.clone(), record);
        if let Err(e) = self.persist(&records).await {
            records.remove(&image_id);
            return Err(e);
        }
        Ok(())
    }

    #[instrument(skip(self, update), fields(status = %update.status()))]
    async fn update_status(&self, image_id: &str, update: RecordUpdate) -> Result<bool> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(image_id)
            .ok_or_else(|| ForgeError::record_not_found(image_id))?;
        let previous = record.clone();
        if !record.apply(update) {
            return Ok(false);
        }
        if let Err(e) = self.persist(&records).await {
            records.insert(image_id.to_string(), previous);
            return Err(e);
        }
        Ok(true)
    }

    async fn get_by_id(&self, image_id: &str) -> Result<Option<GenerationRecord>> {
        Ok(self.records.lock().await.get(image_id).cloned())
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        filter: RecordFilter,
        page: Pagination,
    ) -> Result<Vec<GenerationRecord>> {
        Ok(select(&*self.records.lock().await, user_id, filter, page))
    }
}
