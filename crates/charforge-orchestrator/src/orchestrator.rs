//! The generation orchestrator.
//!
//! [`GenerationOrchestrator::submit`] validates a parameter set, assembles
//! (or reuses) its prompt, creates a `PENDING` record and returns at once.
//! The provider work runs in a detached task:
//!
//! 1. Rank providers through the registry.
//! 2. For each candidate, run the call under its circuit breaker, with the
//!    retry manager inside the breaker.
//! 3. A non-retryable provider error ends the run; the request itself is at
//!    fault and another provider would refuse it too.
//! 4. A provider that exhausts its retries, or whose circuit is open, hands
//!    over to the next candidate.
//! 5. On success the asset is fetched, written to storage and the record is
//!    marked `COMPLETE`. Any failure on that path marks it `FAILED`.
//!
//! The task is not tied to the caller; dropping the submitting future does
//! not stop a generation from reaching a terminal state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use charforge_prompt::{validate, AssembledPrompt, Catalog, ParameterSet, ValidationOutcome};
use charforge_providers::{FsStorage, GenerationOutput, ObjectStorage, StoredObject};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cache::PromptCache;
use crate::config::{CacheConfig, Config};
use crate::error::{ForgeError, Result};
use crate::events::{EventBroadcaster, GenerationEvent};
use crate::record::{
    GenerationRecord, GenerationStatus, JsonFileRecordStore, Pagination, RecordFilter,
    RecordStore, RecordUpdate,
};
use crate::registry::{ProviderRegistry, RankedProvider};
use crate::retry::{RetryAttempt, RetryManager, RetryPolicy};

/// Attempts made to write a terminal record update.
const TERMINAL_WRITE_ATTEMPTS: u32 = 4;

/// Delay before the first terminal write retry; doubles afterwards.
const TERMINAL_WRITE_BASE_DELAY: Duration = Duration::from_millis(25);

// ============================================================================
// Responses
// ============================================================================

/// Acknowledgement of an accepted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    /// Id to poll with.
    pub image_id: String,
    /// Always `PENDING`.
    pub status: GenerationStatus,
    /// Hash of the normalized parameters.
    pub parameters_hash: String,
    /// Rough completion estimate. Display hint only.
    pub estimated_completion: DateTime<Utc>,
}

/// Result of [`GenerationOrchestrator::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum SubmitResponse {
    /// The request was accepted and is being generated.
    Accepted(Accepted),
    /// Validation failed; nothing was recorded.
    Rejected(ValidationOutcome),
}

impl SubmitResponse {
    /// The image id, if the request was accepted.
    #[must_use]
    pub fn image_id(&self) -> Option<&str> {
        match self {
            Self::Accepted(a) => Some(&a.image_id),
            Self::Rejected(_) => None,
        }
    }
}

/// A record as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    /// The stored record.
    #[serde(flatten)]
    pub record: GenerationRecord,
    /// Completion estimate while the record is `PENDING`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
}

// ============================================================================
// Orchestrator
// ============================================================================

struct Inner {
    catalog: Arc<Catalog>,
    cache: PromptCache,
    cache_policy: CacheConfig,
    registry: Arc<ProviderRegistry>,
    retry: RetryManager,
    store: Arc<dyn RecordStore>,
    storage: Arc<dyn ObjectStorage>,
    events: EventBroadcaster,
    operation_timeout: Duration,
    estimated_duration: Duration,
}

/// Runs generations end to end. Cheap to clone.
#[derive(Clone)]
pub struct GenerationOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GenerationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationOrchestrator")
            .field("retry", &self.inner.retry)
            .field("operation_timeout", &self.inner.operation_timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for [`GenerationOrchestrator`].
pub struct OrchestratorBuilder {
    catalog: Arc<Catalog>,
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn RecordStore>,
    storage: Arc<dyn ObjectStorage>,
    retry: RetryPolicy,
    cache_policy: CacheConfig,
    event_capacity: usize,
    operation_timeout: Duration,
    estimated_duration: Duration,
}

impl OrchestratorBuilder {
    /// Sets the per-provider retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Sets the prompt cache eviction policy.
    #[must_use]
    pub fn cache_policy(mut self, policy: CacheConfig) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Sets the event channel capacity.
    #[must_use]
    pub const fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Sets the ceiling on provider selection and generation.
    #[must_use]
    pub const fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Sets the duration used for completion estimates.
    #[must_use]
    pub const fn estimated_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration = duration;
        self
    }

    /// Builds the orchestrator.
    #[must_use]
    pub fn build(self) -> GenerationOrchestrator {
        GenerationOrchestrator {
            inner: Arc::new(Inner {
                catalog: self.catalog,
                cache: PromptCache::new(),
                cache_policy: self.cache_policy,
                registry: self.registry,
                retry: RetryManager::new(self.retry),
                store: self.store,
                storage: self.storage,
                events: EventBroadcaster::new(self.event_capacity),
                operation_timeout: self.operation_timeout,
                estimated_duration: self.estimated_duration,
            }),
        }
    }
}

/// A generated image that made it into storage.
struct Delivered {
    service_used: String,
    object: StoredObject,
}

/// A run that ended without a stored image.
struct RunFailure {
    error: ForgeError,
    service_used: Option<String>,
}

impl From<ForgeError> for RunFailure {
    fn from(error: ForgeError) -> Self {
        Self {
            error,
            service_used: None,
        }
    }
}

impl GenerationOrchestrator {
    /// Starts a builder with default retry, cache and timeout settings.
    #[must_use]
    pub fn builder(
        catalog: Catalog,
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn RecordStore>,
        storage: Arc<dyn ObjectStorage>,
    ) -> OrchestratorBuilder {
        let defaults = Config::default();
        OrchestratorBuilder {
            catalog: Arc::new(catalog),
            registry,
            store,
            storage,
            retry: RetryPolicy::from(&defaults.retry),
            cache_policy: defaults.cache.clone(),
            event_capacity: defaults.event_capacity,
            operation_timeout: defaults.operation_timeout(),
            estimated_duration: defaults.estimated_duration(),
        }
    }

    /// Builds an orchestrator from configuration: catalog, providers, a JSON
    /// records file and filesystem image storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog, the records file or the storage
    /// directory cannot be loaded, or a provider cannot be built.
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let catalog = match &config.catalog {
            Some(path) => Catalog::from_json_file(std::path::Path::new(path))?,
            None => Catalog::builtin(),
        };
        let registry = Arc::new(ProviderRegistry::from_config(config).await?);
        let store = Arc::new(JsonFileRecordStore::open(config.records_path()).await?);
        let storage = Arc::new(
            FsStorage::new(&config.storage.dir, config.storage.public_base_url.clone()).await?,
        );

        Ok(Self::builder(catalog, registry, store, storage)
            .retry_policy(RetryPolicy::from(&config.retry))
            .cache_policy(config.cache.clone())
            .event_capacity(config.event_capacity)
            .operation_timeout(config.operation_timeout())
            .estimated_duration(config.estimated_duration())
            .build())
    }

    /// The catalog requests are validated against.
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    /// The provider registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.inner.registry
    }

    /// The prompt cache.
    #[must_use]
    pub fn cache(&self) -> &PromptCache {
        &self.inner.cache
    }

    /// Subscribes to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.inner.events.subscribe()
    }

    /// Validates `params` without submitting them.
    #[must_use]
    pub fn validate(&self, params: &ParameterSet) -> ValidationOutcome {
        validate(params, &self.inner.catalog)
    }

    /// Accepts a generation request.
    ///
    /// Invalid parameters are rejected with the validation outcome and no
    /// record is created. Otherwise a `PENDING` record is stored and the
    /// generation continues in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if prompt assembly or record creation fails.
    #[instrument(skip(self, params))]
    pub async fn submit(&self, params: ParameterSet, user_id: &str) -> Result<SubmitResponse> {
        let params = params.normalized();
        let outcome = self.validate(&params);
        if !outcome.is_valid {
            info!(summary = %outcome.summary(), "Rejected generation request");
            return Ok(SubmitResponse::Rejected(outcome));
        }

        let prompt = self
            .inner
            .cache
            .get_or_assemble(&params, &self.inner.catalog)
            .await?;

        let image_id = Uuid::new_v4().to_string();
        let record = GenerationRecord::pending(&image_id, user_id, params);
        let created_at = record.created_at;
        let parameters_hash = record.parameters_hash.clone();
        self.inner.store.insert(record).await?;
        let started = Instant::now();

        self.inner.events.send(GenerationEvent::accepted(
            &image_id,
            user_id,
            &parameters_hash,
        ));
        info!(image_id = %image_id, hash = %parameters_hash, "Accepted generation request");

        let this = self.clone();
        let task_id = image_id.clone();
        tokio::spawn(async move {
            this.drive(&task_id, &prompt, started).await;
        });

        Ok(SubmitResponse::Accepted(Accepted {
            image_id,
            status: GenerationStatus::Pending,
            parameters_hash,
            estimated_completion: self.estimate_completion(created_at),
        }))
    }

    /// Returns the record for `image_id` with a completion estimate while pending.
    ///
    /// # Errors
    ///
    /// Returns `RecordNotFound` for an unknown id.
    pub async fn get_status(&self, image_id: &str) -> Result<StatusView> {
        let record = self
            .inner
            .store
            .get_by_id(image_id)
            .await?
            .ok_or_else(|| ForgeError::record_not_found(image_id))?;
        let estimated_completion = (record.status == GenerationStatus::Pending)
            .then(|| self.estimate_completion(record.created_at));
        Ok(StatusView {
            record,
            estimated_completion,
        })
    }

    /// Lists a user's records, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the record store cannot be read.
    pub async fn list_by_user(
        &self,
        user_id: &str,
        filter: RecordFilter,
        page: Pagination,
    ) -> Result<Vec<GenerationRecord>> {
        self.inner.store.list_by_user(user_id, filter, page).await
    }

    /// Waits until `image_id` is `COMPLETE` or `FAILED`.
    ///
    /// Wakes on lifecycle events and polls the store every `poll_interval`
    /// in case an event was missed.
    ///
    /// # Errors
    ///
    /// Returns `RecordNotFound` for an unknown id, or `OperationTimeout` if
    /// the record is still pending after `timeout`.
    pub async fn wait_for_terminal(
        &self,
        image_id: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<GenerationRecord> {
        let mut events = self.subscribe();
        let deadline = Instant::now() + timeout;
        loop {
            let record = self
                .inner
                .store
                .get_by_id(image_id)
                .await?
                .ok_or_else(|| ForgeError::record_not_found(image_id))?;
            if record.status.is_terminal() {
                return Ok(record);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ForgeError::OperationTimeout { timeout });
            }
            tokio::select! {
                _ = events.recv() => {}
                () = tokio::time::sleep(remaining.min(poll_interval)) => {}
            }
        }
    }

    /// Spawns periodic provider health checks and prompt cache eviction.
    #[must_use]
    pub fn spawn_maintenance(&self, interval: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.inner.registry.run_health_checks().await;
                this.inner.cache.apply_policy(&this.inner.cache_policy).await;
            }
        })
    }

    fn estimate_completion(&self, created_at: DateTime<Utc>) -> DateTime<Utc> {
        let estimate = chrono::Duration::from_std(self.inner.estimated_duration)
            .unwrap_or_else(|_| chrono::Duration::zero());
        created_at + estimate
    }

    // ========================================================================
    // Background run
    // ========================================================================

    /// Runs one generation to a terminal record.
    ///
    /// The operation timeout bounds provider selection and generation only.
    /// Once an image exists, fetching and storing it run to completion so a
    /// timeout never cuts a storage write short.
    async fn drive(&self, image_id: &str, prompt: &AssembledPrompt, started: Instant) {
        let timeout = self.inner.operation_timeout;
        let outcome = match tokio::time::timeout(timeout, self.generate(image_id, prompt)).await {
            Ok(Ok((candidate, output))) => {
                self.deliver(image_id, prompt, candidate, &output).await
            }
            Ok(Err(error)) => Err(RunFailure::from(error)),
            Err(_) => Err(RunFailure::from(ForgeError::OperationTimeout { timeout })),
        };
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let delivered = match outcome {
            Ok(delivered) => delivered,
            Err(failure) => {
                self.fail(image_id, &failure.error, failure.service_used, elapsed_ms)
                    .await;
                return;
            }
        };

        let update = RecordUpdate::Complete {
            object_key: delivered.object.object_key.clone(),
            public_url: delivered.object.public_url.clone(),
            service_used: delivered.service_used.clone(),
            generation_time_ms: elapsed_ms,
        };
        match self.settle(image_id, update).await {
            Ok(_) => {
                info!(
                    image_id,
                    provider = %delivered.service_used,
                    generation_time_ms = elapsed_ms,
                    "Generation complete"
                );
                self.inner.events.send(GenerationEvent::completed(
                    image_id,
                    &delivered.service_used,
                    &delivered.object.public_url,
                    elapsed_ms,
                ));
            }
            Err(e) => {
                error!(image_id, error = %e, "Failed to record completion, removing stored image");
                if let Err(delete_error) =
                    self.inner.storage.delete(&delivered.object.object_key).await
                {
                    warn!(image_id, error = %delete_error, "Failed to remove orphaned image");
                }
                self.fail(image_id, &e, Some(delivered.service_used), elapsed_ms)
                    .await;
            }
        }
    }

    async fn deliver(
        &self,
        image_id: &str,
        prompt: &AssembledPrompt,
        candidate: RankedProvider,
        output: &GenerationOutput,
    ) -> std::result::Result<Delivered, RunFailure> {
        let object = self
            .store_asset(image_id, prompt, &candidate, output)
            .await
            .map_err(|error| RunFailure {
                error,
                service_used: Some(candidate.name.clone()),
            })?;
        Ok(Delivered {
            service_used: candidate.name,
            object,
        })
    }

    /// Tries ranked providers until one produces an image.
    async fn generate(
        &self,
        image_id: &str,
        prompt: &AssembledPrompt,
    ) -> Result<(RankedProvider, GenerationOutput)> {
        let candidates = self.inner.registry.available_providers().await;
        if candidates.is_empty() {
            warn!(image_id, "No provider available");
            return Err(ForgeError::NoProviderAvailable);
        }

        let mut last_error = None;
        for (index, candidate) in candidates.iter().enumerate() {
            let error = match self.call_provider(image_id, prompt, candidate).await {
                Ok(output) => return Ok((candidate.clone(), output)),
                Err(error) => error,
            };

            if matches!(error.provider_error(), Some(e) if !e.is_retryable()) {
                warn!(
                    image_id,
                    provider = %candidate.name,
                    error = %error,
                    "Non-retryable provider error, not failing over"
                );
                return Err(error);
            }

            if let Some(next) = candidates.get(index + 1) {
                info!(
                    image_id,
                    from = %candidate.name,
                    to = %next.name,
                    "Failing over to next provider"
                );
                self.inner.events.send(GenerationEvent::failover(
                    image_id,
                    &candidate.name,
                    &next.name,
                    error.to_string(),
                ));
            }
            last_error = Some(error);
        }

        Err(last_error.unwrap_or(ForgeError::NoProviderAvailable))
    }

    /// One provider: breaker around retry around the call.
    async fn call_provider(
        &self,
        image_id: &str,
        prompt: &AssembledPrompt,
        candidate: &RankedProvider,
    ) -> Result<GenerationOutput> {
        let name = candidate.name.as_str();
        let provider = &candidate.provider;
        let retry = &self.inner.retry;
        let events = &self.inner.events;
        let mut failures: Vec<RetryAttempt> = Vec::new();
        let failures_ref = &mut failures;

        debug!(image_id, provider = name, "Calling provider");
        let result = candidate
            .breaker
            .execute(move || {
                retry.execute_with_retry(
                    name,
                    move |_attempt| async move {
                        let started = Instant::now();
                        provider
                            .generate(prompt)
                            .await
                            .map(|output| (output, started.elapsed()))
                    },
                    move |attempt: &RetryAttempt| {
                        events.send(GenerationEvent::attempt_failed(
                            image_id,
                            name,
                            attempt.attempt,
                            attempt.error.to_string(),
                            attempt.delay.is_some(),
                        ));
                        failures_ref.push(attempt.clone());
                    },
                )
            })
            .await;

        let registry = &self.inner.registry;
        for attempt in &failures {
            registry
                .record_outcome(name, Err(&attempt.error), attempt.elapsed)
                .await;
        }
        let (output, latency) = result?;
        registry.record_outcome(name, Ok(()), latency).await;
        Ok(output)
    }

    async fn store_asset(
        &self,
        image_id: &str,
        prompt: &AssembledPrompt,
        candidate: &RankedProvider,
        output: &GenerationOutput,
    ) -> Result<StoredObject> {
        let asset = candidate.provider.fetch_asset(&output.asset_url).await?;
        let mut metadata = BTreeMap::from([
            ("imageId".to_string(), image_id.to_string()),
            ("parametersHash".to_string(), prompt.parameters_hash.clone()),
            ("provider".to_string(), candidate.name.clone()),
        ]);
        if let Some(request_id) = &output.request_id {
            metadata.insert("requestId".to_string(), request_id.clone());
        }
        let object = self
            .inner
            .storage
            .put(&asset.bytes, &asset.content_type, &metadata)
            .await?;
        debug!(image_id, key = %object.object_key, bytes = asset.bytes.len(), "Stored image");
        Ok(object)
    }

    /// Writes a terminal update, retrying store errors with doubling delays.
    ///
    /// A record the store does not know is not retried.
    async fn settle(&self, image_id: &str, update: RecordUpdate) -> Result<bool> {
        let mut delay = TERMINAL_WRITE_BASE_DELAY;
        let mut attempt = 1;
        loop {
            match self.inner.store.update_status(image_id, update.clone()).await {
                Ok(applied) => return Ok(applied),
                Err(e @ ForgeError::RecordNotFound { .. }) => return Err(e),
                Err(e) if attempt >= TERMINAL_WRITE_ATTEMPTS => return Err(e),
                Err(e) => {
                    warn!(
                        image_id,
                        attempt,
                        status = %update.status(),
                        error = %e,
                        "Terminal record write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }

    async fn fail(
        &self,
        image_id: &str,
        error: &ForgeError,
        service_used: Option<String>,
        elapsed_ms: u64,
    ) {
        let message = error.to_string();
        if error.is_fatal() {
            error!(image_id, error = %message, "Generation failed, operator action required");
        } else {
            warn!(image_id, transient = error.is_transient(), error = %message, "Generation failed");
        }
        let update = RecordUpdate::Failed {
            error_message: message.clone(),
            service_used,
            generation_time_ms: elapsed_ms,
        };
        if let Err(e) = self.settle(image_id, update).await {
            error!(image_id, error = %e, "Failed to record generation failure");
        }
        self.inner
            .events
            .send(GenerationEvent::failed(image_id, message));
    }
}
