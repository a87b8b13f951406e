//! Charforge Orchestrator
//!
//! Turns a validated parameter set into a stored character image. The
//! orchestrator ranks providers through the [`ProviderRegistry`], calls each
//! one through its [`CircuitBreaker`] and the [`RetryManager`], fails over
//! between providers, and keeps one [`GenerationRecord`] per request in a
//! [`RecordStore`].

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod record;
pub mod registry;
pub mod retry;

pub use cache::{CacheStats, PromptCache, PromptCacheEntry};
pub use circuit_breaker::{
    BreakerCore, BreakerSettings, BreakerSnapshot, CircuitBreaker, CircuitState, Rejected,
};
pub use config::{
    CacheConfig, CircuitBreakerConfig, Config, ProviderEntry, ProviderKind, RegistryConfig,
    RetryConfig, StorageConfig,
};
pub use error::{ForgeError, Result};
pub use events::{EventBroadcaster, GenerationEvent};
pub use orchestrator::{
    Accepted, GenerationOrchestrator, OrchestratorBuilder, StatusView, SubmitResponse,
};
pub use record::{
    GenerationRecord, GenerationStatus, InMemoryRecordStore, JsonFileRecordStore, Pagination,
    RecordFilter, RecordStore, RecordUpdate, RECORDS_VERSION,
};
pub use registry::{build_provider, ProviderHealth, ProviderRegistry, ProviderStatus, RankedProvider};
pub use retry::{RetryAttempt, RetryManager, RetryPolicy};
