//! End-to-end generation tests against in-process providers
//!
//! These wire the orchestrator to mock providers, in-memory storage and an
//! in-memory record store, then drive requests to a terminal state.

use std::sync::Arc;
use std::time::Duration;

use charforge_orchestrator::{
    BreakerSettings, GenerationOrchestrator, GenerationStatus, InMemoryRecordStore, Pagination,
    ProviderRegistry, RecordFilter, RecordStore, RegistryConfig, RetryPolicy, SubmitResponse,
};
use charforge_prompt::{validate, Catalog, Field, FrameType, ParameterSet};
use charforge_providers::{
    ImageProvider, MemoryStorage, MockProvider, ObjectStorage, ProviderErrorKind,
};

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(5);

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        backoff_multiplier: 2.0,
        jitter_ratio: 0.1,
        attempt_timeout: Duration::from_secs(2),
    }
}

struct Setup {
    orchestrator: GenerationOrchestrator,
    storage: Arc<MemoryStorage>,
}

async fn setup(providers: Vec<(Arc<MockProvider>, u32)>) -> Setup {
    let registry = Arc::new(ProviderRegistry::new(
        RegistryConfig::default(),
        BreakerSettings::default(),
    ));
    for (provider, priority) in providers {
        registry
            .register(provider as Arc<dyn ImageProvider>, priority, true)
            .await
            .expect("Failed to register provider");
    }

    let storage = Arc::new(MemoryStorage::new());
    let orchestrator = GenerationOrchestrator::builder(
        Catalog::builtin(),
        registry,
        Arc::new(InMemoryRecordStore::new()) as Arc<dyn RecordStore>,
        Arc::clone(&storage) as Arc<dyn ObjectStorage>,
    )
    .retry_policy(fast_retry())
    .build();

    Setup {
        orchestrator,
        storage,
    }
}

fn sneaker_params() -> ParameterSet {
    ParameterSet::new("pointing-forward", "hoodie-sweatpants", "air-jordan-1-chicago")
}

async fn generate(orchestrator: &GenerationOrchestrator, params: ParameterSet) -> String {
    match orchestrator
        .submit(params, "explorer-1")
        .await
        .expect("Submit failed")
    {
        SubmitResponse::Accepted(accepted) => accepted.image_id,
        SubmitResponse::Rejected(outcome) => {
            panic!("Request rejected: {}", outcome.summary())
        }
    }
}

/// A sneaker generation reaches COMPLETE with a stored image.
#[tokio::test]
async fn test_sneaker_generation_completes() {
    let setup = setup(vec![(Arc::new(MockProvider::new("primary")), 0)]).await;

    let image_id = generate(&setup.orchestrator, sneaker_params()).await;
    let record = setup
        .orchestrator
        .wait_for_terminal(&image_id, POLL, WAIT)
        .await
        .expect("Generation did not finish");

    assert_eq!(record.status, GenerationStatus::Complete);
    assert_eq!(record.service_used.as_deref(), Some("primary"));
    let url = record.public_url.expect("Missing public URL");
    assert!(!url.is_empty());
    let key = record.object_key.expect("Missing object key");
    assert!(setup.storage.get(&key).await.is_some());
}

/// Provider A keeps failing, so B serves the request.
#[tokio::test]
async fn test_failover_to_secondary_provider() {
    let a = Arc::new(MockProvider::new("a").always_failing(ProviderErrorKind::ServiceUnavailable));
    let b = Arc::new(MockProvider::new("b"));
    let setup = setup(vec![(Arc::clone(&a), 0), (Arc::clone(&b), 1)]).await;

    let image_id = generate(&setup.orchestrator, sneaker_params()).await;
    let record = setup
        .orchestrator
        .wait_for_terminal(&image_id, POLL, WAIT)
        .await
        .expect("Generation did not finish");

    assert_eq!(record.status, GenerationStatus::Complete);
    assert_eq!(record.service_used.as_deref(), Some("b"));
    assert_eq!(a.calls(), 3);
    assert_eq!(b.calls(), 1);

    let health = setup
        .orchestrator
        .registry()
        .health("a")
        .await
        .expect("Missing health for a");
    assert_eq!(health.failed_requests, 3);
    assert!(!health.is_healthy);
}

/// A content policy refusal fails the request without trying B.
#[tokio::test]
async fn test_content_policy_does_not_fail_over() {
    let a = Arc::new(
        MockProvider::new("a").always_failing(ProviderErrorKind::ContentPolicyViolation),
    );
    let b = Arc::new(MockProvider::new("b"));
    let setup = setup(vec![(Arc::clone(&a), 0), (Arc::clone(&b), 1)]).await;

    let image_id = generate(&setup.orchestrator, sneaker_params()).await;
    let record = setup
        .orchestrator
        .wait_for_terminal(&image_id, POLL, WAIT)
        .await
        .expect("Generation did not finish");

    assert_eq!(record.status, GenerationStatus::Failed);
    assert!(record.error_message.is_some_and(|m| !m.is_empty()));
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 0);
    assert!(setup.storage.is_empty().await);
}

/// Every provider exhausting its retries marks the record FAILED.
#[tokio::test]
async fn test_all_providers_exhausted() {
    let a = Arc::new(MockProvider::new("a").always_failing(ProviderErrorKind::Timeout));
    let b = Arc::new(MockProvider::new("b").always_failing(ProviderErrorKind::RateLimited));
    let setup = setup(vec![(Arc::clone(&a), 0), (Arc::clone(&b), 1)]).await;

    let image_id = generate(&setup.orchestrator, sneaker_params()).await;
    let record = setup
        .orchestrator
        .wait_for_terminal(&image_id, POLL, WAIT)
        .await
        .expect("Generation did not finish");

    assert_eq!(record.status, GenerationStatus::Failed);
    assert_eq!(a.calls(), 3);
    assert_eq!(b.calls(), 3);
    assert!(record.public_url.is_none());
}

/// Narrative frames flow through to a completed record.
#[tokio::test]
async fn test_onboarding_frame_generation() {
    let setup = setup(vec![(Arc::new(MockProvider::new("primary")), 0)]).await;
    let params = ParameterSet::new("holding-cave-map", "explorer-vest-cargo", "hiking-boots")
        .with_accessory("cave-map")
        .with_frame(FrameType::Onboarding, "onboarding-cave-entrance");

    let outcome = validate(&params, setup.orchestrator.catalog());
    assert!(outcome.is_valid, "{}", outcome.summary());

    let image_id = generate(&setup.orchestrator, params.clone()).await;
    let record = setup
        .orchestrator
        .wait_for_terminal(&image_id, POLL, WAIT)
        .await
        .expect("Generation did not finish");

    assert_eq!(record.status, GenerationStatus::Complete);
    assert_eq!(record.parameters_hash, params.hash());
}

/// The pose cannot hold the map, so the request is rejected.
#[tokio::test]
async fn test_incompatible_accessory_rejected() {
    let setup = setup(vec![(Arc::new(MockProvider::new("primary")), 0)]).await;
    let params = ParameterSet::new("arms-crossed", "hoodie-sweatpants", "air-jordan-1-chicago")
        .with_accessory("cave-map");

    let response = setup
        .orchestrator
        .submit(params, "explorer-1")
        .await
        .expect("Submit failed");

    let SubmitResponse::Rejected(outcome) = response else {
        panic!("Expected rejection");
    };
    assert!(!outcome.is_valid);
    assert!(outcome.blocking().any(|issue| issue.field == Field::Accessory));

    let records = setup
        .orchestrator
        .list_by_user("explorer-1", RecordFilter::default(), Pagination::default())
        .await
        .expect("List failed");
    assert!(records.is_empty());
}

/// Records are listed newest first and can be filtered by status.
#[tokio::test]
async fn test_history_lists_newest_first() {
    let setup = setup(vec![(Arc::new(MockProvider::new("primary")), 0)]).await;

    let first = generate(&setup.orchestrator, sneaker_params()).await;
    setup
        .orchestrator
        .wait_for_terminal(&first, POLL, WAIT)
        .await
        .expect("First generation did not finish");
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = generate(
        &setup.orchestrator,
        ParameterSet::new("waving-hello", "denim-jacket-jeans", "white-canvas-sneakers"),
    )
    .await;
    setup
        .orchestrator
        .wait_for_terminal(&second, POLL, WAIT)
        .await
        .expect("Second generation did not finish");

    let records = setup
        .orchestrator
        .list_by_user("explorer-1", RecordFilter::default(), Pagination::default())
        .await
        .expect("List failed");
    let ids: Vec<_> = records.iter().map(|r| r.image_id.as_str()).collect();
    assert_eq!(ids, vec![second.as_str(), first.as_str()]);

    let failed = setup
        .orchestrator
        .list_by_user(
            "explorer-1",
            RecordFilter {
                status: Some(GenerationStatus::Failed),
            },
            Pagination::default(),
        )
        .await
        .expect("List failed");
    assert!(failed.is_empty());
}
