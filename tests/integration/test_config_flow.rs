//! Integration tests for the file-backed setup
//!
//! Builds the orchestrator from a `charforge.json` in a temporary
//! directory, so records and images land on disk the way the CLI uses
//! them.

use std::path::Path;
use std::time::Duration;

use charforge_orchestrator::{Config, ForgeError, GenerationOrchestrator, GenerationStatus};
use charforge_prompt::ParameterSet;
use serde_json::json;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(10);

fn write_config(dir: &Path, providers: &serde_json::Value) -> Config {
    let config = json!({
        "retry": { "maxAttempts": 2, "baseDelayMs": 1, "maxDelayMs": 5 },
        "recordsFile": dir.join("state/records.json"),
        "storage": {
            "dir": dir.join("images"),
            "publicBaseUrl": "https://cdn.example.com/characters/"
        },
        "providers": providers
    });
    std::fs::write(
        dir.join("charforge.json"),
        serde_json::to_string_pretty(&config).expect("Failed to encode config"),
    )
    .expect("Failed to write config");
    Config::load_from_dir(dir).expect("Failed to load config")
}

fn sneaker_params() -> ParameterSet {
    ParameterSet::new("pointing-forward", "hoodie-sweatpants", "air-jordan-1-chicago")
}

/// The default configuration uses the mock provider and completes.
#[tokio::test]
async fn test_default_config_generates() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = write_config(
        dir.path(),
        &json!([{ "name": "mock", "provider": { "type": "mock" } }]),
    );
    let orchestrator = GenerationOrchestrator::from_config(&config)
        .await
        .expect("Failed to build orchestrator");

    let response = orchestrator
        .submit(sneaker_params(), "local")
        .await
        .expect("Submit failed");
    let image_id = response.image_id().expect("Expected acceptance").to_string();
    let record = orchestrator
        .wait_for_terminal(&image_id, POLL, WAIT)
        .await
        .expect("Generation did not finish");

    assert_eq!(record.status, GenerationStatus::Complete);
    let url = record.public_url.expect("Missing public URL");
    assert!(url.starts_with("https://cdn.example.com/characters/"));
    let key = record.object_key.expect("Missing object key");
    assert!(dir.path().join("images").join(&key).exists());
}

/// The first provider never succeeds, so the second serves the image.
#[tokio::test]
async fn test_configured_failover() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = write_config(
        dir.path(),
        &json!([
            {
                "name": "flaky",
                "priority": 0,
                "provider": { "type": "mock", "failFirst": 100, "failWith": "service-unavailable" }
            },
            { "name": "steady", "priority": 5, "provider": { "type": "mock" } }
        ]),
    );
    let orchestrator = GenerationOrchestrator::from_config(&config)
        .await
        .expect("Failed to build orchestrator");

    let response = orchestrator
        .submit(sneaker_params(), "local")
        .await
        .expect("Submit failed");
    let image_id = response.image_id().expect("Expected acceptance").to_string();
    let record = orchestrator
        .wait_for_terminal(&image_id, POLL, WAIT)
        .await
        .expect("Generation did not finish");

    assert_eq!(record.status, GenerationStatus::Complete);
    assert_eq!(record.service_used.as_deref(), Some("steady"));

    let flaky = orchestrator
        .registry()
        .health("flaky")
        .await
        .expect("Missing health");
    assert_eq!(flaky.failed_requests, 2);
}

/// Records survive a restart through the JSON records file.
#[tokio::test]
async fn test_records_persist_across_restart() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = write_config(
        dir.path(),
        &json!([{ "name": "mock", "provider": { "type": "mock" } }]),
    );

    let image_id = {
        let orchestrator = GenerationOrchestrator::from_config(&config)
            .await
            .expect("Failed to build orchestrator");
        let response = orchestrator
            .submit(sneaker_params(), "local")
            .await
            .expect("Submit failed");
        let image_id = response.image_id().expect("Expected acceptance").to_string();
        orchestrator
            .wait_for_terminal(&image_id, POLL, WAIT)
            .await
            .expect("Generation did not finish");
        image_id
    };

    let contents = std::fs::read_to_string(dir.path().join("state/records.json"))
        .expect("Records file missing");
    let value: serde_json::Value = serde_json::from_str(&contents).expect("Invalid records JSON");
    assert_eq!(value["version"], 1);
    let records = value["records"].as_array().expect("Records should be an array");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["imageId"], image_id.as_str());
    assert_eq!(records[0]["status"], "COMPLETE");

    let reopened = GenerationOrchestrator::from_config(&config)
        .await
        .expect("Failed to rebuild orchestrator");
    let view = reopened
        .get_status(&image_id)
        .await
        .expect("Record lost after restart");
    assert_eq!(view.record.status, GenerationStatus::Complete);
    assert!(view.estimated_completion.is_none());
    assert_eq!(view.record.parameters_hash, sneaker_params().hash());
}

/// A corrupted records file is reported instead of being overwritten.
#[tokio::test]
async fn test_corrupted_records_file_is_reported() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = write_config(
        dir.path(),
        &json!([{ "name": "mock", "provider": { "type": "mock" } }]),
    );
    std::fs::create_dir_all(dir.path().join("state")).expect("Failed to create state dir");
    std::fs::write(dir.path().join("state/records.json"), "{ not json")
        .expect("Failed to write records");

    let result = GenerationOrchestrator::from_config(&config).await;

    assert!(matches!(result, Err(ForgeError::RecordsFileCorrupted { .. })));
    let contents =
        std::fs::read_to_string(dir.path().join("state/records.json")).expect("Records missing");
    assert_eq!(contents, "{ not json");
}

/// Unknown ids produce a not-found error.
#[tokio::test]
async fn test_status_of_unknown_id() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = write_config(
        dir.path(),
        &json!([{ "name": "mock", "provider": { "type": "mock" } }]),
    );
    let orchestrator = GenerationOrchestrator::from_config(&config)
        .await
        .expect("Failed to build orchestrator");

    let result = orchestrator.get_status("does-not-exist").await;

    assert!(matches!(result, Err(ForgeError::RecordNotFound { .. })));
}
