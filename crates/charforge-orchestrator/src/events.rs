//! Generation lifecycle events.
//!
//! The orchestrator pushes an event at every step a caller may want to
//! observe instead of polling the record store.
//!
//! # Event Types
//!
//! - `generation_accepted` - A request passed validation and a PENDING record exists
//! - `attempt_failed` - One provider attempt failed (it may still be retried)
//! - `provider_failover` - A provider was exhausted and the next one is tried
//! - `generation_completed` - The image was stored and the record is COMPLETE
//! - `generation_failed` - The record is FAILED
//!
//! # Example
//!
//! ```
//! use charforge_orchestrator::events::{EventBroadcaster, GenerationEvent};
//!
//! # async fn example() {
//! let broadcaster = EventBroadcaster::new(100);
//! let mut receiver = broadcaster.subscribe();
//!
//! broadcaster.send(GenerationEvent::failed("img-1", "all providers exhausted"));
//!
//! if let Ok(event) = receiver.recv().await {
//!     assert_eq!(event.event_name(), "generation_failed");
//! }
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ============================================================================
// Event Payloads
// ============================================================================

/// Payload for the `generation_accepted` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedPayload {
    /// The new image id.
    pub image_id: String,
    /// Owner of the request.
    pub user_id: String,
    /// Hash of the normalized parameter set.
    pub parameters_hash: String,
    /// When the request was accepted.
    pub timestamp: DateTime<Utc>,
}

/// Payload for the `attempt_failed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptFailedPayload {
    /// Image being generated.
    pub image_id: String,
    /// Provider that failed.
    pub provider: String,
    /// Attempt number against this provider (1-indexed).
    pub attempt: u32,
    /// Failure description.
    pub error: String,
    /// Whether another attempt will follow.
    pub will_retry: bool,
}

/// Payload for the `provider_failover` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverPayload {
    /// Image being generated.
    pub image_id: String,
    /// Provider that was given up on.
    pub from: String,
    /// Provider tried next.
    pub to: String,
    /// Why the previous provider was abandoned.
    pub reason: String,
}

/// Payload for the `generation_completed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPayload {
    /// Image id.
    pub image_id: String,
    /// Provider that produced the image.
    pub service_used: String,
    /// Where the image can be loaded from.
    pub public_url: String,
    /// Wall time from acceptance to completion.
    pub generation_time_ms: u64,
}

/// Payload for the `generation_failed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedPayload {
    /// Image id.
    pub image_id: String,
    /// Failure description stored on the record.
    pub error_message: String,
}

// ============================================================================
// Event Enum
// ============================================================================

/// Lifecycle event for one generation.
///
/// Serialized as a JSON object with "event" and "payload" fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum GenerationEvent {
    /// A request was accepted.
    GenerationAccepted(AcceptedPayload),
    /// A provider attempt failed.
    AttemptFailed(AttemptFailedPayload),
    /// The orchestrator moved on to the next provider.
    ProviderFailover(FailoverPayload),
    /// The generation completed.
    GenerationCompleted(CompletedPayload),
    /// The generation failed.
    GenerationFailed(FailedPayload),
}

impl GenerationEvent {
    /// Creates a `GenerationAccepted` event.
    #[must_use]
    pub fn accepted(
        image_id: impl Into<String>,
        user_id: impl Into<String>,
        parameters_hash: impl Into<String>,
    ) -> Self {
        Self::GenerationAccepted(AcceptedPayload {
            image_id: image_id.into(),
            user_id: user_id.into(),
            parameters_hash: parameters_hash.into(),
            timestamp: Utc::now(),
        })
    }

    /// Creates an `AttemptFailed` event.
    #[must_use]
    pub fn attempt_failed(
        image_id: impl Into<String>,
        provider: impl Into<String>,
        attempt: u32,
        error: impl Into<String>,
        will_retry: bool,
    ) -> Self {
        Self::AttemptFailed(AttemptFailedPayload {
            image_id: image_id.into(),
            provider: provider.into(),
            attempt,
            error: error.into(),
            will_retry,
        })
    }

    /// Creates a `ProviderFailover` event.
    #[must_use]
    pub fn failover(
        image_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ProviderFailover(FailoverPayload {
            image_id: image_id.into(),
            from: from.into(),
            to: to.into(),
            reason: reason.into(),
        })
    }

    /// Creates a `GenerationCompleted` event.
    #[must_use]
    pub fn completed(
        image_id: impl Into<String>,
        service_used: impl Into<String>,
        public_url: impl Into<String>,
        generation_time_ms: u64,
    ) -> Self {
        Self::GenerationCompleted(CompletedPayload {
            image_id: image_id.into(),
            service_used: service_used.into(),
            public_url: public_url.into(),
            generation_time_ms,
        })
    }

    /// Creates a `GenerationFailed` event.
    #[must_use]
    pub fn failed(image_id: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self::GenerationFailed(FailedPayload {
            image_id: image_id.into(),
            error_message: error_message.into(),
        })
    }

    /// Returns the event name as a string.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::GenerationAccepted(_) => "generation_accepted",
            Self::AttemptFailed(_) => "attempt_failed",
            Self::ProviderFailover(_) => "provider_failover",
            Self::GenerationCompleted(_) => "generation_completed",
            Self::GenerationFailed(_) => "generation_failed",
        }
    }

    /// Returns the image id the event refers to.
    #[must_use]
    pub fn image_id(&self) -> &str {
        match self {
            Self::GenerationAccepted(p) => &p.image_id,
            Self::AttemptFailed(p) => &p.image_id,
            Self::ProviderFailover(p) => &p.image_id,
            Self::GenerationCompleted(p) => &p.image_id,
            Self::GenerationFailed(p) => &p.image_id,
        }
    }

    /// Returns `true` for events that end a generation.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::GenerationCompleted(_) | Self::GenerationFailed(_)
        )
    }
}

// ============================================================================
// Event Broadcaster
// ============================================================================

/// Broadcasts generation events to all subscribers.
///
/// Events are not persisted for subscribers that join late.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<GenerationEvent>,
}

impl EventBroadcaster {
    /// Creates a new `EventBroadcaster` with the specified buffer capacity.
    ///
    /// If a subscriber falls more than `capacity` events behind it receives
    /// a `Lagged` error and misses the oldest events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Creates a new subscriber.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.sender.subscribe()
    }

    /// Broadcasts an event, returning the number of receivers.
    pub fn send(&self, event: GenerationEvent) -> usize {
        // send() returns Err only if there are no receivers, which is fine
        self.sender.send(event).unwrap_or(0)
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_shape() {
        let event = GenerationEvent::completed("img-1", "primary", "https://cdn/x.png", 1200);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event"], "generation_completed");
        assert_eq!(json["payload"]["imageId"], "img-1");
        assert_eq!(json["payload"]["serviceUsed"], "primary");
        assert_eq!(json["payload"]["generationTimeMs"], 1200);
    }

    #[test]
    fn test_event_names_match_serde_tags() {
        let events = vec![
            GenerationEvent::accepted("i", "u", "h"),
            GenerationEvent::attempt_failed("i", "p", 1, "boom", true),
            GenerationEvent::failover("i", "a", "b", "exhausted"),
            GenerationEvent::completed("i", "p", "url", 1),
            GenerationEvent::failed("i", "boom"),
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], event.event_name());
            assert_eq!(event.image_id(), "i");
        }
    }

    #[test]
    fn test_is_terminal() {
        assert!(GenerationEvent::failed("i", "x").is_terminal());
        assert!(GenerationEvent::completed("i", "p", "u", 0).is_terminal());
        assert!(!GenerationEvent::failover("i", "a", "b", "r").is_terminal());
    }

    #[test]
    fn test_send_without_receivers_returns_zero() {
        let broadcaster = EventBroadcaster::new(4);
        assert_eq!(broadcaster.send(GenerationEvent::failed("i", "x")), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let broadcaster = EventBroadcaster::default();
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();
        assert_eq!(broadcaster.receiver_count(), 2);

        assert_eq!(broadcaster.send(GenerationEvent::accepted("i", "u", "h")), 2);
        assert_eq!(a.recv().await.unwrap().event_name(), "generation_accepted");
        assert_eq!(b.recv().await.unwrap().event_name(), "generation_accepted");
    }
}
