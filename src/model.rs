use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Published by a creator-facing service when new content goes live.
/// Consumed by the fan-out service from the content topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentPublishedEvent {
    pub creator_id: String,
    pub content_id: String,
    pub title: String,
    #[serde(default = "Utc::now")]
    pub published_at: DateTime<Utc>,
}

impl ContentPublishedEvent {
    pub fn new(creator_id: &str, content_id: &str, title: &str) -> Self {
        Self {
            creator_id: creator_id.to_string(),
            content_id: content_id.to_string(),
            title: title.to_string(),
            published_at: Utc::now(),
        }
    }
}

/// One bus message = one page of follower IDs to notify.
///
/// Every composition gets a fresh `batch_id`, so a re-run of fan-out for the
/// same event produces new batches instead of colliding with old ones.
/// Duplicate batches are absorbed downstream by the idempotent delivery sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationBatch {
    pub batch_id: Uuid,
    pub creator_id: String,
    pub content_id: String,
    pub title: String,
    pub follower_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl NotificationBatch {
    /// Compose a batch from one non-empty follower page. Pure apart from the
    /// fresh id and timestamp.
    pub fn compose(
        creator_id: &str,
        content_id: &str,
        title: &str,
        follower_ids: Vec<String>,
    ) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            creator_id: creator_id.to_string(),
            content_id: content_id.to_string(),
            title: title.to_string(),
            follower_ids,
            created_at: Utc::now(),
        }
    }
}

/// One delivered notification, as recorded by the delivery sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub notif_id: Uuid,
    pub user_id: String,
    pub creator_id: String,
    pub content_id: String,
    pub title: String,
    pub sent_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn new(user_id: String, batch: &NotificationBatch) -> Self {
        Self {
            notif_id: Uuid::new_v4(),
            user_id,
            creator_id: batch.creator_id.clone(),
            content_id: batch.content_id.clone(),
            title: batch.title.clone(),
            sent_at: Utc::now(),
        }
    }
}

/// What a dispatch worker does with a user when the opt-out lookup fails.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptOutPolicy {
    /// Send anyway; a spurious notification beats a silently suppressed one.
    #[default]
    FailOpen,
    /// Skip the user.
    FailClosed,
}

impl OptOutPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptOutPolicy::FailOpen => "fail_open",
            OptOutPolicy::FailClosed => "fail_closed",
        }
    }
}

/// Per-batch result reported by a dispatch worker before acking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub sent: u32,
    pub skipped: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_assigns_fresh_batch_ids() {
        let ids = vec!["u1".to_string(), "u2".to_string()];
        let a = NotificationBatch::compose("c1", "v1", "t", ids.clone());
        let b = NotificationBatch::compose("c1", "v1", "t", ids);
        assert_ne!(a.batch_id, b.batch_id);
        assert_eq!(a.follower_ids, b.follower_ids);
    }

    #[test]
    fn batch_round_trips_as_json() {
        let batch = NotificationBatch::compose("c1", "v1", "hello", vec!["u1".into()]);
        let bytes = serde_json::to_vec(&batch).unwrap();
        let decoded: NotificationBatch = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(batch, decoded);
    }

    #[test]
    fn event_missing_required_field_is_malformed() {
        let payload = br#"{"creator_id": "c1", "title": "no content id"}"#;
        assert!(serde_json::from_slice::<ContentPublishedEvent>(payload).is_err());
    }

    #[test]
    fn event_without_timestamp_defaults_to_now() {
        let payload = br#"{"creator_id": "c1", "content_id": "v1", "title": "t"}"#;
        let event: ContentPublishedEvent = serde_json::from_slice(payload).unwrap();
        assert_eq!(event.creator_id, "c1");
    }

    #[test]
    fn opt_out_policy_parses_from_config_strings() {
        let p: OptOutPolicy = serde_yaml::from_str("fail_closed").unwrap();
        assert_eq!(p, OptOutPolicy::FailClosed);
        assert_eq!(OptOutPolicy::default().as_str(), "fail_open");
    }
}
