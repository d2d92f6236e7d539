//! External-collaborator seams: paginated follower reads, idempotent
//! notification writes, and the optional opt-out lookup. Production backing
//! stores swap in behind these traits.

use anyhow::Result;
use async_trait::async_trait;

use crate::model::DeliveryRecord;

pub mod memory;
pub mod sqlite;

/// Paged read access to a creator's followers.
///
/// Reads must be idempotent per `(creator_id, page)` since a fan-out retry
/// restarts at page 0. An empty page terminates pagination.
#[async_trait]
pub trait FollowerSource: Send + Sync {
    /// Total follower count, used for logging only.
    async fn follower_count(&self, creator_id: &str) -> Result<u64>;

    async fn follower_page(
        &self,
        creator_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<String>>;
}

/// Records one delivered notification.
///
/// Must tolerate replays: at most one stored record per
/// `(user_id, content_id)`, with duplicate sends absorbed silently.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn record(&self, record: &DeliveryRecord) -> Result<()>;
}

/// Per-user notification opt-out lookup (production = Redis cache).
#[async_trait]
pub trait OptOutStore: Send + Sync {
    async fn is_opted_out(&self, user_id: &str) -> Result<bool>;
}
