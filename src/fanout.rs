//! Fan-out service: expands one content-published event into one
//! notification batch per follower page.

use anyhow::{Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::bus::{CancelFlag, Consumer, MemoryBus};
use crate::model::{ContentPublishedEvent, NotificationBatch};
use crate::store::FollowerSource;

pub struct FanoutService {
    bus: MemoryBus,
    followers: Arc<dyn FollowerSource>,
    batch_topic: String,
    page_size: u32,
}

impl FanoutService {
    pub fn new(
        bus: MemoryBus,
        followers: Arc<dyn FollowerSource>,
        batch_topic: String,
        page_size: u32,
    ) -> Self {
        Self {
            bus,
            followers,
            batch_topic,
            page_size,
        }
    }

    /// Page followers from page 0, publish one batch per non-empty page, and
    /// wait for every publish confirmation. Returns the number of batches.
    ///
    /// Any page fetch or publish failure fails the whole event; the caller
    /// nacks it and the redelivered event re-runs pagination with fresh
    /// batch ids. Zero followers is a success with zero batches.
    #[instrument(skip_all)]
    pub async fn handle_event(&self, payload: &[u8]) -> Result<u32> {
        let event: ContentPublishedEvent =
            serde_json::from_slice(payload).context("malformed content-published payload")?;

        match self.followers.follower_count(&event.creator_id).await {
            Ok(count) => info!(
                creator = %event.creator_id,
                followers = count,
                title = %event.title,
                "fanning out"
            ),
            // Count is observability only; pagination decides correctness.
            Err(err) => warn!(?err, creator = %event.creator_id, "follower count unavailable"),
        }

        let mut publishes = Vec::new();
        let mut page = 0u32;
        loop {
            let follower_ids = self
                .followers
                .follower_page(&event.creator_id, page, self.page_size)
                .await
                .with_context(|| format!("follower page {page} for {}", event.creator_id))?;
            if follower_ids.is_empty() {
                break;
            }
            let batch = NotificationBatch::compose(
                &event.creator_id,
                &event.content_id,
                &event.title,
                follower_ids,
            );
            let data = serde_json::to_vec(&batch).context("encode batch")?;
            publishes.push(self.bus.publish(&self.batch_topic, data));
            page += 1;
        }

        // The event may only be acked once every page's publish is confirmed.
        let batches = publishes.len() as u32;
        for result in join_all(publishes).await {
            result.context("batch publish")?;
        }

        info!(
            creator = %event.creator_id,
            content = %event.content_id,
            batches,
            "fan-out complete"
        );
        Ok(batches)
    }

    /// Worker loop: receive publish events, fan out, ack on success, nack on
    /// failure. Exits once `cancel` fires, after resolving any in-flight
    /// event.
    pub async fn run(&self, consumer: Consumer, cancel: CancelFlag) {
        info!("fan-out worker listening");
        while let Some(delivery) = consumer.recv(&cancel).await {
            match self.handle_event(&delivery.payload).await {
                Ok(_) => delivery.acker.ack().await,
                Err(err) => {
                    warn!(
                        ?err,
                        message_id = %delivery.message_id,
                        attempt = delivery.attempt,
                        "fan-out failed; nacking event"
                    );
                    delivery.acker.nack().await;
                }
            }
        }
        info!("fan-out worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SubscriptionConfig;
    use crate::store::memory::MemoryFollowerStore;

    async fn bus_with_batch_sub() -> MemoryBus {
        let bus = MemoryBus::new();
        bus.create_topic("notification-batch").await.unwrap();
        bus.create_subscription(
            "notification-batch",
            "batch-sub",
            SubscriptionConfig::default(),
        )
        .await
        .unwrap();
        bus
    }

    fn event_payload() -> Vec<u8> {
        serde_json::to_vec(&ContentPublishedEvent::new("c1", "v1", "hello")).unwrap()
    }

    #[tokio::test]
    async fn publishes_ceil_of_followers_over_page_size_batches() {
        let bus = bus_with_batch_sub().await;
        let followers = Arc::new(MemoryFollowerStore::new());
        followers.seed("c1", 1_234).await;
        let svc = FanoutService::new(bus.clone(), followers, "notification-batch".into(), 100);

        let batches = svc.handle_event(&event_payload()).await.unwrap();
        assert_eq!(batches, 13);
        assert_eq!(bus.depth("batch-sub").await.unwrap(), 13);
    }

    #[tokio::test]
    async fn zero_followers_publishes_nothing_and_succeeds() {
        let bus = bus_with_batch_sub().await;
        let followers = Arc::new(MemoryFollowerStore::new());
        let svc = FanoutService::new(bus.clone(), followers, "notification-batch".into(), 500);

        let batches = svc.handle_event(&event_payload()).await.unwrap();
        assert_eq!(batches, 0);
        assert_eq!(bus.depth("batch-sub").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_event_is_an_error() {
        let bus = bus_with_batch_sub().await;
        let followers = Arc::new(MemoryFollowerStore::new());
        let svc = FanoutService::new(bus, followers, "notification-batch".into(), 500);

        assert!(svc.handle_event(b"not json").await.is_err());
        assert!(svc.handle_event(br#"{"creator_id": "c1"}"#).await.is_err());
    }

    #[tokio::test]
    async fn publish_failure_fails_the_event() {
        // No batch topic provisioned, so every page publish fails.
        let bus = MemoryBus::new();
        let followers = Arc::new(MemoryFollowerStore::new());
        followers.seed("c1", 10).await;
        let svc = FanoutService::new(bus, followers, "notification-batch".into(), 5);

        assert!(svc.handle_event(&event_payload()).await.is_err());
    }
}
