//! In-memory store implementations, used by the demo runner and tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use super::{DeliverySink, FollowerSource, OptOutStore};
use crate::model::DeliveryRecord;

/// Follower lists held in memory, keyed by creator.
#[derive(Default)]
pub struct MemoryFollowerStore {
    data: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryFollowerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed synthetic followers `user_<creator>_<i>` for a creator.
    pub async fn seed(&self, creator_id: &str, count: usize) {
        let followers = (0..count)
            .map(|i| format!("user_{creator_id}_{i}"))
            .collect();
        self.data.lock().await.insert(creator_id.to_string(), followers);
    }
}

#[async_trait]
impl FollowerSource for MemoryFollowerStore {
    async fn follower_count(&self, creator_id: &str) -> Result<u64> {
        let data = self.data.lock().await;
        Ok(data.get(creator_id).map(|f| f.len() as u64).unwrap_or(0))
    }

    async fn follower_page(
        &self,
        creator_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<String>> {
        let data = self.data.lock().await;
        let followers = match data.get(creator_id) {
            Some(f) => f,
            None => return Ok(Vec::new()),
        };
        let start = page as usize * page_size as usize;
        let end = (start + page_size as usize).min(followers.len());
        if start >= followers.len() {
            return Ok(Vec::new());
        }
        Ok(followers[start..end].to_vec())
    }
}

/// Delivery sink keyed on `(user_id, content_id)`, so replayed sends leave a
/// single stored record. Tests can script one-shot send failures per user.
#[derive(Default)]
pub struct MemoryDeliverySink {
    records: Mutex<HashMap<(String, String), DeliveryRecord>>,
    replays: Mutex<u64>,
    fail_once: Mutex<HashSet<String>>,
}

impl MemoryDeliverySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `record` call for `user_id` fail.
    pub async fn fail_once_for(&self, user_id: &str) {
        self.fail_once.lock().await.insert(user_id.to_string());
    }

    pub async fn total_recorded(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn total_for_content(&self, content_id: &str) -> usize {
        self.records
            .lock()
            .await
            .keys()
            .filter(|(_, c)| c == content_id)
            .count()
    }

    pub async fn records_for(&self, user_id: &str) -> Vec<DeliveryRecord> {
        self.records
            .lock()
            .await
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }

    /// How many sends hit an already-recorded `(user, content)` pair.
    pub async fn replayed(&self) -> u64 {
        *self.replays.lock().await
    }
}

#[async_trait]
impl DeliverySink for MemoryDeliverySink {
    async fn record(&self, record: &DeliveryRecord) -> Result<()> {
        if self.fail_once.lock().await.remove(&record.user_id) {
            return Err(anyhow!("injected send failure for {}", record.user_id));
        }
        let mut records = self.records.lock().await;
        let key = (record.user_id.clone(), record.content_id.clone());
        if records.contains_key(&key) {
            *self.replays.lock().await += 1;
        } else {
            records.insert(key, record.clone());
        }
        Ok(())
    }
}

/// Opt-out set with a switch to simulate lookup outages.
#[derive(Default)]
pub struct MemoryOptOutStore {
    opted_out: Mutex<HashSet<String>>,
    failing: AtomicBool,
}

impl MemoryOptOutStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn opt_out(&self, user_id: &str) {
        self.opted_out.lock().await.insert(user_id.to_string());
    }

    pub fn fail_lookups(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl OptOutStore for MemoryOptOutStore {
    async fn is_opted_out(&self, user_id: &str) -> Result<bool> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("opt-out lookup unavailable"));
        }
        Ok(self.opted_out.lock().await.contains(user_id))
    }
}
