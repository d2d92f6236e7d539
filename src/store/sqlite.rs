//! SQLite-backed follower source and delivery sink.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;

use super::{DeliverySink, FollowerSource};
use crate::model::DeliveryRecord;

pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, ensure the parent directory exists and
/// normalize to the `sqlite://` form. In-memory URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }
    let rest = &url["sqlite:".len()..];
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    match query {
        Some(q) => format!("sqlite://{path}?{q}"),
        None => format!("sqlite://{path}"),
    }
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Bulk-load synthetic followers `user_<creator>_<i>` for a creator.
pub async fn seed_followers(pool: &SqlitePool, creator_id: &str, count: u64) -> Result<u64> {
    let mut tx = pool.begin().await?;
    for i in 0..count {
        sqlx::query("INSERT OR IGNORE INTO followers (creator_id, follower_id) VALUES (?, ?)")
            .bind(creator_id)
            .bind(format!("user_{creator_id}_{i}"))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(count)
}

pub async fn total_for_content(pool: &SqlitePool, content_id: &str) -> Result<i64> {
    let count =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM notifications WHERE content_id = ?")
            .bind(content_id)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

#[derive(Clone)]
pub struct SqliteFollowerStore {
    pool: SqlitePool,
}

impl SqliteFollowerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FollowerSource for SqliteFollowerStore {
    async fn follower_count(&self, creator_id: &str) -> Result<u64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM followers WHERE creator_id = ?")
                .bind(creator_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn follower_page(
        &self,
        creator_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT follower_id FROM followers WHERE creator_id = ? \
             ORDER BY follower_id LIMIT ? OFFSET ?",
        )
        .bind(creator_id)
        .bind(page_size as i64)
        .bind(page as i64 * page_size as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

#[derive(Clone)]
pub struct SqliteDeliverySink {
    pool: SqlitePool,
}

impl SqliteDeliverySink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliverySink for SqliteDeliverySink {
    async fn record(&self, record: &DeliveryRecord) -> Result<()> {
        // Idempotent on (user_id, content_id); replayed sends are no-ops.
        sqlx::query(
            "INSERT INTO notifications (notif_id, user_id, creator_id, content_id, title, sent_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (user_id, content_id) DO NOTHING",
        )
        .bind(record.notif_id.to_string())
        .bind(&record.user_id)
        .bind(&record.creator_id)
        .bind(&record.content_id)
        .bind(&record.title)
        .bind(record.sent_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NotificationBatch;

    async fn setup_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn seeded_followers_page_in_order() {
        let pool = setup_pool().await;
        let store = SqliteFollowerStore::new(pool.clone());
        seed_followers(&pool, "c1", 12).await.unwrap();

        assert_eq!(store.follower_count("c1").await.unwrap(), 12);

        let mut seen = std::collections::HashSet::new();
        let mut page = 0;
        loop {
            let ids = store.follower_page("c1", page, 5).await.unwrap();
            if ids.is_empty() {
                break;
            }
            seen.extend(ids);
            page += 1;
        }
        assert_eq!(page, 3);
        assert_eq!(seen.len(), 12);
        assert!(seen.contains("user_c1_0"));
    }

    #[tokio::test]
    async fn seeding_twice_does_not_duplicate() {
        let pool = setup_pool().await;
        seed_followers(&pool, "c1", 5).await.unwrap();
        seed_followers(&pool, "c1", 5).await.unwrap();
        let store = SqliteFollowerStore::new(pool);
        assert_eq!(store.follower_count("c1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn record_is_idempotent_per_user_and_content() {
        let pool = setup_pool().await;
        let sink = SqliteDeliverySink::new(pool.clone());
        let batch = NotificationBatch::compose("c1", "v1", "t", vec!["u1".into()]);

        let first = DeliveryRecord::new("u1".into(), &batch);
        let replay = DeliveryRecord::new("u1".into(), &batch);
        sink.record(&first).await.unwrap();
        sink.record(&replay).await.unwrap();

        assert_eq!(total_for_content(&pool, "v1").await.unwrap(), 1);

        let stored: String =
            sqlx::query_scalar("SELECT notif_id FROM notifications WHERE user_id = 'u1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(stored, first.notif_id.to_string());
    }

    #[test]
    fn sqlite_urls_are_normalized() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://host/db"),
            "postgres://host/db"
        );
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested/fanout.db");
        let url = format!("sqlite://{}", path.display());
        assert_eq!(prepare_sqlite_url(&url), url);
        assert!(path.parent().unwrap().exists());
    }
}
