use anyhow::Result;
use clap::Parser;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

use fanout_notify::bus::{self, CancelFlag, MemoryBus};
use fanout_notify::config::{self, Config, StoreBackend};
use fanout_notify::dispatch::DispatchService;
use fanout_notify::fanout::FanoutService;
use fanout_notify::model::ContentPublishedEvent;
use fanout_notify::store::memory::{MemoryDeliverySink, MemoryFollowerStore};
use fanout_notify::store::sqlite::{self, SqliteDeliverySink, SqliteFollowerStore};
use fanout_notify::store::{DeliverySink, FollowerSource};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
    /// Creator whose content was published
    #[arg(long, default_value = "creator_A")]
    creator_id: String,
    #[arg(long, default_value = "content_001")]
    content_id: String,
    #[arg(long, default_value = "My Awesome New Content")]
    title: String,
    /// Followers to seed for the creator (memory backend only)
    #[arg(long, default_value_t = 10_000)]
    seed_followers: u64,
}

enum Stores {
    Memory {
        followers: Arc<MemoryFollowerStore>,
        sink: Arc<MemoryDeliverySink>,
    },
    Sqlite {
        pool: SqlitePool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = if args.config.exists() {
        config::load(Some(&args.config))?
    } else {
        info!(config = %args.config.display(), "config file not found; using defaults");
        Config::default()
    };
    cfg.ensure_dirs()?;

    let bus_handle = MemoryBus::new();
    bus::provision_topology(&bus_handle, &cfg.bus).await?;

    let stores = match cfg.store.backend {
        StoreBackend::Memory => {
            let followers = Arc::new(MemoryFollowerStore::new());
            followers
                .seed(&args.creator_id, args.seed_followers as usize)
                .await;
            info!(
                creator = %args.creator_id,
                followers = args.seed_followers,
                "seeded in-memory follower store"
            );
            Stores::Memory {
                followers,
                sink: Arc::new(MemoryDeliverySink::new()),
            }
        }
        StoreBackend::Sqlite => {
            let database_url = std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| format!("sqlite://{}/fanout.db", cfg.store.data_dir));
            let pool = sqlite::init_pool(&database_url).await?;
            sqlite::run_migrations(&pool).await?;
            Stores::Sqlite { pool }
        }
    };
    let (follower_source, delivery_sink): (Arc<dyn FollowerSource>, Arc<dyn DeliverySink>) =
        match &stores {
            Stores::Memory { followers, sink } => (followers.clone(), sink.clone()),
            Stores::Sqlite { pool } => (
                Arc::new(SqliteFollowerStore::new(pool.clone())),
                Arc::new(SqliteDeliverySink::new(pool.clone())),
            ),
        };

    let cancel = CancelFlag::new();
    let mut workers = Vec::new();

    let fanout = Arc::new(FanoutService::new(
        bus_handle.clone(),
        follower_source,
        cfg.bus.batch_topic.clone(),
        cfg.fanout.page_size,
    ));
    let consumer = bus_handle
        .consumer(&cfg.bus.fanout_subscription, cfg.fanout.max_in_flight)
        .await?;
    {
        let fanout = fanout.clone();
        let cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            fanout.run(consumer, cancel).await;
        }));
    }

    for i in 1..=cfg.dispatch.workers {
        let svc = Arc::new(DispatchService::new(
            delivery_sink.clone(),
            None,
            cfg.dispatch.opt_out_policy,
            cfg.dispatch.send_concurrency,
            format!("notif-worker-{i}"),
        ));
        let consumer = bus_handle
            .consumer(&cfg.bus.dispatch_subscription, cfg.dispatch.max_in_flight)
            .await?;
        let cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            svc.run(consumer, cancel).await;
        }));
    }

    let event = ContentPublishedEvent::new(&args.creator_id, &args.content_id, &args.title);
    let msg_id = bus_handle
        .publish(&cfg.bus.content_topic, serde_json::to_vec(&event)?)
        .await?;
    info!(
        %msg_id,
        creator = %event.creator_id,
        content = %event.content_id,
        title = %event.title,
        "published content event"
    );

    // Wait for the pipeline to drain, or Ctrl-C.
    loop {
        tokio::select! {
            _ = sleep(Duration::from_millis(200)) => {
                let backlog = bus_handle.depth(&cfg.bus.fanout_subscription).await?
                    + bus_handle.depth(&cfg.bus.dispatch_subscription).await?;
                if backlog == 0 {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; shutting down");
                break;
            }
        }
    }

    cancel.cancel();
    for worker in workers {
        let _ = worker.await;
    }

    let total = match &stores {
        Stores::Memory { sink, .. } => sink.total_for_content(&args.content_id).await as i64,
        Stores::Sqlite { pool } => sqlite::total_for_content(pool, &args.content_id).await?,
    };
    info!(total, content = %args.content_id, "pipeline drained");

    if let Stores::Memory { sink, .. } = &stores {
        let sample_user = format!("user_{}_0", args.creator_id);
        if let Some(notif) = sink.records_for(&sample_user).await.into_iter().next() {
            info!(
                user = %sample_user,
                notif_id = %notif.notif_id,
                title = %notif.title,
                "sample notification"
            );
        }
    }

    Ok(())
}
