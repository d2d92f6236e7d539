//! Dispatch service: competing workers expand notification batches into
//! per-user sends against the delivery sink.

use anyhow::{anyhow, Context, Result};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::bus::{CancelFlag, Consumer};
use crate::model::{BatchOutcome, DeliveryRecord, NotificationBatch, OptOutPolicy};
use crate::store::{DeliverySink, OptOutStore};

pub struct DispatchService {
    sink: Arc<dyn DeliverySink>,
    opt_out: Option<Arc<dyn OptOutStore>>,
    opt_out_policy: OptOutPolicy,
    send_concurrency: usize,
    worker: String,
}

impl DispatchService {
    pub fn new(
        sink: Arc<dyn DeliverySink>,
        opt_out: Option<Arc<dyn OptOutStore>>,
        opt_out_policy: OptOutPolicy,
        send_concurrency: usize,
        worker: String,
    ) -> Self {
        Self {
            sink,
            opt_out,
            opt_out_policy,
            send_concurrency,
            worker,
        }
    }

    /// Process one batch: filter opted-out users, send to the rest with
    /// bounded concurrency, and report the outcome.
    ///
    /// Individual send failures never abort the remaining sends; if any send
    /// failed the whole call errors so the caller nacks and the batch is
    /// redelivered in full. Already-sent users are then replayed against the
    /// sink, which absorbs them idempotently.
    #[instrument(skip_all, fields(worker = %self.worker))]
    pub async fn handle_batch(&self, payload: &[u8]) -> Result<BatchOutcome> {
        let batch: NotificationBatch =
            serde_json::from_slice(payload).context("malformed notification-batch payload")?;

        let (recipients, skipped) = self.filter_recipients(&batch).await;
        let total = recipients.len();

        let results: Vec<(DeliveryRecord, Result<()>)> = stream::iter(recipients)
            .map(|user_id| {
                let record = DeliveryRecord::new(user_id, &batch);
                async move {
                    let res = self.sink.record(&record).await;
                    (record, res)
                }
            })
            .buffer_unordered(self.send_concurrency.max(1))
            .collect()
            .await;

        let mut sent = 0u32;
        let mut failed = 0u32;
        for (record, res) in results {
            match res {
                Ok(()) => sent += 1,
                Err(err) => {
                    failed += 1;
                    warn!(
                        ?err,
                        user_id = %record.user_id,
                        batch_id = %batch.batch_id,
                        "notification send failed"
                    );
                }
            }
        }

        if failed > 0 {
            return Err(anyhow!(
                "{failed} of {total} sends failed for batch {}",
                batch.batch_id
            ));
        }

        info!(
            batch_id = %batch.batch_id,
            title = %batch.title,
            sent,
            skipped,
            "batch dispatched"
        );
        Ok(BatchOutcome { sent, skipped })
    }

    async fn filter_recipients(&self, batch: &NotificationBatch) -> (Vec<String>, u32) {
        let opt_out = match &self.opt_out {
            Some(store) => store,
            None => return (batch.follower_ids.clone(), 0),
        };
        let mut recipients = Vec::with_capacity(batch.follower_ids.len());
        let mut skipped = 0u32;
        for user_id in &batch.follower_ids {
            match opt_out.is_opted_out(user_id).await {
                Ok(true) => skipped += 1,
                Ok(false) => recipients.push(user_id.clone()),
                Err(err) => match self.opt_out_policy {
                    OptOutPolicy::FailOpen => {
                        warn!(?err, user_id = %user_id, "opt-out lookup failed; sending anyway");
                        recipients.push(user_id.clone());
                    }
                    OptOutPolicy::FailClosed => {
                        warn!(?err, user_id = %user_id, "opt-out lookup failed; skipping user");
                        skipped += 1;
                    }
                },
            }
        }
        (recipients, skipped)
    }

    /// Worker loop: compete for batches, ack clean batches, nack poison or
    /// partially failed ones. Exits once `cancel` fires, after resolving any
    /// in-flight batch.
    pub async fn run(&self, consumer: Consumer, cancel: CancelFlag) {
        info!(worker = %self.worker, "dispatch worker listening");
        while let Some(delivery) = consumer.recv(&cancel).await {
            match self.handle_batch(&delivery.payload).await {
                Ok(_) => delivery.acker.ack().await,
                Err(err) => {
                    warn!(
                        ?err,
                        worker = %self.worker,
                        message_id = %delivery.message_id,
                        attempt = delivery.attempt,
                        "batch failed; nacking"
                    );
                    delivery.acker.nack().await;
                }
            }
        }
        info!(worker = %self.worker, "dispatch worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryDeliverySink, MemoryOptOutStore};

    fn batch(users: &[&str]) -> Vec<u8> {
        let batch = NotificationBatch::compose(
            "c1",
            "v1",
            "hello",
            users.iter().map(|u| u.to_string()).collect(),
        );
        serde_json::to_vec(&batch).unwrap()
    }

    fn service(
        sink: Arc<MemoryDeliverySink>,
        opt_out: Option<Arc<MemoryOptOutStore>>,
        policy: OptOutPolicy,
    ) -> DispatchService {
        DispatchService::new(
            sink,
            opt_out.map(|s| s as Arc<dyn OptOutStore>),
            policy,
            4,
            "notif-worker-1".into(),
        )
    }

    #[tokio::test]
    async fn sends_to_every_user_in_the_batch() {
        let sink = Arc::new(MemoryDeliverySink::new());
        let svc = service(sink.clone(), None, OptOutPolicy::FailOpen);

        let outcome = svc.handle_batch(&batch(&["u1", "u2", "u3"])).await.unwrap();
        assert_eq!(outcome, BatchOutcome { sent: 3, skipped: 0 });
        assert_eq!(sink.total_recorded().await, 3);
    }

    #[tokio::test]
    async fn opted_out_users_are_skipped() {
        let sink = Arc::new(MemoryDeliverySink::new());
        let opt_out = Arc::new(MemoryOptOutStore::new());
        opt_out.opt_out("u2").await;
        let svc = service(sink.clone(), Some(opt_out), OptOutPolicy::FailOpen);

        let outcome = svc.handle_batch(&batch(&["u1", "u2", "u3"])).await.unwrap();
        assert_eq!(outcome, BatchOutcome { sent: 2, skipped: 1 });
        assert!(sink.records_for("u2").await.is_empty());
    }

    #[tokio::test]
    async fn lookup_outage_fail_open_sends_anyway() {
        let sink = Arc::new(MemoryDeliverySink::new());
        let opt_out = Arc::new(MemoryOptOutStore::new());
        opt_out.fail_lookups(true);
        let svc = service(sink.clone(), Some(opt_out), OptOutPolicy::FailOpen);

        let outcome = svc.handle_batch(&batch(&["u1", "u2"])).await.unwrap();
        assert_eq!(outcome, BatchOutcome { sent: 2, skipped: 0 });
    }

    #[tokio::test]
    async fn lookup_outage_fail_closed_skips() {
        let sink = Arc::new(MemoryDeliverySink::new());
        let opt_out = Arc::new(MemoryOptOutStore::new());
        opt_out.fail_lookups(true);
        let svc = service(sink.clone(), Some(opt_out), OptOutPolicy::FailClosed);

        let outcome = svc.handle_batch(&batch(&["u1", "u2"])).await.unwrap();
        assert_eq!(outcome, BatchOutcome { sent: 0, skipped: 2 });
        assert_eq!(sink.total_recorded().await, 0);
    }

    #[tokio::test]
    async fn partial_failure_errors_but_keeps_successful_sends() {
        let sink = Arc::new(MemoryDeliverySink::new());
        sink.fail_once_for("u2").await;
        let svc = service(sink.clone(), None, OptOutPolicy::FailOpen);
        let payload = batch(&["u1", "u2", "u3"]);

        let err = svc.handle_batch(&payload).await.unwrap_err();
        assert!(err.to_string().contains("1 of 3"));
        assert_eq!(sink.total_recorded().await, 2);

        // Full-batch redelivery: replayed users are absorbed, the failed one
        // is finally recorded.
        let outcome = svc.handle_batch(&payload).await.unwrap();
        assert_eq!(outcome.sent, 3);
        assert_eq!(sink.total_recorded().await, 3);
        assert_eq!(sink.replayed().await, 2);
    }

    #[tokio::test]
    async fn malformed_batch_is_an_error() {
        let sink = Arc::new(MemoryDeliverySink::new());
        let svc = service(sink, None, OptOutPolicy::FailOpen);
        assert!(svc.handle_batch(b"{\"nope\": true}").await.is_err());
    }
}
