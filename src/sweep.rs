//! Retention sweeper: expiry-based mailbox deletion and age-based
//! message pruning, on independent cadences.

use crate::config::RetentionConfig;
use crate::error::Result;
use crate::store::{MailboxDirectory, MessageStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

/// Time-driven cleanup over the two stores.
pub struct RetentionSweeper {
    retention: RetentionConfig,
    directory: Arc<MailboxDirectory>,
    messages: Arc<MessageStore>,
    shutdown_tx: RwLock<Option<watch::Sender<bool>>>,
    task: RwLock<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RetentionSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionSweeper")
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl RetentionSweeper {
    pub fn new(
        retention: RetentionConfig,
        directory: Arc<MailboxDirectory>,
        messages: Arc<MessageStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            retention,
            directory,
            messages,
            shutdown_tx: RwLock::new(None),
            task: RwLock::new(None),
        })
    }

    /// Start both sweep timers in one background task.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.task.read().await.is_some() {
            return Err(anyhow::anyhow!("retention sweeper already started").into());
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let sweeper = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut expiry_ticker = tokio::time::interval(Duration::from_secs(
                sweeper.retention.expiry_sweep_interval_secs.max(60),
            ));
            let mut prune_ticker = tokio::time::interval(Duration::from_secs(
                sweeper.retention.prune_interval_secs.max(60),
            ));
            expiry_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            prune_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = expiry_ticker.tick() => {
                        match sweeper.sweep_expired(Utc::now()).await {
                            Ok(0) => {}
                            Ok(swept) => tracing::info!(swept, "expired mailboxes removed"),
                            Err(error) => tracing::error!(%error, "expiry sweep failed"),
                        }
                    }
                    _ = prune_ticker.tick() => {
                        match sweeper.prune_aged(Utc::now()).await {
                            Ok(0) => {}
                            Ok(pruned) => tracing::info!(pruned, "aged messages pruned"),
                            Err(error) => tracing::error!(%error, "message pruning failed"),
                        }
                    }
                }
            }

            tracing::info!("retention sweeper stopped");
        });

        *self.task.write().await = Some(task);
        Ok(())
    }

    pub async fn shutdown(&self) {
        if let Some(shutdown_tx) = self.shutdown_tx.write().await.take() {
            shutdown_tx.send(true).ok();
        }

        if let Some(task) = self.task.write().await.take() {
            if let Err(error) = task.await {
                tracing::warn!(%error, "sweeper task join failed during shutdown");
            }
        }
    }

    /// Remove every mailbox whose expiry has passed, cascading message
    /// deletes. Idempotent: a second run over the same state is a no-op.
    /// Safe to interleave with ingestion; delivery lookups already refuse
    /// expired mailboxes, so nothing re-attaches mid-sweep.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let expired = self.directory.list_expired(now).await?;
        let mut swept = 0;

        for mailbox in expired {
            if self.directory.delete_cascade(&mailbox.id).await? {
                swept += 1;
                tracing::debug!(address = %mailbox.address, "expired mailbox swept");
            }
        }

        Ok(swept)
    }

    /// Delete messages older than the configured age, regardless of
    /// mailbox state. A storage safety net, not a per-mailbox policy.
    pub async fn prune_aged(&self, now: DateTime<Utc>) -> Result<u64> {
        if !self.retention.auto_prune {
            return Ok(0);
        }

        let cutoff = now - ChronoDuration::days(i64::from(self.retention.prune_after_days));
        self.messages.delete_older_than(cutoff).await
    }
}
