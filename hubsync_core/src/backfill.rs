//! Bulk reconciliation of the fid space through the task queue.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::{BackfillConfig, HubConfig, ReconcileConfig};
use crate::error::{BoxError, SyncError};
use crate::hub::{HubClient, with_timeout};
use crate::lifecycle::{TaskHandle, is_shutdown, sleep_unless_shutdown};
use crate::message::{Message, StoredMessage};
use crate::processor::{EventProcessor, MessageHandler};
use crate::queue::{BackfillTask, CompletionMarker, QueuedTask, ReconciliationBatch, TaskQueue};
use crate::reconcile::{
    HubMessageDivergence, MessageReconciliation, MessageReconciliationHandler,
    ProofReconciliationOutcome, UsernameProofReconciliation, UsernameProofReconciliationHandler,
};
use crate::store::SyncStore;
use crate::username_proof::{StoredUsernameProof, UserNameProof};

/// Splits `[1, max_fid]` into consecutive batches of at most `batch_size` fids.
pub fn plan_batches(max_fid: u64, batch_size: u64) -> Vec<ReconciliationBatch> {
    if max_fid == 0 || batch_size == 0 {
        return Vec::new();
    }
    let mut batches = Vec::with_capacity(max_fid.div_ceil(batch_size) as usize);
    let mut start = 1;
    while start <= max_fid {
        let end = start.saturating_add(batch_size - 1).min(max_fid);
        batches.push(ReconciliationBatch {
            fids: (start..=end).collect(),
        });
        start = end + 1;
    }
    batches
}

/// What [`Backfiller::backfill_fids`] enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillPlan {
    pub task_ids: Vec<Uuid>,
    /// Number of reconcile tasks, the completion marker excluded.
    pub batches: usize,
    /// The upper bound used for a full backfill.
    pub max_fid: Option<u64>,
}

/// Enqueues reconciliation work.
pub struct Backfiller<H, Q>
where
    H: HubClient,
    Q: TaskQueue,
{
    hub: Arc<H>,
    queue: Arc<Q>,
    config: BackfillConfig,
    hub_config: HubConfig,
}

impl<H, Q> Backfiller<H, Q>
where
    H: HubClient,
    Q: TaskQueue,
{
    pub fn new(hub: Arc<H>, queue: Arc<Q>, config: BackfillConfig) -> Self {
        Self::with_hub_config(hub, queue, config, HubConfig::default())
    }

    pub fn with_hub_config(
        hub: Arc<H>,
        queue: Arc<Q>,
        config: BackfillConfig,
        hub_config: HubConfig,
    ) -> Self {
        Self {
            hub,
            queue,
            config,
            hub_config,
        }
    }

    /// Enqueues reconciliation of `fids`, or of every fid when `fids` is empty.
    ///
    /// A full backfill enqueues one task per batch in fid order followed by a completion
    /// marker. An explicit fid list becomes a single task.
    pub async fn backfill_fids(&self, fids: &[u64]) -> Result<BackfillPlan, SyncError> {
        if !fids.is_empty() {
            let mut seen = HashSet::with_capacity(fids.len());
            let mut unique = Vec::with_capacity(fids.len());
            for fid in fids {
                if seen.insert(*fid) {
                    unique.push(*fid);
                }
            }
            info!("Enqueuing reconciliation of {} fids", unique.len());
            let id = self.queue.enqueue(BackfillTask::reconcile(unique)).await?;
            return Ok(BackfillPlan {
                task_ids: vec![id],
                batches: 1,
                max_fid: None,
            });
        }

        if self.config.batch_size == 0 {
            return Err(SyncError::Configuration(
                "backfill batch size must be positive".to_string(),
            ));
        }

        let started_at = Utc::now();
        let max_fid = self.resolve_max_fid().await?;
        let batches = plan_batches(max_fid, self.config.batch_size);
        info!(
            "Starting backfill of fids 1..={} in {} batches of {}",
            max_fid,
            batches.len(),
            self.config.batch_size
        );

        let mut task_ids = Vec::with_capacity(batches.len() + 1);
        let batch_count = batches.len();
        for batch in batches {
            task_ids.push(self.queue.enqueue(BackfillTask::Reconcile(batch)).await?);
        }
        task_ids.push(
            self.queue
                .enqueue(BackfillTask::Complete(CompletionMarker { started_at }))
                .await?,
        );

        Ok(BackfillPlan {
            task_ids,
            batches: batch_count,
            max_fid: Some(max_fid),
        })
    }

    async fn resolve_max_fid(&self) -> Result<u64, SyncError> {
        let max_fid = match self.config.max_fid {
            Some(max_fid) => Some(max_fid),
            None => {
                with_timeout(self.hub_config.rpc_timeout, self.hub.get_info())
                    .await?
                    .max_fid
            }
        };
        match max_fid {
            Some(max_fid) if max_fid > 0 => Ok(max_fid),
            _ => Err(SyncError::MissingMetadata(
                "the hub did not report a max fid".to_string(),
            )),
        }
    }
}

/// Counts of one reconcile task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub fids: usize,
    pub failed_fids: Vec<u64>,
    pub repaired_messages: usize,
    pub repaired_proofs: usize,
}

/// Drains the task queue with a bounded pool, repairing what reconciliation finds.
pub struct BackfillWorker<H, S, MH, Q>
where
    H: HubClient + 'static,
    S: SyncStore + 'static,
    MH: MessageHandler<S::Transaction> + 'static,
    Q: TaskQueue + 'static,
{
    messages: MessageReconciliation<H, S>,
    proofs: UsernameProofReconciliation<H, S>,
    processor: EventProcessor<S, MH>,
    queue: Arc<Q>,
    config: BackfillConfig,
    state: Arc<Mutex<Option<TaskHandle>>>,
}

impl<H, S, MH, Q> Clone for BackfillWorker<H, S, MH, Q>
where
    H: HubClient + 'static,
    S: SyncStore + 'static,
    MH: MessageHandler<S::Transaction> + 'static,
    Q: TaskQueue + 'static,
{
    fn clone(&self) -> Self {
        Self {
            messages: self.messages.clone(),
            proofs: self.proofs.clone(),
            processor: self.processor.clone(),
            queue: self.queue.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
        }
    }
}

impl<H, S, MH, Q> BackfillWorker<H, S, MH, Q>
where
    H: HubClient + 'static,
    S: SyncStore + 'static,
    MH: MessageHandler<S::Transaction> + 'static,
    Q: TaskQueue + 'static,
{
    pub fn new(
        hub: Arc<H>,
        processor: EventProcessor<S, MH>,
        queue: Arc<Q>,
        config: BackfillConfig,
        reconcile_config: ReconcileConfig,
        hub_config: HubConfig,
    ) -> Self {
        let store = processor.store().clone();
        Self {
            messages: MessageReconciliation::with_hub_config(
                hub.clone(),
                store.clone(),
                reconcile_config,
                hub_config.clone(),
            ),
            proofs: UsernameProofReconciliation::new(hub, store, hub_config),
            processor,
            queue,
            config,
            state: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawns the worker loop.
    pub async fn start(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(SyncError::Lifecycle(
                "backfill worker is already running".to_string(),
            ));
        }
        let worker = self.clone();
        info!(
            "Starting backfill worker with concurrency {}",
            self.config.concurrency.max(1)
        );
        *state = Some(TaskHandle::spawn(move |shutdown_rx| {
            worker.run(shutdown_rx, false)
        }));
        Ok(())
    }

    /// Stops leasing tasks and waits for the in-flight ones to finish.
    pub async fn stop(&self) -> Result<(), SyncError> {
        let handle = self.state.lock().await.take();
        match handle {
            Some(handle) => handle.shutdown().await,
            None => Err(SyncError::Lifecycle(
                "backfill worker was not started".to_string(),
            )),
        }
    }

    /// Processes tasks until none is ready and none is in flight.
    pub async fn run_until_idle(&self) {
        // Held so the loop never observes a closed channel.
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        self.clone().run(shutdown_rx, true).await;
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<bool>, exit_when_idle: bool) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            if is_shutdown(&shutdown_rx) {
                break;
            }
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!("Backfill task panicked: {}", e);
                }
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit,
                _ = shutdown_rx.changed() => break,
            };
            let Ok(permit) = permit else {
                break;
            };

            match self.queue.dequeue().await {
                Ok(Some(queued)) => {
                    let worker = self.clone();
                    in_flight.spawn(async move {
                        worker.execute(queued).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if exit_when_idle {
                        if in_flight.is_empty() {
                            break;
                        }
                        // A running task may still be nacked back onto the queue.
                        if let Some(Err(e)) = in_flight.join_next().await {
                            error!("Backfill task panicked: {}", e);
                        }
                        continue;
                    }
                    if sleep_unless_shutdown(self.config.poll_interval, &mut shutdown_rx).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(
                        "Failed to dequeue a backfill task: {}. Retrying in {:?}",
                        e, self.config.poll_interval
                    );
                    if sleep_unless_shutdown(self.config.poll_interval, &mut shutdown_rx).await {
                        break;
                    }
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Backfill task panicked: {}", e);
            }
        }
        info!("Backfill worker stopped");
    }

    async fn execute(&self, queued: QueuedTask) {
        debug!(
            "Running backfill task {} ({}, attempt {})",
            queued.id,
            queued.task.name(),
            queued.attempts + 1
        );
        match self.run_task(&queued.task).await {
            Ok(report) => {
                if let BackfillTask::Reconcile(_) = queued.task {
                    debug!(
                        "Backfill task {} reconciled {} fids, repaired {} messages and {} proofs",
                        queued.id, report.fids, report.repaired_messages, report.repaired_proofs
                    );
                }
                if let Err(e) = self.queue.ack(queued.id).await {
                    error!("Failed to ack backfill task {}: {}", queued.id, e);
                }
            }
            Err(e) => {
                warn!("Backfill task {} failed: {}", queued.id, e);
                if let Err(nack_err) = self.queue.nack(queued.id, &e.to_string()).await {
                    error!("Failed to nack backfill task {}: {}", queued.id, nack_err);
                }
            }
        }
    }

    /// Runs one task. A reconcile task attempts every fid and fails if any of them failed.
    pub async fn run_task(&self, task: &BackfillTask) -> Result<BatchReport, SyncError> {
        match task {
            BackfillTask::Reconcile(batch) => self.reconcile_batch(batch).await,
            BackfillTask::Complete(marker) => {
                let elapsed = Utc::now().signed_duration_since(marker.started_at);
                info!(
                    "Backfill started at {} completed after {}s",
                    marker.started_at,
                    elapsed.num_seconds()
                );
                Ok(BatchReport::default())
            }
        }
    }

    async fn reconcile_batch(&self, batch: &ReconciliationBatch) -> Result<BatchReport, SyncError> {
        let mut report = BatchReport {
            fids: batch.fids.len(),
            ..BatchReport::default()
        };
        for fid in &batch.fids {
            match self.reconcile_fid(*fid).await {
                Ok((messages, proofs)) => {
                    report.repaired_messages += messages;
                    report.repaired_proofs += proofs;
                }
                Err(e) => {
                    error!("Failed to reconcile fid {}: {}", fid, e);
                    report.failed_fids.push(*fid);
                }
            }
        }
        if report.failed_fids.is_empty() {
            Ok(report)
        } else {
            Err(SyncError::PartialBatch {
                failed: report.failed_fids.len(),
                total: report.fids,
            })
        }
    }

    async fn reconcile_fid(&self, fid: u64) -> Result<(usize, usize), SyncError> {
        let repair = Repair::new(self.processor.clone());
        self.messages
            .reconcile_messages_for_fid(fid, &repair)
            .await?;
        let repaired_messages = repair.repaired();

        let mut repaired_proofs = 0;
        if self.config.include_username_proofs {
            let proof_repair = Repair::new(self.processor.clone());
            let outcome = self
                .proofs
                .reconcile_username_proofs_for_fid(fid, &proof_repair, None, None, None)
                .await?;
            if let ProofReconciliationOutcome::Skipped { reason } = outcome {
                warn!("Username proof reconciliation of fid {} skipped: {}", fid, reason);
            }
            repaired_proofs = proof_repair.repaired();
        }
        Ok((repaired_messages, repaired_proofs))
    }
}

/// Routes reconciliation findings to the processor and logs the rest.
struct Repair<S, MH>
where
    S: SyncStore,
    MH: MessageHandler<S::Transaction>,
{
    processor: EventProcessor<S, MH>,
    repaired: AtomicUsize,
}

impl<S, MH> Repair<S, MH>
where
    S: SyncStore,
    MH: MessageHandler<S::Transaction>,
{
    fn new(processor: EventProcessor<S, MH>) -> Self {
        Self {
            processor,
            repaired: AtomicUsize::new(0),
        }
    }

    fn repaired(&self) -> usize {
        self.repaired.load(Ordering::Relaxed)
    }

    fn count_repair(&self) {
        self.repaired.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl<S, MH> MessageReconciliationHandler for Repair<S, MH>
where
    S: SyncStore + 'static,
    MH: MessageHandler<S::Transaction> + 'static,
{
    async fn on_hub_message(
        &self,
        message: &Message,
        divergence: HubMessageDivergence,
    ) -> Result<(), BoxError> {
        if divergence.missing_in_db {
            let outcome = self.processor.handle_missing_message(message).await?;
            if outcome.is_new {
                self.count_repair();
            }
        } else if !divergence.is_consistent() {
            warn!(
                "Message {} of fid {} is live on the hub but deleted in the db (pruned: {}, revoked: {})",
                message.hash, message.fid, divergence.pruned_in_db, divergence.revoked_in_db
            );
        }
        Ok(())
    }

    async fn on_db_message(
        &self,
        stored: &StoredMessage,
        _missing_in_hub: bool,
    ) -> Result<(), BoxError> {
        if stored.deleted_at.is_none() {
            warn!(
                "Message {} of fid {} is live in the db but missing on the hub",
                stored.message.hash, stored.message.fid
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<S, MH> UsernameProofReconciliationHandler for Repair<S, MH>
where
    S: SyncStore + 'static,
    MH: MessageHandler<S::Transaction> + 'static,
{
    async fn on_hub_proof(&self, proof: &UserNameProof, missing_in_db: bool) -> Result<(), BoxError> {
        if missing_in_db && self.processor.handle_missing_username_proof(proof).await? {
            self.count_repair();
        }
        Ok(())
    }

    async fn on_db_proof(
        &self,
        stored: &StoredUsernameProof,
        _missing_in_hub: bool,
    ) -> Result<(), BoxError> {
        warn!(
            "Username proof '{}' of fid {} is in the db but missing on the hub",
            stored.proof.name, stored.proof.fid
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_cover_the_fid_space_in_order() {
        let batches = plan_batches(25, 10);
        let fids: Vec<Vec<u64>> = batches.into_iter().map(|b| b.fids).collect();
        assert_eq!(
            fids,
            vec![
                (1..=10).collect::<Vec<u64>>(),
                (11..=20).collect(),
                (21..=25).collect(),
            ]
        );
    }

    #[test]
    fn exact_multiple_has_no_empty_tail() {
        let batches = plan_batches(20, 10);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].fids.last(), Some(&20));
    }

    #[test]
    fn empty_space_has_no_batches() {
        assert!(plan_batches(0, 10).is_empty());
        assert!(plan_batches(10, 0).is_empty());
    }

    #[test]
    fn batch_larger_than_space_is_one_batch() {
        let batches = plan_batches(3, 100);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].fids, vec![1, 2, 3]);
    }
}
