//! Entry points that wire the sync components together.
//!
//! Each command takes already constructed collaborators (Hub client, stream, store, queue)
//! so the same wiring serves the in-memory and the Postgres backends.

use std::sync::Arc;

use hubsync_core::prelude::*;
use log::{error, info};

/// Settings for [`start`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Hub call settings shared by the subscriber.
    pub hub: HubConfig,
    /// Subscriber settings.
    pub subscriber: SubscriberConfig,
    /// Consumer settings.
    pub consumer: ConsumerConfig,
}

impl StartOptions {
    /// Default settings for the subscriber/consumer pair owning `shard`.
    pub fn for_shard(shard: ShardConfig) -> Self {
        Self {
            hub: HubConfig::default(),
            subscriber: SubscriberConfig::for_shard(shard),
            consumer: ConsumerConfig::for_shard(shard),
        }
    }
}

/// A running subscriber/consumer pair for one shard.
pub struct SyncPipeline<H, S, St, MH>
where
    H: HubClient + 'static,
    S: DurableStream + 'static,
    St: SyncStore + 'static,
    MH: MessageHandler<St::Transaction> + 'static,
{
    subscriber: HubSubscriber<H, S>,
    consumer: StreamConsumer<S>,
    processor: Arc<EventProcessor<St, MH>>,
}

impl<H, S, St, MH> SyncPipeline<H, S, St, MH>
where
    H: HubClient + 'static,
    S: DurableStream + 'static,
    St: SyncStore + 'static,
    MH: MessageHandler<St::Transaction> + 'static,
{
    /// The subscriber feeding the stream.
    pub fn subscriber(&self) -> &HubSubscriber<H, S> {
        &self.subscriber
    }

    /// The consumer applying the stream to the store.
    pub fn consumer(&self) -> &StreamConsumer<S> {
        &self.consumer
    }

    /// The processor the consumer hands entries to.
    pub fn processor(&self) -> &Arc<EventProcessor<St, MH>> {
        &self.processor
    }

    /// Stops the subscriber, then lets the consumer finish its in-flight entry.
    ///
    /// Both are stopped even if the first fails; the first error is returned.
    pub async fn stop(&self) -> Result<(), SyncError> {
        let subscriber = self.subscriber.stop().await;
        let consumer = self.consumer.stop().await;
        info!("Stopped sync pipeline '{}'", self.consumer.consumer_id());
        subscriber.and(consumer)
    }
}

/// Starts a subscriber and a consumer for one shard, the consumer applying every entry
/// through `processor`.
///
/// The subscriber and the consumer must own the same shard and read the same stream.
pub async fn start<H, S, St, MH>(
    hub: Arc<H>,
    stream: Arc<S>,
    processor: EventProcessor<St, MH>,
    options: StartOptions,
) -> Result<SyncPipeline<H, S, St, MH>, SyncError>
where
    H: HubClient + 'static,
    S: DurableStream + 'static,
    St: SyncStore + 'static,
    MH: MessageHandler<St::Transaction> + 'static,
{
    if options.subscriber.shard != options.consumer.shard {
        return Err(SyncError::Configuration(format!(
            "subscriber shard {:?} does not match consumer shard {:?}",
            options.subscriber.shard, options.consumer.shard
        )));
    }
    if options.subscriber.stream_prefix != options.consumer.stream_prefix {
        return Err(SyncError::Configuration(format!(
            "subscriber writes '{}' but the consumer reads '{}'",
            options.subscriber.stream_prefix, options.consumer.stream_prefix
        )));
    }

    let processor = Arc::new(processor);
    let subscriber =
        HubSubscriber::with_hub_config(hub, stream.clone(), options.subscriber, options.hub);
    let consumer = StreamConsumer::new(stream, options.consumer);

    subscriber.start().await?;
    if let Err(e) = consumer.start(processor.clone()).await {
        if let Err(stop_err) = subscriber.stop().await {
            error!("Failed to stop subscriber after consumer failure: {}", stop_err);
        }
        return Err(e);
    }

    info!("Started sync pipeline '{}'", consumer.consumer_id());
    Ok(SyncPipeline {
        subscriber,
        consumer,
        processor,
    })
}

/// Enqueues reconciliation of `fids`, or of the whole fid space when `fids` is empty.
pub async fn backfill<H, Q>(
    hub: Arc<H>,
    queue: Arc<Q>,
    config: BackfillConfig,
    hub_config: HubConfig,
    fids: &[u64],
) -> Result<BackfillPlan, SyncError>
where
    H: HubClient,
    Q: TaskQueue,
{
    let backfiller = Backfiller::with_hub_config(hub, queue, config, hub_config);
    let plan = backfiller.backfill_fids(fids).await?;
    info!(
        "Enqueued {} backfill tasks ({} batches)",
        plan.task_ids.len(),
        plan.batches
    );
    Ok(plan)
}

/// Settings for [`worker`].
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Hub call settings.
    pub hub: HubConfig,
    /// Pool size, polling and proof settings.
    pub backfill: BackfillConfig,
    /// What message reconciliation compares.
    pub reconcile: ReconcileConfig,
}

/// Starts a backfill worker draining `queue`. Stop it with [`BackfillWorker::stop`].
pub async fn worker<H, St, MH, Q>(
    hub: Arc<H>,
    processor: EventProcessor<St, MH>,
    queue: Arc<Q>,
    options: WorkerOptions,
) -> Result<BackfillWorker<H, St, MH, Q>, SyncError>
where
    H: HubClient + 'static,
    St: SyncStore + 'static,
    MH: MessageHandler<St::Transaction> + 'static,
    Q: TaskQueue + 'static,
{
    let worker = BackfillWorker::new(
        hub,
        processor,
        queue,
        options.backfill,
        options.reconcile,
        options.hub,
    );
    worker.start().await?;
    Ok(worker)
}
