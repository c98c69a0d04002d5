mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use hubsync_core::config::DEFAULT_STREAM_PREFIX;
use hubsync_core::prelude::*;
use hubsync_core::stream::subscriber_position_id;
use hubsync_mem::{InMemoryHub, InMemoryStream, InMemorySyncStore};

fn event_ids(entries: &[StreamEntry]) -> Vec<u64> {
    entries.iter().map(|e| e.event.id).collect()
}

fn fids(entries: &[StreamEntry]) -> Vec<u64> {
    entries.iter().filter_map(|e| e.event.fid()).collect()
}

async fn subscribed(hub: &InMemoryHub, count: usize) {
    wait_until("hub subscription", move || async move {
        hub.subscriber_count().await == count
    })
    .await;
}

async fn stream_len(stream: &InMemoryStream, key: &str, len: usize) {
    wait_until("stream entries", move || async move {
        stream.len(key).await >= len
    })
    .await;
}

async fn handled(recorder: &OrderRecorder, len: usize) {
    wait_until("handled entries", move || async move {
        recorder.handled.lock().await.len() >= len
    })
    .await;
}

async fn append_all(stream: &InMemoryStream, key: &str, ids: impl IntoIterator<Item = u64>) {
    for id in ids {
        stream
            .append(key, &HubEvent::new(id, merge(cast(id, 1))))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn a_shard_only_buffers_the_fids_it_owns() {
    init_logs();
    for hub_filters in [true, false] {
        let hub = shared(InMemoryHub::new());
        hub.set_filter_shards(hub_filters).await;
        let stream = shared(InMemoryStream::new());
        let shard = ShardConfig::new(2, 0).unwrap();
        let key = shard.stream_key(DEFAULT_STREAM_PREFIX);
        let subscriber = HubSubscriber::new(hub.clone(), stream.clone(), fast_subscriber(shard));

        subscriber.start().await.unwrap();
        subscribed(&hub, 1).await;
        for fid in 1..=4 {
            hub.publish(merge(cast(fid, 1))).await;
        }
        // A closing event for an owned fid marks the end of the sequence.
        hub.publish(merge(cast(6, 1))).await;
        stream_len(&stream, &key, 3).await;
        subscriber.stop().await.unwrap();

        assert_eq!(key, "hub:events:0");
        assert_eq!(fids(&stream.entries(&key).await), vec![2, 4, 6]);
        assert_eq!(stream.len("hub:events:1").await, 0);
    }
}

#[tokio::test]
async fn the_subscriber_resumes_without_duplicates_after_a_disconnect() {
    init_logs();
    let hub = shared(InMemoryHub::new());
    let stream = shared(InMemoryStream::new());
    let shard = ShardConfig::unsharded();
    let key = shard.stream_key(DEFAULT_STREAM_PREFIX);
    let subscriber = HubSubscriber::new(hub.clone(), stream.clone(), fast_subscriber(shard));

    subscriber.start().await.unwrap();
    subscribed(&hub, 1).await;
    hub.publish(merge(cast(1, 1))).await;
    hub.publish(merge(cast(2, 1))).await;
    stream_len(&stream, &key, 2).await;

    hub.disconnect_subscribers().await;
    // Published while nobody listens; the reconnect must fetch it from history.
    hub.publish(merge(cast(3, 1))).await;
    stream_len(&stream, &key, 3).await;
    subscribed(&hub, 1).await;
    hub.publish(merge(cast(4, 1))).await;
    stream_len(&stream, &key, 4).await;

    assert_eq!(event_ids(&stream.entries(&key).await), vec![1, 2, 3, 4]);
    assert_eq!(subscriber.position(), Some(4));
    subscriber.stop().await.unwrap();
    assert_eq!(
        stream
            .get_checkpoint(&subscriber_position_id("all"))
            .await
            .unwrap(),
        Some(4)
    );
}

#[tokio::test]
async fn a_restarted_subscriber_continues_from_its_persisted_position() {
    init_logs();
    let hub = shared(InMemoryHub::new());
    let stream = shared(InMemoryStream::new());
    let shard = ShardConfig::unsharded();
    let key = shard.stream_key(DEFAULT_STREAM_PREFIX);

    let first = HubSubscriber::new(hub.clone(), stream.clone(), fast_subscriber(shard));
    first.start().await.unwrap();
    subscribed(&hub, 1).await;
    hub.publish(merge(cast(1, 1))).await;
    hub.publish(merge(cast(2, 1))).await;
    stream_len(&stream, &key, 2).await;
    first.stop().await.unwrap();

    hub.publish(merge(cast(3, 1))).await;
    hub.publish(merge(cast(4, 1))).await;

    let second = HubSubscriber::new(hub.clone(), stream.clone(), fast_subscriber(shard));
    second.start().await.unwrap();
    stream_len(&stream, &key, 4).await;
    second.stop().await.unwrap();

    assert_eq!(event_ids(&stream.entries(&key).await), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn replayed_hub_events_are_dropped() {
    init_logs();
    let hub = shared(InMemoryHub::new());
    let stream = shared(InMemoryStream::new());
    let shard = ShardConfig::unsharded();
    let key = shard.stream_key(DEFAULT_STREAM_PREFIX);
    let subscriber = HubSubscriber::new(hub.clone(), stream.clone(), fast_subscriber(shard));

    subscriber.start().await.unwrap();
    subscribed(&hub, 1).await;
    let first = hub.publish(merge(cast(1, 1))).await;
    let second = hub.publish(merge(cast(2, 1))).await;
    stream_len(&stream, &key, 2).await;

    hub.publish_event(first).await;
    hub.publish_event(second).await;
    hub.publish(merge(cast(3, 1))).await;
    stream_len(&stream, &key, 3).await;
    subscriber.stop().await.unwrap();

    assert_eq!(event_ids(&stream.entries(&key).await), vec![1, 2, 3]);
}

#[tokio::test]
async fn failed_appends_are_retried_in_order() {
    init_logs();
    let hub = shared(InMemoryHub::new());
    let stream = shared(InMemoryStream::new());
    let shard = ShardConfig::unsharded();
    let key = shard.stream_key(DEFAULT_STREAM_PREFIX);
    let subscriber = HubSubscriber::new(hub.clone(), stream.clone(), fast_subscriber(shard));

    subscriber.start().await.unwrap();
    subscribed(&hub, 1).await;
    stream.fail_next_appends(3).await;
    hub.publish(merge(cast(1, 1))).await;
    hub.publish(merge(cast(2, 1))).await;
    stream_len(&stream, &key, 2).await;
    subscriber.stop().await.unwrap();

    assert_eq!(event_ids(&stream.entries(&key).await), vec![1, 2]);
}

#[tokio::test]
async fn an_unreachable_hub_is_retried_until_it_recovers() {
    init_logs();
    let hub = shared(InMemoryHub::new());
    hub.set_available(false).await;
    let stream = shared(InMemoryStream::new());
    let shard = ShardConfig::unsharded();
    let key = shard.stream_key(DEFAULT_STREAM_PREFIX);
    let subscriber = HubSubscriber::new(hub.clone(), stream.clone(), fast_subscriber(shard));

    subscriber.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(subscriber.is_running().await);
    assert_eq!(hub.subscriber_count().await, 0);

    hub.set_available(true).await;
    subscribed(&hub, 1).await;
    hub.publish(merge(cast(1, 1))).await;
    stream_len(&stream, &key, 1).await;
    subscriber.stop().await.unwrap();
}

#[tokio::test]
async fn starting_twice_or_stopping_an_idle_component_fails() {
    init_logs();
    let hub = shared(InMemoryHub::new());
    let stream = shared(InMemoryStream::new());
    let subscriber = HubSubscriber::new(
        hub.clone(),
        stream.clone(),
        fast_subscriber(ShardConfig::unsharded()),
    );
    assert!(subscriber.stop().await.is_err());
    subscriber.start().await.unwrap();
    assert!(subscriber.start().await.is_err());
    subscriber.stop().await.unwrap();

    let invalid = HubSubscriber::new(
        hub,
        stream.clone(),
        fast_subscriber(ShardConfig {
            total_shards: 2,
            shard_index: 2,
        }),
    );
    let err = invalid.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let consumer = StreamConsumer::new(
        stream,
        ConsumerConfig {
            batch_size: 0,
            ..fast_consumer(ShardConfig::unsharded())
        },
    );
    let err = consumer
        .start(shared(OrderRecorder::default()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn consumers_handle_each_shard_in_order() {
    init_logs();
    let hub = shared(InMemoryHub::new());
    let stream = shared(InMemoryStream::new());
    let mut pipelines = Vec::new();
    for index in 0..2 {
        let shard = ShardConfig::new(2, index).unwrap();
        let subscriber = HubSubscriber::new(hub.clone(), stream.clone(), fast_subscriber(shard));
        let consumer = StreamConsumer::new(stream.clone(), fast_consumer(shard));
        let recorder = shared(OrderRecorder::default());
        subscriber.start().await.unwrap();
        consumer.start(recorder.clone()).await.unwrap();
        pipelines.push((subscriber, consumer, recorder));
    }
    subscribed(&hub, 2).await;

    for fid in 1..=6 {
        hub.publish(merge(cast(fid, 1))).await;
    }
    for (_, _, recorder) in &pipelines {
        handled(recorder, 3).await;
    }

    assert_eq!(pipelines[0].2.handled().await, vec![2, 4, 6]);
    assert_eq!(pipelines[1].2.handled().await, vec![1, 3, 5]);
    for (subscriber, consumer, _) in &pipelines {
        consumer.stop().await.unwrap();
        subscriber.stop().await.unwrap();
    }
    assert_eq!(pipelines[0].1.checkpoint().await.unwrap(), Some(3));
    assert_eq!(pipelines[0].1.consumer_id(), "hubsync:0");
}

#[tokio::test]
async fn a_restarted_consumer_picks_up_after_its_checkpoint() {
    init_logs();
    let stream = shared(InMemoryStream::new());
    let shard = ShardConfig::unsharded();
    let key = shard.stream_key(DEFAULT_STREAM_PREFIX);
    append_all(&stream, &key, 1..=3).await;

    let consumer = StreamConsumer::new(stream.clone(), fast_consumer(shard));
    let first = shared(OrderRecorder::default());
    consumer.start(first.clone()).await.unwrap();
    handled(&first, 3).await;
    consumer.stop().await.unwrap();

    append_all(&stream, &key, 4..=5).await;
    let restarted = StreamConsumer::new(stream.clone(), fast_consumer(shard));
    let second = shared(OrderRecorder::default());
    restarted.start(second.clone()).await.unwrap();
    handled(&second, 2).await;
    restarted.stop().await.unwrap();

    assert_eq!(first.handled().await, vec![1, 2, 3]);
    assert_eq!(second.handled().await, vec![4, 5]);
}

#[tokio::test]
async fn an_entry_handled_but_not_checkpointed_is_redelivered() {
    init_logs();
    let stream = shared(InMemoryStream::new());
    let shard = ShardConfig::unsharded();
    let key = shard.stream_key(DEFAULT_STREAM_PREFIX);
    append_all(&stream, &key, 1..=5).await;
    let consumer = StreamConsumer::new(stream.clone(), fast_consumer(shard));

    // Entry 3 was handled before a crash, but only entry 2 reached the checkpoint.
    stream.set_checkpoint(&consumer.consumer_id(), 2).await.unwrap();

    let recorder = shared(OrderRecorder::default());
    consumer.start(recorder.clone()).await.unwrap();
    handled(&recorder, 3).await;
    consumer.stop().await.unwrap();

    assert_eq!(recorder.handled().await, vec![3, 4, 5]);
    assert_eq!(consumer.checkpoint().await.unwrap(), Some(5));
}

#[tokio::test]
async fn a_failing_entry_blocks_its_successors_until_it_succeeds() {
    init_logs();
    let stream = shared(InMemoryStream::new());
    let shard = ShardConfig::unsharded();
    let key = shard.stream_key(DEFAULT_STREAM_PREFIX);
    append_all(&stream, &key, 1..=3).await;

    let recorder = shared(OrderRecorder::default());
    *recorder.failing.lock().await = Some(2);
    let consumer = StreamConsumer::new(stream.clone(), fast_consumer(shard));
    consumer.start(recorder.clone()).await.unwrap();

    let attempts = recorder.clone();
    wait_until("retries of entry 2", move || {
        let attempts = attempts.clone();
        async move { attempts.attempts.lock().await.iter().filter(|id| **id == 2).count() >= 3 }
    })
    .await;
    assert_eq!(recorder.handled().await, vec![1]);
    assert_eq!(consumer.checkpoint().await.unwrap(), Some(1));

    *recorder.failing.lock().await = None;
    handled(&recorder, 3).await;
    consumer.stop().await.unwrap();

    assert_eq!(recorder.handled().await, vec![1, 2, 3]);
    assert_eq!(consumer.checkpoint().await.unwrap(), Some(3));
}

#[tokio::test]
async fn stream_read_failures_are_retried() {
    init_logs();
    let stream = shared(InMemoryStream::new());
    let shard = ShardConfig::unsharded();
    let key = shard.stream_key(DEFAULT_STREAM_PREFIX);
    append_all(&stream, &key, 1..=2).await;
    stream.fail_next_reads(2).await;

    let recorder = shared(OrderRecorder::default());
    let consumer = StreamConsumer::new(stream.clone(), fast_consumer(shard));
    consumer.start(recorder.clone()).await.unwrap();
    handled(&recorder, 2).await;
    consumer.stop().await.unwrap();

    assert_eq!(recorder.handled().await, vec![1, 2]);
}

#[tokio::test]
async fn batched_checkpoints_are_flushed_when_idle_and_on_stop() {
    init_logs();
    let stream = shared(InMemoryStream::new());
    let shard = ShardConfig::unsharded();
    let key = shard.stream_key(DEFAULT_STREAM_PREFIX);
    append_all(&stream, &key, 1..=5).await;

    let config = ConsumerConfig {
        checkpoint_mode: CheckpointMode::batched(3, Duration::from_secs(60)),
        ..fast_consumer(shard)
    };
    let consumer = StreamConsumer::new(stream.clone(), config.clone());
    let recorder = shared(OrderRecorder::default());
    consumer.start(recorder.clone()).await.unwrap();
    handled(&recorder, 5).await;

    let consumer_ref = &consumer;
    wait_until("idle checkpoint flush", move || async move {
        consumer_ref.checkpoint().await.ok().flatten() == Some(5)
    })
    .await;
    consumer.stop().await.unwrap();

    // Entries handled right before stop are flushed by the shutdown path.
    append_all(&stream, &key, 6..=7).await;
    let restarted = StreamConsumer::new(stream.clone(), config);
    let second = shared(OrderRecorder::default());
    restarted.start(second.clone()).await.unwrap();
    handled(&second, 2).await;
    restarted.stop().await.unwrap();
    assert_eq!(restarted.checkpoint().await.unwrap(), Some(7));
}

#[tokio::test]
async fn the_full_pipeline_applies_hub_events_to_the_store() {
    init_logs();
    let hub = shared(InMemoryHub::new());
    let stream = shared(InMemoryStream::new());
    let store = shared(InMemorySyncStore::new());
    let handler = shared(RecordingHandler::default());
    let processor: Arc<EventProcessor<InMemorySyncStore, RecordingHandler>> =
        shared(EventProcessor::new(store.clone(), handler.clone()));
    let shard = ShardConfig::unsharded();

    let subscriber = HubSubscriber::new(hub.clone(), stream.clone(), fast_subscriber(shard));
    let consumer = StreamConsumer::new(stream.clone(), fast_consumer(shard));
    subscriber.start().await.unwrap();
    consumer.start(processor).await.unwrap();
    subscribed(&hub, 1).await;

    hub.publish(merge(cast(1, 1))).await;
    hub.publish(merge(cast(1, 2))).await;
    hub.publish(HubEventBody::PruneMessage {
        message: cast(1, 1),
    })
    .await;

    let store_ref = &*store;
    wait_until("hub events applied", move || async move {
        store_ref.hub_event_ids().await.len() == 3
    })
    .await;
    consumer.stop().await.unwrap();
    subscriber.stop().await.unwrap();

    let pruned = store.message(1, &cast(1, 1).hash).await.unwrap();
    assert!(pruned.pruned_at.is_some());
    assert_eq!(
        store.message(1, &cast(1, 2).hash).await.unwrap().state(),
        MessageState::Created
    );
    assert_eq!(handler.writes().await.len(), 3);
}
