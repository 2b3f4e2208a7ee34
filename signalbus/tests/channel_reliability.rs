use async_trait::async_trait;
use serde_json::{Value, json};
use signalbus::channel::{
    ChannelConfig, ChannelState, Consumer, ConsumerConfig, DeliveryChannel, InMemoryBroker,
    Message, MessageProcessor, PublishFault,
};
use signalbus::error::SignalBusError;
use signalbus::retry::{Backoff, RetryPolicy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

fn job(id: &str, body: Value) -> Message {
    Message::builder()
        .message_id(id)
        .routing_key("jobs")
        .body(serde_json::to_vec(&body).unwrap())
        .build()
}

fn config() -> ChannelConfig {
    ChannelConfig {
        poll_interval: Duration::from_millis(100),
        reconnect: RetryPolicy {
            max_attempts: 3,
            backoff: Backoff {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(1),
                multiplier: 2.0,
                jitter: 0.0,
            },
        },
        ..ChannelConfig::default()
    }
}

fn channel(broker: &InMemoryBroker) -> DeliveryChannel {
    DeliveryChannel::new(Arc::new(broker.clone()), config())
}

/// 根据消息体决定处理结果：`ok` 成功，`bad` 拒绝，`boom` 失败
#[derive(Default)]
struct ScriptedProcessor {
    seen: Mutex<Vec<String>>,
    processed: AtomicUsize,
}

#[async_trait]
impl MessageProcessor for ScriptedProcessor {
    async fn process(&self, message: &Message) -> anyhow::Result<bool> {
        self.seen
            .lock()
            .unwrap()
            .push(message.message_id().to_string());
        let body: Value = message.decode()?;
        match body["kind"].as_str() {
            Some("ok") => {
                self.processed.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            Some("bad") => Ok(false),
            _ => anyhow::bail!("cannot handle {}", message.message_id()),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn reconnect_backs_off_and_gives_up_after_max_attempts() {
    let broker = InMemoryBroker::new();
    broker.set_online(false);
    let mut ch = channel(&broker);

    let started = Instant::now();
    let err = ch.publish(job("a", json!({}))).await.unwrap_err();
    assert!(matches!(err, SignalBusError::Connection { .. }));
    assert_eq!(broker.connect_attempts(), 3);
    // 两次退避：100ms + 200ms
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(ch.state(), ChannelState::Disconnected);

    broker.set_online(true);
    ch.publish(job("a", json!({}))).await.unwrap();
    assert_eq!(ch.generation(), 1);
    assert_eq!(broker.published_ids(), vec!["a"]);
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_publish_times_out_and_drops_the_link() {
    let broker = InMemoryBroker::new();
    broker.fault_on_publish(1, PublishFault::Hang);
    let mut ch = channel(&broker);

    let err = ch.publish(job("a", json!({}))).await.unwrap_err();
    assert!(matches!(
        err,
        SignalBusError::Timeout {
            operation: "publish",
            ..
        }
    ));
    assert!(err.is_retryable());
    assert_eq!(ch.state(), ChannelState::Disconnected);

    // 下一次发布透明地重连
    ch.publish(job("a", json!({}))).await.unwrap();
    assert_eq!(ch.generation(), 2);
    assert_eq!(broker.published_ids(), vec!["a"]);
}

#[tokio::test]
async fn nack_and_return_surface_as_delivery_errors() {
    let broker = InMemoryBroker::new();
    broker.fault_on_publish(1, PublishFault::Nack("queue full".into()));
    broker.fault_on_publish(2, PublishFault::Return("no route".into()));
    let mut ch = channel(&broker);

    for id in ["a", "b"] {
        let err = ch.publish(job(id, json!({}))).await.unwrap_err();
        assert!(matches!(err, SignalBusError::Delivery { .. }));
        assert!(!err.is_retryable());
    }
    // 拒绝确认不影响连接本身
    assert_eq!(ch.state(), ChannelState::Ready);
    assert_eq!(ch.generation(), 1);
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn reconnect_invalidates_outstanding_ack_handles() {
    let broker = InMemoryBroker::new();
    broker.push("jobs", job("a", json!({"kind": "ok"})));
    let mut ch = channel(&broker);
    let mut consumption = ch.consume("jobs");

    let first = consumption.next().await.unwrap();
    assert!(!first.redelivered());
    assert_eq!(first.handle().generation(), 1);

    broker.disconnect_all();
    let err = consumption.try_next().await.unwrap_err();
    assert!(err.is_connection());

    // 重连后未确认的消息被重新投递
    let second = consumption.next().await.unwrap();
    assert!(second.redelivered());
    assert_eq!(second.message().message_id(), "a");
    assert_eq!(second.handle().generation(), 2);

    assert!(matches!(
        consumption.ack(first.handle()).await,
        Err(SignalBusError::Delivery { .. })
    ));
    consumption.ack(second.handle()).await.unwrap();
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_len("jobs"), 0);
}

#[tokio::test]
async fn consumer_acks_rejects_and_stops_on_processing_error() {
    let broker = InMemoryBroker::new();
    broker.push("jobs", job("m1", json!({"kind": "ok"})));
    broker.push("jobs", job("m2", json!({"kind": "bad"})));
    broker.push("jobs", job("m3", json!({"kind": "boom"})));
    broker.push("jobs", job("m4", json!({"kind": "ok"})));

    let processor = Arc::new(ScriptedProcessor::default());
    let mut consumer = Consumer::builder()
        .channel(channel(&broker))
        .queue("jobs")
        .processor(processor.clone())
        .build();

    let err = consumer.run().await.unwrap_err();
    assert!(matches!(err, SignalBusError::Processing { .. }));
    assert_eq!(processor.processed.load(Ordering::SeqCst), 1);
    assert_eq!(*processor.seen.lock().unwrap(), vec!["m1", "m2", "m3"]);

    let dead: Vec<String> = broker
        .dead_letters()
        .iter()
        .map(|m| m.message_id().to_string())
        .collect();
    assert_eq!(dead, vec!["m2"]);
    // m3 重新入队，排在 m4 之前
    assert_eq!(broker.queue_len("jobs"), 2);
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn stopping_a_consumer_terminates_consumption() {
    let broker = InMemoryBroker::new();
    let processor = Arc::new(ScriptedProcessor::default());
    let consumer = Consumer::builder()
        .channel(channel(&broker))
        .queue("jobs")
        .processor(processor.clone())
        .build();
    let stop = consumer.stop_token();

    let task = tokio::spawn(async move {
        let mut consumer = consumer;
        consumer.run().await
    });
    broker.push("jobs", job("m1", json!({"kind": "ok"})));
    tokio::time::sleep(Duration::from_millis(300)).await;
    stop.cancel();

    let outcome = task.await.unwrap();
    assert!(matches!(outcome, Err(SignalBusError::TerminatedConsumption)));
    assert_eq!(processor.processed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn draining_mode_pauses_after_idle_polls() {
    let broker = InMemoryBroker::new();
    let processor = Arc::new(ScriptedProcessor::default());
    let consumer = Consumer::builder()
        .channel(channel(&broker))
        .queue("jobs")
        .processor(processor.clone())
        .config(ConsumerConfig {
            draining_mode: true,
            idle_polls_before_pause: 2,
            draining_pause: Duration::from_secs(10),
            ..ConsumerConfig::default()
        })
        .build();
    let stop = consumer.stop_token();
    let task = tokio::spawn(async move {
        let mut consumer = consumer;
        consumer.run().await
    });

    // 两次空轮询（约 200ms）后暂停 10s，期间到达的消息暂不处理
    tokio::time::sleep(Duration::from_secs(5)).await;
    broker.push("jobs", job("m1", json!({"kind": "ok"})));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(broker.queue_len("jobs"), 1);
    assert_eq!(processor.processed.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(processor.processed.load(Ordering::SeqCst), 1);
    assert_eq!(broker.queue_len("jobs"), 0);

    stop.cancel();
    assert!(matches!(
        task.await.unwrap(),
        Err(SignalBusError::TerminatedConsumption)
    ));
}

#[tokio::test]
async fn stopped_consumer_leaves_the_channel_usable() {
    let broker = InMemoryBroker::new();
    let mut consumer = Consumer::builder()
        .channel(channel(&broker))
        .queue("jobs")
        .processor(Arc::new(ScriptedProcessor::default()))
        .build();
    consumer.stop();
    assert!(matches!(
        consumer.run().await,
        Err(SignalBusError::TerminatedConsumption)
    ));

    let mut ch = consumer.into_channel();
    assert!(!ch.shutdown_token().is_cancelled());
    ch.publish(job("after-stop", json!({}))).await.unwrap();
    assert_eq!(broker.published_ids(), vec!["after-stop"]);
}

#[tokio::test]
async fn channel_shutdown_also_stops_the_consumer() {
    let broker = InMemoryBroker::new();
    let ch = channel(&broker);
    let shutdown = ch.shutdown_token();
    let mut consumer = Consumer::builder()
        .channel(ch)
        .queue("jobs")
        .processor(Arc::new(ScriptedProcessor::default()))
        .build();
    shutdown.cancel();
    assert!(matches!(
        consumer.run().await,
        Err(SignalBusError::TerminatedConsumption)
    ));
    assert!(!consumer.stop_token().is_cancelled());
}
