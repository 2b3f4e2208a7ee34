use async_trait::async_trait;
use serde_json::json;
use signalbus::autoflush::retry_on_integrity_error;
use signalbus::bus::SignalBus;
use signalbus::channel::{ChannelConfig, DeliveryChannel, InMemoryBroker, Message, Publisher};
use signalbus::error::{SignalBusError, SignalBusResult};
use signalbus::flush::FlushEngine;
use signalbus::registry::SignalRegistry;
use signalbus::retry::{Backoff, RetryPolicy};
use signalbus::signal::{PendingEvent, RowId, Signal, SignalDescriptor};
use signalbus::store::InMemoryOutboxStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct RelaySignal {
    descriptor: SignalDescriptor,
    batches: Mutex<Vec<usize>>,
}

impl RelaySignal {
    fn new(name: &str, autoflush: bool) -> Arc<Self> {
        Arc::new(Self {
            descriptor: SignalDescriptor::builder()
                .name(name)
                .autoflush(autoflush)
                .build(),
            batches: Mutex::new(Vec::new()),
        })
    }

    fn batches(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl Signal for RelaySignal {
    fn descriptor(&self) -> SignalDescriptor {
        self.descriptor.clone()
    }

    async fn send_one(
        &self,
        publisher: &mut dyn Publisher,
        event: &PendingEvent,
    ) -> SignalBusResult<()> {
        self.batches.lock().unwrap().push(1);
        let message = Message::for_event(event, "signals", event.signal(), event.payload())?;
        publisher.publish(message).await
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff: Backoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(10),
            multiplier: 2.0,
            jitter: 0.0,
        },
    }
}

fn bus(
    store: &InMemoryOutboxStore,
    broker: &InMemoryBroker,
    signal: Arc<dyn Signal>,
) -> SignalBus {
    let registry = SignalRegistry::new().with(signal).unwrap();
    let config = ChannelConfig {
        reconnect: fast_retry(2),
        ..ChannelConfig::default()
    };
    let engine = FlushEngine::builder()
        .registry(Arc::new(registry))
        .store(Arc::new(store.clone()))
        .delivery_channel(DeliveryChannel::new(Arc::new(broker.clone()), config))
        .build();
    SignalBus::new(Arc::new(engine)).with_conflict_retry(fast_retry(5))
}

#[tokio::test]
async fn commit_flushes_rows_added_in_the_transaction() {
    let store = InMemoryOutboxStore::new();
    let broker = InMemoryBroker::new();
    let transfer = RelaySignal::new("transfer", true);
    let bus = bus(&store, &broker, transfer.clone());

    let mut uow = bus.begin().await.unwrap();
    for amount in [10, 20, 30] {
        uow.add("transfer", json!({"amount": amount})).await.unwrap();
    }
    let report = uow.commit().await.unwrap();

    assert_eq!(report.committed.total(), 3);
    let autoflush = report.autoflush.expect("hook attached");
    assert_eq!(autoflush.sent, 3);
    assert!(autoflush.failures.is_empty());
    // burst_count 为 1：逐行发送
    assert_eq!(transfer.batches(), vec![1, 1, 1]);
    assert_eq!(store.len("transfer"), 0);
    assert_eq!(
        broker.published_ids(),
        vec!["transfer:1", "transfer:2", "transfer:3"]
    );
}

#[tokio::test]
async fn signals_without_autoflush_wait_for_an_explicit_flush() {
    let store = InMemoryOutboxStore::new();
    let broker = InMemoryBroker::new();
    let audit = RelaySignal::new("audit", false);
    let bus = bus(&store, &broker, audit.clone());

    let mut uow = bus.begin().await.unwrap();
    uow.add("audit", json!({"who": "alice"})).await.unwrap();
    let report = uow.commit().await.unwrap();
    assert_eq!(report.autoflush.map(|r| r.sent), Some(0));
    assert_eq!(store.len("audit"), 1);
    assert!(broker.published().is_empty());

    assert_eq!(bus.flush(None).await.unwrap(), 1);
    assert_eq!(store.len("audit"), 0);
}

#[tokio::test]
async fn rollback_discards_rows_without_flushing() {
    let store = InMemoryOutboxStore::new();
    let broker = InMemoryBroker::new();
    let bus = bus(&store, &broker, RelaySignal::new("transfer", true));

    let mut uow = bus.begin().await.unwrap();
    uow.add("transfer", json!({})).await.unwrap();
    uow.rollback().await.unwrap();

    assert_eq!(store.len("transfer"), 0);
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn failed_commit_does_not_flush() {
    let store = InMemoryOutboxStore::new();
    let broker = InMemoryBroker::new();
    let bus = bus(&store, &broker, RelaySignal::new("transfer", true));
    store.fail_next_commits(1);

    let mut uow = bus.begin().await.unwrap();
    uow.add("transfer", json!({})).await.unwrap();
    let err = uow.commit().await.unwrap_err();

    assert!(err.is_conflict());
    assert_eq!(store.len("transfer"), 0);
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn rows_removed_in_the_same_transaction_are_not_flushed() {
    let store = InMemoryOutboxStore::new();
    let broker = InMemoryBroker::new();
    let bus = bus(&store, &broker, RelaySignal::new("transfer", true));

    let mut uow = bus.begin().await.unwrap();
    let kept = uow.add("transfer", json!({"n": 1})).await.unwrap();
    let dropped = uow.add("transfer", json!({"n": 2})).await.unwrap();
    assert_eq!(uow.remove("transfer", &[dropped]).await.unwrap(), 1);
    assert_eq!(uow.added("transfer"), vec![kept]);
    let report = uow.commit().await.unwrap();

    assert_eq!(report.committed.rows("transfer"), &[kept]);
    assert_eq!(broker.published_ids(), vec![format!("transfer:{kept}")]);
    assert_eq!(store.len("transfer"), 0);
}

#[tokio::test]
async fn autoflush_failure_keeps_the_commit() {
    let store = InMemoryOutboxStore::new();
    let broker = InMemoryBroker::new();
    let bus = bus(&store, &broker, RelaySignal::new("transfer", true));
    broker.set_online(false);

    let mut uow = bus.begin().await.unwrap();
    uow.add("transfer", json!({})).await.unwrap();
    uow.add("transfer", json!({})).await.unwrap();
    let report = uow.commit().await.unwrap();

    let autoflush = report.autoflush.expect("hook attached");
    assert_eq!(autoflush.sent, 0);
    assert_eq!(autoflush.failures.len(), 1);
    assert!(autoflush.failures[0].is_retryable());
    assert_eq!(store.len("transfer"), 2);

    // 代理恢复后由全量刷新补发
    broker.set_online(true);
    assert_eq!(bus.flush(None).await.unwrap(), 2);
    assert_eq!(store.len("transfer"), 0);
}

#[tokio::test]
async fn atomic_block_is_rerun_on_serialization_conflict() {
    let store = InMemoryOutboxStore::new();
    let broker = InMemoryBroker::new();
    let bus = bus(&store, &broker, RelaySignal::new("transfer", true));
    store.fail_next_commits(2);

    let attempts = Arc::new(AtomicUsize::new(0));
    let (id, report) = bus
        .atomic(|uow| {
            let attempts = attempts.clone();
            Box::pin(async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                uow.add("transfer", json!({"amount": 10})).await
            })
        })
        .await
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    // 行标识序列不随回滚而回退
    assert_eq!(id, RowId::new(3));
    assert_eq!(report.autoflush.map(|r| r.sent), Some(1));
    assert_eq!(broker.published_ids(), vec!["transfer:3"]);
}

#[tokio::test]
async fn atomic_block_error_rolls_back() {
    let store = InMemoryOutboxStore::new();
    let broker = InMemoryBroker::new();
    let bus = bus(&store, &broker, RelaySignal::new("transfer", true));

    let outcome: SignalBusResult<((), _)> = bus
        .atomic(|uow| {
            Box::pin(async move {
                uow.add("transfer", json!({})).await?;
                Err::<(), _>(SignalBusError::Processing {
                    reason: "insufficient funds".into(),
                })
            })
        })
        .await;

    assert!(matches!(outcome, Err(SignalBusError::Processing { .. })));
    assert_eq!(store.len("transfer"), 0);
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn integrity_race_reruns_the_block_when_opted_in() {
    let store = InMemoryOutboxStore::new();
    let broker = InMemoryBroker::new();
    let bus = bus(&store, &broker, RelaySignal::new("transfer", true));

    // 首次执行时另一事务抢先写入同一主键；重跑时检查到已存在
    let attempts = Arc::new(AtomicUsize::new(0));
    let (existed, report) = bus
        .atomic(|uow| {
            let attempts = attempts.clone();
            Box::pin(async move {
                if attempts.fetch_add(1, Ordering::SeqCst) > 0 {
                    return Ok(true);
                }
                retry_on_integrity_error(async {
                    uow.add("transfer", json!({"account": 7})).await?;
                    Err::<bool, SignalBusError>(SignalBusError::integrity(
                        "duplicate key value violates unique constraint",
                    ))
                })
                .await
            })
        })
        .await
        .unwrap();

    assert!(existed);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(report.committed.is_empty());
    assert_eq!(store.len("transfer"), 0);
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn integrity_violation_is_not_retried_by_default() {
    let store = InMemoryOutboxStore::new();
    let broker = InMemoryBroker::new();
    let bus = bus(&store, &broker, RelaySignal::new("transfer", true));

    let attempts = Arc::new(AtomicUsize::new(0));
    let outcome = bus
        .atomic(|uow| {
            let attempts = attempts.clone();
            Box::pin(async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                uow.add("transfer", json!({"account": 7})).await?;
                Err::<(), _>(SignalBusError::integrity("duplicate key"))
            })
        })
        .await;

    assert!(matches!(
        outcome,
        Err(SignalBusError::IntegrityViolation { .. })
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(store.len("transfer"), 0);
}
