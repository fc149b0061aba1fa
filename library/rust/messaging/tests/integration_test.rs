use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use corekit_messaging::{
    handler_fn, BoxError, CancellationToken, ConsumedMessage, Envelope, MessageReader,
    MessagingError, OutboundMessage, Publisher, Subscriber, SubscriberConfig, TopicWriter,
    WriterFactory,
};
use corekit_retry::{with_retry, RetryConfig, RetryError};
use tokio::sync::mpsc;

// --- 単一パーティションのインメモリブローカー ---

struct ChannelWriter {
    topic: String,
    tx: mpsc::UnboundedSender<ConsumedMessage>,
    next_offset: Arc<AtomicI64>,
}

#[async_trait]
impl TopicWriter for ChannelWriter {
    async fn write(&self, message: OutboundMessage) -> Result<(), BoxError> {
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(ConsumedMessage {
                topic: self.topic.clone(),
                partition: 0,
                offset,
                key: Some(message.key),
                value: message.value,
                timestamp: Some(message.timestamp),
            })
            .map_err(|e| Box::new(e) as BoxError)
    }

    async fn close(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

struct ChannelFactory {
    tx: mpsc::UnboundedSender<ConsumedMessage>,
    next_offset: Arc<AtomicI64>,
    created: AtomicUsize,
}

impl WriterFactory for ChannelFactory {
    fn create(&self, topic: &str) -> Result<Arc<dyn TopicWriter>, MessagingError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ChannelWriter {
            topic: topic.to_string(),
            tx: self.tx.clone(),
            next_offset: Arc::clone(&self.next_offset),
        }))
    }
}

/// 受信済みメッセージをログとして保持し、rewind で読み込み位置を戻せるリーダー。
struct ChannelReader {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ConsumedMessage>>,
    log: Mutex<Vec<ConsumedMessage>>,
    position: Mutex<usize>,
    committed: Mutex<Vec<i64>>,
}

#[async_trait]
impl MessageReader for ChannelReader {
    async fn fetch(&self) -> Result<ConsumedMessage, BoxError> {
        {
            let log = self.log.lock().unwrap();
            let mut position = self.position.lock().unwrap();
            if let Some(message) = log.get(*position) {
                *position += 1;
                return Ok(message.clone());
            }
        }
        let message = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| BoxError::from("broker connection closed"))?;
        self.log.lock().unwrap().push(message.clone());
        *self.position.lock().unwrap() += 1;
        Ok(message)
    }

    async fn commit(&self, message: &ConsumedMessage) -> Result<(), BoxError> {
        self.committed.lock().unwrap().push(message.offset);
        Ok(())
    }

    async fn rewind(&self, message: &ConsumedMessage) -> Result<(), BoxError> {
        // 単一パーティションなのでオフセットがそのままログの添字になる
        *self.position.lock().unwrap() = usize::try_from(message.offset)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.rx.lock().await.close();
        Ok(())
    }
}

fn broker() -> (Arc<ChannelFactory>, Arc<ChannelReader>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(ChannelFactory {
            tx,
            next_offset: Arc::new(AtomicI64::new(0)),
            created: AtomicUsize::new(0),
        }),
        Arc::new(ChannelReader {
            rx: tokio::sync::Mutex::new(rx),
            log: Mutex::new(Vec::new()),
            position: Mutex::new(0),
            committed: Mutex::new(Vec::new()),
        }),
    )
}

#[tokio::test]
async fn test_publish_and_consume_envelopes() {
    let (factory, reader) = broker();
    let publisher = Publisher::new(factory.clone());
    let subscriber = Arc::new(Subscriber::new(
        reader.clone(),
        SubscriberConfig::new("orders", "order-projector"),
    ));
    let cancel = CancellationToken::new();

    let created =
        Envelope::create("order-service", "order.created", &serde_json::json!({"orderId": "123"}))
            .unwrap();
    let cancelled =
        Envelope::create("order-service", "order.cancelled", &serde_json::json!({"orderId": "123"}))
            .unwrap();
    publisher.publish_envelope(&cancel, "orders", &created).await.unwrap();
    publisher.publish_envelope(&cancel, "orders", &cancelled).await.unwrap();
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);

    let seen: Arc<Mutex<Vec<(String, HashMap<String, String>)>>> = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = Arc::clone(&seen);
        let stop = cancel.clone();
        handler_fn(move |_, message: ConsumedMessage| {
            let seen = Arc::clone(&seen);
            let stop = stop.clone();
            async move {
                let envelope = message.envelope()?;
                // type でルーティングしてからペイロードの型を決める
                let event_type = envelope.event_type();
                if event_type == "order.created" || event_type == "order.cancelled" {
                    let data: HashMap<String, String> = envelope.extract_payload()?;
                    let mut seen = seen.lock().unwrap();
                    seen.push((event_type.to_string(), data));
                    if seen.len() == 2 {
                        stop.cancel();
                    }
                }
                Ok::<(), BoxError>(())
            }
        })
    };

    let err = subscriber.consume(&cancel, &handler).await.unwrap_err();
    assert!(err.is_cancelled());

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].0, "order.created");
    assert_eq!(seen[1].0, "order.cancelled");
    assert_eq!(seen[0].1.get("orderId").map(String::as_str), Some("123"));
    assert_eq!(*reader.committed.lock().unwrap(), vec![0, 1]);

    publisher.close().await;
    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_message_is_redelivered_before_later_offsets_are_committed() {
    let (factory, reader) = broker();
    let publisher = Publisher::new(factory);
    let subscriber = Subscriber::new(reader.clone(), SubscriberConfig::new("orders", "projector"));
    let cancel = CancellationToken::new();

    for event_type in ["order.created", "order.paid"] {
        let envelope = Envelope::create("order-service", event_type, &serde_json::json!({})).unwrap();
        publisher.publish_envelope(&cancel, "orders", &envelope).await.unwrap();
    }

    // (offset, 処理結果) を記録する。offset 0 の初回だけ失敗させる。
    let attempts: Arc<Mutex<Vec<(i64, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let attempts = Arc::clone(&attempts);
        let stop = cancel.clone();
        handler_fn(move |_, message: ConsumedMessage| {
            let attempts = Arc::clone(&attempts);
            let stop = stop.clone();
            async move {
                let mut attempts = attempts.lock().unwrap();
                let ok = !attempts.is_empty();
                attempts.push((message.offset, ok));
                if !ok {
                    return Err::<(), BoxError>("projection store unavailable".into());
                }
                if message.offset == 1 {
                    stop.cancel();
                }
                message.envelope().map(|_| ()).map_err(BoxError::from)
            }
        })
    };

    assert!(subscriber.consume(&cancel, &handler).await.unwrap_err().is_cancelled());
    assert_eq!(*attempts.lock().unwrap(), vec![(0, false), (0, true), (1, true)]);
    assert_eq!(*reader.committed.lock().unwrap(), vec![0, 1]);
}

#[tokio::test]
async fn test_undecodable_message_is_never_committed() {
    let (factory, reader) = broker();
    let publisher = Publisher::new(factory);
    let subscriber = Subscriber::new(reader.clone(), SubscriberConfig::new("orders", "projector"));
    let cancel = CancellationToken::new();

    publisher
        .publish(&cancel, "orders", "raw", &serde_json::json!({"not": "an envelope"}))
        .await
        .unwrap();
    let valid = Envelope::create("order-service", "order.created", &serde_json::json!({})).unwrap();
    publisher.publish_envelope(&cancel, "orders", &valid).await.unwrap();

    let offsets = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let offsets = Arc::clone(&offsets);
        let stop = cancel.clone();
        handler_fn(move |_, message: ConsumedMessage| {
            let offsets = Arc::clone(&offsets);
            let stop = stop.clone();
            async move {
                let mut offsets = offsets.lock().unwrap();
                offsets.push(message.offset);
                if offsets.len() == 3 {
                    stop.cancel();
                }
                message.envelope().map(|_| ()).map_err(BoxError::from)
            }
        })
    };

    assert!(subscriber.consume(&cancel, &handler).await.unwrap_err().is_cancelled());
    // 読み込み位置が戻るため、後続のオフセットが先にコミットされることはない
    assert_eq!(*offsets.lock().unwrap(), vec![0, 0, 0]);
    assert!(reader.committed.lock().unwrap().is_empty());
}

// --- 呼び出し側でのリトライ ---

struct FlakyWriter {
    failures_left: AtomicU32,
    writes: AtomicU32,
}

#[async_trait]
impl TopicWriter for FlakyWriter {
    async fn write(&self, _message: OutboundMessage) -> Result<(), BoxError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err("not enough replicas".into());
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

struct SingleWriterFactory {
    writer: Arc<FlakyWriter>,
    created: AtomicUsize,
}

impl WriterFactory for SingleWriterFactory {
    fn create(&self, _topic: &str) -> Result<Arc<dyn TopicWriter>, MessagingError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.writer.clone())
    }
}

fn flaky(failures: u32) -> (Arc<FlakyWriter>, Arc<SingleWriterFactory>) {
    let writer = Arc::new(FlakyWriter {
        failures_left: AtomicU32::new(failures),
        writes: AtomicU32::new(0),
    });
    let factory = Arc::new(SingleWriterFactory {
        writer: writer.clone(),
        created: AtomicUsize::new(0),
    });
    (writer, factory)
}

#[tokio::test]
async fn test_caller_retries_publish_on_same_connection() {
    let (writer, factory) = flaky(2);
    let publisher = Publisher::new(factory.clone());
    let cancel = CancellationToken::new();
    let envelope =
        Envelope::create("order-service", "order.created", &serde_json::json!({"orderId": "123"}))
            .unwrap();
    let config = RetryConfig::new(4)
        .with_initial_delay(Duration::from_millis(1))
        .with_jitter(false);

    with_retry(&config, &cancel, "publish order.created", || {
        publisher.publish_envelope(&cancel, "orders", &envelope)
    })
    .await
    .unwrap();

    assert_eq!(writer.writes.load(Ordering::SeqCst), 3);
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_caller_retry_exhausted_keeps_publish_error() {
    let (writer, factory) = flaky(10);
    let publisher = Publisher::new(factory);
    let cancel = CancellationToken::new();
    let config = RetryConfig::new(2)
        .with_initial_delay(Duration::from_millis(1))
        .with_jitter(false);

    let payload = serde_json::json!({"orderId": "123"});
    let err = with_retry(&config, &cancel, "publish", || {
        publisher.publish(&cancel, "orders", "123", &payload)
    })
    .await
    .unwrap_err();

    match err {
        RetryError::ExhaustedRetries { attempts, last_error } => {
            assert_eq!(attempts, 2);
            assert!(matches!(last_error, MessagingError::Publish { .. }));
            assert!(last_error.to_string().contains("not enough replicas"));
        }
        RetryError::Cancelled => panic!("ExhaustedRetries が期待される"),
    }
    assert_eq!(writer.writes.load(Ordering::SeqCst), 2);
    assert_eq!(publisher.topics().await, vec!["orders"]);
}
