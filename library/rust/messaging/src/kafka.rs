//! rdkafka を使用した TopicWriter / MessageReader 実装。
//! feature = "kafka" で有効化される。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};

use crate::config::MessagingConfig;
use crate::error::{BoxError, MessagingError};
use crate::transport::{ConsumedMessage, MessageReader, OutboundMessage, TopicWriter, WriterFactory};

/// KafkaWriterFactory はトピックごとに FutureProducer を生成する。
pub struct KafkaWriterFactory {
    config: MessagingConfig,
}

impl KafkaWriterFactory {
    pub fn new(config: MessagingConfig) -> Self {
        Self { config }
    }
}

impl WriterFactory for KafkaWriterFactory {
    fn create(&self, topic: &str) -> Result<Arc<dyn TopicWriter>, MessagingError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", self.config.brokers_string())
            .set("security.protocol", &self.config.security_protocol)
            .set("acks", self.config.required_acks.as_kafka_value())
            // バッチは linger.ms の時間窓で自動的にフラッシュされる
            .set("linger.ms", self.config.batch_timeout_ms.to_string())
            .set("message.timeout.ms", self.config.message_timeout_ms.to_string())
            .create()
            .map_err(|e| MessagingError::Connection {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Arc::new(KafkaTopicWriter {
            producer,
            topic: topic.to_string(),
            timeout: Duration::from_millis(self.config.message_timeout_ms),
        }))
    }
}

/// KafkaTopicWriter は 1 トピック専用の FutureProducer ラッパー。
pub struct KafkaTopicWriter {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

#[async_trait]
impl TopicWriter for KafkaTopicWriter {
    async fn write(&self, message: OutboundMessage) -> Result<(), BoxError> {
        let record = FutureRecord::to(&self.topic)
            .key(&message.key)
            .payload(&message.value)
            .timestamp(message.timestamp.timestamp_millis());

        self.producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map(|_| ())
            .map_err(|(err, _)| Box::new(err) as BoxError)
    }

    /// flush は librdkafka の同期呼び出しなので、ブロッキングスレッドで実行する。
    async fn close(&self) -> Result<(), BoxError> {
        let producer = self.producer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await?
            .map_err(|e| Box::new(e) as BoxError)
    }
}

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// コンシューマー用の ClientConfig を組み立てる。group_id はプレフィックス付与済みの値を渡す。
fn consumer_client_config(config: &MessagingConfig, group_id: &str) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.brokers_string())
        .set("security.protocol", &config.security_protocol)
        .set("group.id", group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("fetch.min.bytes", config.fetch_min_bytes.to_string())
        .set("fetch.max.bytes", config.fetch_max_bytes.to_string());
    client
}

/// KafkaMessageReader は rdkafka の StreamConsumer を使った実装。
/// オートコミットは無効化し、ハンドラー成功後に明示的にコミットする。
pub struct KafkaMessageReader {
    consumer: Arc<StreamConsumer>,
}

impl KafkaMessageReader {
    pub fn new(
        config: &MessagingConfig,
        topic: &str,
        group_id: &str,
    ) -> Result<Self, MessagingError> {
        let consumer: StreamConsumer = consumer_client_config(config, group_id)
            .create()
            .map_err(|e| MessagingError::Connection {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| MessagingError::Connection {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!(topic = %topic, group = %group_id, "kafka consumer subscribed");
        Ok(Self {
            consumer: Arc::new(consumer),
        })
    }
}

#[async_trait]
impl MessageReader for KafkaMessageReader {
    async fn fetch(&self) -> Result<ConsumedMessage, BoxError> {
        let msg = self.consumer.recv().await.map_err(|e| Box::new(e) as BoxError)?;

        Ok(ConsumedMessage {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(<[u8]>::to_vec),
            value: msg.payload().unwrap_or_default().to_vec(),
            timestamp: msg
                .timestamp()
                .to_millis()
                .and_then(DateTime::from_timestamp_millis),
        })
    }

    async fn commit(&self, message: &ConsumedMessage) -> Result<(), BoxError> {
        // コミットするのは「次に読む位置」なので offset + 1
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )
        .map_err(|e| Box::new(e) as BoxError)?;

        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await?
            .map_err(|e| Box::new(e) as BoxError)
    }

    async fn rewind(&self, message: &ConsumedMessage) -> Result<(), BoxError> {
        let consumer = Arc::clone(&self.consumer);
        let topic = message.topic.clone();
        let partition = message.partition;
        let offset = message.offset;
        tokio::task::spawn_blocking(move || {
            consumer.seek(&topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)
        })
        .await?
        .map_err(|e| Box::new(e) as BoxError)
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.consumer.unsubscribe();
        Ok(())
    }
}
