use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::error::MessagingError;
use crate::transport::{OutboundMessage, TopicWriter, WriterFactory};

/// Publisher はトピックごとに 1 本の書き込みコネクションを保持し、メッセージを発行する。
///
/// コネクションは初回発行時に遅延生成され、[`Publisher::close`] まで再利用される。
/// 送信失敗時に内部でリトライはしない。業務レベルで冪等かどうかを知っているのは呼び出し側なので、
/// 必要なら `corekit-retry` などで包んで再送する。
pub struct Publisher {
    factory: Arc<dyn WriterFactory>,
    writers: RwLock<HashMap<String, Arc<dyn TopicWriter>>>,
}

impl Publisher {
    pub fn new(factory: Arc<dyn WriterFactory>) -> Self {
        Self {
            factory,
            writers: RwLock::new(HashMap::new()),
        }
    }

    /// rdkafka を使用する Publisher を生成する。
    #[cfg(feature = "kafka")]
    pub fn kafka(config: &crate::config::MessagingConfig) -> Result<Self, MessagingError> {
        config.validate()?;
        Ok(Self::new(Arc::new(crate::kafka::KafkaWriterFactory::new(
            config.clone(),
        ))))
    }

    /// payload を JSON にシリアライズして topic に発行する。
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        key: &str,
        payload: &T,
    ) -> Result<(), MessagingError> {
        if cancel.is_cancelled() {
            return Err(MessagingError::Cancelled);
        }

        let value = serde_json::to_vec(payload).map_err(|e| MessagingError::Publish {
            topic: topic.to_string(),
            source: Box::new(e),
        })?;

        let writer = self.writer(topic).await?;
        let message = OutboundMessage {
            key: key.as_bytes().to_vec(),
            value,
            timestamp: Utc::now(),
        };

        let started = Instant::now();
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(MessagingError::Cancelled),
            result = writer.write(message) => result,
        };

        match result {
            Ok(()) => {
                tracing::debug!(
                    topic = %topic,
                    key = %key,
                    latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "message published"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    topic = %topic,
                    key = %key,
                    error = %e,
                    "failed to publish message"
                );
                Err(MessagingError::Publish {
                    topic: topic.to_string(),
                    source: e,
                })
            }
        }
    }

    /// Envelope を発行する。パーティションキーには Envelope の ID を使うため、
    /// 同じイベントを再送しても同じパーティションに届く。
    pub async fn publish_envelope(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        envelope: &Envelope,
    ) -> Result<(), MessagingError> {
        self.publish(cancel, topic, envelope.id(), envelope).await
    }

    /// 全コネクションをフラッシュして解放する。個別の失敗はログに記録し、処理は継続する。
    pub async fn close(&self) {
        let writers: Vec<(String, Arc<dyn TopicWriter>)> =
            self.writers.write().await.drain().collect();

        for (topic, writer) in writers {
            match writer.close().await {
                Ok(()) => tracing::debug!(topic = %topic, "writer closed"),
                Err(e) => tracing::error!(topic = %topic, error = %e, "failed to close writer"),
            }
        }
    }

    /// コネクションを保持しているトピックの一覧を返す。
    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.writers.read().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    async fn writer(&self, topic: &str) -> Result<Arc<dyn TopicWriter>, MessagingError> {
        if let Some(writer) = self.writers.read().await.get(topic) {
            return Ok(Arc::clone(writer));
        }

        let mut writers = self.writers.write().await;
        // 書き込みロック待ちの間に他のタスクが生成している場合はそれを使う
        if let Some(writer) = writers.get(topic) {
            return Ok(Arc::clone(writer));
        }

        let writer = self.factory.create(topic)?;
        writers.insert(topic.to_string(), Arc::clone(&writer));
        tracing::info!(topic = %topic, "writer created");
        Ok(writer)
    }
}
