use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::MessagingConfig;
use crate::error::{BoxError, MessagingError};
use crate::transport::{ConsumedMessage, MessageReader};

/// MessageHandler は受信した 1 件のメッセージを処理する。
///
/// 再配信された同じメッセージで繰り返し呼ばれても安全でなければならない。
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        cancel: &CancellationToken,
        message: &ConsumedMessage,
    ) -> Result<(), BoxError>;
}

/// FnHandler は非同期クロージャを MessageHandler として扱うアダプター。
pub struct FnHandler<F>(F);

/// クロージャから MessageHandler を生成する。
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(CancellationToken, ConsumedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(CancellationToken, ConsumedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn handle(
        &self,
        cancel: &CancellationToken,
        message: &ConsumedMessage,
    ) -> Result<(), BoxError> {
        (self.0)(cancel.clone(), message.clone()).await
    }
}

/// SubscriberConfig は Subscriber セッションの設定を表す。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberConfig {
    /// 購読するトピック
    pub topic: String,
    /// コンシューマーグループ ID
    pub group_id: String,
    /// フェッチ失敗後に次のフェッチまで待つ時間（ミリ秒）
    #[serde(default = "default_fetch_error_backoff_ms")]
    pub fetch_error_backoff_ms: u64,
    /// 連続コミット失敗の上限。None の場合は失敗をログに記録して消費を続ける。
    #[serde(default)]
    pub max_consecutive_commit_failures: Option<u32>,
}

fn default_fetch_error_backoff_ms() -> u64 {
    100
}

impl SubscriberConfig {
    pub fn new(topic: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
            fetch_error_backoff_ms: default_fetch_error_backoff_ms(),
            max_consecutive_commit_failures: None,
        }
    }

    pub fn with_fetch_error_backoff(mut self, backoff: Duration) -> Self {
        self.fetch_error_backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_consecutive_commit_failures(mut self, limit: u32) -> Self {
        self.max_consecutive_commit_failures = Some(limit);
        self
    }

    /// group_id に MessagingConfig の group_prefix を付与する。
    pub fn with_group_prefix(mut self, messaging: &MessagingConfig) -> Self {
        self.group_id = messaging.group_id(&self.group_id);
        self
    }
}

/// SubscriberState は消費ループの状態を表す。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// consume 呼び出し前
    Idle,
    /// Fetch → Handle → Commit を繰り返している
    Running,
    /// キャンセルを検知し、処理中のメッセージを終えようとしている
    Stopping,
    /// ループ終了（終端状態）
    Stopped,
}

impl SubscriberState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SubscriberState::Running,
            2 => SubscriberState::Stopping,
            3 => SubscriberState::Stopped,
            _ => SubscriberState::Idle,
        }
    }
}

/// Subscriber は 1 つの (トピック, コンシューマーグループ) からメッセージを取得し、
/// ハンドラーの処理が成功した場合のみオフセットをコミットする（at-least-once）。
pub struct Subscriber {
    reader: Arc<dyn MessageReader>,
    config: SubscriberConfig,
    state: AtomicU8,
}

impl Subscriber {
    pub fn new(reader: Arc<dyn MessageReader>, config: SubscriberConfig) -> Self {
        Self {
            reader,
            config,
            state: AtomicU8::new(SubscriberState::Idle as u8),
        }
    }

    /// rdkafka を使用する Subscriber を生成する。
    /// コンシューマーグループ ID には MessagingConfig の group_prefix が付与される。
    #[cfg(feature = "kafka")]
    pub fn kafka(
        messaging: &MessagingConfig,
        config: SubscriberConfig,
    ) -> Result<Self, MessagingError> {
        messaging.validate()?;
        let config = config.with_group_prefix(messaging);
        let reader =
            crate::kafka::KafkaMessageReader::new(messaging, &config.topic, &config.group_id)?;
        Ok(Self::new(Arc::new(reader), config))
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    pub fn group_id(&self) -> &str {
        &self.config.group_id
    }

    pub fn state(&self) -> SubscriberState {
        SubscriberState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SubscriberState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// キャンセルされるまでメッセージを消費し続ける。
    ///
    /// フェッチ失敗・ハンドラー失敗・コミット失敗はログに記録してループを継続する。
    /// ハンドラーが失敗したメッセージは読み込み位置を戻し、次のフェッチで再配信させる。
    /// キャンセル時は [`MessagingError::Cancelled`] を返す。
    pub async fn consume<H>(
        &self,
        cancel: &CancellationToken,
        handler: &H,
    ) -> Result<(), MessagingError>
    where
        H: MessageHandler + ?Sized,
    {
        let topic = self.config.topic.as_str();
        let group = self.config.group_id.as_str();
        tracing::info!(topic = %topic, group = %group, "starting consumer");
        self.set_state(SubscriberState::Running);

        let result = self.run(cancel, handler).await;

        self.set_state(SubscriberState::Stopped);
        match &result {
            Err(MessagingError::Cancelled) => {
                tracing::info!(topic = %topic, group = %group, "consumer stopped");
            }
            Err(e) => {
                tracing::error!(topic = %topic, group = %group, error = %e, "consumer aborted");
            }
            Ok(()) => {}
        }
        result
    }

    async fn run<H>(&self, cancel: &CancellationToken, handler: &H) -> Result<(), MessagingError>
    where
        H: MessageHandler + ?Sized,
    {
        let topic = self.config.topic.as_str();
        let backoff = Duration::from_millis(self.config.fetch_error_backoff_ms);
        let mut consecutive_commit_failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(self.stopping());
            }

            let fetched = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(self.stopping()),
                fetched = self.reader.fetch() => fetched,
            };

            let message = match fetched {
                Ok(message) => message,
                Err(e) => {
                    if cancel.is_cancelled() {
                        return Err(self.stopping());
                    }
                    tracing::error!(topic = %topic, error = %e, "failed to fetch message");
                    if !backoff.is_zero() {
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => return Err(self.stopping()),
                            () = tokio::time::sleep(backoff) => {}
                        }
                    }
                    continue;
                }
            };

            // ハンドラーはキャンセル後も最後まで実行させる。中断の判断はハンドラーに委ねる。
            if let Err(e) = handler.handle(cancel, &message).await {
                tracing::error!(
                    topic = %topic,
                    partition = message.partition,
                    offset = message.offset,
                    key = message.key_str().unwrap_or_default(),
                    error = %e,
                    "failed to handle message"
                );
                // 後続オフセットのコミットで失敗したメッセージを追い越さないよう、読み込み位置を戻す
                if let Err(e) = self.reader.rewind(&message).await {
                    tracing::error!(
                        topic = %topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "failed to rewind to unhandled message"
                    );
                }
                continue;
            }

            match self.reader.commit(&message).await {
                Ok(()) => {
                    consecutive_commit_failures = 0;
                    tracing::debug!(
                        topic = %topic,
                        partition = message.partition,
                        offset = message.offset,
                        "message committed"
                    );
                }
                Err(e) => {
                    consecutive_commit_failures += 1;
                    tracing::error!(
                        topic = %topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "failed to commit message"
                    );
                    if let Some(limit) = self.config.max_consecutive_commit_failures {
                        if consecutive_commit_failures >= limit {
                            return Err(MessagingError::CommitFailuresExceeded {
                                topic: topic.to_string(),
                                failures: consecutive_commit_failures,
                            });
                        }
                    }
                }
            }
        }
    }

    fn stopping(&self) -> MessagingError {
        self.set_state(SubscriberState::Stopping);
        tracing::info!(topic = %self.config.topic, "consumer stopping");
        MessagingError::Cancelled
    }

    /// 読み込みコネクションを解放する。
    pub async fn close(&self) -> Result<(), MessagingError> {
        self.reader
            .close()
            .await
            .map_err(|source| MessagingError::Close {
                topic: self.config.topic.clone(),
                source,
            })
    }
}
