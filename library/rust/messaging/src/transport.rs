//! ブローカークライアントとの境界。
//!
//! Publisher / Subscriber はこのモジュールのトレイト越しにブローカーへアクセスする。
//! 本番では `kafka` フィーチャーの rdkafka 実装を、テストではモックやインメモリ実装を差し込む。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::envelope::Envelope;
use crate::error::{BoxError, MessagingError};

/// OutboundMessage は Publisher がブローカーへ書き込む 1 件のメッセージを表す。
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// パーティションキー
    pub key: Vec<u8>,
    /// シリアライズ済みペイロード
    pub value: Vec<u8>,
    /// 送信時刻（UTC）
    pub timestamp: DateTime<Utc>,
}

/// ConsumedMessage はブローカーから受信したメッセージを表す。
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedMessage {
    /// トピック名
    pub topic: String,
    /// パーティション番号
    pub partition: i32,
    /// オフセット
    pub offset: i64,
    /// メッセージキー
    pub key: Option<Vec<u8>>,
    /// メッセージペイロード
    pub value: Vec<u8>,
    /// ブローカーが記録したタイムスタンプ
    pub timestamp: Option<DateTime<Utc>>,
}

impl ConsumedMessage {
    /// ペイロードを JSON としてデシリアライズする。
    pub fn deserialize_json<T: DeserializeOwned>(&self) -> Result<T, MessagingError> {
        serde_json::from_slice(&self.value).map_err(|e| {
            MessagingError::Decode(format!(
                "failed to parse message at {}/{}@{}: {e}",
                self.topic, self.partition, self.offset
            ))
        })
    }

    /// ペイロードを [`Envelope`] としてパースする。
    pub fn envelope(&self) -> Result<Envelope, MessagingError> {
        Envelope::decode(&self.value)
    }

    /// キーを UTF-8 文字列として返す（ログ出力用）。
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }
}

/// TopicWriter は 1 トピックに束縛された永続的な書き込みコネクション。
/// 複数タスクから同時に呼び出されても安全でなければならない。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait TopicWriter: Send + Sync {
    /// 1 件のメッセージを書き込み、ブローカーの確認応答を待つ。
    async fn write(&self, message: OutboundMessage) -> Result<(), BoxError>;

    /// 未送信のバッチをフラッシュしてコネクションを解放する。
    async fn close(&self) -> Result<(), BoxError>;
}

/// WriterFactory はトピックごとの書き込みコネクションを生成する。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait WriterFactory: Send + Sync {
    fn create(&self, topic: &str) -> Result<Arc<dyn TopicWriter>, MessagingError>;
}

/// MessageReader は 1 つの (トピック, コンシューマーグループ) に束縛された読み込みコネクション。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait MessageReader: Send + Sync {
    /// 次のメッセージを取得する。メッセージが届くまでブロックする。
    async fn fetch(&self) -> Result<ConsumedMessage, BoxError>;

    /// メッセージのオフセットをコミットする。
    async fn commit(&self, message: &ConsumedMessage) -> Result<(), BoxError>;

    /// 読み込み位置を message のオフセットに戻す。次の fetch は同じメッセージを返す。
    async fn rewind(&self, message: &ConsumedMessage) -> Result<(), BoxError>;

    /// 読み込みコネクションを解放する。
    async fn close(&self) -> Result<(), BoxError>;
}
