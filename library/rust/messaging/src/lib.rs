//! corekit-messaging: パーティション分割ログ型ブローカー上の発行・購読レイヤー。
//!
//! - [`Envelope`]: サービス間ドメインイベントの構造化エンベロープ
//! - [`Publisher`]: トピックごとのコネクション多重化と確認応答付き発行
//! - [`Subscriber`]: ハンドラー成功後にのみコミットする at-least-once 消費ループ

pub mod config;
pub mod envelope;
pub mod error;
pub mod publisher;
pub mod subscriber;
pub mod transport;

#[cfg(feature = "kafka")]
pub mod kafka;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{MessagingConfig, RequiredAcks};
pub use envelope::{Envelope, CONTENT_TYPE_JSON};
pub use error::{BoxError, MessagingError};
pub use publisher::Publisher;
pub use subscriber::{handler_fn, MessageHandler, Subscriber, SubscriberConfig, SubscriberState};
pub use transport::{ConsumedMessage, MessageReader, OutboundMessage, TopicWriter, WriterFactory};
pub use tokio_util::sync::CancellationToken;

#[cfg(feature = "kafka")]
pub use kafka::{KafkaMessageReader, KafkaWriterFactory};

#[cfg(feature = "mock")]
pub use transport::{MockMessageReader, MockTopicWriter, MockWriterFactory};
