/// BoxError はブローカークライアントやハンドラーから返される下位エラーを表す。
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// MessagingError はメッセージング操作に関するエラーを表す。
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// イベントデータを構造化データとして表現できない。
    #[error("encode error: {0}")]
    Encode(String),

    /// エンベロープまたはペイロードの構造が不正。
    #[error("decode error: {0}")]
    Decode(String),

    /// 送信時のシリアライズ失敗またはブローカーからの送信失敗。
    #[error("failed to publish to {topic}: {source}")]
    Publish {
        topic: String,
        #[source]
        source: BoxError,
    },

    /// トピック用のコネクションを生成できない。
    #[error("connection error for {topic}: {reason}")]
    Connection { topic: String, reason: String },

    #[error("failed to close connection for {topic}: {source}")]
    Close {
        topic: String,
        #[source]
        source: BoxError,
    },

    /// キャンセルシグナルによる停止。障害ではない。
    #[error("operation cancelled")]
    Cancelled,

    #[error("commit failed {failures} times in a row for {topic}")]
    CommitFailuresExceeded { topic: String, failures: u32 },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl MessagingError {
    /// キャンセルによる終了かどうかを返す。呼び出し側はこれを障害として記録しない。
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MessagingError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_publish_error_keeps_source() {
        let transport: BoxError = "broker ack timeout".into();
        let err = MessagingError::Publish {
            topic: "orders".to_string(),
            source: transport,
        };
        assert!(err.to_string().contains("orders"));
        assert_eq!(err.source().unwrap().to_string(), "broker ack timeout");
    }

    #[test]
    fn test_is_cancelled() {
        assert!(MessagingError::Cancelled.is_cancelled());
        assert!(!MessagingError::Decode("missing field `id`".to_string()).is_cancelled());
    }

    #[test]
    fn test_commit_failures_exceeded_display() {
        let err = MessagingError::CommitFailuresExceeded {
            topic: "orders".to_string(),
            failures: 5,
        };
        assert_eq!(err.to_string(), "commit failed 5 times in a row for orders");
    }
}
