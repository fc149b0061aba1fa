use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("すべてのリトライが失敗しました ({attempts} 回): {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: E },
    #[error("リトライ待機中にキャンセルされました")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// 最後に発生したエラーを返す。キャンセル時は None。
    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::ExhaustedRetries { last_error, .. } => Some(last_error),
            RetryError::Cancelled => None,
        }
    }
}
