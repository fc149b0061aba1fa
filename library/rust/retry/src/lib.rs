//! corekit-retry: 指数バックオフ付きリトライ。
//!
//! メッセージングの Publisher は内部でリトライしないため、
//! 冪等な発行を再送したい呼び出し側がこのクレートで包む。

pub mod error;
pub mod policy;
pub mod retry;

pub use error::RetryError;
pub use policy::RetryConfig;
pub use retry::with_retry;
