//! corekit-telemetry: 構造化ログの初期化。
//!
//! メッセージングレイヤーは `tracing` のマクロでログを出すだけで、
//! 出力形式と転送先はこのクレートで起動時に決める。

pub mod logger;

pub use logger::{init_logger, parse_log_level, LoggerConfig, TelemetryError};
