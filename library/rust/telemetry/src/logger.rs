//! 構造化ログユーティリティ。
//! tracing クレートを使用し、JSON またはテキスト形式の構造化ログを出力する。
//!
//! # 使用例
//!
//! ```ignore
//! use tracing::{info, error};
//!
//! info!(topic = "orders", group = "order-projector", "starting consumer");
//! error!(topic = "orders", offset = 42, error = %e, "failed to handle message");
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("logger already initialized: {0}")]
    AlreadyInitialized(String),
}

/// LoggerConfig はロガーの初期化設定を保持する。
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub service_name: String,
    /// dev / staging / prod（production も prod として扱う）
    pub environment: String,
    /// "json" / "text"。未指定の場合は prod のみ JSON。
    pub format: Option<String>,
    /// ログレベル。未指定の場合は環境ごとのデフォルト。
    pub level: Option<String>,
}

impl LoggerConfig {
    pub fn new(service_name: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            environment: environment.into(),
            format: None,
            level: None,
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = Some(level.into());
        self
    }

    fn is_production(&self) -> bool {
        matches!(self.environment.as_str(), "prod" | "production")
    }

    /// JSON 形式で出力するかどうかを返す。
    pub fn uses_json(&self) -> bool {
        match self.format.as_deref() {
            Some(format) => format == "json",
            None => self.is_production(),
        }
    }

    /// フィルタに使うログレベルを返す。
    ///
    /// - dev: debug
    /// - staging / prod: info
    pub fn effective_level(&self) -> tracing::Level {
        if let Some(level) = &self.level {
            return parse_log_level(level);
        }
        match self.environment.as_str() {
            "dev" | "development" => tracing::Level::DEBUG,
            _ => tracing::Level::INFO,
        }
    }
}

/// init_logger は tracing-subscriber をグローバルに初期化する。
/// RUST_LOG が設定されている場合はそちらのフィルタを優先する。
pub fn init_logger(config: &LoggerConfig) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.effective_level().as_str().to_lowercase()));

    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.uses_json() {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    result.map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        environment = %config.environment,
        "logger initialized"
    );
    Ok(())
}

/// parse_log_level はログレベル文字列を tracing の Level に変換する。
pub fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}
