use serde::{Deserialize, Serialize};

use crate::error::MessagingError;

/// RequiredAcks はプロデューサーが送信成功とみなすために必要なブローカーの確認応答数。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequiredAcks {
    /// 確認応答を待たない
    None,
    /// リーダーレプリカ 1 台の確認応答を待つ
    #[default]
    One,
    /// 全 ISR の確認応答を待つ
    All,
}

impl RequiredAcks {
    /// rdkafka の `acks` 設定値を返す。
    pub fn as_kafka_value(self) -> &'static str {
        match self {
            RequiredAcks::None => "0",
            RequiredAcks::One => "1",
            RequiredAcks::All => "all",
        }
    }
}

/// MessagingConfig は Kafka 接続設定を表す。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Kafka ブローカーアドレスのリスト（例: ["kafka:9092"]）
    pub brokers: Vec<String>,
    /// セキュリティプロトコル（PLAINTEXT / SSL / SASL_PLAINTEXT / SASL_SSL）
    #[serde(default = "default_security_protocol")]
    pub security_protocol: String,
    /// コンシューマーグループ名のプレフィックス
    #[serde(default)]
    pub group_prefix: Option<String>,
    /// プロデューサーのバッチ送信待ち時間（ミリ秒）
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    /// 送信成功に必要な確認応答
    #[serde(default)]
    pub required_acks: RequiredAcks,
    /// 送信のタイムアウト（ミリ秒）
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    /// フェッチ 1 回あたりの最小バイト数
    #[serde(default = "default_fetch_min_bytes")]
    pub fetch_min_bytes: usize,
    /// フェッチ 1 回あたりの最大バイト数
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: usize,
}

fn default_security_protocol() -> String {
    "PLAINTEXT".to_string()
}

fn default_batch_timeout_ms() -> u64 {
    10
}

fn default_message_timeout_ms() -> u64 {
    30000
}

fn default_fetch_min_bytes() -> usize {
    1
}

fn default_fetch_max_bytes() -> usize {
    10_000_000
}

impl MessagingConfig {
    /// 指定したブローカーとデフォルト値で MessagingConfig を生成する。
    pub fn new(brokers: Vec<String>) -> Self {
        Self {
            brokers,
            security_protocol: default_security_protocol(),
            group_prefix: None,
            batch_timeout_ms: default_batch_timeout_ms(),
            required_acks: RequiredAcks::default(),
            message_timeout_ms: default_message_timeout_ms(),
            fetch_min_bytes: default_fetch_min_bytes(),
            fetch_max_bytes: default_fetch_max_bytes(),
        }
    }

    /// YAML 文字列から読み込む。
    pub fn from_yaml_str(yaml: &str) -> Result<Self, MessagingError> {
        let cfg: MessagingConfig = serde_yaml::from_str(yaml)
            .map_err(|e| MessagingError::Configuration(format!("failed to parse YAML: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// YAML ファイルを読み込み、環境変数で上書きする。
    pub fn load(path: &str) -> Result<Self, MessagingError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MessagingError::Configuration(format!("failed to read file {path}: {e}"))
        })?;
        let mut cfg: MessagingConfig = serde_yaml::from_str(&content)
            .map_err(|e| MessagingError::Configuration(format!("failed to parse YAML: {e}")))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// 環境変数のみから生成する。KAFKA_BROKERS が必須。
    pub fn from_env() -> Result<Self, MessagingError> {
        let mut cfg = Self::new(Vec::new());
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// KAFKA_BROKERS / KAFKA_GROUP_PREFIX / KAFKA_SECURITY_PROTOCOL で設定を上書きする。
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(brokers) = lookup("KAFKA_BROKERS") {
            self.brokers = parse_brokers(&brokers);
        }
        if let Some(prefix) = lookup("KAFKA_GROUP_PREFIX") {
            self.group_prefix = Some(prefix).filter(|p| !p.is_empty());
        }
        if let Some(protocol) = lookup("KAFKA_SECURITY_PROTOCOL").filter(|p| !p.is_empty()) {
            self.security_protocol = protocol;
        }
    }

    /// ブローカーが 1 つ以上設定されているか検証する。
    pub fn validate(&self) -> Result<(), MessagingError> {
        if self.brokers.is_empty() || self.brokers.iter().any(|b| b.trim().is_empty()) {
            return Err(MessagingError::Configuration(
                "at least one broker must be specified".to_string(),
            ));
        }
        Ok(())
    }

    /// ブローカーアドレスをカンマ区切り文字列で返す（rdkafka 用）。
    pub fn brokers_string(&self) -> String {
        self.brokers.join(",")
    }

    /// group_prefix を付与したコンシューマーグループ ID を返す。
    pub fn group_id(&self, name: &str) -> String {
        match &self.group_prefix {
            Some(prefix) => format!("{prefix}.{name}"),
            None => name.to_string(),
        }
    }
}

fn parse_brokers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(str::to_string)
        .collect()
}
