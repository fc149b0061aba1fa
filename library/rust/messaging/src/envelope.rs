use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

use crate::error::MessagingError;

/// 構造化ペイロードの datacontenttype。
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Envelope はサービス間ドメインイベントのメタデータと不透明なペイロードをラップする。
///
/// ワイヤーフォーマットは CloudEvents の構造化モードに準拠する
/// （`id` / `source` / `type` / `time` / `datacontenttype` / `data`）。
/// `data` はエンコード済みのバイト列をそのまま保持し、エンベロープ層では解釈しない。
/// 外側のパース（[`Envelope::decode`]）と内側のパース（[`Envelope::extract_payload`]）を
/// 分離しているため、コンシューマーは `type` でルーティングしてからペイロードの型を決められる。
///
/// 生成後は変更できない。各フィールドは読み取り専用のアクセサーで参照する。
///
/// ```compile_fail
/// let mut envelope = corekit_messaging::Envelope::create("svc", "order.created", &1).unwrap();
/// envelope.id = String::new();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// イベント ID（UUID v4）。Publisher のデフォルトのパーティションキーになる。
    id: String,
    /// 発行元（サービス名または URI 形式の文字列）
    source: String,
    /// イベント種別（例: "order.created"）
    #[serde(rename = "type")]
    event_type: String,
    /// 生成日時（UTC、RFC3339）
    time: DateTime<Utc>,
    /// ペイロードのエンコーディング
    datacontenttype: String,
    data: Box<RawValue>,
}

impl Envelope {
    /// data をエンコードして新しい Envelope を生成する。ID と現在時刻は毎回新しく付与する。
    pub fn create<T: Serialize + ?Sized>(
        source: impl Into<String>,
        event_type: impl Into<String>,
        data: &T,
    ) -> Result<Self, MessagingError> {
        let data = serde_json::value::to_raw_value(data)
            .map_err(|e| MessagingError::Encode(format!("failed to marshal event data: {e}")))?;

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            event_type: event_type.into(),
            time: Utc::now(),
            datacontenttype: CONTENT_TYPE_JSON.to_string(),
            data,
        })
    }

    /// トランスポート層のバイト列から Envelope 全体をパースする。
    pub fn decode(bytes: &[u8]) -> Result<Self, MessagingError> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| MessagingError::Decode(format!("failed to parse envelope: {e}")))?;

        for (field, value) in [
            ("id", &envelope.id),
            ("source", &envelope.source),
            ("type", &envelope.event_type),
        ] {
            if value.is_empty() {
                return Err(MessagingError::Decode(format!(
                    "envelope field `{field}` must not be empty"
                )));
            }
        }

        Ok(envelope)
    }

    /// Envelope をワイヤーフォーマットにシリアライズする。
    pub fn encode(&self) -> Result<Vec<u8>, MessagingError> {
        serde_json::to_vec(self).map_err(|e| MessagingError::Encode(e.to_string()))
    }

    /// ペイロードを呼び出し側が指定した型にデコードする。
    pub fn extract_payload<T: DeserializeOwned>(&self) -> Result<T, MessagingError> {
        serde_json::from_str(self.data.get()).map_err(|e| {
            MessagingError::Decode(format!(
                "failed to parse data of {} event {}: {e}",
                self.event_type, self.id
            ))
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// イベント種別を返す。ルーティングに使う。
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn datacontenttype(&self) -> &str {
        &self.datacontenttype
    }

    /// エンコード済みペイロードのバイト列を返す。
    pub fn payload(&self) -> &[u8] {
        self.data.get().as_bytes()
    }
}
