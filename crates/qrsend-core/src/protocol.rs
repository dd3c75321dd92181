//! 点对点消息协议
//!
//! 每条消息编码为一个 JSON 对象，用 `type` 字段区分种类:
//!
//! - 会话控制: `ready`、`heartbeat-ping`、`heartbeat-pong`
//! - 文件传输: `metadata`、`chunk`、`end`、`cancel`（均携带 `fileId`）
//! - 聊天: `chat-text`、`chat-read`
//!
//! 协议没有版本号。无法识别的 `type` 会被解析为 [`Message::Unknown`] 并忽略，
//! 以便与只认识旧消息集合的对端互通。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 协议错误
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// 传输 ID，关联同一文件的所有协议消息
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    /// 生成新的随机 ID (UUID v4)
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TransferId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TransferId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 传输通道上的一条消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// 连接建立后双方各发送一次
    Ready {
        /// 对端显示名称（旧版本不携带）
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    HeartbeatPing,
    HeartbeatPong,
    #[serde(rename_all = "camelCase")]
    Metadata {
        file_id: TransferId,
        name: String,
        size: u64,
        file_type: String,
    },
    #[serde(rename_all = "camelCase")]
    Chunk {
        file_id: TransferId,
        #[serde(with = "base64_bytes")]
        chunk: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    End { file_id: TransferId },
    #[serde(rename_all = "camelCase")]
    Cancel { file_id: TransferId },
    #[serde(rename_all = "camelCase")]
    ChatText { msg_id: String, text: String },
    #[serde(rename_all = "camelCase")]
    ChatRead { msg_id: String },
    /// 未知种类，接收后忽略
    #[serde(other)]
    Unknown,
}

impl Message {
    /// 解析一条 JSON 文本消息
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// 编码为 JSON 文本
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// 消息种类名称，与线上 `type` 字段一致
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ready { .. } => "ready",
            Message::HeartbeatPing => "heartbeat-ping",
            Message::HeartbeatPong => "heartbeat-pong",
            Message::Metadata { .. } => "metadata",
            Message::Chunk { .. } => "chunk",
            Message::End { .. } => "end",
            Message::Cancel { .. } => "cancel",
            Message::ChatText { .. } => "chat-text",
            Message::ChatRead { .. } => "chat-read",
            Message::Unknown => "unknown",
        }
    }

    /// 文件传输消息携带的传输 ID
    pub fn transfer_id(&self) -> Option<&TransferId> {
        match self {
            Message::Metadata { file_id, .. }
            | Message::Chunk { file_id, .. }
            | Message::End { file_id }
            | Message::Cancel { file_id } => Some(file_id),
            _ => None,
        }
    }
}

/// 二进制块在 JSON 中以 base64 字符串传输
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_wire_format() {
        let msg = Message::Metadata {
            file_id: TransferId::from("abc"),
            name: "photo.jpg".to_string(),
            size: 1024,
            file_type: "image/jpeg".to_string(),
        };
        let text = msg.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["type"], "metadata");
        assert_eq!(value["fileId"], "abc");
        assert_eq!(value["size"], 1024);
        assert_eq!(value["fileType"], "image/jpeg");
    }

    #[test]
    fn test_chunk_is_base64() {
        let msg = Message::Chunk {
            file_id: TransferId::from("x"),
            chunk: vec![0, 1, 2, 255],
        };
        let text = msg.encode().unwrap();
        assert!(text.contains("\"chunk\":\"AAEC/w==\""), "{text}");

        let parsed = Message::decode(&text).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_parse_session_kinds() {
        assert_eq!(
            Message::decode(r#"{"type":"heartbeat-ping"}"#).unwrap(),
            Message::HeartbeatPing
        );
        assert_eq!(
            Message::decode(r#"{"type":"ready"}"#).unwrap(),
            Message::Ready { name: None }
        );
        assert_eq!(
            Message::decode(r#"{"type":"ready","name":"laptop"}"#).unwrap(),
            Message::Ready {
                name: Some("laptop".to_string())
            }
        );
    }

    #[test]
    fn test_unknown_kind_is_ignored() {
        let msg = Message::decode(r#"{"type":"call-end","reason":"bye"}"#).unwrap();
        assert_eq!(msg, Message::Unknown);
        assert_eq!(msg.kind(), "unknown");
    }

    #[test]
    fn test_missing_type_is_rejected() {
        assert!(Message::decode(r#"{"fileId":"x"}"#).is_err());
        assert!(Message::decode("not json").is_err());
    }

    #[test]
    fn test_transfer_id_accessor() {
        let cancel = Message::Cancel {
            file_id: TransferId::from("t1"),
        };
        assert_eq!(cancel.transfer_id().map(TransferId::as_str), Some("t1"));
        assert!(Message::HeartbeatPong.transfer_id().is_none());
    }

    #[test]
    fn test_chat_text_fields() {
        let msg = Message::decode(r#"{"type":"chat-text","msgId":"m1","text":"hi"}"#).unwrap();
        assert_eq!(
            msg,
            Message::ChatText {
                msg_id: "m1".to_string(),
                text: "hi".to_string()
            }
        );
    }
}
