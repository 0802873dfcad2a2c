//! Serialized form of a context window, for callers that persist
//! conversations themselves.
//!
//! Messages are read through [`MessageRecord`], a lenient shape where every
//! field is optional, so that a missing role or content surfaces as
//! [`ContextError::InvalidMessage`] rather than an opaque parse error.

use crate::{ContextError, Message, MessageRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Messages and settings of a [`ContextWindow`](super::ContextWindow).
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct WindowSnapshot {
    pub budget: usize,
    pub pin_system: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_messages: Option<usize>,
    pub pinned: Vec<Message>,
    pub history: Vec<Message>,
}

#[derive(Deserialize)]
struct RawSnapshot {
    budget: usize,
    #[serde(default = "default_pin_system")]
    pin_system: bool,
    #[serde(default)]
    max_messages: Option<usize>,
    #[serde(default)]
    pinned: Vec<MessageRecord>,
    #[serde(default)]
    history: Vec<MessageRecord>,
}

fn default_pin_system() -> bool {
    true
}

impl RawSnapshot {
    /// Validate every record. Shared by [`Deserialize`] and
    /// [`WindowSnapshot::from_json`].
    fn into_snapshot(self) -> Result<WindowSnapshot, ContextError> {
        let convert = |records: Vec<MessageRecord>| -> Result<Vec<Message>, ContextError> {
            records.into_iter().map(Message::try_from).collect()
        };
        Ok(WindowSnapshot {
            budget: self.budget,
            pin_system: self.pin_system,
            max_messages: self.max_messages,
            pinned: convert(self.pinned)?,
            history: convert(self.history)?,
        })
    }
}

impl<'de> Deserialize<'de> for WindowSnapshot {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        RawSnapshot::deserialize(deserializer)?
            .into_snapshot()
            .map_err(serde::de::Error::custom)
    }
}

impl WindowSnapshot {
    /// Parse a snapshot, reporting malformed messages as
    /// [`ContextError::InvalidMessage`].
    pub fn from_json(json: &str) -> Result<Self, ContextError> {
        serde_json::from_str::<RawSnapshot>(json)?.into_snapshot()
    }
}

/// Loosely-typed message as found in external files.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct MessageRecord {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = ContextError;

    fn try_from(record: MessageRecord) -> Result<Self, Self::Error> {
        let role = match record.role.as_deref().map(str::trim) {
            Some("system") => MessageRole::System,
            Some("user") => MessageRole::User,
            Some("assistant") => MessageRole::Assistant,
            Some(other) => {
                return Err(ContextError::InvalidMessage(format!(
                    "unknown role '{other}'"
                )));
            }
            None => return Err(ContextError::InvalidMessage("missing role".into())),
        };
        let content = record
            .content
            .ok_or_else(|| ContextError::InvalidMessage("missing content".into()))?;

        let mut message = Message::new(role, content);
        if let Some(ts) = record.timestamp {
            message = message.with_timestamp(ts);
        }
        for (key, value) in record.metadata.unwrap_or_default() {
            message = message.with_metadata(key, value);
        }
        message.validate()?;
        Ok(message)
    }
}

/// Parse a JSON array of loosely-typed messages.
pub fn parse_messages(json: &str) -> Result<Vec<Message>, ContextError> {
    let records: Vec<MessageRecord> = serde_json::from_str(json)?;
    records.into_iter().map(Message::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_role_is_invalid_message() {
        let err = parse_messages(r#"[{"content": "hi"}]"#).unwrap_err();
        assert!(matches!(err, ContextError::InvalidMessage(ref m) if m.contains("role")));
    }

    #[test]
    fn missing_content_is_invalid_message() {
        let err = parse_messages(r#"[{"role": "user"}]"#).unwrap_err();
        assert!(matches!(err, ContextError::InvalidMessage(ref m) if m.contains("content")));
    }

    #[test]
    fn unknown_role_is_invalid_message() {
        let err = parse_messages(r#"[{"role": "tool", "content": "x"}]"#).unwrap_err();
        assert!(matches!(err, ContextError::InvalidMessage(ref m) if m.contains("tool")));
    }

    #[test]
    fn timestamps_and_metadata_are_optional() {
        let msgs = parse_messages(
            r#"[
                {"role": "system", "content": "rules"},
                {"role": "user", "content": "hi", "timestamp": "2024-05-01T12:00:00Z",
                 "metadata": {"channel": "cli"}}
            ]"#,
        )
        .unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].timestamp().to_rfc3339(), "2024-05-01T12:00:00+00:00");
        assert_eq!(msgs[1].meta("channel"), Some(&serde_json::json!("cli")));
    }

    #[test]
    fn malformed_json_is_a_snapshot_error() {
        assert!(matches!(
            WindowSnapshot::from_json("{not json"),
            Err(ContextError::Snapshot(_))
        ));
    }

    #[test]
    fn snapshot_defaults_pin_system() {
        let snap = WindowSnapshot::from_json(r#"{"budget": 100}"#).unwrap();
        assert!(snap.pin_system);
        assert!(snap.pinned.is_empty());
        assert_eq!(snap.max_messages, None);
    }

    #[test]
    fn snapshot_deserializes_through_serde() {
        let snap: WindowSnapshot = serde_json::from_str(
            r#"{"budget": 10, "history": [{"role": "user", "content": "hi"}]}"#,
        )
        .unwrap();
        assert_eq!(snap.history.len(), 1);

        let bad = serde_json::from_str::<WindowSnapshot>(
            r#"{"budget": 10, "history": [{"content": "hi"}]}"#,
        );
        assert!(bad.unwrap_err().to_string().contains("missing role"));
    }

    #[test]
    fn both_entry_points_reject_the_same_records() {
        let json = r#"{"budget": 10, "pinned": [{"role": "system", "content": " "}]}"#;
        assert!(matches!(
            WindowSnapshot::from_json(json),
            Err(ContextError::InvalidMessage(_))
        ));
        assert!(serde_json::from_str::<WindowSnapshot>(json).is_err());
    }
}
