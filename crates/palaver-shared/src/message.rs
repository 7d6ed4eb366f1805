//! The canonical persisted chat message and its classification axes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationKey, MessageId, Recipient, UserId};

/// Message kind, the first axis the router classifies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    File,
    AudioVideo,
}

/// Audio/video signalling subtypes.
///
/// Only the call-lifecycle subtypes are worth persisting; the rest are
/// ephemeral negotiation between two live peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    CallStart,
    CallAccept,
    CallReject,
    Offer,
    Answer,
    IceCandidate,
    Hangup,
}

impl SignalKind {
    /// Whether a message carrying this signal is persisted.
    pub fn is_persistent(self) -> bool {
        matches!(
            self,
            SignalKind::CallStart | SignalKind::CallAccept | SignalKind::CallReject
        )
    }
}

/// Metadata describing an uploaded attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub content_type: String,
    pub name: String,
    pub size: i64,
}

/// Delivery status of a persisted message.
///
/// `Unsent` on creation; advanced to `Sent` only after a successful
/// write-back to a live socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Unsent,
    Sent,
}

/// A single chat message as created by the router on ingest.
///
/// Immutable once built except for `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub conversation_key: ConversationKey,
    pub kind: MessageKind,
    pub sender_id: UserId,
    pub sender_display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_avatar: Option<String>,
    pub recipient: Recipient,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_meta: Option<AttachmentMeta>,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<SignalKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_payload: Option<String>,
}

/// Reduce an avatar reference to a storage-relative path.
///
/// Stored references must survive the public URL prefix changing, so any
/// absolute `http(s)://host[:port]/` part is stripped before persisting.
pub fn normalize_avatar_ref(raw: &str) -> String {
    for scheme in ["https://", "http://"] {
        if let Some(rest) = raw.strip_prefix(scheme) {
            return match rest.find('/') {
                Some(idx) => rest[idx + 1..].to_string(),
                None => String::new(),
            };
        }
    }
    raw.trim_start_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_persistence_allow_list() {
        assert!(SignalKind::CallStart.is_persistent());
        assert!(SignalKind::CallAccept.is_persistent());
        assert!(SignalKind::CallReject.is_persistent());
        assert!(!SignalKind::Offer.is_persistent());
        assert!(!SignalKind::IceCandidate.is_persistent());
        assert!(!SignalKind::Hangup.is_persistent());
    }

    #[test]
    fn avatar_ref_strips_host() {
        assert_eq!(
            normalize_avatar_ref("https://cdn.example.com/avatars/a1.png"),
            "avatars/a1.png"
        );
        assert_eq!(
            normalize_avatar_ref("http://localhost:8080/avatars/a1.png"),
            "avatars/a1.png"
        );
        assert_eq!(normalize_avatar_ref("/avatars/a1.png"), "avatars/a1.png");
        assert_eq!(normalize_avatar_ref("avatars/a1.png"), "avatars/a1.png");
        assert_eq!(normalize_avatar_ref("https://cdn.example.com"), "");
    }

    #[test]
    fn kind_serde_tags() {
        let json = serde_json::to_string(&MessageKind::AudioVideo).unwrap();
        assert_eq!(json, "\"audio_video\"");
        let signal: SignalKind = serde_json::from_str("\"ice_candidate\"").unwrap();
        assert_eq!(signal, SignalKind::IceCandidate);
    }
}
