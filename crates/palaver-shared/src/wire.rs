//! Wire protocol: JSON frames exchanged with clients, the frame shape
//! published onto a broker, and the outbound delivery envelope.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::ids::{ConversationKey, GroupId, MessageId, Recipient, UserId};
use crate::message::{AttachmentMeta, ChatMessage, MessageKind, SignalKind};

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// A frame received from a connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Send(SendRequest),
    Ping,
}

impl ClientFrame {
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// A request to send one message.
///
/// The sender's identity is *not* part of the frame; it comes from the
/// transport upgrade that authenticated the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub recipient: Recipient,
    pub kind: MessageKind,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_meta: Option<AttachmentMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<SignalKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_payload: Option<String>,
}

/// The unit a connection endpoint publishes onto its broker: the decoded
/// request plus the identity the transport authenticated.  In
/// distributed mode this is also the record payload on the log topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundFrame {
    pub sender_id: UserId,
    pub request: SendRequest,
}

impl InboundFrame {
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// A frame pushed to a connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Delivery(DeliveryPayload),
    /// Local buffering exhausted; the sender should retry shortly.
    Busy { reason: String },
    Pong,
}

impl ServerFrame {
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Response shape for a delivered message.  Private conversations and
/// group fan-out deliberately differ so clients can route without
/// re-deriving the recipient scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum DeliveryPayload {
    Private {
        conversation: ConversationKey,
        message: ChatMessage,
    },
    Group {
        group_id: GroupId,
        message: ChatMessage,
    },
}

impl DeliveryPayload {
    pub fn message(&self) -> &ChatMessage {
        match self {
            DeliveryPayload::Private { message, .. } => message,
            DeliveryPayload::Group { message, .. } => message,
        }
    }
}

/// The unit placed on a connection endpoint's outbound queue.
///
/// `message_id` is present only for persisted chat messages; a
/// successful socket write for those advances the stored status.
#[derive(Debug, Clone)]
pub struct DeliveryEnvelope {
    pub payload: Bytes,
    pub message_id: Option<MessageId>,
}
