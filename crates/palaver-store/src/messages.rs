//! CRUD operations for persisted [`ChatMessage`] rows.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use palaver_shared::ids::{ConversationKey, MessageId, Recipient, UserId};
use palaver_shared::message::{
    AttachmentMeta, ChatMessage, DeliveryStatus, MessageKind, SignalKind,
};

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Insert a newly routed message.
    pub fn insert_message(&self, message: &ChatMessage) -> Result<()> {
        insert_message(self.conn(), message)
    }

    /// Advance a message's delivery status.
    pub fn update_message_status(&self, id: MessageId, status: DeliveryStatus) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = ?1 WHERE id = ?2",
            params![status_to_str(status), id.0],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Fetch the most recent messages of a conversation, oldest first.
    pub fn recent_messages(
        &self,
        key: &ConversationKey,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, conversation_key, kind, sender_id, sender_display_name,
                    sender_avatar, recipient, content, attachment_ref,
                    attachment_content_type, attachment_name, attachment_size,
                    status, created_at, signal, signal_payload
             FROM messages
             WHERE conversation_key = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![key.as_str(), limit as i64], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        // Query runs newest-first for the LIMIT; callers want send order.
        messages.reverse();
        Ok(messages)
    }

    /// Fetch a single message by id.
    pub fn get_message(&self, id: MessageId) -> Result<ChatMessage> {
        self.conn()
            .query_row(
                "SELECT id, conversation_key, kind, sender_id, sender_display_name,
                        sender_avatar, recipient, content, attachment_ref,
                        attachment_content_type, attachment_name, attachment_size,
                        status, created_at, signal, signal_payload
                 FROM messages WHERE id = ?1",
                params![id.0],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Count messages in a conversation.
    pub fn message_count(&self, key: &ConversationKey) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_key = ?1",
            params![key.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

/// Insert helper usable inside a transaction.
pub fn insert_message(conn: &Connection, message: &ChatMessage) -> Result<()> {
    let (attachment_content_type, attachment_name, attachment_size) =
        match &message.attachment_meta {
            Some(meta) => (
                Some(meta.content_type.as_str()),
                Some(meta.name.as_str()),
                Some(meta.size),
            ),
            None => (None, None, None),
        };

    conn.execute(
        "INSERT INTO messages (id, conversation_key, kind, sender_id,
             sender_display_name, sender_avatar, recipient, content,
             attachment_ref, attachment_content_type, attachment_name,
             attachment_size, status, created_at, signal, signal_payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            message.id.0,
            message.conversation_key.as_str(),
            kind_to_str(message.kind),
            message.sender_id.as_str(),
            message.sender_display_name,
            message.sender_avatar,
            message.recipient.as_str(),
            message.content,
            message.attachment_ref,
            attachment_content_type,
            attachment_name,
            attachment_size,
            status_to_str(message.status),
            message.created_at.to_rfc3339(),
            message.signal.map(signal_to_str),
            message.signal_payload,
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn kind_to_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::File => "file",
        MessageKind::AudioVideo => "audio_video",
    }
}

fn str_to_kind(raw: &str) -> Option<MessageKind> {
    match raw {
        "text" => Some(MessageKind::Text),
        "file" => Some(MessageKind::File),
        "audio_video" => Some(MessageKind::AudioVideo),
        _ => None,
    }
}

fn status_to_str(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Unsent => "unsent",
        DeliveryStatus::Sent => "sent",
    }
}

fn str_to_status(raw: &str) -> Option<DeliveryStatus> {
    match raw {
        "unsent" => Some(DeliveryStatus::Unsent),
        "sent" => Some(DeliveryStatus::Sent),
        _ => None,
    }
}

fn signal_to_str(signal: SignalKind) -> &'static str {
    match signal {
        SignalKind::CallStart => "call_start",
        SignalKind::CallAccept => "call_accept",
        SignalKind::CallReject => "call_reject",
        SignalKind::Offer => "offer",
        SignalKind::Answer => "answer",
        SignalKind::IceCandidate => "ice_candidate",
        SignalKind::Hangup => "hangup",
    }
}

fn str_to_signal(raw: &str) -> Option<SignalKind> {
    match raw {
        "call_start" => Some(SignalKind::CallStart),
        "call_accept" => Some(SignalKind::CallAccept),
        "call_reject" => Some(SignalKind::CallReject),
        "offer" => Some(SignalKind::Offer),
        "answer" => Some(SignalKind::Answer),
        "ice_candidate" => Some(SignalKind::IceCandidate),
        "hangup" => Some(SignalKind::Hangup),
        _ => None,
    }
}

fn conversion_err(idx: usize, detail: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        detail.into(),
    )
}

/// Map a `rusqlite::Row` to a [`ChatMessage`].
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let id: i64 = row.get(0)?;
    let conversation_key: String = row.get(1)?;
    let kind_str: String = row.get(2)?;
    let sender_str: String = row.get(3)?;
    let sender_display_name: String = row.get(4)?;
    let sender_avatar: Option<String> = row.get(5)?;
    let recipient_str: String = row.get(6)?;
    let content: String = row.get(7)?;
    let attachment_ref: Option<String> = row.get(8)?;
    let attachment_content_type: Option<String> = row.get(9)?;
    let attachment_name: Option<String> = row.get(10)?;
    let attachment_size: Option<i64> = row.get(11)?;
    let status_str: String = row.get(12)?;
    let created_str: String = row.get(13)?;
    let signal_str: Option<String> = row.get(14)?;
    let signal_payload: Option<String> = row.get(15)?;

    let kind = str_to_kind(&kind_str)
        .ok_or_else(|| conversion_err(2, format!("unknown kind {kind_str:?}")))?;

    let sender_id = UserId::parse(&sender_str)
        .map_err(|e| conversion_err(3, e.to_string()))?;

    let recipient = Recipient::parse(&recipient_str)
        .map_err(|e| conversion_err(6, e.to_string()))?;

    let status = str_to_status(&status_str)
        .ok_or_else(|| conversion_err(12, format!("unknown status {status_str:?}")))?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(13, e.to_string()))?;

    let signal = match signal_str {
        Some(raw) => Some(
            str_to_signal(&raw)
                .ok_or_else(|| conversion_err(14, format!("unknown signal {raw:?}")))?,
        ),
        None => None,
    };

    let attachment_meta = match (attachment_content_type, attachment_name, attachment_size) {
        (Some(content_type), Some(name), Some(size)) => Some(AttachmentMeta {
            content_type,
            name,
            size,
        }),
        _ => None,
    };

    Ok(ChatMessage {
        id: MessageId(id),
        conversation_key: ConversationKey::from_raw(&conversation_key),
        kind,
        sender_id,
        sender_display_name,
        sender_avatar,
        recipient,
        content,
        attachment_ref,
        attachment_meta,
        status,
        created_at,
        signal,
        signal_payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_shared::ids::MessageIdGen;

    fn sample_message(gen: &MessageIdGen, content: &str) -> ChatMessage {
        let sender = UserId::parse("Ualice").unwrap();
        let recipient = Recipient::parse("Ubob").unwrap();
        let key = match &recipient {
            Recipient::User(user) => ConversationKey::direct(&sender, user),
            Recipient::Group(group) => ConversationKey::group(group),
        };
        ChatMessage {
            id: gen.next(),
            conversation_key: key,
            kind: MessageKind::Text,
            sender_id: sender,
            sender_display_name: "Alice".into(),
            sender_avatar: Some("avatars/alice.png".into()),
            recipient,
            content: content.into(),
            attachment_ref: None,
            attachment_meta: None,
            status: DeliveryStatus::Unsent,
            created_at: Utc::now(),
            signal: None,
            signal_payload: None,
        }
    }

    #[test]
    fn insert_and_read_back() {
        let db = Database::open_in_memory().unwrap();
        let gen = MessageIdGen::new(0).unwrap();
        let message = sample_message(&gen, "hello");

        db.insert_message(&message).unwrap();

        let loaded = db.get_message(message.id).unwrap();
        assert_eq!(loaded.content, "hello");
        assert_eq!(loaded.sender_id, message.sender_id);
        assert_eq!(loaded.status, DeliveryStatus::Unsent);
    }

    #[test]
    fn recent_messages_ordered_oldest_first() {
        let db = Database::open_in_memory().unwrap();
        let gen = MessageIdGen::new(0).unwrap();

        let first = sample_message(&gen, "one");
        let second = sample_message(&gen, "two");
        let third = sample_message(&gen, "three");
        for message in [&first, &second, &third] {
            db.insert_message(message).unwrap();
        }

        let recent = db.recent_messages(&first.conversation_key, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "two");
        assert_eq!(recent[1].content, "three");
    }

    #[test]
    fn status_transition() {
        let db = Database::open_in_memory().unwrap();
        let gen = MessageIdGen::new(0).unwrap();
        let message = sample_message(&gen, "hello");
        db.insert_message(&message).unwrap();

        db.update_message_status(message.id, DeliveryStatus::Sent)
            .unwrap();
        let loaded = db.get_message(message.id).unwrap();
        assert_eq!(loaded.status, DeliveryStatus::Sent);
    }

    #[test]
    fn status_update_missing_row() {
        let db = Database::open_in_memory().unwrap();
        let result = db.update_message_status(MessageId(42), DeliveryStatus::Sent);
        assert!(matches!(result, Err(StoreError::NotFound)));
    }

    #[test]
    fn attachment_meta_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let gen = MessageIdGen::new(0).unwrap();
        let mut message = sample_message(&gen, "");
        message.kind = MessageKind::File;
        message.attachment_ref = Some("files/report.pdf".into());
        message.attachment_meta = Some(AttachmentMeta {
            content_type: "application/pdf".into(),
            name: "report.pdf".into(),
            size: 1024,
        });
        db.insert_message(&message).unwrap();

        let loaded = db.get_message(message.id).unwrap();
        assert_eq!(loaded.attachment_meta, message.attachment_meta);
        assert_eq!(loaded.attachment_ref.as_deref(), Some("files/report.pdf"));
    }
}
