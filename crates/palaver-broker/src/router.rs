//! Message classification and fan-out.
//!
//! Both broker implementations funnel every inbound frame through the
//! same router: assign an id, persist according to kind, branch on the
//! recipient's namespace prefix, push to locally connected sockets, and
//! enqueue the cache append.  The router holds no per-message state;
//! persistence and delivery outcomes stay independent by design.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, error, warn};

use palaver_cache::ConversationCache;
use palaver_shared::ids::{ConversationKey, GroupId, MessageId, MessageIdGen, Recipient, UserId};
use palaver_shared::message::{normalize_avatar_ref, ChatMessage, DeliveryStatus, MessageKind, SignalKind};
use palaver_shared::wire::{DeliveryEnvelope, DeliveryPayload, InboundFrame, ServerFrame};
use palaver_store::Repository;

use crate::registry::ClientRegistry;

/// Classifies inbound frames and applies the persist + fan-out policy.
pub struct Router {
    repository: Arc<dyn Repository>,
    cache: Arc<ConversationCache>,
    registry: Arc<ClientRegistry>,
    ids: MessageIdGen,
}

impl Router {
    pub fn new(
        repository: Arc<dyn Repository>,
        cache: Arc<ConversationCache>,
        registry: Arc<ClientRegistry>,
        ids: MessageIdGen,
    ) -> Self {
        Self {
            repository,
            cache,
            registry,
            ids,
        }
    }

    /// Classify, persist and fan out one inbound frame.
    ///
    /// Every failure is logged and contained: one client's bad frame or
    /// broken socket never affects another client.
    pub async fn dispatch(&self, frame: InboundFrame) {
        let message = self.build_message(frame);
        let persisted = self.persist(&message).await;

        match message.recipient.clone() {
            Recipient::User(user) => self.deliver_private(&message, persisted, &user).await,
            Recipient::Group(group) => self.deliver_group(&message, persisted, &group).await,
        }

        // Only conversation content feeds the recency cache; signalling
        // noise does not.
        if matches!(message.kind, MessageKind::Text | MessageKind::File) {
            self.cache.append(&message).await;
        }
    }

    fn build_message(&self, frame: InboundFrame) -> ChatMessage {
        let InboundFrame { sender_id, request } = frame;
        let conversation_key = match &request.recipient {
            Recipient::User(user) => ConversationKey::direct(&sender_id, user),
            Recipient::Group(group) => ConversationKey::group(group),
        };

        ChatMessage {
            id: self.ids.next(),
            conversation_key,
            kind: request.kind,
            sender_id,
            sender_display_name: request.sender_display_name.unwrap_or_default(),
            sender_avatar: request
                .sender_avatar
                .as_deref()
                .map(normalize_avatar_ref),
            recipient: request.recipient,
            content: request.content,
            attachment_ref: request.attachment_ref,
            attachment_meta: request.attachment_meta,
            status: DeliveryStatus::Unsent,
            created_at: Utc::now(),
            signal: request.signal,
            signal_payload: request.signal_payload,
        }
    }

    /// Text and file messages always persist; audio/video signalling
    /// only for the call-lifecycle subtypes.  Returns whether a row was
    /// written (delivery proceeds either way).
    async fn persist(&self, message: &ChatMessage) -> bool {
        let should_persist = match message.kind {
            MessageKind::Text | MessageKind::File => true,
            MessageKind::AudioVideo => message
                .signal
                .map(SignalKind::is_persistent)
                .unwrap_or(false),
        };
        if !should_persist {
            return false;
        }

        match self.repository.create_message(message).await {
            Ok(()) => true,
            Err(e) => {
                error!(message = %message.id, error = %e, "message persist failed");
                false
            }
        }
    }

    async fn deliver_private(&self, message: &ChatMessage, persisted: bool, recipient: &UserId) {
        let payload = DeliveryPayload::Private {
            conversation: message.conversation_key.clone(),
            message: message.clone(),
        };
        let Some(bytes) = encode_delivery(payload) else {
            return;
        };

        self.push(&message.sender_id, &bytes, persisted, message.id);
        if recipient != &message.sender_id {
            self.push(recipient, &bytes, persisted, message.id);
        }
    }

    async fn deliver_group(&self, message: &ChatMessage, persisted: bool, group: &GroupId) {
        let members = self.group_members(group).await;
        let payload = DeliveryPayload::Group {
            group_id: group.clone(),
            message: message.clone(),
        };
        let Some(bytes) = encode_delivery(payload) else {
            return;
        };

        let mut seen: HashSet<&UserId> = HashSet::new();
        let mut sender_done = false;
        for member in &members {
            if !seen.insert(member) {
                continue;
            }
            if member == &message.sender_id {
                sender_done = true;
            }
            self.push(member, &bytes, persisted, message.id);
        }
        // Exactly one echo to the sender, member or not.
        if !sender_done {
            self.push(&message.sender_id, &bytes, persisted, message.id);
        }
    }

    /// Push one envelope to a user's live connection on this process.
    /// A recipient who is not connected here is silently skipped; the
    /// message remains retrievable via persisted history.
    fn push(&self, user: &UserId, payload: &Bytes, persisted: bool, id: MessageId) {
        let Some(handle) = self.registry.get(user) else {
            debug!(user = %user, "recipient not connected on this process");
            return;
        };
        let envelope = DeliveryEnvelope {
            payload: payload.clone(),
            message_id: persisted.then_some(id),
        };
        if !handle.deliver(envelope) {
            warn!(user = %user, "outbound queue full, dropping delivery");
        }
    }

    /// Group membership via the cache's set entries, falling back to the
    /// repository and repopulating asynchronously.
    async fn group_members(&self, group: &GroupId) -> Vec<UserId> {
        if let Some(cached) = self.cache.cached_group_members(group).await {
            return cached;
        }
        match self.repository.find_group_members(group).await {
            Ok(members) => {
                self.cache.remember_group_members(group, &members).await;
                members
            }
            Err(e) => {
                error!(group = %group, error = %e, "group member lookup failed");
                Vec::new()
            }
        }
    }
}

fn encode_delivery(payload: DeliveryPayload) -> Option<Bytes> {
    match ServerFrame::Delivery(payload).to_bytes() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!(error = %e, "delivery frame encode failed");
            None
        }
    }
}
