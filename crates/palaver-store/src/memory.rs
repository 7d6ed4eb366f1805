//! In-memory [`Repository`] used by tests and ad-hoc tooling.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use palaver_shared::ids::{ConversationKey, GroupId, MessageId, UserId};
use palaver_shared::message::{ChatMessage, DeliveryStatus};

use crate::error::{Result, StoreError};
use crate::repository::Repository;

#[derive(Default)]
struct MemState {
    messages: Vec<ChatMessage>,
    groups: HashMap<GroupId, Vec<UserId>>,
}

/// HashMap-backed repository.  Not durable; mirrors the SQLite
/// implementation's observable behavior.
#[derive(Default)]
pub struct MemoryRepository {
    state: RwLock<MemState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a group's membership.
    pub async fn put_group(&self, group: GroupId, members: Vec<UserId>) {
        self.state.write().await.groups.insert(group, members);
    }

    /// Snapshot of every persisted message, in insertion order.
    pub async fn all_messages(&self) -> Vec<ChatMessage> {
        self.state.read().await.messages.clone()
    }

    /// Number of persisted messages.
    pub async fn message_count(&self) -> usize {
        self.state.read().await.messages.len()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_message(&self, message: &ChatMessage) -> Result<()> {
        self.state.write().await.messages.push(message.clone());
        Ok(())
    }

    async fn update_message_status(&self, id: MessageId, status: DeliveryStatus) -> Result<()> {
        let mut state = self.state.write().await;
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(StoreError::NotFound)?;
        message.status = status;
        Ok(())
    }

    async fn find_group_members(&self, group: &GroupId) -> Result<Vec<UserId>> {
        Ok(self
            .state
            .read()
            .await
            .groups
            .get(group)
            .cloned()
            .unwrap_or_default())
    }

    async fn recent_messages(
        &self,
        key: &ConversationKey,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let state = self.state.read().await;
        let mut matching: Vec<ChatMessage> = state
            .messages
            .iter()
            .filter(|m| &m.conversation_key == key)
            .cloned()
            .collect();
        if matching.len() > limit {
            let excess = matching.len() - limit;
            matching.drain(..excess);
        }
        Ok(matching)
    }
}
