//! The async [`Repository`] collaborator interface the delivery core
//! consumes, and its SQLite-backed implementation.
//!
//! The store itself is synchronous (`rusqlite`); [`SqliteRepository`]
//! bridges onto the async core by running every operation on the
//! blocking pool behind an `Arc<Mutex<Database>>`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use palaver_shared::ids::{ConversationKey, GroupId, MessageId, UserId};
use palaver_shared::message::{ChatMessage, DeliveryStatus};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::groups;
use crate::models::{Group, User};

/// Durable storage operations the delivery core depends on.
///
/// Implementations must be safe to call from many tasks concurrently.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Persist a freshly routed message.
    async fn create_message(&self, message: &ChatMessage) -> Result<()>;

    /// Advance a message's delivery status.
    async fn update_message_status(&self, id: MessageId, status: DeliveryStatus) -> Result<()>;

    /// Resolve the current members of a group.
    async fn find_group_members(&self, group: &GroupId) -> Result<Vec<UserId>>;

    /// Most recent messages of a conversation, oldest first.
    async fn recent_messages(
        &self,
        key: &ConversationKey,
        limit: usize,
    ) -> Result<Vec<ChatMessage>>;
}

/// SQLite-backed [`Repository`].
#[derive(Clone)]
pub struct SqliteRepository {
    db: Arc<Mutex<Database>>,
}

impl SqliteRepository {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Run a closure against the database on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let db = db.lock().unwrap_or_else(|e| e.into_inner());
            f(&db)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Run a closure inside a single SQLite transaction on the blocking
    /// pool.  Used for multi-step writes that must land atomically.
    pub async fn with_tx<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut db = db.lock().unwrap_or_else(|e| e.into_inner());
            let tx = db.conn_mut().transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Create a group and its initial membership atomically.
    pub async fn create_group_with_members(
        &self,
        group: Group,
        members: Vec<UserId>,
    ) -> Result<()> {
        self.with_tx(move |tx| {
            groups::insert_group(tx, &group)?;
            for member in &members {
                groups::insert_group_member(tx, &group.id, member)?;
            }
            Ok(())
        })
        .await
    }

    /// Add a member to an existing group.  Adding a member twice is a
    /// no-op; the group must exist (foreign key).
    pub async fn add_group_member(&self, group: GroupId, user: UserId) -> Result<()> {
        self.run(move |db| db.add_group_member(&group, &user)).await
    }

    /// Remove a member from a group.  Returns whether a row was deleted.
    pub async fn remove_group_member(&self, group: GroupId, user: UserId) -> Result<bool> {
        self.run(move |db| db.remove_group_member(&group, &user))
            .await
    }

    /// Insert or update a user profile.
    pub async fn upsert_user(&self, user: User) -> Result<()> {
        self.run(move |db| db.upsert_user(&user)).await
    }

    /// Fetch a user profile.
    pub async fn get_user(&self, id: UserId) -> Result<User> {
        self.run(move |db| db.get_user(&id)).await
    }

    /// Fetch a group record.
    pub async fn get_group(&self, id: GroupId) -> Result<Group> {
        self.run(move |db| db.get_group(&id)).await
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn create_message(&self, message: &ChatMessage) -> Result<()> {
        let message = message.clone();
        self.run(move |db| db.insert_message(&message)).await
    }

    async fn update_message_status(&self, id: MessageId, status: DeliveryStatus) -> Result<()> {
        self.run(move |db| db.update_message_status(id, status))
            .await
    }

    async fn find_group_members(&self, group: &GroupId) -> Result<Vec<UserId>> {
        let group = group.clone();
        self.run(move |db| db.group_members(&group)).await
    }

    async fn recent_messages(
        &self,
        key: &ConversationKey,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let key = key.clone();
        self.run(move |db| db.recent_messages(&key, limit)).await
    }
}
