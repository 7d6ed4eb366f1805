//! Rolling per-conversation message tails and group-membership sets.
//!
//! Tails are read-modify-write JSON lists maintained by fire-and-forget
//! tasks on the shared [`TaskPool`].  Tasks take no locks; a lost update
//! only shortens the cached tail, and the persisted history remains the
//! source of truth.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use palaver_shared::ids::{ConversationKey, GroupId, UserId};
use palaver_shared::message::ChatMessage;

use crate::backend::CacheBackend;
use crate::error::Result;
use crate::pool::TaskPool;

/// Read-through conversation cache service.
pub struct ConversationCache {
    backend: Arc<dyn CacheBackend>,
    pool: Arc<TaskPool>,
    tail_len: usize,
    ttl: Duration,
}

impl ConversationCache {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        pool: Arc<TaskPool>,
        tail_len: usize,
        ttl: Duration,
    ) -> Self {
        Self {
            backend,
            pool,
            tail_len,
            ttl,
        }
    }

    fn tail_key(key: &ConversationKey) -> String {
        format!("conv:{}", key.as_str())
    }

    fn members_key(group: &GroupId) -> String {
        format!("members:{}", group.as_str())
    }

    /// Enqueue an append to the conversation's rolling tail.
    ///
    /// Fire-and-forget: failures are logged, never surfaced.
    pub async fn append(&self, message: &ChatMessage) {
        let backend = self.backend.clone();
        let key = Self::tail_key(&message.conversation_key);
        let message = message.clone();
        let tail_len = self.tail_len;
        let ttl = self.ttl;

        self.pool
            .submit(async move {
                if let Err(e) = append_tail(backend.as_ref(), &key, &message, tail_len, ttl).await
                {
                    warn!(key = %key, error = %e, "conversation tail append failed");
                }
            })
            .await;
    }

    /// The cached tail for a conversation, oldest first.  `None` on miss
    /// or backend failure (logged).
    pub async fn recent(&self, key: &ConversationKey) -> Option<Vec<ChatMessage>> {
        let raw = match self.backend.get(&Self::tail_key(key)).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key = %key, error = %e, "conversation tail read failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(messages) => Some(messages),
            Err(e) => {
                debug!(key = %key, error = %e, "discarding undecodable cached tail");
                None
            }
        }
    }

    /// Asynchronously replace a conversation's cached tail, e.g. after a
    /// read-through from the repository.
    pub async fn store_recent(&self, key: &ConversationKey, messages: Vec<ChatMessage>) {
        let backend = self.backend.clone();
        let key = Self::tail_key(key);
        let ttl = self.ttl;

        self.pool
            .submit(async move {
                let encoded = match serde_json::to_string(&messages) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        warn!(key = %key, error = %e, "tail encode failed");
                        return;
                    }
                };
                if let Err(e) = backend.set(&key, encoded, Some(ttl)).await {
                    warn!(key = %key, error = %e, "tail store failed");
                }
            })
            .await;
    }

    /// Cached group membership, if present.
    pub async fn cached_group_members(&self, group: &GroupId) -> Option<Vec<UserId>> {
        let raw = match self.backend.set_members(&Self::members_key(group)).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(group = %group, error = %e, "membership read failed");
                return None;
            }
        };
        if raw.is_empty() {
            return None;
        }
        let mut members = Vec::with_capacity(raw.len());
        for member in raw {
            match UserId::parse(&member) {
                Ok(member) => members.push(member),
                Err(e) => {
                    debug!(group = %group, error = %e, "skipping bad cached member");
                }
            }
        }
        Some(members)
    }

    /// Asynchronously remember a group's membership.
    pub async fn remember_group_members(&self, group: &GroupId, members: &[UserId]) {
        let backend = self.backend.clone();
        let key = Self::members_key(group);
        let members: Vec<String> = members.iter().map(|m| m.as_str().to_string()).collect();
        let ttl = self.ttl;

        self.pool
            .submit(async move {
                for member in members {
                    if let Err(e) = backend.add_to_set(&key, member, Some(ttl)).await {
                        warn!(key = %key, error = %e, "membership store failed");
                        return;
                    }
                }
            })
            .await;
    }

    /// Drop a group's cached membership (e.g. after a roster change).
    pub async fn forget_group_members(&self, group: &GroupId) {
        if let Err(e) = self.backend.delete(&Self::members_key(group)).await {
            warn!(group = %group, error = %e, "membership invalidation failed");
        }
    }
}

/// One read-modify-write cycle against a rolling tail.
async fn append_tail(
    backend: &dyn CacheBackend,
    key: &str,
    message: &ChatMessage,
    tail_len: usize,
    ttl: Duration,
) -> Result<()> {
    let mut tail: Vec<ChatMessage> = match backend.get(key).await? {
        // A corrupted entry is rebuilt from scratch rather than kept.
        Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        None => Vec::new(),
    };
    tail.push(message.clone());
    if tail.len() > tail_len {
        let excess = tail.len() - tail_len;
        tail.drain(..excess);
    }
    backend.set(key, serde_json::to_string(&tail)?, Some(ttl)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use chrono::Utc;
    use palaver_shared::ids::{MessageIdGen, Recipient};
    use palaver_shared::message::{DeliveryStatus, MessageKind};

    fn cache_over(backend: Arc<MemoryBackend>) -> ConversationCache {
        let pool = Arc::new(TaskPool::new(2, 16));
        ConversationCache::new(backend, pool, 3, Duration::from_secs(60))
    }

    fn message(gen: &MessageIdGen, content: &str) -> ChatMessage {
        let sender = UserId::parse("Ua").unwrap();
        let peer = UserId::parse("Ub").unwrap();
        ChatMessage {
            id: gen.next(),
            conversation_key: ConversationKey::direct(&sender, &peer),
            kind: MessageKind::Text,
            sender_id: sender,
            sender_display_name: String::new(),
            sender_avatar: None,
            recipient: Recipient::User(peer),
            content: content.into(),
            attachment_ref: None,
            attachment_meta: None,
            status: DeliveryStatus::Unsent,
            created_at: Utc::now(),
            signal: None,
            signal_payload: None,
        }
    }

    async fn wait_for_tail(
        cache: &ConversationCache,
        key: &ConversationKey,
        len: usize,
    ) -> Vec<ChatMessage> {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(tail) = cache.recent(key).await {
                    if tail.len() >= len {
                        return tail;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("tail should appear")
    }

    #[tokio::test]
    async fn append_builds_ordered_tail() {
        let cache = cache_over(Arc::new(MemoryBackend::new()));
        let gen = MessageIdGen::new(0).unwrap();

        let first = message(&gen, "one");
        let key = first.conversation_key.clone();
        cache.append(&first).await;
        let tail = wait_for_tail(&cache, &key, 1).await;
        assert_eq!(tail[0].content, "one");

        cache.append(&message(&gen, "two")).await;
        let tail = wait_for_tail(&cache, &key, 2).await;
        assert_eq!(tail[1].content, "two");
    }

    #[tokio::test]
    async fn tail_is_bounded() {
        let cache = cache_over(Arc::new(MemoryBackend::new()));
        let gen = MessageIdGen::new(0).unwrap();

        let first = message(&gen, "0");
        let key = first.conversation_key.clone();
        cache.append(&first).await;
        wait_for_tail(&cache, &key, 1).await;
        for i in 1..6 {
            let content = i.to_string();
            cache.append(&message(&gen, &content)).await;
            // Serialize appends so the read-modify-write cycles do not race
            // in this bounded-length assertion.
            tokio::time::timeout(Duration::from_secs(1), async {
                loop {
                    if let Some(tail) = cache.recent(&key).await {
                        if tail.last().map(|m| m.content.as_str()) == Some(content.as_str()) {
                            return;
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("append should land");
        }

        let tail = wait_for_tail(&cache, &key, 3).await;
        assert_eq!(tail.len(), 3);
        assert_eq!(tail.last().unwrap().content, "5");
    }

    #[tokio::test]
    async fn double_append_still_deserializes() {
        // Simulates the backpressure-triggered inline fallback racing an
        // async run of the same append: the tail must stay a valid
        // ordered list.
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_over(backend.clone());
        let gen = MessageIdGen::new(0).unwrap();
        let msg = message(&gen, "dup");
        let key = ConversationCache::tail_key(&msg.conversation_key);

        append_tail(backend.as_ref(), &key, &msg, 3, Duration::from_secs(60))
            .await
            .unwrap();
        append_tail(backend.as_ref(), &key, &msg, 3, Duration::from_secs(60))
            .await
            .unwrap();

        let tail = cache.recent(&msg.conversation_key).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail.iter().all(|m| m.id == msg.id));
    }

    #[tokio::test]
    async fn corrupted_tail_is_rebuilt() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_over(backend.clone());
        let gen = MessageIdGen::new(0).unwrap();
        let msg = message(&gen, "fresh");
        let key = ConversationCache::tail_key(&msg.conversation_key);

        backend
            .set(&key, "{not json".into(), None)
            .await
            .unwrap();
        assert!(cache.recent(&msg.conversation_key).await.is_none());

        cache.append(&msg).await;
        let tail = wait_for_tail(&cache, &msg.conversation_key, 1).await;
        assert_eq!(tail[0].content, "fresh");
    }

    #[tokio::test]
    async fn membership_round_trip() {
        let cache = cache_over(Arc::new(MemoryBackend::new()));
        let group = GroupId::parse("Gteam").unwrap();
        assert!(cache.cached_group_members(&group).await.is_none());

        let members = vec![UserId::parse("Ua").unwrap(), UserId::parse("Ub").unwrap()];
        cache.remember_group_members(&group, &members).await;

        let cached = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(cached) = cache.cached_group_members(&group).await {
                    if cached.len() == 2 {
                        return cached;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("membership should appear");
        assert!(cached.contains(&members[0]));

        cache.forget_group_members(&group).await;
        assert!(cache.cached_group_members(&group).await.is_none());
    }
}
