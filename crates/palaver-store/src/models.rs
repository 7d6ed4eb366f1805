//! Domain model structs persisted alongside messages.
//!
//! The message model itself lives in `palaver-shared` because the wire
//! protocol and the cache serialize the same struct.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use palaver_shared::ids::{GroupId, UserId};

/// A known user identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    /// Storage-relative avatar path.
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A group conversation.  Membership lives in its own table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub owner_id: UserId,
    pub created_at: DateTime<Utc>,
}
