//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `users`, `groups`, `group_members`,
//! and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,   -- U-prefixed id
    display_name TEXT NOT NULL,
    avatar       TEXT,                        -- storage-relative path
    created_at   TEXT NOT NULL                -- ISO-8601 / RFC-3339
);

-- ----------------------------------------------------------------
-- Groups
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS groups (
    id         TEXT PRIMARY KEY NOT NULL,     -- G-prefixed id
    name       TEXT NOT NULL,
    owner_id   TEXT NOT NULL,                 -- U-prefixed id
    created_at TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Group membership
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS group_members (
    group_id TEXT NOT NULL,                   -- FK -> groups(id)
    user_id  TEXT NOT NULL,                   -- U-prefixed id

    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_group_members_group ON group_members(group_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id                      INTEGER PRIMARY KEY NOT NULL,  -- sortable 64-bit id
    conversation_key        TEXT NOT NULL,
    kind                    TEXT NOT NULL,     -- text | file | audio_video
    sender_id               TEXT NOT NULL,
    sender_display_name     TEXT NOT NULL,
    sender_avatar           TEXT,
    recipient               TEXT NOT NULL,     -- U* or G* id
    content                 TEXT NOT NULL,
    attachment_ref          TEXT,
    attachment_content_type TEXT,
    attachment_name         TEXT,
    attachment_size         INTEGER,
    status                  TEXT NOT NULL,     -- unsent | sent
    created_at              TEXT NOT NULL,     -- ISO-8601
    signal                  TEXT,
    signal_payload          TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_key, id DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
