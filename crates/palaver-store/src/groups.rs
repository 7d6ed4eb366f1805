//! CRUD operations for [`Group`] records and group membership.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use palaver_shared::ids::{GroupId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Group;

impl Database {
    /// Insert a new group.
    pub fn create_group(&self, group: &Group) -> Result<()> {
        insert_group(self.conn(), group)
    }

    /// Add a member to a group.  Inserting an existing member is a no-op.
    pub fn add_group_member(&self, group_id: &GroupId, user_id: &UserId) -> Result<()> {
        insert_group_member(self.conn(), group_id, user_id)
    }

    /// Remove a member from a group.  Returns `true` if a row was deleted.
    pub fn remove_group_member(&self, group_id: &GroupId, user_id: &UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            params![group_id.as_str(), user_id.as_str()],
        )?;
        Ok(affected > 0)
    }

    /// Fetch a single group by id.
    pub fn get_group(&self, id: &GroupId) -> Result<Group> {
        self.conn()
            .query_row(
                "SELECT id, name, owner_id, created_at FROM groups WHERE id = ?1",
                params![id.as_str()],
                row_to_group,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// List the current members of a group.
    pub fn group_members(&self, group_id: &GroupId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id FROM group_members WHERE group_id = ?1 ORDER BY user_id",
        )?;

        let rows = stmt.query_map(params![group_id.as_str()], |row| {
            let raw: String = row.get(0)?;
            UserId::parse(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    e.to_string().into(),
                )
            })
        })?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }
}

/// Insert helper usable inside a transaction.
pub fn insert_group(conn: &Connection, group: &Group) -> Result<()> {
    conn.execute(
        "INSERT INTO groups (id, name, owner_id, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            group.id.as_str(),
            group.name,
            group.owner_id.as_str(),
            group.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Membership insert helper usable inside a transaction.
pub fn insert_group_member(conn: &Connection, group_id: &GroupId, user_id: &UserId) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?1, ?2)",
        params![group_id.as_str(), user_id.as_str()],
    )?;
    Ok(())
}

/// Map a `rusqlite::Row` to a [`Group`].
fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    let id_str: String = row.get(0)?;
    let name: String = row.get(1)?;
    let owner_str: String = row.get(2)?;
    let created_str: String = row.get(3)?;

    let id = GroupId::parse(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.to_string().into())
    })?;
    let owner_id = UserId::parse(&owner_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.to_string().into())
    })?;
    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Group {
        id,
        name,
        owner_id,
        created_at,
    })
}
