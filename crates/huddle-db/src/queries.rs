use crate::models::{ChatRow, LeaveOutcome, MemberRow, NewChat, UserRow};
use crate::Database;
use anyhow::Result;
use rusqlite::{Connection, params};

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, image: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, image) VALUES (?1, ?2, ?3)",
                params![id, username, image],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, username, image, created_at FROM users WHERE id = ?1",
                [id],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        image: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }

    // -- Chats --

    /// Create a chat and its memberships in one transaction. The creator is
    /// made admin; everyone else joins as a plain member.
    pub fn create_chat(&self, chat: &NewChat<'_>, creator_id: &str, member_ids: &[String]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO chats (id, is_group, name, image, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![chat.id, chat.is_group, chat.name, chat.image, chat.created_at],
            )?;
            for member_id in member_ids {
                let role = if member_id == creator_id { "admin" } else { "member" };
                tx.execute(
                    "INSERT OR IGNORE INTO chat_members (chat_id, user_id, role, joined_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![chat.id, member_id, role, chat.created_at],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_chat(&self, id: &str) -> Result<Option<ChatRow>> {
        self.with_conn(|conn| query_chat(conn, id))
    }

    /// Existing non-group chat between exactly these two users.
    pub fn find_direct_chat(&self, a: &str, b: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT c.id FROM chats c
                 WHERE c.is_group = 0
                   AND EXISTS (SELECT 1 FROM chat_members WHERE chat_id = c.id AND user_id = ?1)
                   AND EXISTS (SELECT 1 FROM chat_members WHERE chat_id = c.id AND user_id = ?2)
                 LIMIT 1",
                [a, b],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn is_member(&self, chat_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM chat_members WHERE chat_id = ?1 AND user_id = ?2",
                    [chat_id, user_id],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn get_members(&self, chat_id: &str) -> Result<Vec<MemberRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT cm.chat_id, cm.user_id, u.username, u.image, cm.role, cm.joined_at
                 FROM chat_members cm
                 LEFT JOIN users u ON cm.user_id = u.id
                 WHERE cm.chat_id = ?1
                 ORDER BY cm.joined_at, cm.rowid",
            )?;
            let rows = stmt
                .query_map([chat_id], |row| {
                    Ok(MemberRow {
                        chat_id: row.get(0)?,
                        user_id: row.get(1)?,
                        username: row.get::<_, Option<String>>(2)?.unwrap_or_else(|| "unknown".to_string()),
                        image: row.get(3)?,
                        role: row.get(4)?,
                        joined_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Remove a member. An emptied chat is deleted together with its
    /// messages; a chat left without an admin promotes its longest-standing
    /// member.
    pub fn leave_chat(&self, chat_id: &str, user_id: &str) -> Result<LeaveOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM chat_members WHERE chat_id = ?1 AND user_id = ?2",
                [chat_id, user_id],
            )?;
            if removed == 0 {
                return Ok(LeaveOutcome::NotMember);
            }

            let remaining: i64 = tx.query_row(
                "SELECT COUNT(*) FROM chat_members WHERE chat_id = ?1",
                [chat_id],
                |row| row.get(0),
            )?;

            if remaining == 0 {
                // Cascades to messages, attachments and receipts
                tx.execute("DELETE FROM chats WHERE id = ?1", [chat_id])?;
                tx.commit()?;
                return Ok(LeaveOutcome::ChatDeleted);
            }

            let admins: i64 = tx.query_row(
                "SELECT COUNT(*) FROM chat_members WHERE chat_id = ?1 AND role = 'admin'",
                [chat_id],
                |row| row.get(0),
            )?;

            let mut promoted = None;
            if admins == 0 {
                let heir: String = tx.query_row(
                    "SELECT user_id FROM chat_members WHERE chat_id = ?1
                     ORDER BY joined_at, rowid LIMIT 1",
                    [chat_id],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "UPDATE chat_members SET role = 'admin' WHERE chat_id = ?1 AND user_id = ?2",
                    [chat_id, heir.as_str()],
                )?;
                promoted = Some(heir);
            }

            tx.commit()?;
            Ok(LeaveOutcome::Left { promoted })
        })
    }
}

pub(crate) fn query_chat(conn: &Connection, id: &str) -> Result<Option<ChatRow>> {
    conn.query_row(
        "SELECT id, is_group, name, image, last_message, last_message_at, created_at
         FROM chats WHERE id = ?1",
        [id],
        |row| {
            Ok(ChatRow {
                id: row.get(0)?,
                is_group: row.get(1)?,
                name: row.get(2)?,
                image: row.get(3)?,
                last_message: row.get(4)?,
                last_message_at: row.get(5)?,
                created_at: row.get(6)?,
            })
        },
    )
    .optional()
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
