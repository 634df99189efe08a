use crate::models::{AttachmentRow, MessagePage, MessageRow, NewAttachment, NewMessage, ReadRow, ReaderRow};
use crate::queries::OptionalExt;
use crate::Database;
use anyhow::Result;
use rusqlite::{Connection, Row, params};

const MESSAGE_COLUMNS: &str =
    "m.id, m.chat_id, m.sender_id, u.username, u.image, m.content, m.created_at, m.edited";

impl Database {
    /// Persist a message, its attachments and the chat's last-message cache
    /// as one unit.
    pub fn insert_message(&self, msg: &NewMessage<'_>, attachments: &[NewAttachment]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (id, chat_id, sender_id, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![msg.id, msg.chat_id, msg.sender_id, msg.content, msg.created_at],
            )?;
            for a in attachments {
                tx.execute(
                    "INSERT INTO attachments (id, message_id, url, kind) VALUES (?1, ?2, ?3, ?4)",
                    params![a.id, msg.id, a.url, a.kind],
                )?;
            }
            tx.execute(
                "UPDATE chats SET last_message = ?2, last_message_at = ?3 WHERE id = ?1",
                params![msg.chat_id, msg.content, msg.created_at],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 LEFT JOIN users u ON m.sender_id = u.id
                 WHERE m.id = ?1"
            );
            conn.query_row(&sql, [id], message_row).optional()
        })
    }

    /// Backward pagination. Without a cursor the newest `limit` messages are
    /// returned; with one, the `limit` messages strictly older than it.
    /// Returns `None` if the cursor is not a message of this chat.
    pub fn get_messages_page(
        &self,
        chat_id: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Option<MessagePage>> {
        self.with_conn(|conn| query_page(conn, chat_id, limit, cursor))
    }

    /// Returns `false` if the message no longer exists.
    pub fn update_message_content(&self, id: &str, content: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let chat_id: Option<String> = tx
                .query_row("SELECT chat_id FROM messages WHERE id = ?1", [id], |row| row.get(0))
                .optional()?;
            let Some(chat_id) = chat_id else {
                return Ok(false);
            };
            tx.execute(
                "UPDATE messages SET content = ?2, edited = 1 WHERE id = ?1",
                params![id, content],
            )?;
            refresh_last_message(&tx, &chat_id)?;
            tx.commit()?;
            Ok(true)
        })
    }

    /// Remove a message with its receipts and attachments. Returns `false` if
    /// it was already gone.
    pub fn delete_message(&self, id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let chat_id: Option<String> = tx
                .query_row("SELECT chat_id FROM messages WHERE id = ?1", [id], |row| row.get(0))
                .optional()?;
            let Some(chat_id) = chat_id else {
                return Ok(false);
            };
            tx.execute("DELETE FROM message_reads WHERE message_id = ?1", [id])?;
            tx.execute("DELETE FROM attachments WHERE message_id = ?1", [id])?;
            tx.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            refresh_last_message(&tx, &chat_id)?;
            tx.commit()?;
            Ok(true)
        })
    }

    /// Batch-fetch attachments for a set of message IDs.
    pub fn get_attachments_for_messages(&self, message_ids: &[String]) -> Result<Vec<AttachmentRow>> {
        self.with_conn(|conn| {
            query_in(
                conn,
                "SELECT id, message_id, url, kind FROM attachments WHERE message_id IN ({}) ORDER BY rowid",
                message_ids,
                |row| {
                    Ok(AttachmentRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        url: row.get(2)?,
                        kind: row.get(3)?,
                    })
                },
            )
        })
    }

    /// Batch-fetch receipts for a set of message IDs.
    pub fn get_reads_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReadRow>> {
        self.with_conn(|conn| {
            query_in(
                conn,
                "SELECT message_id, user_id, read_at FROM message_reads WHERE message_id IN ({}) ORDER BY read_at",
                message_ids,
                |row| {
                    Ok(ReadRow {
                        message_id: row.get(0)?,
                        user_id: row.get(1)?,
                        read_at: row.get(2)?,
                    })
                },
            )
        })
    }

    // -- Receipts --

    /// Upsert a receipt. Re-marking keeps one row and the later timestamp.
    pub fn upsert_read(&self, message_id: &str, user_id: &str, read_at: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO message_reads (message_id, user_id, read_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(message_id, user_id)
                 DO UPDATE SET read_at = MAX(read_at, excluded.read_at)",
                params![message_id, user_id, read_at],
            )?;
            Ok(())
        })
    }

    pub fn get_readers(&self, message_id: &str) -> Result<Vec<ReaderRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.user_id, u.username, u.image, r.read_at
                 FROM message_reads r
                 LEFT JOIN users u ON r.user_id = u.id
                 WHERE r.message_id = ?1
                 ORDER BY r.read_at",
            )?;
            let rows = stmt
                .query_map([message_id], |row| {
                    Ok(ReaderRow {
                        user_id: row.get(0)?,
                        username: row.get::<_, Option<String>>(1)?.unwrap_or_else(|| "unknown".to_string()),
                        image: row.get(2)?,
                        read_at: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_username: row.get::<_, Option<String>>(3)?.unwrap_or_else(|| "unknown".to_string()),
        sender_image: row.get(4)?,
        content: row.get(5)?,
        created_at: row.get(6)?,
        edited: row.get(7)?,
    })
}

fn query_page(conn: &Connection, chat_id: &str, limit: u32, cursor: Option<&str>) -> Result<Option<MessagePage>> {
    // One extra row tells us whether an older page exists
    let fetch = i64::from(limit) + 1;

    let mut rows = match cursor {
        None => {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 LEFT JOIN users u ON m.sender_id = u.id
                 WHERE m.chat_id = ?1
                 ORDER BY m.created_at DESC, m.rowid DESC
                 LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map(params![chat_id, fetch], message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
        Some(cursor) => {
            let anchor: Option<(String, i64)> = conn
                .query_row(
                    "SELECT created_at, rowid FROM messages WHERE id = ?1 AND chat_id = ?2",
                    [cursor, chat_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((anchor_at, anchor_rowid)) = anchor else {
                return Ok(None);
            };

            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 LEFT JOIN users u ON m.sender_id = u.id
                 WHERE m.chat_id = ?1
                   AND (m.created_at < ?2 OR (m.created_at = ?2 AND m.rowid < ?3))
                 ORDER BY m.created_at DESC, m.rowid DESC
                 LIMIT ?4"
            );
            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map(params![chat_id, anchor_at, anchor_rowid, fetch], message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    let has_more = rows.len() > limit as usize;
    rows.truncate(limit as usize);
    rows.reverse();

    Ok(Some(MessagePage { rows, has_more }))
}

fn refresh_last_message(conn: &Connection, chat_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE chats SET
            last_message = (SELECT content FROM messages WHERE chat_id = ?1
                            ORDER BY created_at DESC, rowid DESC LIMIT 1),
            last_message_at = (SELECT created_at FROM messages WHERE chat_id = ?1
                               ORDER BY created_at DESC, rowid DESC LIMIT 1)
         WHERE id = ?1",
        [chat_id],
    )?;
    Ok(())
}

fn query_in<T, F>(conn: &Connection, template: &str, ids: &[String], map: F) -> Result<Vec<T>>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    if ids.is_empty() {
        return Ok(vec![]);
    }

    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
    let sql = template.replace("{}", &placeholders.join(", "));

    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();

    let rows = stmt
        .query_map(params.as_slice(), map)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
