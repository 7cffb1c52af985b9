use crate::models::{
    ConversationRow, ConversationSummaryRow, FeedbackRow, MessageRow, NewMessage, ParticipantRow,
};
use crate::Database;
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row};

const CONVERSATION_COLUMNS: &str = "c.id, c.owner_user_id, c.title, c.created_at, c.closed_at, c.is_active";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_user_id, sender, content, latency_ms, metadata, created_at";
const FEEDBACK_COLUMNS: &str = "id, message_id, user_id, rating, comment, created_at";

/// Aggregates appended to conversation rows by the summary queries.
const SUMMARY_STATS: &str = "(SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id),
     (SELECT MAX(m.created_at) FROM messages m WHERE m.conversation_id = c.id)";

impl Database {
    // -- Conversations --

    /// Insert the conversation and its owner participant atomically.
    pub fn create_conversation(
        &self,
        id: &str,
        owner_user_id: &str,
        title: Option<&str>,
        now: &str,
    ) -> Result<(ConversationRow, Vec<ParticipantRow>)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO conversations (id, owner_user_id, title, created_at) VALUES (?1, ?2, ?3, ?4)",
                (id, owner_user_id, title, now),
            )?;
            tx.execute(
                "INSERT INTO participants (conversation_id, user_id, is_owner, added_at)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT (conversation_id, user_id) DO NOTHING",
                (id, owner_user_id, now),
            )?;
            let conversation = tx.query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1"),
                [id],
                map_conversation,
            )?;
            let participants = query_participants(&tx, id)?;
            tx.commit()?;
            Ok((conversation, participants))
        })
    }

    /// `Some(is_owner)` when the user participates in the conversation and it is
    /// still active, `None` otherwise.
    pub fn active_membership(&self, conversation_id: &str, user_id: &str) -> Result<Option<bool>> {
        self.with_conn(|conn| {
            let is_owner = conn
                .query_row(
                    "SELECT p.is_owner
                     FROM participants p
                     JOIN conversations c ON c.id = p.conversation_id AND c.is_active = 1
                     WHERE p.conversation_id = ?1 AND p.user_id = ?2",
                    (conversation_id, user_id),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(is_owner)
        })
    }

    /// Insert-or-ignore. Returns `true` if the participant is new.
    pub fn add_participant(&self, conversation_id: &str, user_id: &str, now: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT INTO participants (conversation_id, user_id, is_owner, added_at)
                 VALUES (?1, ?2, 0, ?3)
                 ON CONFLICT (conversation_id, user_id) DO NOTHING",
                (conversation_id, user_id, now),
            )?;
            Ok(inserted == 1)
        })
    }

    pub fn list_participants(&self, conversation_id: &str) -> Result<Vec<ParticipantRow>> {
        self.with_conn(|conn| query_participants(conn, conversation_id))
    }

    /// Soft-close an active conversation owned by `owner_user_id`.
    /// Already-closed or foreign conversations yield `None`.
    pub fn close_conversation(
        &self,
        conversation_id: &str,
        owner_user_id: &str,
        now: &str,
    ) -> Result<Option<ConversationRow>> {
        self.with_conn_mut(|conn| {
            let row = conn
                .query_row(
                    "UPDATE conversations AS c
                     SET is_active = 0, closed_at = COALESCE(c.closed_at, ?3)
                     WHERE c.id = ?1 AND c.owner_user_id = ?2 AND c.is_active = 1
                     RETURNING id, owner_user_id, title, created_at, closed_at, is_active",
                    (conversation_id, owner_user_id, now),
                    map_conversation,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Conversation detail with stats, visible only to active participants.
    pub fn get_conversation_for(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<ConversationSummaryRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {CONVERSATION_COLUMNS}, {SUMMARY_STATS}
                         FROM conversations c
                         JOIN participants p ON p.conversation_id = c.id AND p.user_id = ?2
                         WHERE c.id = ?1 AND c.is_active = 1"
                    ),
                    (conversation_id, user_id),
                    map_summary,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Active conversations the user belongs to, most recent activity first.
    pub fn list_conversations_for(
        &self,
        user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<ConversationSummaryRow>, u64)> {
        self.with_conn(|conn| {
            let total: i64 = conn.query_row(
                "SELECT COUNT(*)
                 FROM participants p
                 JOIN conversations c ON c.id = p.conversation_id
                 WHERE p.user_id = ?1 AND c.is_active = 1",
                [user_id],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS}, {SUMMARY_STATS}
                 FROM conversations c
                 JOIN participants p ON p.conversation_id = c.id AND p.user_id = ?1
                 WHERE c.is_active = 1
                 ORDER BY COALESCE(
                     (SELECT MAX(m.created_at) FROM messages m WHERE m.conversation_id = c.id),
                     c.created_at) DESC
                 LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, limit, offset], map_summary)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok((rows, total.max(0) as u64))
        })
    }

    // -- Messages --

    pub fn insert_message(&self, message: &NewMessage<'_>, now: &str) -> Result<MessageRow> {
        self.with_conn_mut(|conn| {
            let row = conn.query_row(
                &format!(
                    "INSERT INTO messages
                         (id, conversation_id, sender_user_id, sender, content, latency_ms, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, COALESCE(?7, '{{}}'), ?8)
                     RETURNING {MESSAGE_COLUMNS}"
                ),
                rusqlite::params![
                    message.id,
                    message.conversation_id,
                    message.sender_user_id,
                    message.sender.as_str(),
                    message.content,
                    message.latency_ms,
                    message.metadata,
                    now,
                ],
                map_message,
            )?;
            Ok(row)
        })
    }

    /// Full transcript in chronological order.
    pub fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt
                .query_map([conversation_id], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Feedback --

    /// Whether `user_id` participates in the active conversation holding the message.
    pub fn message_visible_to(&self, message_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1
                     FROM messages m
                     JOIN conversations c ON c.id = m.conversation_id AND c.is_active = 1
                     JOIN participants p ON p.conversation_id = m.conversation_id AND p.user_id = ?2
                     WHERE m.id = ?1",
                    (message_id, user_id),
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// One rating per (message, user): a repeat replaces rating, comment and timestamp.
    pub fn upsert_feedback(
        &self,
        id: &str,
        message_id: &str,
        user_id: &str,
        rating: u8,
        comment: Option<&str>,
        now: &str,
    ) -> Result<FeedbackRow> {
        self.with_conn_mut(|conn| {
            let row = conn.query_row(
                &format!(
                    "INSERT INTO message_feedback (id, message_id, user_id, rating, comment, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (message_id, user_id) DO UPDATE
                       SET rating = excluded.rating,
                           comment = excluded.comment,
                           created_at = excluded.created_at
                     RETURNING {FEEDBACK_COLUMNS}"
                ),
                rusqlite::params![id, message_id, user_id, rating, comment, now],
                map_feedback,
            )?;
            Ok(row)
        })
    }

    /// Batch-fetch feedback for a set of message IDs.
    pub fn feedback_for_messages(&self, message_ids: &[String]) -> Result<Vec<FeedbackRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT {FEEDBACK_COLUMNS} FROM message_feedback
                 WHERE message_id IN ({})
                 ORDER BY created_at",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(message_ids.iter()), map_feedback)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

pub(crate) fn query_participants(conn: &Connection, conversation_id: &str) -> Result<Vec<ParticipantRow>> {
    let mut stmt = conn.prepare(
        "SELECT p.conversation_id, p.user_id, p.is_owner, p.added_at, u.display_name, u.email
         FROM participants p
         LEFT JOIN users u ON u.id = p.user_id
         WHERE p.conversation_id = ?1
         ORDER BY p.added_at, p.rowid",
    )?;
    let rows = stmt
        .query_map([conversation_id], |row| {
            Ok(ParticipantRow {
                conversation_id: row.get(0)?,
                user_id: row.get(1)?,
                is_owner: row.get(2)?,
                added_at: row.get(3)?,
                display_name: row.get(4)?,
                email: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn map_conversation(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        title: row.get(2)?,
        created_at: row.get(3)?,
        closed_at: row.get(4)?,
        is_active: row.get(5)?,
    })
}

fn map_summary(row: &Row<'_>) -> rusqlite::Result<ConversationSummaryRow> {
    let count: i64 = row.get(6)?;
    Ok(ConversationSummaryRow {
        conversation: map_conversation(row)?,
        messages_count: count.max(0) as u64,
        last_message_at: row.get(7)?,
    })
}

pub(crate) fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_user_id: row.get(2)?,
        sender: row.get(3)?,
        content: row.get(4)?,
        latency_ms: row.get(5)?,
        metadata: row.get(6)?,
        created_at: row.get(7)?,
    })
}

pub(crate) fn map_feedback(row: &Row<'_>) -> rusqlite::Result<FeedbackRow> {
    Ok(FeedbackRow {
        id: row.get(0)?,
        message_id: row.get(1)?,
        user_id: row.get(2)?,
        rating: row.get(3)?,
        comment: row.get(4)?,
        created_at: row.get(5)?,
    })
}
