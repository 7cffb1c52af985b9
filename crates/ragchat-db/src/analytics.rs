//! Read-only reporting over every conversation, open or closed.
//! Access control happens in the API layer.

use crate::Database;
use crate::chat::{map_conversation, map_feedback, map_message, query_participants};
use crate::models::{
    ConversationFilter, ConversationOverviewRow, ConversationTranscript, FeedbackDetailRow, FeedbackFilter,
    FeedbackStatsRow, TranscriptMessageRow,
};
use anyhow::Result;
use rusqlite::{OptionalExtension, Row};

const OVERVIEW_SELECT: &str = "SELECT c.id, c.owner_user_id, c.title, c.created_at, c.closed_at, c.is_active,
        o.email, o.display_name,
        (SELECT COUNT(*) FROM participants p WHERE p.conversation_id = c.id),
        (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id),
        (SELECT MAX(m.created_at) FROM messages m WHERE m.conversation_id = c.id),
        (SELECT COUNT(*) FROM message_feedback f JOIN messages m ON m.id = f.message_id
         WHERE m.conversation_id = c.id),
        (SELECT AVG(f.rating) FROM message_feedback f JOIN messages m ON m.id = f.message_id
         WHERE m.conversation_id = c.id)
     FROM conversations c
     LEFT JOIN users o ON o.id = c.owner_user_id";

const OVERVIEW_FILTER: &str = "WHERE (?1 IS NULL OR lower(COALESCE(c.title, '')) LIKE ?1)
       AND (?2 IS NULL OR c.owner_user_id = ?2)
       AND (?3 IS NULL OR EXISTS (
            SELECT 1 FROM participants p WHERE p.conversation_id = c.id AND p.user_id = ?3))";

const FEEDBACK_DETAIL_SELECT: &str = "SELECT f.id, f.message_id, f.user_id, f.rating, f.comment, f.created_at,
        fu.display_name, fu.email,
        m.conversation_id, m.sender, m.created_at,
        su.display_name, su.email
     FROM message_feedback f
     JOIN messages m ON m.id = f.message_id
     LEFT JOIN users fu ON fu.id = f.user_id
     LEFT JOIN users su ON su.id = m.sender_user_id";

const FEEDBACK_FILTER: &str = "WHERE (?1 IS NULL OR m.conversation_id = ?1) AND (?2 IS NULL OR f.user_id = ?2)";

impl Database {
    /// Page through all conversations, newest first.
    pub fn list_conversation_overviews(
        &self,
        filter: &ConversationFilter,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<ConversationOverviewRow>, u64)> {
        self.with_conn(|conn| {
            let pattern = filter.query.as_deref().map(|q| format!("%{}%", q.to_lowercase()));
            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM conversations c {OVERVIEW_FILTER}"),
                rusqlite::params![pattern, filter.owner_user_id, filter.participant_user_id],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(&format!(
                "{OVERVIEW_SELECT}
                 {OVERVIEW_FILTER}
                 ORDER BY c.created_at DESC, c.rowid DESC
                 LIMIT ?4 OFFSET ?5"
            ))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![pattern, filter.owner_user_id, filter.participant_user_id, limit, offset],
                    map_overview,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok((rows, total.max(0) as u64))
        })
    }

    /// Everything needed to read one conversation back: stats, participants,
    /// the transcript with sender names, and all feedback on it.
    pub fn conversation_transcript(&self, conversation_id: &str) -> Result<Option<ConversationTranscript>> {
        self.with_conn(|conn| {
            let Some(overview) = conn
                .query_row(&format!("{OVERVIEW_SELECT} WHERE c.id = ?1"), [conversation_id], map_overview)
                .optional()?
            else {
                return Ok(None);
            };

            let participants = query_participants(conn, conversation_id)?;

            let mut stmt = conn.prepare(
                "SELECT m.id, m.conversation_id, m.sender_user_id, m.sender, m.content, m.latency_ms,
                        m.metadata, m.created_at, su.display_name, su.email
                 FROM messages m
                 LEFT JOIN users su ON su.id = m.sender_user_id
                 WHERE m.conversation_id = ?1
                 ORDER BY m.created_at ASC, m.rowid ASC",
            )?;
            let messages = stmt
                .query_map([conversation_id], |row| {
                    Ok(TranscriptMessageRow {
                        message: map_message(row)?,
                        sender_display_name: row.get(8)?,
                        sender_email: row.get(9)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare(&format!(
                "{FEEDBACK_DETAIL_SELECT}
                 WHERE m.conversation_id = ?1
                 ORDER BY f.created_at ASC, f.rowid ASC"
            ))?;
            let feedback = stmt
                .query_map([conversation_id], map_feedback_detail)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(Some(ConversationTranscript { overview, participants, messages, feedback }))
        })
    }

    /// Individual ratings, newest first.
    pub fn list_feedback(
        &self,
        filter: &FeedbackFilter,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<FeedbackDetailRow>, u64)> {
        self.with_conn(|conn| {
            let total: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM message_feedback f
                     JOIN messages m ON m.id = f.message_id
                     {FEEDBACK_FILTER}"
                ),
                rusqlite::params![filter.conversation_id, filter.user_id],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(&format!(
                "{FEEDBACK_DETAIL_SELECT}
                 {FEEDBACK_FILTER}
                 ORDER BY f.created_at DESC, f.rowid DESC
                 LIMIT ?3 OFFSET ?4"
            ))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![filter.conversation_id, filter.user_id, limit, offset],
                    map_feedback_detail,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok((rows, total.max(0) as u64))
        })
    }

    /// Rating statistics per rater, most active first.
    pub fn feedback_stats_by_user(&self) -> Result<Vec<FeedbackStatsRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT f.user_id, u.email, u.display_name,
                        COUNT(*), AVG(f.rating), MIN(f.rating), MAX(f.rating), MAX(f.created_at)
                 FROM message_feedback f
                 LEFT JOIN users u ON u.id = f.user_id
                 GROUP BY f.user_id
                 ORDER BY COUNT(*) DESC, AVG(f.rating) DESC, f.user_id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let total: i64 = row.get(3)?;
                    Ok(FeedbackStatsRow {
                        user_id: row.get(0)?,
                        email: row.get(1)?,
                        display_name: row.get(2)?,
                        total_ratings: total.max(0) as u64,
                        avg_rating: row.get(4)?,
                        min_rating: row.get(5)?,
                        max_rating: row.get(6)?,
                        last_rated_at: row.get(7)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn map_overview(row: &Row<'_>) -> rusqlite::Result<ConversationOverviewRow> {
    let participants: i64 = row.get(8)?;
    let messages: i64 = row.get(9)?;
    let feedback: i64 = row.get(11)?;
    Ok(ConversationOverviewRow {
        conversation: map_conversation(row)?,
        owner_email: row.get(6)?,
        owner_display_name: row.get(7)?,
        participants_count: participants.max(0) as u64,
        messages_count: messages.max(0) as u64,
        last_message_at: row.get(10)?,
        feedback_count: feedback.max(0) as u64,
        avg_rating: row.get(12)?,
    })
}

fn map_feedback_detail(row: &Row<'_>) -> rusqlite::Result<FeedbackDetailRow> {
    Ok(FeedbackDetailRow {
        feedback: map_feedback(row)?,
        user_display_name: row.get(6)?,
        user_email: row.get(7)?,
        conversation_id: row.get(8)?,
        sender: row.get(9)?,
        message_created_at: row.get(10)?,
        sender_display_name: row.get(11)?,
        sender_email: row.get(12)?,
    })
}
