//! Row-to-wire conversions. Corrupt stored values are logged and replaced
//! with defaults rather than failing the whole response.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use ragchat_db::models::{
    AdminUserRow, ConversationOverviewRow, ConversationRow, ConversationSummaryRow, FeedbackDetailRow, FeedbackRow,
    FeedbackStatsRow, MessageRow, ParticipantRow, TranscriptMessageRow, UserRow,
};
use ragchat_db::parse_timestamp;
use ragchat_types::api::{
    AdminUserResponse, ConversationOverviewResponse, ConversationResponse, FeedbackDetailResponse, FeedbackResponse,
    FeedbackStatsResponse, MessageResponse, ParticipantResponse, TranscriptMessageResponse, UserResponse,
};
use ragchat_types::models::SenderKind;

pub fn uuid(raw: &str, what: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, raw, e);
        Uuid::default()
    })
}

pub fn time(raw: &str, what: &str) -> DateTime<Utc> {
    parse_timestamp(raw).unwrap_or_else(|| {
        warn!("Corrupt {} '{}'", what, raw);
        DateTime::default()
    })
}

fn opt_time(raw: Option<&str>, what: &str) -> Option<DateTime<Utc>> {
    raw.map(|r| time(r, what))
}

pub fn user(row: &UserRow) -> UserResponse {
    UserResponse {
        id: uuid(&row.id, "user id"),
        email: row.email.clone(),
        display_name: row.display_name.clone(),
        is_active: row.is_active,
        has_password: row.password_hash.is_some(),
    }
}

pub fn admin_user(row: AdminUserRow) -> AdminUserResponse {
    AdminUserResponse {
        id: uuid(&row.id, "user id"),
        created_at: time(&row.created_at, "user created_at"),
        email: row.email,
        display_name: row.display_name,
        is_active: row.is_active,
        roles: row.roles,
    }
}

pub fn participant(row: ParticipantRow) -> ParticipantResponse {
    ParticipantResponse {
        conversation_id: uuid(&row.conversation_id, "conversation id"),
        user_id: uuid(&row.user_id, "participant user id"),
        is_owner: row.is_owner,
        added_at: time(&row.added_at, "participant added_at"),
        display_name: row.display_name,
        email: row.email,
    }
}

pub fn conversation(row: ConversationRow, participants: Option<Vec<ParticipantRow>>) -> ConversationResponse {
    ConversationResponse {
        id: uuid(&row.id, "conversation id"),
        owner_user_id: uuid(&row.owner_user_id, "conversation owner"),
        created_at: time(&row.created_at, "conversation created_at"),
        closed_at: opt_time(row.closed_at.as_deref(), "conversation closed_at"),
        title: row.title,
        is_active: row.is_active,
        participants: participants.map(|p| p.into_iter().map(participant).collect()),
        messages_count: None,
        last_message_at: None,
    }
}

pub fn conversation_summary(
    row: ConversationSummaryRow,
    participants: Option<Vec<ParticipantRow>>,
) -> ConversationResponse {
    let last_message_at = opt_time(row.last_message_at.as_deref(), "last_message_at");
    ConversationResponse {
        messages_count: Some(row.messages_count),
        last_message_at,
        ..conversation(row.conversation, participants)
    }
}

fn sender(raw: &str, owner: &str) -> SenderKind {
    raw.parse::<SenderKind>().unwrap_or_else(|e| {
        warn!("Corrupt sender on message '{}': {}", owner, e);
        SenderKind::System
    })
}

fn rating(raw: i64, owner: &str) -> u8 {
    u8::try_from(raw).unwrap_or_else(|_| {
        warn!("Corrupt rating {} on '{}'", raw, owner);
        0
    })
}

pub fn message(row: MessageRow, feedback: Option<Vec<FeedbackResponse>>) -> MessageResponse {
    let sender = sender(&row.sender, &row.id);
    let metadata = serde_json::from_str::<Value>(&row.metadata).unwrap_or_else(|e| {
        warn!("Corrupt metadata on message '{}': {}", row.id, e);
        Value::Object(Default::default())
    });
    MessageResponse {
        id: uuid(&row.id, "message id"),
        conversation_id: uuid(&row.conversation_id, "message conversation id"),
        sender_user_id: row.sender_user_id.as_deref().map(|u| uuid(u, "message sender id")),
        sender,
        content: row.content,
        latency_ms: row.latency_ms,
        metadata,
        created_at: time(&row.created_at, "message created_at"),
        feedback,
    }
}

pub fn feedback(row: FeedbackRow) -> FeedbackResponse {
    FeedbackResponse {
        id: uuid(&row.id, "feedback id"),
        message_id: uuid(&row.message_id, "feedback message id"),
        user_id: uuid(&row.user_id, "feedback user id"),
        rating: rating(row.rating, &row.id),
        comment: row.comment,
        created_at: time(&row.created_at, "feedback created_at"),
    }
}

pub fn conversation_overview(row: ConversationOverviewRow) -> ConversationOverviewResponse {
    let c = row.conversation;
    ConversationOverviewResponse {
        id: uuid(&c.id, "conversation id"),
        owner_user_id: uuid(&c.owner_user_id, "conversation owner"),
        owner_email: row.owner_email,
        owner_display_name: row.owner_display_name,
        title: c.title,
        created_at: time(&c.created_at, "conversation created_at"),
        closed_at: opt_time(c.closed_at.as_deref(), "conversation closed_at"),
        is_active: c.is_active,
        participants_count: row.participants_count,
        messages_count: row.messages_count,
        last_message_at: opt_time(row.last_message_at.as_deref(), "last_message_at"),
        feedback_count: row.feedback_count,
        avg_rating: row.avg_rating,
    }
}

pub fn feedback_detail(row: FeedbackDetailRow) -> FeedbackDetailResponse {
    let sender = sender(&row.sender, &row.feedback.message_id);
    FeedbackDetailResponse {
        conversation_id: uuid(&row.conversation_id, "feedback conversation id"),
        message_created_at: time(&row.message_created_at, "message created_at"),
        feedback: feedback(row.feedback),
        user_display_name: row.user_display_name,
        user_email: row.user_email,
        sender,
        sender_display_name: row.sender_display_name,
        sender_email: row.sender_email,
    }
}

/// Transcript entry; the feedback list replaces the plain one on the message.
pub fn transcript_message(row: TranscriptMessageRow, feedback: Vec<FeedbackDetailResponse>) -> TranscriptMessageResponse {
    TranscriptMessageResponse {
        message: message(row.message, None),
        sender_display_name: row.sender_display_name,
        sender_email: row.sender_email,
        feedback,
    }
}

pub fn feedback_stats(row: FeedbackStatsRow) -> FeedbackStatsResponse {
    FeedbackStatsResponse {
        user_id: uuid(&row.user_id, "rater id"),
        email: row.email,
        display_name: row.display_name,
        total_ratings: row.total_ratings,
        avg_rating: row.avg_rating,
        min_rating: rating(row.min_rating, &row.user_id),
        max_rating: rating(row.max_rating, &row.user_id),
        last_rated_at: opt_time(row.last_rated_at.as_deref(), "last rated_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_values_fall_back_to_defaults() {
        let row = MessageRow {
            id: "not-a-uuid".into(),
            conversation_id: Uuid::new_v4().to_string(),
            sender_user_id: None,
            sender: "robot".into(),
            content: "hi".into(),
            latency_ms: Some(3),
            metadata: "{broken".into(),
            created_at: "yesterday".into(),
        };
        let msg = message(row, None);
        assert_eq!(msg.id, Uuid::default());
        assert_eq!(msg.sender, SenderKind::System);
        assert_eq!(msg.metadata, serde_json::json!({}));
        assert_eq!(msg.created_at, DateTime::<Utc>::default());
    }

    #[test]
    fn summary_carries_counts() {
        let id = Uuid::new_v4();
        let row = ConversationSummaryRow {
            conversation: ConversationRow {
                id: id.to_string(),
                owner_user_id: Uuid::new_v4().to_string(),
                title: Some("t".into()),
                created_at: "2024-01-01T00:00:00.000Z".into(),
                closed_at: None,
                is_active: true,
            },
            messages_count: 4,
            last_message_at: Some("2024-01-02T00:00:00.000Z".into()),
        };
        let resp = conversation_summary(row, None);
        assert_eq!(resp.id, id);
        assert_eq!(resp.messages_count, Some(4));
        assert!(resp.last_message_at.is_some());
        assert!(resp.participants.is_none());
    }
}
