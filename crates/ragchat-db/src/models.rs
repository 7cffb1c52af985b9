//! Database row types. These map directly to SQLite rows and stay distinct
//! from the ragchat-types API models to keep the DB layer independent.

use ragchat_types::models::SenderKind;

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub email: String,
    pub password_hash: Option<String>,
    pub display_name: String,
    pub is_active: bool,
    pub verification_code: Option<String>,
    pub verification_expires_at: Option<String>,
    pub created_at: String,
}

/// A user as listed in the admin panel, with role names aggregated.
#[derive(Debug, Clone)]
pub struct AdminUserRow {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub is_active: bool,
    pub created_at: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Default)]
pub struct UserFilter {
    /// Case-insensitive substring of email or display name.
    pub query: Option<String>,
    pub role: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: String,
    pub owner_user_id: String,
    pub title: Option<String>,
    pub created_at: String,
    pub closed_at: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct ConversationSummaryRow {
    pub conversation: ConversationRow,
    pub messages_count: u64,
    pub last_message_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParticipantRow {
    pub conversation_id: String,
    pub user_id: String,
    pub is_owner: bool,
    pub added_at: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_user_id: Option<String>,
    pub sender: String,
    pub content: String,
    pub latency_ms: Option<i64>,
    pub metadata: String,
    pub created_at: String,
}

/// Insert payload for a transcript message.
#[derive(Debug)]
pub struct NewMessage<'a> {
    pub id: &'a str,
    pub conversation_id: &'a str,
    pub sender_user_id: Option<&'a str>,
    pub sender: SenderKind,
    pub content: &'a str,
    pub latency_ms: Option<i64>,
    /// Serialized JSON; `None` stores `{}`.
    pub metadata: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct FeedbackRow {
    pub id: String,
    pub message_id: String,
    pub user_id: String,
    pub rating: i64,
    pub comment: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Default)]
pub struct ConversationFilter {
    /// Case-insensitive substring of the title.
    pub query: Option<String>,
    pub owner_user_id: Option<String>,
    pub participant_user_id: Option<String>,
}

/// Conversation with owner details and transcript/feedback statistics.
#[derive(Debug, Clone)]
pub struct ConversationOverviewRow {
    pub conversation: ConversationRow,
    pub owner_email: Option<String>,
    pub owner_display_name: Option<String>,
    pub participants_count: u64,
    pub messages_count: u64,
    pub last_message_at: Option<String>,
    pub feedback_count: u64,
    pub avg_rating: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct TranscriptMessageRow {
    pub message: MessageRow,
    pub sender_display_name: Option<String>,
    pub sender_email: Option<String>,
}

#[derive(Debug, Default)]
pub struct FeedbackFilter {
    pub conversation_id: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FeedbackDetailRow {
    pub feedback: FeedbackRow,
    pub user_display_name: Option<String>,
    pub user_email: Option<String>,
    pub conversation_id: String,
    pub sender: String,
    pub message_created_at: String,
    pub sender_display_name: Option<String>,
    pub sender_email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FeedbackStatsRow {
    pub user_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub total_ratings: u64,
    pub avg_rating: f64,
    pub min_rating: i64,
    pub max_rating: i64,
    pub last_rated_at: Option<String>,
}

/// One conversation read back in full for review.
#[derive(Debug, Clone)]
pub struct ConversationTranscript {
    pub overview: ConversationOverviewRow,
    pub participants: Vec<ParticipantRow>,
    pub messages: Vec<TranscriptMessageRow>,
    pub feedback: Vec<FeedbackDetailRow>,
}
