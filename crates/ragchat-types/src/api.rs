use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::SenderKind;

// -- Envelopes --

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub ok: bool,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn new(data: T) -> Self {
        Self { ok: true, data }
    }
}

#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub ok: bool,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub data: Vec<T>,
}

/// Raw paging parameters. Parsed leniently: garbage falls back to defaults.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<String>,
    pub limit: Option<String>,
}

impl PageQuery {
    pub const DEFAULT_LIMIT: u32 = 20;
    pub const MAX_LIMIT: u32 = 100;

    /// Returns `(page, limit)` with page >= 1 and limit in 1..=100.
    pub fn resolve(&self) -> (u32, u32) {
        let page = self
            .page
            .as_deref()
            .and_then(|p| p.trim().parse::<u32>().ok())
            .filter(|p| *p >= 1)
            .unwrap_or(1);
        let limit = self
            .limit
            .as_deref()
            .and_then(|l| l.trim().parse::<u32>().ok())
            .filter(|l| *l >= 1)
            .unwrap_or(Self::DEFAULT_LIMIT)
            .min(Self::MAX_LIMIT);
        (page, limit)
    }
}

// -- Auth --

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: Option<String>,
    #[serde(alias = "name")]
    pub display_name: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: Option<String>,
    pub password: Option<String>,
}

/// `code` may arrive as a string or as a bare JSON number.
#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub code: Option<Value>,
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetPasswordRequest {
    pub password: Option<String>,
    pub current_password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OAuthCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub is_active: bool,
    pub has_password: bool,
}

/// Returned once a session is bound to a user.
#[derive(Debug, Serialize)]
pub struct AuthenticatedResponse {
    pub ok: bool,
    pub user: UserResponse,
    pub roles: Vec<String>,
}

/// Login or OAuth succeeded but an emailed code must be confirmed first.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRequiredResponse {
    pub ok: bool,
    pub requires_verification: bool,
    pub email: String,
}

/// OAuth found no account for the email; the caller must register.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequiredResponse {
    pub ok: bool,
    pub requires_registration: bool,
    pub email: String,
}

/// Registration completed after an OAuth attempt; repeat the OAuth exchange to link.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleLinkRequiredResponse {
    pub ok: bool,
    pub requires_google_link: bool,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub is_authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<MeUser>,
}

#[derive(Debug, Serialize)]
pub struct MeUser {
    pub id: Uuid,
    pub display_name: String,
    pub email: String,
    pub roles: Vec<String>,
    pub has_password: bool,
}

// -- Account --

#[derive(Debug, Deserialize)]
pub struct UpdateAccountRequest {
    pub display_name: Option<String>,
    pub current_password: Option<String>,
    pub new_password: Option<String>,
    pub confirm_password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub id: Uuid,
    pub display_name: String,
    pub email: String,
    #[serde(rename = "hasPassword")]
    pub has_password: bool,
}

// -- Conversations --

#[derive(Debug, Default, Deserialize)]
pub struct CreateConversationRequest {
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddParticipantRequest {
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantResponse {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub is_owner: bool,
    pub added_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<ParticipantResponse>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

// -- Messages --

/// Loosely typed on purpose: each field maps to its own validation error code.
#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub content: Option<Value>,
    pub sender: Option<String>,
    pub latency_ms: Option<Value>,
    pub sender_user_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub question: Option<String>,
    pub k: Option<i64>,
    pub evaluate: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_user_id: Option<Uuid>,
    pub sender: SenderKind,
    pub content: String,
    pub latency_ms: Option<i64>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Vec<FeedbackResponse>>,
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub user: MessageResponse,
    pub bot: MessageResponse,
}

// -- Feedback --

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub rating: Option<Value>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackResponse {
    pub id: Uuid,
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub rating: u8,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

// -- Admin --

#[derive(Debug, Default, Deserialize)]
pub struct AdminUserQuery {
    pub q: Option<String>,
    pub role: Option<String>,
    pub status: Option<String>,
    #[serde(flatten)]
    pub paging: PageQuery,
}

#[derive(Debug, Deserialize)]
pub struct SetActiveRequest {
    pub active: bool,
}

#[derive(Debug, Serialize)]
pub struct AdminUserResponse {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub roles: Vec<String>,
}

// -- Admin analytics --

#[derive(Debug, Default, Deserialize)]
pub struct AdminConversationQuery {
    pub q: Option<String>,
    pub owner: Option<String>,
    pub participant: Option<String>,
    #[serde(flatten)]
    pub paging: PageQuery,
}

#[derive(Debug, Default, Deserialize)]
pub struct AdminFeedbackQuery {
    pub conversation: Option<String>,
    pub user: Option<String>,
    #[serde(flatten)]
    pub paging: PageQuery,
}

/// A conversation as seen from the admin panel, open or closed.
#[derive(Debug, Serialize)]
pub struct ConversationOverviewResponse {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub owner_email: Option<String>,
    pub owner_display_name: Option<String>,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub participants_count: u64,
    pub messages_count: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub feedback_count: u64,
    pub avg_rating: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct ConversationTranscriptResponse {
    #[serde(flatten)]
    pub conversation: ConversationOverviewResponse,
    pub participants: Vec<ParticipantResponse>,
    pub messages: Vec<TranscriptMessageResponse>,
}

#[derive(Debug, Serialize)]
pub struct TranscriptMessageResponse {
    #[serde(flatten)]
    pub message: MessageResponse,
    pub sender_display_name: Option<String>,
    pub sender_email: Option<String>,
    pub feedback: Vec<FeedbackDetailResponse>,
}

/// One rating with enough context to read it without opening the conversation.
#[derive(Debug, Serialize)]
pub struct FeedbackDetailResponse {
    #[serde(flatten)]
    pub feedback: FeedbackResponse,
    pub user_display_name: Option<String>,
    pub user_email: Option<String>,
    pub conversation_id: Uuid,
    pub sender: SenderKind,
    pub message_created_at: DateTime<Utc>,
    pub sender_display_name: Option<String>,
    pub sender_email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FeedbackStatsResponse {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub total_ratings: u64,
    pub avg_rating: f64,
    pub min_rating: u8,
    pub max_rating: u8,
    pub last_rated_at: Option<DateTime<Utc>>,
}
