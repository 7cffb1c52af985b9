use axum::Json;
use axum::extract::FromRequest;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use tracing::{error, warn};

use crate::identity::IdentityError;

/// Every failure the HTTP surface can report. Each variant maps to a status
/// code and a stable snake_case error code.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("required fields are missing")]
    MissingFields,
    #[error("email address is not valid")]
    InvalidEmail,
    #[error("password must be at least 8 characters")]
    WeakPassword,
    #[error("an account with that email already exists")]
    EmailTaken,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("this account has no local password; sign in with Google or set one")]
    NoLocalPassword,
    #[error("account is inactive")]
    AccountInactive,
    #[error("verification code is invalid or expired")]
    CodeInvalidOrExpired,
    #[error("no verification is pending for this session")]
    VerificationNotPending,
    #[error("could not deliver the verification code")]
    CodeDeliveryFailed,
    #[error("current password is required")]
    CurrentPasswordRequired,
    #[error("current password is incorrect")]
    CurrentPasswordInvalid,
    #[error("passwords do not match")]
    PasswordMismatch,
    #[error("display name cannot be empty")]
    InvalidDisplayName,
    #[error("google sign-in is not configured")]
    OAuthDisabled,
    #[error("oauth state is missing or does not match")]
    InvalidOAuthState,
    #[error("google sign-in failed")]
    OAuthFailed,
    #[error("authentication required")]
    AuthenticationRequired,
    #[error("requires role {0}")]
    Forbidden(String),
    #[error("user not found")]
    UserNotFound,
    #[error("conversation not found")]
    ConversationNotFound,
    #[error("message not found")]
    MessageNotFound,
    #[error("content must be a non-empty string")]
    InvalidContent,
    #[error("sender must be one of user, bot, system")]
    InvalidSender,
    #[error("sender_user_id is not a participant of this conversation")]
    InvalidSenderUser,
    #[error("latency_ms must be a non-negative number")]
    InvalidLatency,
    #[error("rating must be an integer between 1 and 5")]
    InvalidRating,
    #[error("{0}")]
    RagInvalidRequest(String),
    #[error("{0}")]
    RagUnavailable(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::MissingFields
            | Self::InvalidEmail
            | Self::WeakPassword
            | Self::CurrentPasswordRequired
            | Self::CurrentPasswordInvalid
            | Self::PasswordMismatch
            | Self::InvalidDisplayName
            | Self::InvalidOAuthState
            | Self::InvalidContent
            | Self::InvalidSender
            | Self::InvalidSenderUser
            | Self::InvalidLatency
            | Self::InvalidRating
            | Self::RagInvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::InvalidCredentials
            | Self::NoLocalPassword
            | Self::CodeInvalidOrExpired
            | Self::VerificationNotPending
            | Self::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            Self::AccountInactive | Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::OAuthDisabled
            | Self::UserNotFound
            | Self::ConversationNotFound
            | Self::MessageNotFound => StatusCode::NOT_FOUND,
            Self::EmailTaken => StatusCode::CONFLICT,
            Self::CodeDeliveryFailed | Self::OAuthFailed | Self::RagUnavailable(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) | Self::RagInvalidRequest(_) => "invalid_request",
            Self::MissingFields => "missing_fields",
            Self::InvalidEmail => "invalid_email",
            Self::WeakPassword => "weak_password",
            Self::EmailTaken => "email_taken",
            Self::InvalidCredentials => "invalid_credentials",
            Self::NoLocalPassword => "no_local_password",
            Self::AccountInactive => "account_inactive",
            Self::CodeInvalidOrExpired => "code_invalid_or_expired",
            Self::VerificationNotPending => "verification_not_pending",
            Self::CodeDeliveryFailed => "code_delivery_failed",
            Self::CurrentPasswordRequired => "current_password_required",
            Self::CurrentPasswordInvalid => "current_password_invalid",
            Self::PasswordMismatch => "password_mismatch",
            Self::InvalidDisplayName => "invalid_display_name",
            Self::OAuthDisabled => "oauth_disabled",
            Self::InvalidOAuthState => "invalid_oauth_state",
            Self::OAuthFailed => "oauth_failed",
            Self::AuthenticationRequired => "authentication_required",
            Self::Forbidden(_) => "forbidden",
            Self::UserNotFound => "user_not_found",
            Self::ConversationNotFound => "conversation_not_found",
            Self::MessageNotFound => "message_not_found",
            Self::InvalidContent => "invalid_content",
            Self::InvalidSender => "invalid_sender",
            Self::InvalidSenderUser => "invalid_sender_user",
            Self::InvalidLatency => "invalid_latency",
            Self::InvalidRating => "invalid_rating",
            Self::RagUnavailable(_) => "rag_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            Self::Internal(e) => {
                error!("Internal error: {:#}", e);
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let body = serde_json::json!({ "ok": false, "error": self.code(), "message": message });
        (self.status(), Json(body)).into_response()
    }
}

impl From<IdentityError> for ApiError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::MissingFields => Self::MissingFields,
            IdentityError::InvalidEmail => Self::InvalidEmail,
            IdentityError::WeakPassword => Self::WeakPassword,
            IdentityError::EmailTaken => Self::EmailTaken,
            IdentityError::UserNotFound => {
                warn!("Login attempt for unknown account");
                Self::InvalidCredentials
            }
            IdentityError::AccountInactive => Self::AccountInactive,
            IdentityError::NoLocalPassword => Self::NoLocalPassword,
            IdentityError::InvalidCredentials => {
                warn!("Login rejected: bad password");
                Self::InvalidCredentials
            }
            IdentityError::CodeInvalidOrExpired => Self::CodeInvalidOrExpired,
            IdentityError::VerificationNotPending => Self::VerificationNotPending,
            IdentityError::CodeDeliveryFailed => Self::CodeDeliveryFailed,
            IdentityError::CurrentPasswordRequired => Self::CurrentPasswordRequired,
            IdentityError::CurrentPasswordInvalid => Self::CurrentPasswordInvalid,
            IdentityError::Store(e) => Self::Internal(e),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(anyhow::anyhow!("spawn_blocking join error: {}", e))
    }
}

/// JSON body extractor whose rejections become `400 invalid_request`.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct Payload<T>(pub T);

/// Parse a body that may legitimately be empty.
pub fn optional_json<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidRequest(e.to_string()))
}
