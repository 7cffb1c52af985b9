use axum::{Extension, Json, extract::State};
use tracing::info;

use ragchat_types::api::{AccountResponse, UpdateAccountRequest};

use crate::error::{ApiError, Payload};
use crate::identity::IdentityResolver;
use crate::middleware::Principal;
use crate::state::AppState;

const MAX_DISPLAY_NAME: usize = 80;

pub async fn get_account(Extension(principal): Extension<Principal>) -> Json<AccountResponse> {
    Json(AccountResponse {
        id: principal.user_id,
        display_name: principal.display_name,
        email: principal.email,
        has_password: principal.has_password,
    })
}

/// Update the display name and/or the local password. Nothing is written
/// unless every supplied field is valid.
pub async fn update_account(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Payload(req): Payload<UpdateAccountRequest>,
) -> Result<Json<AccountResponse>, ApiError> {
    let display_name = match req.display_name.as_deref().map(str::trim) {
        Some(name) if name.is_empty() || name.chars().count() > MAX_DISPLAY_NAME => {
            return Err(ApiError::InvalidDisplayName);
        }
        other => other,
    };

    if let Some(new_password) = req.new_password.as_deref().filter(|p| !p.is_empty()) {
        if req.confirm_password.as_deref() != Some(new_password) {
            return Err(ApiError::PasswordMismatch);
        }
        IdentityResolver::new(&state.db, state.mailer.as_ref())
            .set_password(principal.user_id, new_password, req.current_password.as_deref())
            .await?;
    }

    let db = state.clone();
    let id = principal.id();
    let display_name = display_name.map(str::to_string);
    let user = tokio::task::spawn_blocking(move || {
        if let Some(name) = display_name {
            db.db.set_display_name(&id, &name)?;
            info!(user_id = %id, "Display name updated");
        }
        db.db.get_user_by_id(&id)
    })
    .await??
    .ok_or(ApiError::UserNotFound)?;
    Ok(Json(AccountResponse {
        id: principal.user_id,
        display_name: user.display_name,
        email: user.email,
        has_password: user.password_hash.is_some(),
    }))
}
