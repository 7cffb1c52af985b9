use axum::{
    Extension,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::{debug, warn};
use uuid::Uuid;

use ragchat_types::models::{ROLE_ADMIN, ROLE_ANALYST};

use crate::error::ApiError;
use crate::session::Session;
use crate::state::AppState;

/// The authenticated caller, resolved from the session for every protected request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: String,
    pub has_password: bool,
    /// Roles captured when the session was bound.
    pub roles: Vec<String>,
}

impl Principal {
    pub fn id(&self) -> String {
        self.user_id.to_string()
    }
}

/// Resolve the session to an active user and expose it as a [`Principal`] extension.
pub async fn require_auth(
    State(state): State<AppState>,
    session: Session,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user_id = session.context.user_id().ok_or(ApiError::AuthenticationRequired)?;

    let db = state.clone();
    let user = tokio::task::spawn_blocking(move || db.db.get_user_by_id(&user_id.to_string()))
        .await??
        .filter(|u| u.is_active)
        .ok_or_else(|| {
            warn!(%user_id, "Session refers to a missing or inactive user");
            ApiError::AuthenticationRequired
        })?;

    req.extensions_mut().insert(Principal {
        user_id,
        email: user.email,
        display_name: user.display_name,
        has_password: user.password_hash.is_some(),
        roles: session.context.roles().to_vec(),
    });
    Ok(next.run(req).await)
}

/// The session's role set is consulted first; the store has the final word.
pub async fn has_role(state: &AppState, principal: &Principal, role: &'static str) -> Result<bool, ApiError> {
    let cached = principal.roles.iter().any(|r| r == role);
    let db = state.clone();
    let user_id = principal.id();
    let stored = tokio::task::spawn_blocking(move || db.db.user_has_role(&user_id, role)).await??;
    if cached != stored {
        debug!(user_id = %principal.user_id, role, stored, "Session roles are stale");
    }
    Ok(stored)
}

/// Runs after [`require_auth`].
pub async fn require_admin(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !has_role(&state, &principal, ROLE_ADMIN).await? {
        warn!(user_id = %principal.user_id, "Admin route refused");
        return Err(ApiError::Forbidden(ROLE_ADMIN.to_string()));
    }
    Ok(next.run(req).await)
}

/// Analytics are readable by analysts and admins. Runs after [`require_auth`].
pub async fn require_analyst(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let allowed = has_role(&state, &principal, ROLE_ANALYST).await?
        || has_role(&state, &principal, ROLE_ADMIN).await?;
    if !allowed {
        warn!(user_id = %principal.user_id, "Analytics route refused");
        return Err(ApiError::Forbidden(ROLE_ANALYST.to_string()));
    }
    Ok(next.run(req).await)
}
