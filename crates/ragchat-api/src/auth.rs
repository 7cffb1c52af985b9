use axum::{
    Extension, Json,
    extract::{Query, State},
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::CookieJar;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use rand::RngCore;
use serde_json::Value;
use tracing::{info, warn};

use ragchat_types::api::{
    AuthenticatedResponse, GoogleLinkRequiredResponse, LoginRequest, MeResponse, MeUser, OAuthCallbackQuery,
    OkResponse, RegisterRequest, RegistrationRequiredResponse, SetPasswordRequest, VerificationRequiredResponse,
    VerifyRequest,
};

use crate::convert;
use crate::error::{ApiError, Payload};
use crate::identity::{AuthenticatedUser, IdentityResolver, Registration, Resolution};
use crate::middleware::Principal;
use crate::oauth::IdentityProvider;
use crate::session::{Session, SessionContext};
use crate::state::AppState;

fn resolver(state: &AppState) -> IdentityResolver<'_> {
    IdentityResolver::new(&state.db, state.mailer.as_ref())
}

fn authenticated(auth: AuthenticatedUser) -> AuthenticatedResponse {
    AuthenticatedResponse { ok: true, user: convert::user(&auth.user), roles: auth.roles }
}

fn resolution_response(jar: CookieJar, resolution: Resolution) -> Response {
    match resolution {
        Resolution::Authenticated(auth) => (jar, Json(authenticated(auth))).into_response(),
        Resolution::NeedsVerification { email } => (
            jar,
            Json(VerificationRequiredResponse { ok: true, requires_verification: true, email }),
        )
            .into_response(),
        Resolution::NeedsRegistration { email } => (
            jar,
            Json(RegistrationRequiredResponse { ok: true, requires_registration: true, email }),
        )
            .into_response(),
    }
}

pub async fn register(
    State(state): State<AppState>,
    mut session: Session,
    Payload(req): Payload<RegisterRequest>,
) -> Result<Response, ApiError> {
    let outcome = resolver(&state)
        .register(&mut session.context, req.email.as_deref(), req.display_name.as_deref(), req.password.as_deref())
        .await?;
    let jar = session.commit(&state.sessions).await;

    Ok(match outcome {
        Registration::Authenticated(auth) => (jar, Json(authenticated(auth))).into_response(),
        Registration::AwaitingGoogleLink { email } => (
            jar,
            Json(GoogleLinkRequiredResponse { ok: true, requires_google_link: true, email }),
        )
            .into_response(),
    })
}

pub async fn login(
    State(state): State<AppState>,
    mut session: Session,
    Payload(req): Payload<LoginRequest>,
) -> Result<Response, ApiError> {
    let email = req.email.as_deref().map(str::trim).filter(|e| !e.is_empty());
    let password = req.password.as_deref().filter(|p| !p.is_empty());
    let (Some(email), Some(password)) = (email, password) else {
        return Err(ApiError::MissingFields);
    };

    let resolution = resolver(&state).login(&mut session.context, email, password).await?;
    let jar = session.commit(&state.sessions).await;
    Ok(resolution_response(jar, resolution))
}

pub async fn verify(
    State(state): State<AppState>,
    mut session: Session,
    Payload(req): Payload<VerifyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let code = submitted_code(req.code.as_ref().unwrap_or(&Value::Null))?;
    let auth = resolver(&state).verify(&mut session.context, &code, req.email.as_deref()).await?;
    let jar = session.commit(&state.sessions).await;
    Ok((jar, Json(authenticated(auth))))
}

pub async fn resend_code(
    State(state): State<AppState>,
    mut session: Session,
) -> Result<impl IntoResponse, ApiError> {
    let email = resolver(&state).resend_code(&mut session.context).await?;
    let jar = session.commit(&state.sessions).await;
    Ok((jar, Json(VerificationRequiredResponse { ok: true, requires_verification: true, email })))
}

pub async fn google_start(
    State(state): State<AppState>,
    mut session: Session,
) -> Result<impl IntoResponse, ApiError> {
    let provider = state.oauth.clone().ok_or(ApiError::OAuthDisabled)?;
    let csrf = oauth_state_token();
    let url = provider.authorize_url(&csrf);
    session.context.set_oauth_state(csrf);
    let jar = session.commit(&state.sessions).await;
    Ok((jar, Redirect::to(&url)))
}

pub async fn google_callback(
    State(state): State<AppState>,
    mut session: Session,
    Query(query): Query<OAuthCallbackQuery>,
) -> Result<Response, ApiError> {
    let provider = state.oauth.clone().ok_or(ApiError::OAuthDisabled)?;

    // Single use: the session is stored without the state whatever the outcome.
    let expected = session.context.take_oauth_state();
    let outcome = finish_oauth(&state, provider.as_ref(), &mut session.context, expected, query).await;
    let jar = session.commit(&state.sessions).await;

    Ok(match outcome {
        Ok(resolution) => resolution_response(jar, resolution),
        Err(e) => (jar, e).into_response(),
    })
}

async fn finish_oauth(
    state: &AppState,
    provider: &dyn IdentityProvider,
    ctx: &mut SessionContext,
    expected: Option<String>,
    query: OAuthCallbackQuery,
) -> Result<Resolution, ApiError> {
    if !matches!((&expected, &query.state), (Some(e), Some(got)) if e == got) {
        warn!("OAuth callback with missing or mismatched state");
        return Err(ApiError::InvalidOAuthState);
    }
    if let Some(error) = query.error {
        warn!(%error, "Google sign-in refused by the provider");
        return Err(ApiError::OAuthFailed);
    }
    let Some(code) = query.code else {
        warn!("OAuth callback without an authorization code");
        return Err(ApiError::OAuthFailed);
    };

    let profile = provider.exchange(&code).await.map_err(|e| {
        warn!("OAuth exchange failed: {:#}", e);
        ApiError::OAuthFailed
    })?;
    Ok(resolver(state).oauth(ctx, &profile).await?)
}

pub async fn set_password(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Payload(req): Payload<SetPasswordRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    let password = req.password.as_deref().ok_or(ApiError::MissingFields)?;
    resolver(&state).set_password(principal.user_id, password, req.current_password.as_deref()).await?;
    Ok(Json(OkResponse { ok: true }))
}

pub async fn logout(State(state): State<AppState>, session: Session) -> impl IntoResponse {
    if let Some(user_id) = session.context.user_id() {
        info!(%user_id, "Logout");
    }
    let jar = session.destroy(&state.sessions).await;
    (jar, Json(OkResponse { ok: true }))
}

pub async fn me(State(state): State<AppState>, session: Session) -> Result<Json<MeResponse>, ApiError> {
    let anonymous = Json(MeResponse { is_authenticated: false, user: None });
    let Some(user_id) = session.context.user_id() else {
        return Ok(anonymous);
    };
    let db = state.clone();
    let id = user_id.to_string();
    let found = tokio::task::spawn_blocking(move || {
        let Some(user) = db.db.get_user_by_id(&id)?.filter(|u| u.is_active) else {
            return Ok::<_, anyhow::Error>(None);
        };
        let roles = db.db.get_user_roles(&id)?;
        Ok(Some((user, roles)))
    })
    .await??;
    let Some((user, roles)) = found else {
        return Ok(anonymous);
    };

    Ok(Json(MeResponse {
        is_authenticated: true,
        user: Some(MeUser {
            id: user_id,
            display_name: user.display_name,
            email: user.email,
            roles,
            has_password: user.password_hash.is_some(),
        }),
    }))
}

fn oauth_state_token() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    B64.encode(bytes)
}

/// The emailed code as typed. Clients that send it as a JSON number lose the
/// leading zeros, so those are restored.
fn submitted_code(raw: &Value) -> Result<String, ApiError> {
    match raw {
        Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Value::Null | Value::String(_) => Err(ApiError::MissingFields),
        Value::Number(n) => n
            .as_u64()
            .filter(|c| *c < 1_000_000)
            .map(|c| format!("{:06}", c))
            .ok_or(ApiError::CodeInvalidOrExpired),
        _ => Err(ApiError::CodeInvalidOrExpired),
    }
}
