//! Identity resolution.
//!
//! Local credentials and OAuth profiles both end up in the same place: an
//! admin is bound straight away, anyone else gets an emailed code and must
//! finish through [`IdentityResolver::verify`]. Every step reads and writes
//! the caller's [`SessionContext`] explicitly.

use std::sync::Arc;

use anyhow::anyhow;
use chrono::{Duration, Utc};
use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use ragchat_db::models::UserRow;
use ragchat_db::{Database, timestamp};
use ragchat_types::models::{ROLE_ADMIN, ROLE_USER, normalize_email};

use crate::mailer::Mailer;
use crate::oauth::OAuthProfile;
use crate::password::{hash_password, is_strong_enough, verify_password};
use crate::session::SessionContext;

pub const CODE_TTL_MINUTES: i64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("missing required fields")]
    MissingFields,
    #[error("invalid email")]
    InvalidEmail,
    #[error("password too short")]
    WeakPassword,
    #[error("email already registered")]
    EmailTaken,
    #[error("user not found")]
    UserNotFound,
    #[error("account inactive")]
    AccountInactive,
    #[error("no local password")]
    NoLocalPassword,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("code invalid or expired")]
    CodeInvalidOrExpired,
    #[error("no verification pending")]
    VerificationNotPending,
    #[error("verification code could not be delivered")]
    CodeDeliveryFailed,
    #[error("current password required")]
    CurrentPasswordRequired,
    #[error("current password invalid")]
    CurrentPasswordInvalid,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// A user whose session has just been bound.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user: UserRow,
    pub roles: Vec<String>,
}

/// Outcome of a login or OAuth exchange.
#[derive(Debug)]
pub enum Resolution {
    Authenticated(AuthenticatedUser),
    /// A code was emailed; the session stays unauthenticated.
    NeedsVerification { email: String },
    /// OAuth produced an email with no account behind it.
    NeedsRegistration { email: String },
}

/// Outcome of a registration.
#[derive(Debug)]
pub enum Registration {
    Authenticated(AuthenticatedUser),
    /// Registered after an OAuth attempt. Nothing is bound; the caller must
    /// repeat the OAuth exchange, which then links the identity.
    AwaitingGoogleLink { email: String },
}

pub struct IdentityResolver<'a> {
    db: Arc<Database>,
    mailer: &'a dyn Mailer,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(db: &Arc<Database>, mailer: &'a dyn Mailer) -> Self {
        Self { db: Arc::clone(db), mailer }
    }

    pub async fn login(
        &self,
        ctx: &mut SessionContext,
        email: &str,
        password: &str,
    ) -> Result<Resolution, IdentityError> {
        let email = normalize_email(email);
        let password = password.to_string();
        let user = self
            .store(move |db| {
                let user = db.get_user_by_email(&email)?.ok_or(IdentityError::UserNotFound)?;
                if !user.is_active {
                    return Err(IdentityError::AccountInactive);
                }
                let hash = user.password_hash.as_deref().ok_or(IdentityError::NoLocalPassword)?;
                if !verify_password(&password, hash) {
                    return Err(IdentityError::InvalidCredentials);
                }
                Ok(user)
            })
            .await?;
        self.complete(ctx, user).await
    }

    pub async fn oauth(
        &self,
        ctx: &mut SessionContext,
        profile: &OAuthProfile,
    ) -> Result<Resolution, IdentityError> {
        let provider = profile.provider.clone();
        let provider_id = profile.provider_id.clone();
        let email = normalize_email(&profile.email);

        let lookup_email = email.clone();
        let found = self
            .store(move |db| {
                if let Some(user_id) = db.find_oauth_user(&provider, &provider_id)? {
                    if let Some(user) = db.get_user_by_id(&user_id)? {
                        return Ok(Some(user));
                    }
                }

                let Some(user) = db.get_user_by_email(&lookup_email)? else {
                    return Ok(None);
                };
                let owner = db.link_oauth_identity(&provider, &provider_id, &user.id)?;
                if owner == user.id {
                    info!(user_id = %user.id, %provider, "OAuth identity linked");
                    return Ok(Some(user));
                }
                Ok(Some(db.get_user_by_id(&owner)?.ok_or(IdentityError::UserNotFound)?))
            })
            .await?;

        match found {
            Some(user) => self.complete_active(ctx, user).await,
            None => {
                info!(provider = %profile.provider, "OAuth profile has no account; registration required");
                ctx.set_pending_oauth_email(email.clone());
                Ok(Resolution::NeedsRegistration { email })
            }
        }
    }

    /// Finish a pending login. The target is the session's pending user when
    /// there is one, otherwise the account behind `email`.
    pub async fn verify(
        &self,
        ctx: &mut SessionContext,
        code: &str,
        email: Option<&str>,
    ) -> Result<AuthenticatedUser, IdentityError> {
        let pending = ctx.pending_verification();
        let email = email.map(normalize_email).filter(|e| !e.is_empty());
        let code = code.trim().to_string();

        let user = self
            .store(move |db| {
                let user = match (pending, email) {
                    (Some(user_id), _) => db.get_user_by_id(&user_id.to_string())?,
                    (None, Some(email)) => db.get_user_by_email(&email)?,
                    (None, None) => None,
                };
                let user = user.ok_or(IdentityError::CodeInvalidOrExpired)?;

                if code.is_empty() || !db.consume_verification_code(&user.id, &code, &timestamp(Utc::now()))? {
                    warn!(user_id = %user.id, "Verification code rejected");
                    return Err(IdentityError::CodeInvalidOrExpired);
                }
                if !user.is_active {
                    return Err(IdentityError::AccountInactive);
                }
                Ok(user)
            })
            .await?;
        self.bind(ctx, user).await
    }

    /// Issue a fresh code to the session's pending user. Returns the address it went to.
    pub async fn resend_code(&self, ctx: &mut SessionContext) -> Result<String, IdentityError> {
        let user_id = ctx.pending_verification().ok_or(IdentityError::VerificationNotPending)?;
        let user = self
            .store(move |db| {
                db.get_user_by_id(&user_id.to_string())?.ok_or(IdentityError::VerificationNotPending)
            })
            .await?;
        self.issue_code(&user).await?;
        ctx.set_pending_verification(user_id);
        Ok(user.email)
    }

    pub async fn register(
        &self,
        ctx: &mut SessionContext,
        email: Option<&str>,
        display_name: Option<&str>,
        password: Option<&str>,
    ) -> Result<Registration, IdentityError> {
        let email = email.map(normalize_email).unwrap_or_default();
        let display_name = display_name.map(str::trim).unwrap_or_default().to_string();
        let password = password.unwrap_or_default().to_string();
        if email.is_empty() || display_name.is_empty() || password.is_empty() {
            return Err(IdentityError::MissingFields);
        }
        if !is_plausible_email(&email) {
            return Err(IdentityError::InvalidEmail);
        }
        if !is_strong_enough(&password) {
            return Err(IdentityError::WeakPassword);
        }

        let new_email = email.clone();
        let user = self
            .store(move |db| {
                let hash = hash_password(&password)?;
                let id = Uuid::new_v4().to_string();
                if !db.create_user(&id, &new_email, &display_name, Some(&hash), &[ROLE_USER])? {
                    return Err(IdentityError::EmailTaken);
                }
                db.get_user_by_id(&id)?
                    .ok_or_else(|| IdentityError::Store(anyhow!("user {} vanished after insert", id)))
            })
            .await?;
        info!(user_id = %user.id, "User registered");

        if ctx.take_pending_oauth_email().is_some() {
            return Ok(Registration::AwaitingGoogleLink { email });
        }
        Ok(Registration::Authenticated(self.bind(ctx, user).await?))
    }

    /// Set or replace the local password of an authenticated user.
    pub async fn set_password(
        &self,
        user_id: Uuid,
        password: &str,
        current_password: Option<&str>,
    ) -> Result<(), IdentityError> {
        if !is_strong_enough(password) {
            return Err(IdentityError::WeakPassword);
        }
        let password = password.to_string();
        let current_password = current_password.filter(|p| !p.is_empty()).map(str::to_string);

        self.store(move |db| {
            let user = db.get_user_by_id(&user_id.to_string())?.ok_or(IdentityError::UserNotFound)?;
            if let Some(existing) = user.password_hash.as_deref() {
                let current = current_password.ok_or(IdentityError::CurrentPasswordRequired)?;
                if !verify_password(&current, existing) {
                    return Err(IdentityError::CurrentPasswordInvalid);
                }
            }
            db.set_password_hash(&user.id, &hash_password(&password)?)?;
            info!(user_id = %user.id, "Password updated");
            Ok(())
        })
        .await
    }

    async fn complete_active(&self, ctx: &mut SessionContext, user: UserRow) -> Result<Resolution, IdentityError> {
        if !user.is_active {
            return Err(IdentityError::AccountInactive);
        }
        self.complete(ctx, user).await
    }

    /// Credentials are good: admins skip the emailed code.
    async fn complete(&self, ctx: &mut SessionContext, user: UserRow) -> Result<Resolution, IdentityError> {
        let user_id = parse_user_id(&user)?;
        let roles = self.roles_of(&user).await?;
        if roles.iter().any(|r| r == ROLE_ADMIN) {
            info!(user_id = %user.id, "Admin login, verification bypassed");
            ctx.bind(user_id, roles.clone());
            return Ok(Resolution::Authenticated(AuthenticatedUser { user, roles }));
        }

        self.issue_code(&user).await?;
        ctx.unbind();
        ctx.set_pending_verification(user_id);
        Ok(Resolution::NeedsVerification { email: user.email })
    }

    async fn issue_code(&self, user: &UserRow) -> Result<(), IdentityError> {
        let code = generate_code();
        let expires_at = timestamp(Utc::now() + Duration::minutes(CODE_TTL_MINUTES));
        let (id, stored) = (user.id.clone(), code.clone());
        self.store(move |db| Ok(db.set_verification_code(&id, &stored, &expires_at)?)).await?;

        let body = format!(
            "Your verification code is {code}. It expires in {CODE_TTL_MINUTES} minutes."
        );
        if let Err(e) = self.mailer.send(&user.email, "Your verification code", &body).await {
            warn!(user_id = %user.id, "Verification email failed: {:#}", e);
            let id = user.id.clone();
            self.store(move |db| Ok(db.clear_verification_code(&id)?)).await?;
            return Err(IdentityError::CodeDeliveryFailed);
        }
        info!(user_id = %user.id, "Verification code issued");
        Ok(())
    }

    async fn bind(&self, ctx: &mut SessionContext, user: UserRow) -> Result<AuthenticatedUser, IdentityError> {
        let user_id = parse_user_id(&user)?;
        let roles = self.roles_of(&user).await?;
        ctx.bind(user_id, roles.clone());
        info!(user_id = %user.id, "Session bound");
        Ok(AuthenticatedUser { user, roles })
    }

    async fn roles_of(&self, user: &UserRow) -> Result<Vec<String>, IdentityError> {
        let id = user.id.clone();
        self.store(move |db| Ok(db.get_user_roles(&id)?)).await
    }

    /// Runs store work, and the password hashing that goes with it, on the blocking pool.
    async fn store<T, F>(&self, f: F) -> Result<T, IdentityError>
    where
        F: FnOnce(&Database) -> Result<T, IdentityError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| IdentityError::Store(anyhow!("store task failed: {}", e)))?
    }
}

fn parse_user_id(user: &UserRow) -> Result<Uuid, IdentityError> {
    Uuid::parse_str(&user.id).map_err(|e| IdentityError::Store(anyhow!("corrupt user id '{}': {}", user.id, e)))
}

/// Six decimal digits, zero padded.
fn generate_code() -> String {
    format!("{:06}", rand::rng().random_range(0..1_000_000u32))
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}
