pub mod account;
pub mod admin;
pub mod auth;
pub mod conversations;
pub mod convert;
pub mod error;
pub mod feedback;
pub mod identity;
pub mod mailer;
pub mod messages;
pub mod middleware;
pub mod oauth;
pub mod password;
pub mod rag;
pub mod session;
pub mod state;

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};

use crate::middleware::{require_admin, require_analyst, require_auth};
use crate::state::AppState;

/// All HTTP routes. Cross-cutting layers (CORS, tracing) are added by the binary.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/verify", post(auth::verify))
        .route("/auth/verify/resend", post(auth::resend_code))
        .route("/auth/google", get(auth::google_start))
        .route("/auth/google/callback", get(auth::google_callback))
        .route("/auth/logout", post(auth::logout))
        .route("/me", get(auth::me))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/auth/set-password", post(auth::set_password))
        .route("/api/account", get(account::get_account).put(account::update_account))
        .route(
            "/api/chat/conversations",
            get(conversations::list_conversations).post(conversations::create_conversation),
        )
        .route(
            "/api/chat/conversations/{id}",
            get(conversations::get_conversation).delete(conversations::delete_conversation),
        )
        .route("/api/chat/conversations/{id}/participants", post(conversations::add_participant))
        .route(
            "/api/chat/conversations/{id}/messages",
            get(messages::list_messages).post(messages::post_message),
        )
        .route("/api/chat/conversations/{id}/ask", post(messages::ask))
        .route("/api/chat/messages/{id}/feedback", post(feedback::rate_message))
        .route_layer(from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    let admin_routes = Router::new()
        .route("/api/admin/users", get(admin::list_users))
        .route("/api/admin/users/{id}/grant-admin", post(admin::grant_admin))
        .route("/api/admin/users/{id}/revoke-admin", post(admin::revoke_admin))
        .route("/api/admin/users/{id}/active", post(admin::set_active))
        .route_layer(from_fn_with_state(state.clone(), require_admin))
        .route_layer(from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    let analytics_routes = Router::new()
        .route("/api/admin/chat/conversations", get(admin::list_conversations))
        .route("/api/admin/chat/conversations/{id}", get(admin::conversation_detail))
        .route("/api/admin/chat/feedback/summary", get(admin::feedback_summary))
        .route("/api/admin/chat/feedback/messages", get(admin::list_feedback))
        .route_layer(from_fn_with_state(state.clone(), require_analyst))
        .route_layer(from_fn_with_state(state.clone(), require_auth))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(admin_routes)
        .merge(analytics_routes)
}
