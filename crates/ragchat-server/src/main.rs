mod config;

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use ragchat_api::mailer::{LogMailer, Mailer, WebhookMailer};
use ragchat_api::oauth::{GoogleOAuth, IdentityProvider};
use ragchat_api::password::{hash_password, is_strong_enough};
use ragchat_api::rag::RagClient;
use ragchat_api::session::SessionStore;
use ragchat_api::state::{AppState, AppStateInner};
use ragchat_db::Database;
use ragchat_types::models::{ROLE_ADMIN, ROLE_USER, normalize_email};

use crate::config::{BootstrapAdmin, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "ragchat=debug,ragchat_api=debug,ragchat_db=info,tower_http=debug".into()
            }),
        )
        .init();

    let config = Config::from_env()?;

    let db = Database::open(&config.db_path)?;
    if let Some(admin) = &config.bootstrap_admin {
        bootstrap_admin(&db, admin)?;
    }

    let http = reqwest::Client::new();
    let mailer: Arc<dyn Mailer> = match &config.mail_webhook_url {
        Some(url) => {
            info!("Verification emails go to mail relay {}", url);
            Arc::new(WebhookMailer::new(http.clone(), url.clone(), config.mail_from.clone()))
        }
        None => {
            warn!("MAIL_WEBHOOK_URL not set, verification codes will only be logged");
            Arc::new(LogMailer)
        }
    };
    let oauth: Option<Arc<dyn IdentityProvider>> = match config.google.clone() {
        Some(google) => {
            info!("Google sign-in enabled");
            Some(Arc::new(GoogleOAuth::new(http.clone(), google)))
        }
        None => {
            info!("Google sign-in disabled");
            None
        }
    };
    let rag = RagClient::new(config.rag.clone())?;
    info!(endpoint = rag.endpoint(), timeout_ms = config.rag.timeout.as_millis() as u64, "RAG client ready");

    let state: AppState = Arc::new(AppStateInner {
        db: Arc::new(db),
        sessions: SessionStore::new(chrono::Duration::hours(config.session_ttl_hours), config.cookie_secure),
        mailer,
        rag: Arc::new(rag),
        oauth,
    });

    let app = ragchat_api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("RAG chat server listening on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    Ok(())
}

/// Create the configured admin account if nobody holds that email yet.
fn bootstrap_admin(db: &Database, admin: &BootstrapAdmin) -> anyhow::Result<()> {
    let email = normalize_email(&admin.email);
    if db.get_user_by_email(&email)?.is_some() {
        return Ok(());
    }
    if !is_strong_enough(&admin.password) {
        anyhow::bail!("RAGCHAT_ADMIN_PASSWORD must be at least 8 characters");
    }
    let hash = hash_password(&admin.password)?;
    let id = Uuid::new_v4().to_string();
    if db.create_user(&id, &email, "Administrator", Some(&hash), &[ROLE_ADMIN, ROLE_USER])? {
        info!(user_id = %id, "Bootstrap admin account created");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
