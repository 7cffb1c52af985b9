use std::sync::Arc;

use ragchat_db::Database;

use crate::mailer::Mailer;
use crate::oauth::IdentityProvider;
use crate::rag::Answerer;
use crate::session::SessionStore;

pub type AppState = Arc<AppStateInner>;

/// Everything a handler can reach. Built once in `main` and injected into the router.
/// Database work runs under `spawn_blocking`, never on the async workers.
pub struct AppStateInner {
    pub db: Arc<Database>,
    pub sessions: SessionStore,
    pub mailer: Arc<dyn Mailer>,
    pub rag: Arc<dyn Answerer>,
    /// `None` when Google sign-in is not configured.
    pub oauth: Option<Arc<dyn IdentityProvider>>,
}
