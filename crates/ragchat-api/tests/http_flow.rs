use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use ragchat_api::mailer::Mailer;
use ragchat_api::oauth::{IdentityProvider, OAuthProfile};
use ragchat_api::password::hash_password;
use ragchat_api::rag::{Answerer, RagAnswer, RagError, RagRequest};
use ragchat_api::session::{SESSION_COOKIE, SessionStore};
use ragchat_api::state::{AppState, AppStateInner};
use ragchat_db::Database;

// -- Fakes --

#[derive(Default)]
struct CapturingMailer {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl Mailer for CapturingMailer {
    async fn send(&self, to: &str, _subject: &str, _body: &str) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(to.to_string());
        Ok(())
    }
}

struct ScriptedRag {
    outcome: Result<RagAnswer, RagError>,
    calls: Mutex<Vec<RagRequest>>,
}

#[async_trait]
impl Answerer for ScriptedRag {
    async fn answer(&self, request: &RagRequest) -> Result<RagAnswer, RagError> {
        self.calls.lock().unwrap().push(request.clone());
        self.outcome.clone()
    }
}

struct FakeGoogle {
    profile: OAuthProfile,
}

#[async_trait]
impl IdentityProvider for FakeGoogle {
    fn authorize_url(&self, state: &str) -> String {
        format!("https://idp.test/authorize?state={state}")
    }

    async fn exchange(&self, code: &str) -> anyhow::Result<OAuthProfile> {
        if code != "good-code" {
            anyhow::bail!("bad code");
        }
        Ok(self.profile.clone())
    }
}

// -- Harness --

struct Harness {
    app: Router,
    state: AppState,
    mailer: Arc<CapturingMailer>,
    rag: Arc<ScriptedRag>,
}

fn answer(text: &str) -> Result<RagAnswer, RagError> {
    Ok(RagAnswer {
        answer: text.to_string(),
        sources: vec![json!({"doc": "guide.pdf", "page": 3})],
        evaluation: Some(json!({"faithfulness": 0.9})),
        latency_ms: 42,
        raw: json!({"answer": text}),
    })
}

fn harness_with(outcome: Result<RagAnswer, RagError>, google: Option<OAuthProfile>) -> Harness {
    let mailer = Arc::new(CapturingMailer::default());
    let rag = Arc::new(ScriptedRag { outcome, calls: Mutex::new(vec![]) });
    let oauth = google.map(|profile| Arc::new(FakeGoogle { profile }) as Arc<dyn IdentityProvider>);
    let state: AppState = Arc::new(AppStateInner {
        db: Arc::new(Database::open_in_memory().unwrap()),
        sessions: SessionStore::new(chrono::Duration::hours(1), false),
        mailer: mailer.clone(),
        rag: rag.clone(),
        oauth,
    });
    Harness { app: ragchat_api::router(state.clone()), state, mailer, rag }
}

fn harness() -> Harness {
    harness_with(answer("RAG combines retrieval with generation."), None)
}

struct Reply {
    status: StatusCode,
    cookie: Option<String>,
    location: Option<String>,
    json: Value,
}

impl Harness {
    async fn send(&self, method: Method, uri: &str, cookie: Option<&str>, body: Option<Value>) -> Reply {
        self.send_raw(method, uri, cookie, body.map(|b| b.to_string())).await
    }

    async fn send_raw(&self, method: Method, uri: &str, cookie: Option<&str>, body: Option<String>) -> Reply {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(sid) = cookie {
            builder = builder.header(header::COOKIE, format!("{SESSION_COOKIE}={sid}"));
        }
        let req = match body {
            Some(body) => builder.header(header::CONTENT_TYPE, "application/json").body(Body::from(body)).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let cookie = resp
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|v| v.strip_prefix(&format!("{SESSION_COOKIE}=")).map(|rest| rest.split(';').next().unwrap_or("").to_string()));
        let location = resp.headers().get(header::LOCATION).and_then(|v| v.to_str().ok()).map(str::to_string);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        Reply { status, cookie, location, json }
    }

    /// Register a fresh account and return its bound session id.
    async fn register(&self, email: &str) -> String {
        let reply = self
            .send(
                Method::POST,
                "/auth/register",
                None,
                Some(json!({"email": email, "display_name": "Tester", "password": "longenough1"})),
            )
            .await;
        assert_eq!(reply.status, StatusCode::OK, "{}", reply.json);
        reply.cookie.expect("session cookie")
    }

    fn seed_admin(&self, email: &str) {
        let hash = hash_password("adminpass1").unwrap();
        let id = Uuid::new_v4().to_string();
        assert!(self.state.db.create_user(&id, email, "Admin", Some(&hash), &["admin", "user"]).unwrap());
    }

    async fn create_conversation(&self, sid: &str) -> String {
        let reply = self
            .send(Method::POST, "/api/chat/conversations", Some(sid), Some(json!({"title": "Docs"})))
            .await;
        assert_eq!(reply.status, StatusCode::CREATED, "{}", reply.json);
        reply.json["data"]["id"].as_str().unwrap().to_string()
    }

    fn code_for(&self, email: &str) -> String {
        self.state.db.get_user_by_email(email).unwrap().unwrap().verification_code.unwrap()
    }
}

// -- Identity --

#[tokio::test]
async fn register_binds_session_and_rejects_duplicate_email() {
    let h = harness();
    let reply = h
        .send(
            Method::POST,
            "/auth/register",
            None,
            Some(json!({"email": "a@x.com", "display_name": "A", "password": "longenough1"})),
        )
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json["user"]["email"], "a@x.com");
    assert_eq!(reply.json["user"]["is_active"], true);
    assert_eq!(reply.json["roles"], json!(["user"]));
    let sid = reply.cookie.unwrap();

    let me = h.send(Method::GET, "/me", Some(&sid), None).await;
    assert_eq!(me.json["isAuthenticated"], true);
    assert_eq!(me.json["user"]["roles"], json!(["user"]));

    let again = h
        .send(
            Method::POST,
            "/auth/register",
            None,
            Some(json!({"email": "a@x.com", "display_name": "A2", "password": "longenough1"})),
        )
        .await;
    assert_eq!(again.status, StatusCode::CONFLICT);
    assert_eq!(again.json["error"], "email_taken");

    let (_, total) = h.state.db.list_users(&Default::default(), 10, 0).unwrap();
    assert_eq!(total, 1);
}

#[tokio::test]
async fn register_validates_input() {
    let h = harness();
    let missing = h.send(Method::POST, "/auth/register", None, Some(json!({"email": "a@x.com"}))).await;
    assert_eq!(missing.status, StatusCode::BAD_REQUEST);
    assert_eq!(missing.json["error"], "missing_fields");

    let weak = h
        .send(
            Method::POST,
            "/auth/register",
            None,
            Some(json!({"email": "a@x.com", "display_name": "A", "password": "short"})),
        )
        .await;
    assert_eq!(weak.status, StatusCode::BAD_REQUEST);
    assert_eq!(weak.json["error"], "weak_password");

    let malformed = h.send_raw(Method::POST, "/auth/register", None, Some("{nope".into())).await;
    assert_eq!(malformed.status, StatusCode::BAD_REQUEST);
    assert_eq!(malformed.json["error"], "invalid_request");
    assert_eq!(malformed.json["ok"], false);
}

#[tokio::test]
async fn user_login_goes_through_emailed_code() {
    let h = harness();
    h.register("a@x.com").await;

    let login = h
        .send(Method::POST, "/auth/login", None, Some(json!({"email": "a@x.com", "password": "longenough1"})))
        .await;
    assert_eq!(login.status, StatusCode::OK);
    assert_eq!(login.json["requiresVerification"], true);
    assert_eq!(login.json["email"], "a@x.com");
    assert_eq!(h.mailer.sent.lock().unwrap().as_slice(), ["a@x.com".to_string()]);
    let sid = login.cookie.unwrap();

    let me = h.send(Method::GET, "/me", Some(&sid), None).await;
    assert_eq!(me.json["isAuthenticated"], false);
    let blocked = h.send(Method::GET, "/api/chat/conversations", Some(&sid), None).await;
    assert_eq!(blocked.status, StatusCode::UNAUTHORIZED);

    let wrong = h.send(Method::POST, "/auth/verify", Some(&sid), Some(json!({"code": "000000x"}))).await;
    assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong.json["error"], "code_invalid_or_expired");

    let code = h.code_for("a@x.com");
    let verified = h.send(Method::POST, "/auth/verify", Some(&sid), Some(json!({"code": code}))).await;
    assert_eq!(verified.status, StatusCode::OK);
    let bound = verified.cookie.unwrap();
    assert_ne!(bound, sid);

    let me = h.send(Method::GET, "/me", Some(&bound), None).await;
    assert_eq!(me.json["isAuthenticated"], true);

    let reused = h
        .send(Method::POST, "/auth/verify", None, Some(json!({"code": code, "email": "a@x.com"})))
        .await;
    assert_eq!(reused.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn verify_accepts_a_numeric_code() {
    let h = harness();
    h.register("a@x.com").await;
    let login = h
        .send(Method::POST, "/auth/login", None, Some(json!({"email": "a@x.com", "password": "longenough1"})))
        .await;
    let sid = login.cookie.unwrap();

    let blank = h.send(Method::POST, "/auth/verify", Some(&sid), Some(json!({"code": "  "}))).await;
    assert_eq!(blank.status, StatusCode::BAD_REQUEST);
    assert_eq!(blank.json["error"], "missing_fields");
    let odd = h.send(Method::POST, "/auth/verify", Some(&sid), Some(json!({"code": true}))).await;
    assert_eq!(odd.status, StatusCode::UNAUTHORIZED);
    assert_eq!(odd.json["error"], "code_invalid_or_expired");

    // Clients that send the code as a JSON number lose leading zeros.
    let code: u64 = h.code_for("a@x.com").parse().unwrap();
    let verified = h.send(Method::POST, "/auth/verify", Some(&sid), Some(json!({"code": code}))).await;
    assert_eq!(verified.status, StatusCode::OK, "{}", verified.json);
    let me = h.send(Method::GET, "/me", verified.cookie.as_deref(), None).await;
    assert_eq!(me.json["isAuthenticated"], true);
}

#[tokio::test]
async fn admin_login_skips_verification() {
    let h = harness();
    h.seed_admin("root@x.com");

    let login = h
        .send(Method::POST, "/auth/login", None, Some(json!({"email": "root@x.com", "password": "adminpass1"})))
        .await;
    assert_eq!(login.status, StatusCode::OK);
    assert_eq!(login.json["roles"], json!(["admin", "user"]));
    assert!(login.json.get("requiresVerification").is_none());
    assert!(h.mailer.sent.lock().unwrap().is_empty());
    assert!(h.state.db.get_user_by_email("root@x.com").unwrap().unwrap().verification_code.is_none());
}

#[tokio::test]
async fn login_errors_use_stable_codes() {
    let h = harness();
    h.register("a@x.com").await;

    let unknown = h
        .send(Method::POST, "/auth/login", None, Some(json!({"email": "who@x.com", "password": "longenough1"})))
        .await;
    assert_eq!(unknown.status, StatusCode::UNAUTHORIZED);
    assert_eq!(unknown.json["error"], "invalid_credentials");

    let bad = h
        .send(Method::POST, "/auth/login", None, Some(json!({"email": "a@x.com", "password": "wrong-password"})))
        .await;
    assert_eq!(bad.json["error"], "invalid_credentials");

    let missing = h.send(Method::POST, "/auth/login", None, Some(json!({"email": "a@x.com"}))).await;
    assert_eq!(missing.status, StatusCode::BAD_REQUEST);

    let resend = h.send(Method::POST, "/auth/verify/resend", None, None).await;
    assert_eq!(resend.status, StatusCode::UNAUTHORIZED);
    assert_eq!(resend.json["error"], "verification_not_pending");
}

#[tokio::test]
async fn logout_is_idempotent() {
    let h = harness();
    let sid = h.register("a@x.com").await;

    let out = h.send(Method::POST, "/auth/logout", Some(&sid), None).await;
    assert_eq!(out.status, StatusCode::OK);
    assert_eq!(out.json["ok"], true);
    let again = h.send(Method::POST, "/auth/logout", Some(&sid), None).await;
    assert_eq!(again.status, StatusCode::OK);

    let me = h.send(Method::GET, "/me", Some(&sid), None).await;
    assert_eq!(me.json["isAuthenticated"], false);
}

#[tokio::test]
async fn set_password_and_account_update() {
    let h = harness();
    let sid = h.register("a@x.com").await;

    let weak = h.send(Method::POST, "/auth/set-password", Some(&sid), Some(json!({"password": "short"}))).await;
    assert_eq!(weak.json["error"], "weak_password");

    let no_current = h
        .send(Method::POST, "/auth/set-password", Some(&sid), Some(json!({"password": "anotherpass"})))
        .await;
    assert_eq!(no_current.json["error"], "current_password_required");

    let ok = h
        .send(
            Method::POST,
            "/auth/set-password",
            Some(&sid),
            Some(json!({"password": "anotherpass", "current_password": "longenough1"})),
        )
        .await;
    assert_eq!(ok.status, StatusCode::OK);

    let mismatch = h
        .send(
            Method::PUT,
            "/api/account",
            Some(&sid),
            Some(json!({"new_password": "thirdpass1", "confirm_password": "thirdpass2", "current_password": "anotherpass"})),
        )
        .await;
    assert_eq!(mismatch.json["error"], "password_mismatch");

    let blank = h.send(Method::PUT, "/api/account", Some(&sid), Some(json!({"display_name": "  "}))).await;
    assert_eq!(blank.json["error"], "invalid_display_name");

    let renamed = h.send(Method::PUT, "/api/account", Some(&sid), Some(json!({"display_name": "Ada"}))).await;
    assert_eq!(renamed.status, StatusCode::OK);
    assert_eq!(renamed.json["display_name"], "Ada");
    assert_eq!(renamed.json["hasPassword"], true);

    let account = h.send(Method::GET, "/api/account", Some(&sid), None).await;
    assert_eq!(account.json["display_name"], "Ada");
}

// -- OAuth --

fn google_profile(email: &str) -> OAuthProfile {
    OAuthProfile { provider: "google".into(), provider_id: "g-123".into(), email: email.into() }
}

/// Start the redirect flow and return (session id, state token).
async fn start_google(h: &Harness, sid: Option<&str>) -> (String, String) {
    let start = h.send(Method::GET, "/auth/google", sid, None).await;
    assert!(start.status.is_redirection());
    let location = url::Url::parse(&start.location.unwrap()).unwrap();
    let state = location.query_pairs().find(|(k, _)| k == "state").unwrap().1.to_string();
    (start.cookie.unwrap(), state)
}

#[tokio::test]
async fn oauth_without_account_requires_registration_then_links() {
    let h = harness_with(answer("x"), Some(google_profile("new@x.com")));

    let (sid, state) = start_google(&h, None).await;
    let cb = h
        .send(Method::GET, &format!("/auth/google/callback?code=good-code&state={state}"), Some(&sid), None)
        .await;
    assert_eq!(cb.status, StatusCode::OK);
    assert_eq!(cb.json["requiresRegistration"], true);
    assert_eq!(cb.json["email"], "new@x.com");
    assert!(h.state.db.get_user_by_email("new@x.com").unwrap().is_none());
    assert!(h.state.db.find_oauth_user("google", "g-123").unwrap().is_none());

    let sid = cb.cookie.unwrap_or(sid);
    let reg = h
        .send(
            Method::POST,
            "/auth/register",
            Some(&sid),
            Some(json!({"email": "new@x.com", "display_name": "New", "password": "longenough1"})),
        )
        .await;
    assert_eq!(reg.status, StatusCode::OK);
    assert_eq!(reg.json["requiresGoogleLink"], true);
    let me = h.send(Method::GET, "/me", Some(&sid), None).await;
    assert_eq!(me.json["isAuthenticated"], false);

    let (sid, state) = start_google(&h, Some(&sid)).await;
    let cb = h
        .send(Method::GET, &format!("/auth/google/callback?code=good-code&state={state}"), Some(&sid), None)
        .await;
    assert_eq!(cb.json["requiresVerification"], true);
    let user = h.state.db.get_user_by_email("new@x.com").unwrap().unwrap();
    assert_eq!(h.state.db.find_oauth_user("google", "g-123").unwrap(), Some(user.id));
}

#[tokio::test]
async fn oauth_state_must_match() {
    let h = harness_with(answer("x"), Some(google_profile("a@x.com")));
    let (sid, _state) = start_google(&h, None).await;

    let forged = h
        .send(Method::GET, "/auth/google/callback?code=good-code&state=forged", Some(&sid), None)
        .await;
    assert_eq!(forged.status, StatusCode::BAD_REQUEST);
    assert_eq!(forged.json["error"], "invalid_oauth_state");
}

#[tokio::test]
async fn failed_callback_still_consumes_the_state() {
    let h = harness_with(answer("x"), Some(google_profile("a@x.com")));

    for failing in ["code=bad-code", "error=access_denied", ""] {
        let (sid, state) = start_google(&h, None).await;
        let failed = h
            .send(Method::GET, &format!("/auth/google/callback?{failing}&state={state}"), Some(&sid), None)
            .await;
        assert_eq!(failed.status, StatusCode::BAD_GATEWAY, "{failing}");
        assert_eq!(failed.json["error"], "oauth_failed");

        let sid = failed.cookie.unwrap_or(sid);
        let replay = h
            .send(Method::GET, &format!("/auth/google/callback?code=good-code&state={state}"), Some(&sid), None)
            .await;
        assert_eq!(replay.status, StatusCode::BAD_REQUEST, "{failing}");
        assert_eq!(replay.json["error"], "invalid_oauth_state");
    }
}

#[tokio::test]
async fn oauth_failure_hides_upstream_detail() {
    let h = harness_with(answer("x"), Some(google_profile("a@x.com")));
    let (sid, state) = start_google(&h, None).await;

    let failed = h
        .send(Method::GET, &format!("/auth/google/callback?code=bad-code&state={state}"), Some(&sid), None)
        .await;
    assert_eq!(failed.json["message"], "google sign-in failed");
    assert!(!failed.json.to_string().contains("bad code"));
}

#[tokio::test]
async fn oauth_disabled_when_not_configured() {
    let h = harness();
    let start = h.send(Method::GET, "/auth/google", None, None).await;
    assert_eq!(start.status, StatusCode::NOT_FOUND);
    assert_eq!(start.json["error"], "oauth_disabled");
}

// -- Conversations --

#[tokio::test]
async fn protected_routes_require_a_session() {
    let h = harness();
    let reply = h.send(Method::GET, "/api/chat/conversations", None, None).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(reply.json["error"], "authentication_required");
}

#[tokio::test]
async fn conversation_lifecycle() {
    let h = harness();
    let owner = h.register("a@x.com").await;
    let other = h.register("b@x.com").await;

    let created = h.send(Method::POST, "/api/chat/conversations", Some(&owner), None).await;
    assert_eq!(created.status, StatusCode::CREATED);
    assert_eq!(created.json["data"]["participants"].as_array().unwrap().len(), 1);
    assert_eq!(created.json["data"]["participants"][0]["is_owner"], true);
    let id = created.json["data"]["id"].as_str().unwrap().to_string();

    let list = h.send(Method::GET, "/api/chat/conversations?page=1&limit=5", Some(&owner), None).await;
    assert_eq!(list.json["total"], 1);
    assert_eq!(list.json["limit"], 5);

    let hidden = h.send(Method::GET, &format!("/api/chat/conversations/{id}"), Some(&other), None).await;
    assert_eq!(hidden.status, StatusCode::NOT_FOUND);

    for _ in 0..2 {
        let added = h
            .send(
                Method::POST,
                &format!("/api/chat/conversations/{id}/participants"),
                Some(&owner),
                Some(json!({"email": "B@x.com"})),
            )
            .await;
        assert_eq!(added.status, StatusCode::OK);
        assert_eq!(added.json["data"].as_array().unwrap().len(), 2);
    }

    let detail = h.send(Method::GET, &format!("/api/chat/conversations/{id}"), Some(&other), None).await;
    assert_eq!(detail.status, StatusCode::OK);
    assert_eq!(detail.json["data"]["messages_count"], 0);

    let not_owner = h.send(Method::DELETE, &format!("/api/chat/conversations/{id}"), Some(&other), None).await;
    assert_eq!(not_owner.status, StatusCode::NOT_FOUND);

    let closed = h.send(Method::DELETE, &format!("/api/chat/conversations/{id}"), Some(&owner), None).await;
    assert_eq!(closed.status, StatusCode::OK);
    assert_eq!(closed.json["data"]["is_active"], false);
    assert!(closed.json["data"]["closed_at"].is_string());

    let again = h.send(Method::DELETE, &format!("/api/chat/conversations/{id}"), Some(&owner), None).await;
    assert_eq!(again.status, StatusCode::NOT_FOUND);
    assert_eq!(again.json["error"], "conversation_not_found");
}

#[tokio::test]
async fn post_message_validates_and_attributes_sender() {
    let h = harness();
    let owner = h.register("a@x.com").await;
    let stranger = h.register("b@x.com").await;
    let id = h.create_conversation(&owner).await;
    let uri = format!("/api/chat/conversations/{id}/messages");

    let outsider = h.send(Method::POST, &uri, Some(&stranger), Some(json!({"content": "hello"}))).await;
    assert_eq!(outsider.status, StatusCode::NOT_FOUND);
    assert_eq!(outsider.json["error"], "conversation_not_found");

    let empty = h.send(Method::POST, &uri, Some(&owner), Some(json!({"content": "   "}))).await;
    assert_eq!(empty.json["error"], "invalid_content");
    let sender = h.send(Method::POST, &uri, Some(&owner), Some(json!({"content": "x", "sender": "robot"}))).await;
    assert_eq!(sender.json["error"], "invalid_sender");
    let latency = h.send(Method::POST, &uri, Some(&owner), Some(json!({"content": "x", "latency_ms": -3}))).await;
    assert_eq!(latency.json["error"], "invalid_latency");
    let foreign = h
        .send(
            Method::POST,
            &uri,
            Some(&owner),
            Some(json!({"content": "x", "sender": "bot", "sender_user_id": Uuid::new_v4()})),
        )
        .await;
    assert_eq!(foreign.json["error"], "invalid_sender_user");

    let ok = h
        .send(Method::POST, &uri, Some(&owner), Some(json!({"content": "  hi there ", "latency_ms": "12.6"})))
        .await;
    assert_eq!(ok.status, StatusCode::CREATED);
    assert_eq!(ok.json["data"]["content"], "hi there");
    assert_eq!(ok.json["data"]["sender"], "user");
    assert_eq!(ok.json["data"]["latency_ms"], 13);
    assert!(ok.json["data"]["sender_user_id"].is_string());

    let bot = h.send(Method::POST, &uri, Some(&owner), Some(json!({"content": "auto", "sender": "bot"}))).await;
    assert_eq!(bot.status, StatusCode::CREATED);
    assert!(bot.json["data"]["sender_user_id"].is_null());
}

// -- Ask --

#[tokio::test]
async fn ask_stores_question_and_answer() {
    let h = harness();
    let sid = h.register("a@x.com").await;
    let id = h.create_conversation(&sid).await;

    let reply = h
        .send(
            Method::POST,
            &format!("/api/chat/conversations/{id}/ask"),
            Some(&sid),
            Some(json!({"question": "  What is RAG? ", "k": 3})),
        )
        .await;
    assert_eq!(reply.status, StatusCode::CREATED, "{}", reply.json);
    assert_eq!(reply.json["data"]["user"]["content"], "What is RAG?");
    assert_eq!(reply.json["data"]["bot"]["sender"], "bot");
    assert_eq!(reply.json["data"]["bot"]["latency_ms"], 42);
    assert_eq!(reply.json["data"]["bot"]["metadata"]["rag"]["request"]["k"], 3);
    assert_eq!(reply.json["data"]["bot"]["metadata"]["rag"]["response"]["sources"][0]["doc"], "guide.pdf");

    let sent = h.rag.calls.lock().unwrap().clone();
    assert_eq!(sent, vec![RagRequest { question: "What is RAG?".into(), k: 3, evaluate: true }]);
}

#[tokio::test]
async fn ask_with_empty_question_writes_nothing() {
    let h = harness();
    let sid = h.register("a@x.com").await;
    let id = h.create_conversation(&sid).await;

    let reply = h
        .send(Method::POST, &format!("/api/chat/conversations/{id}/ask"), Some(&sid), Some(json!({"question": ""})))
        .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json["error"], "invalid_request");

    let out_of_range = h
        .send(
            Method::POST,
            &format!("/api/chat/conversations/{id}/ask"),
            Some(&sid),
            Some(json!({"question": "q", "k": 21})),
        )
        .await;
    assert_eq!(out_of_range.json["error"], "invalid_request");

    assert!(h.state.db.list_messages(&id).unwrap().is_empty());
    assert!(h.rag.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn ask_timeout_keeps_question_and_records_system_message() {
    let h = harness_with(Err(RagError::new("timed out waiting for the RAG engine")), None);
    let sid = h.register("a@x.com").await;
    let id = h.create_conversation(&sid).await;

    let reply = h
        .send(Method::POST, &format!("/api/chat/conversations/{id}/ask"), Some(&sid), Some(json!({"question": "q?"})))
        .await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert_eq!(reply.json["error"], "rag_unavailable");

    let messages = h.send(Method::GET, &format!("/api/chat/conversations/{id}/messages"), Some(&sid), None).await;
    let messages = messages.json["data"].as_array().unwrap().clone();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["sender"], "user");
    assert_eq!(messages[0]["content"], "q?");
    assert_eq!(messages[1]["sender"], "system");
    assert_eq!(messages[1]["metadata"]["rag"]["error"]["message"], "timed out waiting for the RAG engine");
    assert!(messages[1]["metadata"]["rag"]["error"]["status"].is_null());
    assert!(messages.iter().all(|m| m["sender"] != "bot"));
}

#[tokio::test]
async fn ask_client_fault_maps_to_invalid_request() {
    let rejected = RagError { message: "bad k".into(), status: Some(422), details: Some(json!({"detail": "k"})) };
    let h = harness_with(Err(rejected), None);
    let sid = h.register("a@x.com").await;
    let id = h.create_conversation(&sid).await;

    let reply = h
        .send(Method::POST, &format!("/api/chat/conversations/{id}/ask"), Some(&sid), Some(json!({"question": "q"})))
        .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json["error"], "invalid_request");

    let rows = h.state.db.list_messages(&id).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].sender, "system");
    let metadata: Value = serde_json::from_str(&rows[1].metadata).unwrap();
    assert_eq!(metadata["rag"]["error"]["status"], 422);
    assert_eq!(metadata["rag"]["error"]["details"]["detail"], "k");
}

// -- Feedback --

#[tokio::test]
async fn feedback_is_replaced_not_accumulated() {
    let h = harness();
    let sid = h.register("a@x.com").await;
    let stranger = h.register("b@x.com").await;
    let id = h.create_conversation(&sid).await;
    let posted = h
        .send(
            Method::POST,
            &format!("/api/chat/conversations/{id}/messages"),
            Some(&sid),
            Some(json!({"content": "rate me"})),
        )
        .await;
    let message_id = posted.json["data"]["id"].as_str().unwrap().to_string();
    let uri = format!("/api/chat/messages/{message_id}/feedback");

    let invalid = h.send(Method::POST, &uri, Some(&sid), Some(json!({"rating": 9}))).await;
    assert_eq!(invalid.json["error"], "invalid_rating");
    let hidden = h.send(Method::POST, &uri, Some(&stranger), Some(json!({"rating": 3}))).await;
    assert_eq!(hidden.status, StatusCode::NOT_FOUND);
    assert_eq!(hidden.json["error"], "message_not_found");

    let first = h.send(Method::POST, &uri, Some(&sid), Some(json!({"rating": 2, "comment": "meh"}))).await;
    assert_eq!(first.status, StatusCode::OK);
    let second = h.send(Method::POST, &uri, Some(&sid), Some(json!({"rating": 5, "comment": "great"}))).await;
    assert_eq!(second.json["data"]["rating"], 5);

    let rows = h.state.db.feedback_for_messages(&[message_id]).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].rating, 5);
    assert_eq!(rows[0].comment.as_deref(), Some("great"));

    let listed = h.send(Method::GET, &format!("/api/chat/conversations/{id}/messages"), Some(&sid), None).await;
    assert_eq!(listed.json["data"][0]["feedback"].as_array().unwrap().len(), 1);
}

// -- Admin --

#[tokio::test]
async fn admin_routes_are_role_gated() {
    let h = harness();
    let user = h.register("a@x.com").await;
    h.seed_admin("root@x.com");
    let admin = h
        .send(Method::POST, "/auth/login", None, Some(json!({"email": "root@x.com", "password": "adminpass1"})))
        .await
        .cookie
        .unwrap();

    let refused = h.send(Method::GET, "/api/admin/users", Some(&user), None).await;
    assert_eq!(refused.status, StatusCode::FORBIDDEN);
    assert_eq!(refused.json["error"], "forbidden");

    let listed = h.send(Method::GET, "/api/admin/users?role=admin", Some(&admin), None).await;
    assert_eq!(listed.status, StatusCode::OK);
    assert_eq!(listed.json["total"], 1);
    assert_eq!(listed.json["data"][0]["email"], "root@x.com");

    let target = h.state.db.get_user_by_email("a@x.com").unwrap().unwrap().id;
    let granted = h.send(Method::POST, &format!("/api/admin/users/{target}/grant-admin"), Some(&admin), None).await;
    assert_eq!(granted.status, StatusCode::OK);
    let now_allowed = h.send(Method::GET, "/api/admin/users", Some(&user), None).await;
    assert_eq!(now_allowed.status, StatusCode::OK);

    h.send(Method::POST, &format!("/api/admin/users/{target}/revoke-admin"), Some(&admin), None).await;
    assert_eq!(h.state.db.get_user_roles(&target).unwrap(), vec!["user".to_string()]);

    let off = h
        .send(Method::POST, &format!("/api/admin/users/{target}/active"), Some(&admin), Some(json!({"active": false})))
        .await;
    assert_eq!(off.status, StatusCode::OK);
    let locked_out = h.send(Method::GET, "/api/chat/conversations", Some(&user), None).await;
    assert_eq!(locked_out.status, StatusCode::UNAUTHORIZED);

    let inactive = h.send(Method::GET, "/api/admin/users?status=inactive", Some(&admin), None).await;
    assert_eq!(inactive.json["total"], 1);

    let missing = h
        .send(Method::POST, &format!("/api/admin/users/{}/grant-admin", Uuid::new_v4()), Some(&admin), None)
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn chat_analytics_are_readable_by_analysts_and_admins() {
    let h = harness();
    let user = h.register("a@x.com").await;
    let analyst = h.register("b@x.com").await;
    let analyst_id = h.state.db.get_user_by_email("b@x.com").unwrap().unwrap().id;
    assert!(h.state.db.assign_role(&analyst_id, "analyst").unwrap());
    h.seed_admin("root@x.com");
    let admin = h
        .send(Method::POST, "/auth/login", None, Some(json!({"email": "root@x.com", "password": "adminpass1"})))
        .await
        .cookie
        .unwrap();

    let id = h.create_conversation(&user).await;
    let posted = h
        .send(
            Method::POST,
            &format!("/api/chat/conversations/{id}/messages"),
            Some(&user),
            Some(json!({"content": "how do I export?"})),
        )
        .await;
    let message_id = posted.json["data"]["id"].as_str().unwrap().to_string();
    h.send(
        Method::POST,
        &format!("/api/chat/messages/{message_id}/feedback"),
        Some(&user),
        Some(json!({"rating": 4, "comment": "useful"})),
    )
    .await;

    for uri in [
        "/api/admin/chat/conversations".to_string(),
        format!("/api/admin/chat/conversations/{id}"),
        "/api/admin/chat/feedback/summary".to_string(),
        "/api/admin/chat/feedback/messages".to_string(),
    ] {
        let refused = h.send(Method::GET, &uri, Some(&user), None).await;
        assert_eq!(refused.status, StatusCode::FORBIDDEN, "{uri}");
        assert_eq!(refused.json["error"], "forbidden");
        let anonymous = h.send(Method::GET, &uri, None, None).await;
        assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED, "{uri}");
        for caller in [&analyst, &admin] {
            let allowed = h.send(Method::GET, &uri, Some(caller), None).await;
            assert_eq!(allowed.status, StatusCode::OK, "{uri}: {}", allowed.json);
        }
    }

    // Analytics do not open up user management.
    let users = h.send(Method::GET, "/api/admin/users", Some(&analyst), None).await;
    assert_eq!(users.status, StatusCode::FORBIDDEN);

    let listed = h.send(Method::GET, "/api/admin/chat/conversations?q=DOC", Some(&analyst), None).await;
    assert_eq!(listed.json["total"], 1);
    let row = &listed.json["data"][0];
    assert_eq!(row["owner_email"], "a@x.com");
    assert_eq!(row["messages_count"], 1);
    assert_eq!(row["feedback_count"], 1);
    assert_eq!(row["avg_rating"], 4.0);
    let none = h.send(Method::GET, "/api/admin/chat/conversations?q=billing", Some(&analyst), None).await;
    assert_eq!(none.json["total"], 0);
    let by_owner = h
        .send(Method::GET, &format!("/api/admin/chat/conversations?owner={analyst_id}"), Some(&analyst), None)
        .await;
    assert_eq!(by_owner.json["total"], 0);

    let detail = h.send(Method::GET, &format!("/api/admin/chat/conversations/{id}"), Some(&analyst), None).await;
    assert_eq!(detail.json["data"]["title"], "Docs");
    assert_eq!(detail.json["data"]["participants"].as_array().unwrap().len(), 1);
    let message = &detail.json["data"]["messages"][0];
    assert_eq!(message["content"], "how do I export?");
    assert_eq!(message["sender_email"], "a@x.com");
    assert_eq!(message["feedback"][0]["rating"], 4);
    assert_eq!(message["feedback"][0]["user_email"], "a@x.com");

    let missing = h
        .send(Method::GET, &format!("/api/admin/chat/conversations/{}", Uuid::new_v4()), Some(&analyst), None)
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.json["error"], "conversation_not_found");

    let summary = h.send(Method::GET, "/api/admin/chat/feedback/summary", Some(&admin), None).await;
    assert_eq!(summary.json["data"][0]["email"], "a@x.com");
    assert_eq!(summary.json["data"][0]["total_ratings"], 1);
    assert_eq!(summary.json["data"][0]["max_rating"], 4);

    let feedback = h
        .send(Method::GET, &format!("/api/admin/chat/feedback/messages?conversation={id}"), Some(&admin), None)
        .await;
    assert_eq!(feedback.json["total"], 1);
    assert_eq!(feedback.json["data"][0]["comment"], "useful");
    assert_eq!(feedback.json["data"][0]["conversation_id"], id.as_str());
    let other_rater = h
        .send(
            Method::GET,
            &format!("/api/admin/chat/feedback/messages?user={analyst_id}"),
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(other_rater.json["total"], 0);
}
