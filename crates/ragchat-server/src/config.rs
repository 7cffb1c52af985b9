use std::net::SocketAddr;
use std::path::PathBuf;

use ragchat_api::oauth::GoogleConfig;
use ragchat_api::rag::RagConfig;

/// Process configuration, read from the environment (after `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub db_path: PathBuf,
    pub cookie_secure: bool,
    pub session_ttl_hours: i64,
    pub rag: RagConfig,
    /// `None` unless client id, secret and callback URL are all set.
    pub google: Option<GoogleConfig>,
    pub mail_webhook_url: Option<String>,
    pub mail_from: String,
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

#[derive(Debug, Clone)]
pub struct BootstrapAdmin {
    pub email: String,
    pub password: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid listen address: {0}")]
    InvalidAddr(#[from] std::net::AddrParseError),
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = var("RAGCHAT_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port = parse_or("RAGCHAT_PORT", 3000u16)?;
        let listen_addr = format!("{}:{}", host, port).parse::<SocketAddr>()?;

        let db_path = var("RAGCHAT_DB_PATH").unwrap_or_else(|| "ragchat.db".into()).into();
        let cookie_secure = flag("RAGCHAT_COOKIE_SECURE")?;
        let session_ttl_hours = session_ttl(parse_or("RAGCHAT_SESSION_TTL_HOURS", 24i64)?)?;

        let google = match (var("GOOGLE_CLIENT_ID"), var("GOOGLE_CLIENT_SECRET"), var("GOOGLE_CALLBACK_URL")) {
            (Some(client_id), Some(client_secret), Some(redirect_uri)) => {
                Some(GoogleConfig { client_id, client_secret, redirect_uri })
            }
            _ => None,
        };

        let bootstrap_admin = match (var("RAGCHAT_ADMIN_EMAIL"), var("RAGCHAT_ADMIN_PASSWORD")) {
            (Some(email), Some(password)) => Some(BootstrapAdmin { email, password }),
            _ => None,
        };

        Ok(Self {
            listen_addr,
            db_path,
            cookie_secure,
            session_ttl_hours,
            rag: RagConfig::from_env(),
            google,
            mail_webhook_url: var("MAIL_WEBHOOK_URL"),
            mail_from: var("MAIL_FROM").unwrap_or_else(|| "no-reply@ragchat.local".into()),
            bootstrap_admin,
        })
    }
}

/// A leap year. Large values overflow `chrono::Duration`.
const MAX_SESSION_TTL_HOURS: i64 = 24 * 366;

fn session_ttl(hours: i64) -> Result<i64, ConfigError> {
    if hours <= 0 || hours > MAX_SESSION_TTL_HOURS {
        return Err(ConfigError::InvalidValue { name: "RAGCHAT_SESSION_TTL_HOURS", value: hours.to_string() });
    }
    Ok(hours)
}

/// Set and non-blank.
fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}

fn flag(name: &'static str) -> Result<bool, ConfigError> {
    match var(name).map(|v| v.to_ascii_lowercase()).as_deref() {
        None | Some("0") | Some("false") | Some("no") => Ok(false),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some(other) => Err(ConfigError::InvalidValue { name, value: other.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ttl_must_be_positive_and_bounded() {
        assert_eq!(session_ttl(24).unwrap(), 24);
        assert_eq!(session_ttl(MAX_SESSION_TTL_HOURS).unwrap(), MAX_SESSION_TTL_HOURS);
        assert!(matches!(
            session_ttl(0),
            Err(ConfigError::InvalidValue { name: "RAGCHAT_SESSION_TTL_HOURS", .. })
        ));
        assert!(matches!(session_ttl(-5), Err(ConfigError::InvalidValue { .. })));
        assert!(matches!(session_ttl(i64::MAX), Err(ConfigError::InvalidValue { .. })));
        assert!(matches!(session_ttl(MAX_SESSION_TTL_HOURS + 1), Err(ConfigError::InvalidValue { .. })));
    }
}
