use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Role granted to every self-registered account.
pub const ROLE_USER: &str = "user";
/// Role that bypasses the emailed verification code and unlocks `/api/admin`.
pub const ROLE_ADMIN: &str = "admin";
/// Read-only access to the conversation and feedback analytics.
pub const ROLE_ANALYST: &str = "analyst";

/// OAuth provider name stored alongside linked identities.
pub const PROVIDER_GOOGLE: &str = "google";

/// Who authored a message in a conversation transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    User,
    Bot,
    System,
}

impl SenderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Bot => "bot",
            Self::System => "system",
        }
    }
}

impl fmt::Display for SenderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSender(pub String);

impl fmt::Display for UnknownSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown sender kind '{}'", self.0)
    }
}

impl std::error::Error for UnknownSender {}

impl FromStr for SenderKind {
    type Err = UnknownSender;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "bot" => Ok(Self::Bot),
            "system" => Ok(Self::System),
            other => Err(UnknownSender(other.to_string())),
        }
    }
}

/// Normalize an email address for storage and lookup.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
