use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PetSafeError {
    /// The identity provider refused to start a login for this user.
    #[error("Identity provider rejected the login request: {0}")]
    AuthInitiation(String),

    #[error("Must request code first")]
    ProtocolSequence,

    #[error("Invalid confirmation code: {0}")]
    InvalidCode(String),

    #[error("Not authorized! Have you requested a token?")]
    NotAuthenticated,

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Failed to refresh tokens: {0}")]
    RefreshFailed(String),

    #[error("Invalid resume tokens: {0}")]
    InvalidResumeTokens(String),

    #[error("API error: HTTP {status} - {body}")]
    Api { status: StatusCode, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest_middleware::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PetSafeError {
    /// True for platform responses rejected as unauthenticated (401/403).
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            PetSafeError::Api { status, .. } if is_auth_status(*status)
        )
    }

    /// HTTP status carried by the error, when there is one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            PetSafeError::Api { status, .. } => Some(*status),
            PetSafeError::Transport(e) => e.status(),
            PetSafeError::Http(reqwest_middleware::Error::Reqwest(e)) => e.status(),
            _ => None,
        }
    }
}

pub(crate) fn is_auth_status(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

pub type Result<T> = std::result::Result<T, PetSafeError>;
