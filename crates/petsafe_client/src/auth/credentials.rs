use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PetSafeError, Result};

/// Token set issued by the identity provider.
///
/// The identity token is the bearer value for platform calls; the access and
/// refresh tokens are kept for renewal. `id_token` and `expires_at` are only
/// ever replaced together.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    id_token: String,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
}

impl Credentials {
    pub fn new(
        id_token: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id_token: id_token.into(),
            access_token: access_token.into(),
            refresh_token,
            expires_at,
        }
    }

    pub fn id_token(&self) -> &str {
        &self.id_token
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// True once `now` is within `margin` of expiry (boundary included).
    pub fn expires_within(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        self.expires_at
            .checked_sub_signed(margin)
            .map_or(true, |refresh_at| now >= refresh_at)
    }

    /// Replaces the bearer pair and expiry, rotating the refresh token only
    /// when a new one was issued.
    pub(crate) fn renewed(
        &self,
        id_token: String,
        access_token: String,
        refresh_token: Option<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id_token,
            access_token,
            refresh_token: refresh_token.or_else(|| self.refresh_token.clone()),
            expires_at,
        }
    }

    pub(crate) fn to_event(&self) -> TokenRefreshEvent {
        TokenRefreshEvent {
            id_token: self.id_token.clone(),
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("id_token", &mask_token(&self.id_token))
            .field("access_token", &mask_token(&self.access_token))
            .field(
                "refresh_token",
                &self.refresh_token.as_deref().map(mask_token),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Shortens a token to a loggable prefix.
pub fn mask_token(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    if prefix.len() == token.len() {
        "***".to_string()
    } else {
        format!("{prefix}***")
    }
}

/// An in-progress custom challenge, between `request_challenge` and a
/// successful `redeem_challenge`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeState {
    pub challenge_name: String,
    pub session: String,
    pub username: String,
}

/// Payload handed to token observers after a login or refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenRefreshEvent {
    pub id_token: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Tokens from an earlier session, used to skip the challenge flow.
#[derive(Clone, PartialEq, Eq)]
pub struct ResumeTokens {
    pub(crate) id_token: String,
    pub(crate) access_token: String,
    pub(crate) refresh_token: String,
    pub(crate) session: Option<String>,
    pub(crate) expires_at: Option<DateTime<Utc>>,
}

impl ResumeTokens {
    /// All three tokens are required; blank values are rejected.
    pub fn new(
        id_token: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Result<Self> {
        let tokens = Self {
            id_token: id_token.into(),
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            session: None,
            expires_at: None,
        };
        for (name, value) in [
            ("id_token", &tokens.id_token),
            ("access_token", &tokens.access_token),
            ("refresh_token", &tokens.refresh_token),
        ] {
            if value.trim().is_empty() {
                return Err(PetSafeError::InvalidResumeTokens(format!("{name} is empty")));
            }
        }
        Ok(tokens)
    }

    /// Builds resume tokens from optional pieces, e.g. values read from the
    /// environment. Nothing given yields `Ok(None)`; a partial set is an error.
    pub fn from_parts(
        id_token: Option<String>,
        access_token: Option<String>,
        refresh_token: Option<String>,
        session: Option<String>,
    ) -> Result<Option<Self>> {
        match (id_token, access_token, refresh_token) {
            (None, None, None) => {
                if session.is_some() {
                    return Err(PetSafeError::InvalidResumeTokens(
                        "session handle given without tokens".to_string(),
                    ));
                }
                Ok(None)
            }
            (Some(id), Some(access), Some(refresh)) => {
                let mut tokens = Self::new(id, access, refresh)?;
                tokens.session = session;
                Ok(Some(tokens))
            }
            (id, access, refresh) => {
                let missing: Vec<&str> = [
                    ("id_token", id.is_none()),
                    ("access_token", access.is_none()),
                    ("refresh_token", refresh.is_none()),
                ]
                .into_iter()
                .filter_map(|(name, absent)| absent.then_some(name))
                .collect();
                Err(PetSafeError::InvalidResumeTokens(format!(
                    "missing {}",
                    missing.join(", ")
                )))
            }
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Known expiry. Without one the tokens are treated as already expired.
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub(crate) fn into_credentials(self) -> (Credentials, Option<String>) {
        let expires_at = self.expires_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        (
            Credentials::new(
                self.id_token,
                self.access_token,
                Some(self.refresh_token),
                expires_at,
            ),
            self.session,
        )
    }
}

impl std::fmt::Debug for ResumeTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeTokens")
            .field("id_token", &mask_token(&self.id_token))
            .field("access_token", &mask_token(&self.access_token))
            .field("refresh_token", &mask_token(&self.refresh_token))
            .field("session", &self.session.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// How a session starts: with nothing, or with a complete prior token set.
#[derive(Debug, Clone, Default)]
pub enum SessionSeed {
    #[default]
    Fresh,
    Resume(ResumeTokens),
}

impl From<Option<ResumeTokens>> for SessionSeed {
    fn from(tokens: Option<ResumeTokens>) -> Self {
        tokens.map_or(SessionSeed::Fresh, SessionSeed::Resume)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Unauthenticated,
    ChallengeIssued,
    Authenticated,
    Refreshing,
}
