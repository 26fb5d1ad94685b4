use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CUSTOM_AUTH_FLOW: &str = "CUSTOM_AUTH";
pub const CUSTOM_CHALLENGE: &str = "CUSTOM_CHALLENGE";
pub const REFRESH_TOKEN_AUTH_FLOW: &str = "REFRESH_TOKEN_AUTH";

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("identity provider unreachable: {0}")]
    Transport(#[from] reqwest_middleware::Error),

    #[error("{error_type}: {message}")]
    Rejected {
        status: u16,
        error_type: String,
        message: String,
    },

    #[error("unexpected identity provider response: {0}")]
    Decode(String),
}

/// `AuthenticationResult` as returned by both the challenge answer and the
/// refresh flow. `refresh_token` is absent when the provider did not rotate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthenticationResult {
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Response shape shared by `InitiateAuth` and `RespondToAuthChallenge`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthResponse {
    #[serde(default)]
    pub challenge_name: Option<String>,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub challenge_parameters: Option<HashMap<String, String>>,
    #[serde(default)]
    pub authentication_result: Option<AuthenticationResult>,
}

impl AuthResponse {
    pub fn challenge_username(&self) -> Option<&str> {
        self.challenge_parameters
            .as_ref()
            .and_then(|params| params.get("USERNAME"))
            .map(String::as_str)
    }
}

/// The three identity-provider exchanges a session needs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Starts a custom-challenge login; the provider sends the code out of band.
    async fn initiate_custom_auth(&self, username: &str) -> Result<AuthResponse, ProviderError>;

    async fn respond_to_challenge(
        &self,
        challenge_name: &str,
        session: &str,
        username: &str,
        answer: &str,
    ) -> Result<AuthResponse, ProviderError>;

    async fn refresh(&self, refresh_token: &str) -> Result<AuthResponse, ProviderError>;
}
