use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};

use super::provider::{
    AuthResponse, IdentityProvider, ProviderError, CUSTOM_AUTH_FLOW, CUSTOM_CHALLENGE,
    REFRESH_TOKEN_AUTH_FLOW,
};
use crate::config::PetSafeConfig;

const AMZ_JSON: &str = "application/x-amz-json-1.1";
const TARGET_PREFIX: &str = "AWSCognitoIdentityProviderService";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateAuthRequest<'a> {
    auth_flow: &'a str,
    client_id: &'a str,
    auth_parameters: HashMap<&'a str, &'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RespondToAuthChallengeRequest<'a> {
    challenge_name: &'a str,
    client_id: &'a str,
    session: &'a str,
    challenge_responses: HashMap<&'a str, &'a str>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "__type", default)]
    error_type: Option<String>,
    #[serde(alias = "Message", default)]
    message: Option<String>,
}

/// Cognito user-pool client speaking the AWS JSON 1.1 protocol.
///
/// Public app clients need no request signing; every call is a POST to the
/// pool's regional endpoint with the operation named in `X-Amz-Target`.
#[derive(Debug, Clone)]
pub struct CognitoIdentityProvider {
    client: Arc<ClientWithMiddleware>,
    endpoint: String,
    client_id: String,
}

impl CognitoIdentityProvider {
    pub fn new(
        client: Arc<ClientWithMiddleware>,
        endpoint: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            client_id: client_id.into(),
        }
    }

    pub fn from_config(client: Arc<ClientWithMiddleware>, config: &PetSafeConfig) -> Self {
        Self::new(client, config.identity_endpoint(), config.client_id.clone())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<B: Serialize + ?Sized>(
        &self,
        operation: &'static str,
        body: &B,
    ) -> Result<AuthResponse, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(AMZ_JSON));
        let target = HeaderValue::from_str(&format!("{TARGET_PREFIX}.{operation}"))
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        headers.insert("X-Amz-Target", target);

        let payload =
            serde_json::to_vec(body).map_err(|e| ProviderError::Decode(e.to_string()))?;

        debug!("Calling identity provider {operation} at {}", self.endpoint);
        let response = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Transport(e.into()))?;

        if !status.is_success() {
            let parsed = serde_json::from_slice::<ErrorBody>(&bytes).ok();
            let error_type = parsed
                .as_ref()
                .and_then(|b| b.error_type.clone())
                .map(|t| t.rsplit('#').next().unwrap_or_default().to_string())
                .unwrap_or_else(|| "UnknownError".to_string());
            let message = parsed
                .and_then(|b| b.message)
                .unwrap_or_else(|| String::from_utf8_lossy(&bytes).into_owned());
            error!("{operation} rejected: HTTP {status} {error_type}: {message}");
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                error_type,
                message,
            });
        }

        serde_json::from_slice::<AuthResponse>(&bytes).map_err(|e| {
            error!("Failed to decode {operation} response: {e}");
            ProviderError::Decode(e.to_string())
        })
    }
}

#[async_trait]
impl IdentityProvider for CognitoIdentityProvider {
    async fn initiate_custom_auth(&self, username: &str) -> Result<AuthResponse, ProviderError> {
        let request = InitiateAuthRequest {
            auth_flow: CUSTOM_AUTH_FLOW,
            client_id: &self.client_id,
            auth_parameters: HashMap::from([
                ("USERNAME", username),
                ("AuthFlow", CUSTOM_CHALLENGE),
            ]),
        };
        self.call("InitiateAuth", &request).await
    }

    async fn respond_to_challenge(
        &self,
        challenge_name: &str,
        session: &str,
        username: &str,
        answer: &str,
    ) -> Result<AuthResponse, ProviderError> {
        let request = RespondToAuthChallengeRequest {
            challenge_name,
            client_id: &self.client_id,
            session,
            challenge_responses: HashMap::from([("USERNAME", username), ("ANSWER", answer)]),
        };
        self.call("RespondToAuthChallenge", &request).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthResponse, ProviderError> {
        let request = InitiateAuthRequest {
            auth_flow: REFRESH_TOKEN_AUTH_FLOW,
            client_id: &self.client_id,
            auth_parameters: HashMap::from([("REFRESH_TOKEN", refresh_token)]),
        };
        self.call("InitiateAuth", &request).await
    }
}
