use std::sync::Arc;

use log::info;
use reqwest::Method;
use serde_json::Value;

use crate::api::{ApiResponse, AuthenticatedHttpClient};
use crate::auth::{
    ChallengeState, CognitoIdentityProvider, Credentials, IdentityProvider, ResumeTokens,
    SessionManager, SessionOptions, SessionSeed, SessionStatus, SubscriptionId, TokenRefreshEvent,
};
use crate::clock::{Clock, SystemClock};
use crate::config::PetSafeConfig;
use crate::devices::{Scoopfree, SmartFeed};
use crate::error::Result;
use crate::utils::http_utils::{build_http_client, build_retry_client};

const FEEDERS_PATH: &str = "smart-feed/feeders";
const LITTERBOXES_PATH: &str = "scoopfree/product/product";

/// One user's connection to the PetSafe cloud: a session plus the
/// authenticated platform client built on it.
#[derive(Debug, Clone)]
pub struct PetSafeClient {
    session: Arc<SessionManager>,
    http: AuthenticatedHttpClient,
}

impl PetSafeClient {
    /// Client for `email` that still has to log in with
    /// [`request_code`](Self::request_code).
    pub fn new(email: impl Into<String>, config: &PetSafeConfig) -> Result<Self> {
        Self::with_seed(email, SessionSeed::Fresh, config)
    }

    /// Client that continues a session from previously issued tokens.
    pub fn resume(email: impl Into<String>, tokens: ResumeTokens, config: &PetSafeConfig) -> Result<Self> {
        Self::with_seed(email, SessionSeed::Resume(tokens), config)
    }

    pub fn with_seed(email: impl Into<String>, seed: SessionSeed, config: &PetSafeConfig) -> Result<Self> {
        // Both transports share one connection pool. Identity calls are not
        // replayed: a refresh token may rotate and a challenge session is
        // single use.
        let client = build_http_client(config)?;
        let identity = Arc::new(build_retry_client(client.clone(), 0));
        let transport = Arc::new(build_retry_client(client, config.transient_retries));
        let provider = CognitoIdentityProvider::from_config(identity, config);
        let session = SessionManager::new(
            email,
            Arc::new(provider),
            Arc::new(SystemClock),
            SessionOptions::from_config(config),
            seed,
        );
        let session = Arc::new(session);
        let http = AuthenticatedHttpClient::new(Arc::clone(&session), transport, &config.api_base)?
            .with_retry_on_auth_failure(config.retry_on_auth_failure);
        Ok(Self { session, http })
    }

    /// Assembles a client from explicit parts, e.g. a non-Cognito identity
    /// provider or a manual clock.
    pub fn from_parts(
        email: impl Into<String>,
        seed: SessionSeed,
        provider: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        config: &PetSafeConfig,
    ) -> Result<Self> {
        let session = Arc::new(SessionManager::new(
            email,
            provider,
            clock,
            SessionOptions::from_config(config),
            seed,
        ));
        let http = AuthenticatedHttpClient::from_config(Arc::clone(&session), config)?;
        Ok(Self { session, http })
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn http(&self) -> &AuthenticatedHttpClient {
        &self.http
    }

    /// Asks the platform to email a confirmation code.
    pub async fn request_code(&self) -> Result<ChallengeState> {
        self.session.request_challenge().await
    }

    pub async fn request_tokens_from_code(&self, code: &str) -> Result<Credentials> {
        self.session.redeem_challenge(code).await
    }

    pub async fn get_feeders(&self) -> Result<Vec<SmartFeed>> {
        let feeders: Vec<Value> = self.http.get(FEEDERS_PATH).await?.json()?;
        info!("Found {} feeder(s)", feeders.len());
        Ok(feeders
            .into_iter()
            .map(|data| SmartFeed::new(self.http.clone(), data))
            .collect())
    }

    pub async fn get_litterboxes(&self) -> Result<Vec<Scoopfree>> {
        let response = self.http.get(LITTERBOXES_PATH).await?;
        let litterboxes: Vec<Value> = match response.data.get("data") {
            Some(list) => serde_json::from_value(list.clone())?,
            None => Vec::new(),
        };
        info!("Found {} litter box(es)", litterboxes.len());
        Ok(litterboxes
            .into_iter()
            .map(|data| Scoopfree::new(self.http.clone(), data))
            .collect())
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.http.get(path).await
    }

    pub async fn post(&self, path: &str, body: Option<&Value>) -> Result<ApiResponse> {
        self.http.post(path, body).await
    }

    pub async fn put(&self, path: &str, body: Option<&Value>) -> Result<ApiResponse> {
        self.http.put(path, body).await
    }

    pub async fn patch(&self, path: &str, body: Option<&Value>) -> Result<ApiResponse> {
        self.http.patch(path, body).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.http.delete(path).await
    }

    pub async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<ApiResponse> {
        self.http.send(method, path, body).await
    }

    pub fn on_token_refreshed<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&TokenRefreshEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.session.on_token_refreshed(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.session.unsubscribe(id)
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn email(&self) -> &str {
        self.session.username()
    }

    pub fn id_token(&self) -> Option<String> {
        self.session.id_token()
    }

    pub fn access_token(&self) -> Option<String> {
        self.session.access_token()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.session.refresh_token()
    }

    pub fn session_handle(&self) -> Option<String> {
        self.session.session_handle()
    }
}
