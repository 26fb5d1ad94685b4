use std::sync::Arc;

use log::{debug, info, warn};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use reqwest_middleware::ClientWithMiddleware;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::auth::SessionManager;
use crate::config::PetSafeConfig;
use crate::error::{is_auth_status, PetSafeError, Result};
use crate::utils::http_utils::build_transport;

/// Decoded body of a successful platform call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: StatusCode,
    /// `Value::Null` for an empty body.
    pub data: Value,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// HTTP client for the platform API that puts the session's identity token on
/// every request.
///
/// A 401 or 403 triggers one forced refresh and one resend of the same
/// request. Whatever the resend returns is final.
#[derive(Debug, Clone)]
pub struct AuthenticatedHttpClient {
    session: Arc<SessionManager>,
    client: Arc<ClientWithMiddleware>,
    base_url: Url,
    retry_on_auth_failure: bool,
}

impl AuthenticatedHttpClient {
    pub fn new(
        session: Arc<SessionManager>,
        client: Arc<ClientWithMiddleware>,
        base_url: &str,
    ) -> Result<Self> {
        Ok(Self {
            session,
            client,
            base_url: normalize_base_url(base_url)?,
            retry_on_auth_failure: true,
        })
    }

    pub fn from_config(session: Arc<SessionManager>, config: &PetSafeConfig) -> Result<Self> {
        let client = build_transport(config)?;
        Ok(Self::new(session, client, &config.api_base)?
            .with_retry_on_auth_failure(config.retry_on_auth_failure))
    }

    pub fn with_retry_on_auth_failure(mut self, enabled: bool) -> Self {
        self.retry_on_auth_failure = enabled;
        self
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.send(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: Option<&Value>) -> Result<ApiResponse> {
        self.send(Method::POST, path, body).await
    }

    pub async fn put(&self, path: &str, body: Option<&Value>) -> Result<ApiResponse> {
        self.send(Method::PUT, path, body).await
    }

    pub async fn patch(&self, path: &str, body: Option<&Value>) -> Result<ApiResponse> {
        self.send(Method::PATCH, path, body).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.send(Method::DELETE, path, None).await
    }

    /// Sends `method path` with the current identity token.
    pub async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<ApiResponse> {
        let url = self.url_for(path)?;
        let payload = body.map(serde_json::to_vec).transpose()?;

        self.session.ensure_valid().await?;
        let (credentials, generation) = self.session.snapshot()?;

        let (status, text) = self
            .dispatch(&method, &url, payload.as_deref(), credentials.id_token())
            .await?;
        if status.is_success() {
            return Ok(Self::decode(status, text));
        }
        if !is_auth_status(status) || !self.retry_on_auth_failure {
            return Err(PetSafeError::Api { status, body: text });
        }

        warn!("{method} {url} rejected with {status}, refreshing token and retrying once");
        let credentials = self.session.refresh_from(generation).await?;
        let (status, text) = self
            .dispatch(&method, &url, payload.as_deref(), credentials.id_token())
            .await?;
        if status.is_success() {
            info!("{method} {url} succeeded after token refresh");
            Ok(Self::decode(status, text))
        } else {
            Err(PetSafeError::Api { status, body: text })
        }
    }

    async fn dispatch(
        &self,
        method: &Method,
        url: &Url,
        payload: Option<&[u8]>,
        id_token: &str,
    ) -> Result<(StatusCode, String)> {
        debug!("{method} {url}");
        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .headers(Self::headers(id_token)?);
        if let Some(payload) = payload {
            request = request.body(payload.to_vec());
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        debug!("{method} {url} -> {status}");
        Ok((status, text))
    }

    fn headers(id_token: &str) -> Result<HeaderMap> {
        let mut authorization = HeaderValue::from_str(id_token)?;
        authorization.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, authorization);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn decode(status: StatusCode, text: String) -> ApiResponse {
        let data = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or_else(|_| {
                debug!("Response body is not JSON, keeping it as a string");
                Value::String(text)
            })
        };
        ApiResponse { status, data }
    }

    fn url_for(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }
}

fn normalize_base_url(base_url: &str) -> Result<Url> {
    let mut base = base_url.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Ok(Url::parse(&base)?)
}
