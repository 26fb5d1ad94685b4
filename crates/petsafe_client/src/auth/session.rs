use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use tokio::sync::Mutex;

use super::credentials::{
    mask_token, ChallengeState, Credentials, SessionSeed, SessionStatus, TokenRefreshEvent,
};
use super::observers::{ObserverList, SubscriptionId};
use super::provider::{AuthResponse, IdentityProvider, ProviderError, CUSTOM_CHALLENGE};
use crate::clock::Clock;
use crate::config::{PetSafeConfig, DEFAULT_REFRESH_MARGIN_SECS};
use crate::error::{PetSafeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Refresh once the token is this close to expiry.
    pub refresh_margin: Duration,
    pub proactive_refresh: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            refresh_margin: Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS as i64),
            proactive_refresh: true,
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &PetSafeConfig) -> Self {
        let refresh_margin = Duration::from_std(config.refresh_margin()).unwrap_or_else(|_| {
            warn!(
                "refresh_margin_secs={} out of range, using default",
                config.refresh_margin_secs
            );
            Self::default().refresh_margin
        });
        Self {
            refresh_margin,
            proactive_refresh: config.proactive_refresh,
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    credentials: Option<Credentials>,
    challenge: Option<ChallengeState>,
    session_handle: Option<String>,
    /// Bumped whenever `credentials` is replaced or a refresh attempt fails.
    generation: u64,
    last_refresh_error: Option<String>,
}

/// Clears the refreshing flag on every exit path, including cancellation.
struct RefreshingFlag<'a>(&'a AtomicBool);

impl<'a> RefreshingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RefreshingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// `now + ttl_secs`, saturating at the latest representable instant.
fn expiry_after(now: DateTime<Utc>, ttl_secs: i64) -> DateTime<Utc> {
    Duration::try_seconds(ttl_secs)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Strips everything but ASCII digits from a confirmation code.
pub fn normalize_answer(answer: &str) -> String {
    answer.chars().filter(char::is_ascii_digit).collect()
}

/// Owns one user's credentials and the challenge-response login against the
/// identity provider.
///
/// Exchanges that replace credentials or challenge state are serialized by a
/// single async lock. A refresh caller records the credential generation it
/// saw before waiting; if another caller completed an exchange in the
/// meantime, the waiter takes that outcome instead of spending the refresh
/// token again.
pub struct SessionManager {
    username: String,
    provider: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    options: SessionOptions,
    state: RwLock<SessionState>,
    exchange_lock: Mutex<()>,
    refreshing: AtomicBool,
    observers: ObserverList,
}

impl SessionManager {
    pub fn new(
        username: impl Into<String>,
        provider: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        options: SessionOptions,
        seed: SessionSeed,
    ) -> Self {
        let mut state = SessionState::default();
        if let SessionSeed::Resume(tokens) = seed {
            let (credentials, session_handle) = tokens.into_credentials();
            debug!(
                "Resuming session with id token {}",
                mask_token(credentials.id_token())
            );
            state.credentials = Some(credentials);
            state.session_handle = session_handle;
        }

        Self {
            username: username.into(),
            provider,
            clock,
            options,
            state: RwLock::new(state),
            exchange_lock: Mutex::new(()),
            refreshing: AtomicBool::new(false),
            observers: ObserverList::new(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    pub fn status(&self) -> SessionStatus {
        if self.refreshing.load(Ordering::SeqCst) {
            return SessionStatus::Refreshing;
        }
        let state = self.read_state();
        if state.credentials.is_some() {
            SessionStatus::Authenticated
        } else if state.challenge.is_some() {
            SessionStatus::ChallengeIssued
        } else {
            SessionStatus::Unauthenticated
        }
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.read_state().credentials.clone()
    }

    pub fn id_token(&self) -> Option<String> {
        self.read_state()
            .credentials
            .as_ref()
            .map(|c| c.id_token().to_string())
    }

    pub fn access_token(&self) -> Option<String> {
        self.read_state()
            .credentials
            .as_ref()
            .map(|c| c.access_token().to_string())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read_state()
            .credentials
            .as_ref()
            .and_then(|c| c.refresh_token().map(str::to_string))
    }

    /// Provider session handle from the latest challenge (or the resumed one).
    pub fn session_handle(&self) -> Option<String> {
        self.read_state().session_handle.clone()
    }

    pub fn pending_challenge(&self) -> Option<ChallengeState> {
        self.read_state().challenge.clone()
    }

    pub fn on_token_refreshed<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&TokenRefreshEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Asks the provider to send a confirmation code to the user.
    ///
    /// A rejection (e.g. unknown user) is returned as
    /// [`PetSafeError::AuthInitiation`] and never retried.
    pub async fn request_challenge(&self) -> Result<ChallengeState> {
        let _guard = self.exchange_lock.lock().await;

        let response = self
            .provider
            .initiate_custom_auth(&self.username)
            .await
            .map_err(|e| match e {
                ProviderError::Transport(e) => PetSafeError::Http(e),
                other => {
                    error!("Login request for {} rejected: {other}", self.username);
                    PetSafeError::AuthInitiation(other.to_string())
                }
            })?;

        let session = response.session.clone().ok_or_else(|| {
            PetSafeError::AuthInitiation("identity provider returned no session".to_string())
        })?;
        let challenge = ChallengeState {
            challenge_name: response
                .challenge_name
                .clone()
                .unwrap_or_else(|| CUSTOM_CHALLENGE.to_string()),
            username: response
                .challenge_username()
                .map(str::to_string)
                .unwrap_or_else(|| self.username.clone()),
            session: session.clone(),
        };

        let mut state = self.write_state();
        state.challenge = Some(challenge.clone());
        state.session_handle = Some(session);
        info!("Confirmation code requested for {}", self.username);
        Ok(challenge)
    }

    /// Answers the pending challenge with the code the user received.
    ///
    /// The pending challenge survives a wrong code so the caller can try
    /// again; if the provider hands back a new session handle it replaces the
    /// old one. It is cleared only by a successful login.
    pub async fn redeem_challenge(&self, answer: &str) -> Result<Credentials> {
        let _guard = self.exchange_lock.lock().await;

        let challenge = self
            .read_state()
            .challenge
            .clone()
            .ok_or(PetSafeError::ProtocolSequence)?;
        let code = normalize_answer(answer);

        let response = match self
            .provider
            .respond_to_challenge(
                &challenge.challenge_name,
                &challenge.session,
                &challenge.username,
                &code,
            )
            .await
        {
            Ok(response) => response,
            Err(ProviderError::Transport(e)) => return Err(PetSafeError::Http(e)),
            Err(e) => {
                warn!("Confirmation code rejected: {e}");
                return Err(PetSafeError::InvalidCode(e.to_string()));
            }
        };

        let now = self.clock.now();
        let credentials = match Self::credentials_from(&response, now) {
            Some((id_token, access_token, refresh_token, expires_at)) => {
                Credentials::new(id_token, access_token, refresh_token, expires_at)
            }
            None => {
                let mut state = self.write_state();
                if let (Some(pending), Some(session)) =
                    (state.challenge.as_mut(), response.session.clone())
                {
                    pending.session = session.clone();
                    if let Some(name) = response.challenge_name.clone() {
                        pending.challenge_name = name;
                    }
                    state.session_handle = Some(session);
                }
                warn!("Challenge answer for {} not accepted", self.username);
                return Err(PetSafeError::InvalidCode(
                    "Invalid confirmation code".to_string(),
                ));
            }
        };

        self.store_login(credentials.clone());
        info!(
            "Logged in as {}, token expires at {}",
            self.username,
            credentials.expires_at()
        );
        self.observers.emit(&credentials.to_event());
        Ok(credentials)
    }

    /// Returns credentials fit to put on the wire, refreshing first when the
    /// identity token is within the refresh margin of expiry.
    pub async fn ensure_valid(&self) -> Result<Credentials> {
        let (credentials, generation) = self.snapshot()?;
        if self.options.proactive_refresh
            && credentials.expires_within(self.clock.now(), self.options.refresh_margin)
        {
            debug!(
                "Token for {} expires at {}, refreshing",
                self.username,
                credentials.expires_at()
            );
            return self.refresh_from(generation).await;
        }
        Ok(credentials)
    }

    /// Exchanges the refresh token for a new identity/access pair.
    ///
    /// Concurrent callers share a single exchange with the provider.
    pub async fn refresh(&self) -> Result<Credentials> {
        let generation = self.read_state().generation;
        self.refresh_from(generation).await
    }

    /// Refreshes unless the credentials have moved past `observed_generation`
    /// while waiting for the lock, in which case that newer outcome is returned.
    pub(crate) async fn refresh_from(&self, observed_generation: u64) -> Result<Credentials> {
        let _guard = self.exchange_lock.lock().await;

        let refresh_token = {
            let state = self.read_state();
            if state.generation != observed_generation {
                if let Some(message) = &state.last_refresh_error {
                    return Err(PetSafeError::RefreshFailed(message.clone()));
                }
                if let Some(credentials) = &state.credentials {
                    debug!("Reusing credentials from a concurrent refresh");
                    return Ok(credentials.clone());
                }
            }
            state
                .credentials
                .as_ref()
                .and_then(|c| c.refresh_token().map(str::to_string))
                .ok_or(PetSafeError::NoRefreshToken)?
        };

        let _refreshing = RefreshingFlag::raise(&self.refreshing);
        info!("Refreshing tokens for {}", self.username);

        let outcome = match self.provider.refresh(&refresh_token).await {
            Ok(response) => Self::credentials_from(&response, self.clock.now())
                .ok_or_else(|| "no authentication result in refresh response".to_string()),
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok((id_token, access_token, rotated, expires_at)) => {
                let credentials = {
                    let mut state = self.write_state();
                    let renewed = match &state.credentials {
                        Some(current) => {
                            current.renewed(id_token, access_token, rotated, expires_at)
                        }
                        None => Credentials::new(
                            id_token,
                            access_token,
                            rotated.or(Some(refresh_token)),
                            expires_at,
                        ),
                    };
                    state.credentials = Some(renewed.clone());
                    state.generation += 1;
                    state.last_refresh_error = None;
                    renewed
                };
                info!(
                    "Tokens refreshed for {}, new expiry {}",
                    self.username,
                    credentials.expires_at()
                );
                self.observers.emit(&credentials.to_event());
                Ok(credentials)
            }
            Err(message) => {
                error!("Token refresh for {} failed: {message}", self.username);
                let mut state = self.write_state();
                state.generation += 1;
                state.last_refresh_error = Some(message.clone());
                Err(PetSafeError::RefreshFailed(message))
            }
        }
    }

    /// Current credentials and their generation.
    pub(crate) fn snapshot(&self) -> Result<(Credentials, u64)> {
        let state = self.read_state();
        let credentials = state
            .credentials
            .clone()
            .ok_or(PetSafeError::NotAuthenticated)?;
        Ok((credentials, state.generation))
    }

    fn store_login(&self, credentials: Credentials) {
        let mut state = self.write_state();
        state.credentials = Some(credentials);
        state.challenge = None;
        state.generation += 1;
        state.last_refresh_error = None;
    }

    fn credentials_from(
        response: &AuthResponse,
        now: DateTime<Utc>,
    ) -> Option<(String, String, Option<String>, DateTime<Utc>)> {
        let result = response.authentication_result.as_ref()?;
        let id_token = result.id_token.clone().filter(|t| !t.is_empty())?;
        let access_token = result.access_token.clone().unwrap_or_default();
        let ttl = result.expires_in.unwrap_or(0).max(0);
        Some((
            id_token,
            access_token,
            result.refresh_token.clone(),
            expiry_after(now, ttl),
        ))
    }

    fn read_state(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("username", &self.username)
            .field("status", &self.status())
            .field("options", &self.options)
            .field("observers", &self.observers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::ResumeTokens;
    use crate::auth::provider::{AuthenticationResult, MockIdentityProvider};
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn challenge_response(session: &str) -> AuthResponse {
        AuthResponse {
            challenge_name: Some(CUSTOM_CHALLENGE.to_string()),
            session: Some(session.to_string()),
            challenge_parameters: Some(HashMap::from([(
                "USERNAME".to_string(),
                "user-uuid".to_string(),
            )])),
            authentication_result: None,
        }
    }

    fn token_response(id: &str, ttl: i64, refresh: Option<&str>) -> AuthResponse {
        AuthResponse {
            authentication_result: Some(AuthenticationResult {
                id_token: Some(id.to_string()),
                access_token: Some(format!("access-{id}")),
                refresh_token: refresh.map(str::to_string),
                expires_in: Some(ttl),
                token_type: Some("Bearer".to_string()),
            }),
            ..AuthResponse::default()
        }
    }

    fn manager(provider: impl IdentityProvider + 'static, clock: Arc<ManualClock>) -> SessionManager {
        SessionManager::new(
            "me@example.com",
            Arc::new(provider),
            clock,
            SessionOptions::default(),
            SessionSeed::Fresh,
        )
    }

    fn resumed(
        provider: impl IdentityProvider + 'static,
        clock: Arc<ManualClock>,
        expires_at: Option<DateTime<Utc>>,
    ) -> SessionManager {
        let mut tokens = ResumeTokens::new("id-0", "access-0", "refresh-0").expect("tokens");
        if let Some(expires_at) = expires_at {
            tokens = tokens.with_expires_at(expires_at);
        }
        SessionManager::new(
            "me@example.com",
            Arc::new(provider),
            clock,
            SessionOptions::default(),
            SessionSeed::Resume(tokens),
        )
    }

    #[test]
    fn normalize_answer_keeps_only_digits() {
        assert_eq!(normalize_answer("12-3456"), "123456");
        assert_eq!(normalize_answer(" 123 456\n"), "123456");
        assert_eq!(normalize_answer("123456"), "123456");
        assert_eq!(normalize_answer(&normalize_answer("1a2b3c")), "123");
        assert_eq!(normalize_answer("abc"), "");
    }

    #[tokio::test]
    async fn redeem_without_challenge_is_a_sequence_error() {
        let clock = Arc::new(ManualClock::new(start()));
        let session = manager(MockIdentityProvider::new(), clock);

        for answer in ["123456", "", "12-34"] {
            let err = session.redeem_challenge(answer).await.unwrap_err();
            assert!(matches!(err, PetSafeError::ProtocolSequence));
        }
        assert_eq!(session.status(), SessionStatus::Unauthenticated);
    }

    #[tokio::test]
    async fn login_submits_normalized_code_and_computes_expiry() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut provider = MockIdentityProvider::new();
        provider
            .expect_initiate_custom_auth()
            .withf(|username| username == "me@example.com")
            .times(1)
            .returning(|_| Ok(challenge_response("sess-1")));
        provider
            .expect_respond_to_challenge()
            .withf(|name, session, username, answer| {
                name == CUSTOM_CHALLENGE
                    && session == "sess-1"
                    && username == "user-uuid"
                    && answer == "123456"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(token_response("id-1", 3600, Some("refresh-1"))));

        let session = manager(provider, clock);
        let events = Arc::new(AtomicUsize::new(0));
        let counter = events.clone();
        session.on_token_refreshed(move |event| {
            assert_eq!(event.id_token, "id-1");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let challenge = session.request_challenge().await.expect("challenge");
        assert_eq!(challenge.username, "user-uuid");
        assert_eq!(session.status(), SessionStatus::ChallengeIssued);
        assert_eq!(session.session_handle().as_deref(), Some("sess-1"));

        let credentials = session.redeem_challenge("12-3456").await.expect("login");
        assert_eq!(credentials.expires_at(), start() + Duration::milliseconds(3_600_000));
        assert_eq!(credentials.refresh_token(), Some("refresh-1"));
        assert_eq!(session.status(), SessionStatus::Authenticated);
        assert!(session.pending_challenge().is_none());
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wrong_code_keeps_challenge_for_retry() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut provider = MockIdentityProvider::new();
        provider
            .expect_initiate_custom_auth()
            .returning(|_| Ok(challenge_response("sess-1")));
        let mut seq = mockall::Sequence::new();
        provider
            .expect_respond_to_challenge()
            .withf(|_, session, _, _| session == "sess-1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(challenge_response("sess-2")));
        provider
            .expect_respond_to_challenge()
            .withf(|_, session, _, answer| session == "sess-2" && answer == "654321")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(token_response("id-1", 60, Some("refresh-1"))));

        let session = manager(provider, clock);
        session.request_challenge().await.expect("challenge");

        let err = session.redeem_challenge("000000").await.unwrap_err();
        assert!(matches!(err, PetSafeError::InvalidCode(_)));
        assert_eq!(session.status(), SessionStatus::ChallengeIssued);
        assert_eq!(
            session.pending_challenge().map(|c| c.session),
            Some("sess-2".to_string())
        );

        session.redeem_challenge("654-321").await.expect("second attempt");
        assert_eq!(session.status(), SessionStatus::Authenticated);
    }

    #[tokio::test]
    async fn provider_rejection_of_code_is_invalid_code() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut provider = MockIdentityProvider::new();
        provider
            .expect_initiate_custom_auth()
            .returning(|_| Ok(challenge_response("sess-1")));
        provider.expect_respond_to_challenge().returning(|_, _, _, _| {
            Err(ProviderError::Rejected {
                status: 400,
                error_type: "NotAuthorizedException".to_string(),
                message: "Incorrect username or password.".to_string(),
            })
        });

        let session = manager(provider, clock);
        session.request_challenge().await.expect("challenge");
        let err = session.redeem_challenge("1").await.unwrap_err();
        assert!(matches!(err, PetSafeError::InvalidCode(msg) if msg.contains("NotAuthorizedException")));
        assert!(session.pending_challenge().is_some());
    }

    #[tokio::test]
    async fn rejected_login_request_is_not_retried() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut provider = MockIdentityProvider::new();
        provider.expect_initiate_custom_auth().times(1).returning(|_| {
            Err(ProviderError::Rejected {
                status: 400,
                error_type: "UserNotFoundException".to_string(),
                message: "User does not exist.".to_string(),
            })
        });

        let session = manager(provider, clock);
        let err = session.request_challenge().await.unwrap_err();
        assert!(matches!(err, PetSafeError::AuthInitiation(_)));
        assert_eq!(session.status(), SessionStatus::Unauthenticated);
    }

    #[tokio::test]
    async fn ensure_valid_requires_credentials() {
        let clock = Arc::new(ManualClock::new(start()));
        let session = manager(MockIdentityProvider::new(), clock);
        let err = session.ensure_valid().await.unwrap_err();
        assert!(matches!(err, PetSafeError::NotAuthenticated));
    }

    #[tokio::test]
    async fn ensure_valid_refreshes_exactly_at_margin() {
        let expires_at = start() + Duration::seconds(1000);
        let clock = Arc::new(ManualClock::new(start()));

        let mut provider = MockIdentityProvider::new();
        provider
            .expect_refresh()
            .withf(|token| token == "refresh-0")
            .times(1)
            .returning(|_| Ok(token_response("id-1", 3600, None)));
        let session = resumed(provider, clock.clone(), Some(expires_at));

        clock.set(expires_at - Duration::milliseconds(100_001));
        let credentials = session.ensure_valid().await.expect("valid");
        assert_eq!(credentials.id_token(), "id-0");

        clock.set(expires_at - Duration::milliseconds(100_000));
        let credentials = session.ensure_valid().await.expect("refreshed");
        assert_eq!(credentials.id_token(), "id-1");
        assert_eq!(credentials.refresh_token(), Some("refresh-0"));
        assert_eq!(
            credentials.expires_at(),
            expires_at - Duration::seconds(100) + Duration::seconds(3600)
        );
    }

    #[test]
    fn expiry_saturates_instead_of_overflowing() {
        assert_eq!(expiry_after(start(), 60), start() + Duration::seconds(60));
        assert_eq!(expiry_after(start(), i64::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(expiry_after(start(), 10_000_000_000_000), DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn huge_expires_in_does_not_panic() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut provider = MockIdentityProvider::new();
        provider
            .expect_initiate_custom_auth()
            .returning(|_| Ok(challenge_response("sess-1")));
        provider
            .expect_respond_to_challenge()
            .returning(|_, _, _, _| Ok(token_response("id-1", i64::MAX, Some("refresh-1"))));
        provider
            .expect_refresh()
            .times(1)
            .returning(|_| Ok(token_response("id-2", 10_000_000_000_000, None)));

        let session = manager(provider, clock);
        session.request_challenge().await.expect("challenge");
        let credentials = session.redeem_challenge("123456").await.expect("login");
        assert_eq!(credentials.expires_at(), DateTime::<Utc>::MAX_UTC);
        assert_eq!(session.ensure_valid().await.expect("valid").id_token(), "id-1");

        let credentials = session.refresh().await.expect("refresh");
        assert_eq!(credentials.id_token(), "id-2");
        assert_eq!(credentials.expires_at(), DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn reactive_mode_skips_proactive_refresh() {
        let clock = Arc::new(ManualClock::new(start()));
        let session = SessionManager::new(
            "me@example.com",
            Arc::new(MockIdentityProvider::new()),
            clock,
            SessionOptions {
                proactive_refresh: false,
                ..SessionOptions::default()
            },
            SessionSeed::Resume(ResumeTokens::new("id-0", "a", "r").expect("tokens")),
        );

        let credentials = session.ensure_valid().await.expect("no refresh");
        assert_eq!(credentials.id_token(), "id-0");
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_credentials() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut provider = MockIdentityProvider::new();
        provider.expect_refresh().times(1).returning(|_| {
            Err(ProviderError::Rejected {
                status: 400,
                error_type: "NotAuthorizedException".to_string(),
                message: "Refresh Token has expired".to_string(),
            })
        });
        let session = resumed(provider, clock, None);
        let before = session.credentials();

        let err = session.refresh().await.unwrap_err();
        assert!(matches!(err, PetSafeError::RefreshFailed(msg) if msg.contains("expired")));
        assert_eq!(session.credentials(), before);
        assert_eq!(session.status(), SessionStatus::Authenticated);
    }

    #[tokio::test]
    async fn refresh_without_authentication_result_fails() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut provider = MockIdentityProvider::new();
        provider
            .expect_refresh()
            .returning(|_| Ok(AuthResponse::default()));
        let session = resumed(provider, clock, None);

        let err = session.refresh().await.unwrap_err();
        assert!(matches!(err, PetSafeError::RefreshFailed(_)));
    }

    #[tokio::test]
    async fn refresh_needs_a_refresh_token() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut provider = MockIdentityProvider::new();
        provider
            .expect_initiate_custom_auth()
            .returning(|_| Ok(challenge_response("sess-1")));
        provider
            .expect_respond_to_challenge()
            .returning(|_, _, _, _| Ok(token_response("id-1", 3600, None)));
        provider.expect_refresh().times(0);

        let session = manager(provider, clock);
        let err = session.refresh().await.unwrap_err();
        assert!(matches!(err, PetSafeError::NoRefreshToken));

        session.request_challenge().await.expect("challenge");
        session.redeem_challenge("123456").await.expect("login");
        let err = session.refresh().await.unwrap_err();
        assert!(matches!(err, PetSafeError::NoRefreshToken));
    }

    #[tokio::test]
    async fn rotated_refresh_token_replaces_old_one() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut provider = MockIdentityProvider::new();
        let mut seq = mockall::Sequence::new();
        provider
            .expect_refresh()
            .withf(|token| token == "refresh-0")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(token_response("id-1", 3600, Some("refresh-1"))));
        provider
            .expect_refresh()
            .withf(|token| token == "refresh-1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(token_response("id-2", 3600, None)));

        let session = resumed(provider, clock, None);
        session.refresh().await.expect("first");
        let credentials = session.refresh().await.expect("second");
        assert_eq!(credentials.id_token(), "id-2");
        assert_eq!(session.refresh_token().as_deref(), Some("refresh-1"));
    }

    /// Counts refresh exchanges and holds each one open for `delay`.
    struct SlowRefreshProvider {
        calls: Arc<AtomicUsize>,
        delay: std::time::Duration,
        fail: bool,
    }

    #[async_trait]
    impl IdentityProvider for SlowRefreshProvider {
        async fn initiate_custom_auth(&self, _: &str) -> std::result::Result<AuthResponse, ProviderError> {
            Err(ProviderError::Decode("not used".to_string()))
        }

        async fn respond_to_challenge(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
        ) -> std::result::Result<AuthResponse, ProviderError> {
            Err(ProviderError::Decode("not used".to_string()))
        }

        async fn refresh(&self, _: &str) -> std::result::Result<AuthResponse, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(ProviderError::Rejected {
                    status: 400,
                    error_type: "NotAuthorizedException".to_string(),
                    message: "Invalid Refresh Token".to_string(),
                });
            }
            Ok(token_response(&format!("id-{n}"), 3600, Some(&format!("refresh-{n}"))))
        }
    }

    fn slow(calls: &Arc<AtomicUsize>, fail: bool) -> SlowRefreshProvider {
        SlowRefreshProvider {
            calls: calls.clone(),
            delay: std::time::Duration::from_millis(50),
            fail,
        }
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_exchange() {
        let calls = Arc::new(AtomicUsize::new(0));
        let clock = Arc::new(ManualClock::new(start()));
        let session = resumed(slow(&calls, false), clock, None);
        let events = Arc::new(AtomicUsize::new(0));
        let counter = events.clone();
        session.on_token_refreshed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let (a, b) = tokio::join!(session.ensure_valid(), session.ensure_valid());
        let (a, b) = (a.expect("first"), b.expect("second"));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a, b);
        assert_eq!(a.id_token(), "id-1");
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_a_failed_refresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let clock = Arc::new(ManualClock::new(start()));
        let session = resumed(slow(&calls, true), clock, None);

        let (a, b) = tokio::join!(session.refresh(), session.refresh());
        assert!(matches!(a, Err(PetSafeError::RefreshFailed(_))));
        assert!(matches!(b, Err(PetSafeError::RefreshFailed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A later call is a fresh attempt.
        assert!(session.refresh().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_refresh_releases_the_lock() {
        let calls = Arc::new(AtomicUsize::new(0));
        let clock = Arc::new(ManualClock::new(start()));
        let session = resumed(slow(&calls, false), clock, None);

        let cancelled =
            tokio::time::timeout(std::time::Duration::from_millis(10), session.refresh()).await;
        assert!(cancelled.is_err());
        assert_eq!(session.status(), SessionStatus::Authenticated);
        assert_eq!(session.id_token().as_deref(), Some("id-0"));

        let credentials = session.refresh().await.expect("refresh after cancel");
        assert_eq!(credentials.id_token(), "id-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
