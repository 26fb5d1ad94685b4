pub mod cognito;
pub mod credentials;
pub mod observers;
pub mod provider;
pub mod session;

pub use cognito::CognitoIdentityProvider;
pub use credentials::{
    mask_token, ChallengeState, Credentials, ResumeTokens, SessionSeed, SessionStatus,
    TokenRefreshEvent,
};
pub use observers::{SubscriptionId, TokenObserver};
pub use provider::{AuthResponse, AuthenticationResult, IdentityProvider, ProviderError};
pub use session::{normalize_answer, SessionManager, SessionOptions};
