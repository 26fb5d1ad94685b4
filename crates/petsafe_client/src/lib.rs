//! Client for the PetSafe cloud platform.
//!
//! [`SessionManager`] runs the email-code login against the identity provider
//! and keeps the resulting tokens fresh. [`AuthenticatedHttpClient`] sends
//! platform requests with the current identity token and recovers once from
//! an expired-token rejection. [`PetSafeClient`] ties both together and hands
//! out the feeder and litter box devices of the account.

pub mod api;
pub mod auth;
pub mod client;
pub mod clock;
pub mod config;
pub mod devices;
pub mod error;
pub mod utils;

pub use api::{ApiResponse, AuthenticatedHttpClient};
pub use auth::{
    ChallengeState, CognitoIdentityProvider, Credentials, IdentityProvider, ResumeTokens,
    SessionManager, SessionOptions, SessionSeed, SessionStatus, SubscriptionId, TokenRefreshEvent,
};
pub use client::PetSafeClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PetSafeConfig;
pub use devices::{FeederMessage, Scoopfree, SmartFeed};
pub use error::{PetSafeError, Result};
