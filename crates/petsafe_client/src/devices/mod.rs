//! Device collaborators built on top of [`AuthenticatedHttpClient`]'s verbs.
//!
//! Each device keeps the last JSON document the platform returned for it and
//! reads its accessors from that document.
//!
//! [`AuthenticatedHttpClient`]: crate::api::AuthenticatedHttpClient

pub mod message;
pub mod scoopfree;
pub mod smart_feed;

pub use message::{FeederMessage, MessagePayload};
pub use scoopfree::Scoopfree;
pub use smart_feed::SmartFeed;

use serde_json::Value;

/// Follows `keys` through nested objects.
pub(crate) fn lookup<'a>(data: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().try_fold(data, |value, key| value.get(*key))
}

pub(crate) fn lookup_str<'a>(data: &'a Value, keys: &[&str]) -> Option<&'a str> {
    lookup(data, keys).and_then(Value::as_str)
}

pub(crate) fn lookup_bool(data: &Value, keys: &[&str]) -> bool {
    lookup(data, keys).and_then(Value::as_bool).unwrap_or(false)
}

/// Integer value of a field the platform sends either as a number or as a
/// numeric string.
pub(crate) fn lookup_int(data: &Value, keys: &[&str]) -> Option<i64> {
    match lookup(data, keys)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Client that never reaches the network, for accessor tests.
#[cfg(test)]
pub(crate) fn offline_client() -> crate::api::AuthenticatedHttpClient {
    use std::sync::Arc;

    use crate::auth::provider::MockIdentityProvider;
    use crate::auth::{SessionManager, SessionOptions, SessionSeed};
    use crate::clock::SystemClock;
    use crate::utils::http_utils::build_retry_client;

    let session = SessionManager::new(
        "test@example.com",
        Arc::new(MockIdentityProvider::new()),
        Arc::new(SystemClock),
        SessionOptions::default(),
        SessionSeed::Fresh,
    );
    crate::api::AuthenticatedHttpClient::new(
        Arc::new(session),
        Arc::new(build_retry_client(reqwest::Client::new(), 0)),
        "http://127.0.0.1:9/",
    )
    .unwrap()
}
