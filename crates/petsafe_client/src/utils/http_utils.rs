use std::sync::Arc;

use reqwest::{Client, Proxy};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};

use crate::config::PetSafeConfig;
use crate::error::Result;

/// Builds the platform API transport.
pub fn build_transport(config: &PetSafeConfig) -> Result<Arc<ClientWithMiddleware>> {
    let client = build_http_client(config)?;
    Ok(Arc::new(build_retry_client(client, config.transient_retries)))
}

pub fn build_http_client(config: &PetSafeConfig) -> Result<Client> {
    let mut builder = Client::builder();
    if let Some(timeout) = config.request_timeout() {
        builder = builder.timeout(timeout);
    }
    if !config.http_proxy.is_empty() {
        builder = builder.proxy(Proxy::http(&config.http_proxy)?);
    }
    if !config.https_proxy.is_empty() {
        builder = builder.proxy(Proxy::https(&config.https_proxy)?);
    }
    Ok(builder.build()?)
}

/// Wraps the client with transient-failure retries (5xx, timeouts, connect
/// errors). 401/403 are never retried here; the session layer owns those.
pub fn build_retry_client(client: Client, max_retries: u32) -> ClientWithMiddleware {
    if max_retries == 0 {
        return ClientBuilder::new(client).build();
    }

    let retry_policy = ExponentialBackoff::builder()
        .retry_bounds(
            std::time::Duration::from_millis(100),
            std::time::Duration::from_secs(5),
        )
        .build_with_max_retries(max_retries);

    ClientBuilder::new(client)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build()
}
