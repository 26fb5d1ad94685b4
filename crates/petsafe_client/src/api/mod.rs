pub mod client;

pub use client::{ApiResponse, AuthenticatedHttpClient};
