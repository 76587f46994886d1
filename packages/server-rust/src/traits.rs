use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::transport::{SpRequest, SpResponse};

/// Wire for outbound SP traffic: one request in, one classified response out.
/// Implementations: reqwest (`HttpTransport`), scripted in-memory (tests).
///
/// Never fails: connection problems are reported as a `ServerError`
/// classification so the router can fail over.
#[async_trait]
pub trait SpTransport: Send + Sync {
    async fn send(&self, request: SpRequest) -> SpResponse;
}

/// Resolves the authentication headers for an instance.
/// Credential storage lives behind this trait, outside the engine.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Header set to attach to every request sent to `instance_id`.
    async fn headers(&self, instance_id: &str) -> anyhow::Result<BTreeMap<String, String>>;
}
