//! Best-effort reverse DNS for connecting clients.
//!
//! The resolved name only decorates greetings and `Received:` lines, so a
//! failed or slow lookup degrades to [`UNKNOWN_HOST`] instead of refusing
//! the connection.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::{name_server::TokioConnectionProvider, ResolveError, TokioResolver};
use thiserror::Error;

/// Placeholder used when the client's name cannot be resolved.
pub const UNKNOWN_HOST: &str = "unknown";

/// Upper bound on how long a session waits for its PTR lookup.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum LookupError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("no PTR record for {0}")]
    NoRecord(IpAddr),

    #[error("reverse lookup for {0} timed out")]
    Timeout(IpAddr),
}

#[async_trait]
pub trait ReverseResolver: Send + Sync {
    async fn reverse_lookup(&self, ip: IpAddr) -> Result<String, LookupError>;
}

/// System-configured resolver backed by hickory.
pub struct DnsReverseResolver {
    resolver: TokioResolver,
}

impl DnsReverseResolver {
    pub fn from_system_conf() -> Result<Self, LookupError> {
        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?.build();
        Ok(DnsReverseResolver { resolver })
    }
}

#[async_trait]
impl ReverseResolver for DnsReverseResolver {
    async fn reverse_lookup(&self, ip: IpAddr) -> Result<String, LookupError> {
        let lookup = self.resolver.reverse_lookup(ip).await?;
        lookup
            .iter()
            .next()
            .map(|name| name.to_string().trim_end_matches('.').to_string())
            .filter(|name| !name.is_empty())
            .ok_or(LookupError::NoRecord(ip))
    }
}

/// Stand-in used when no system resolver configuration could be loaded.
/// Every lookup fails, so sessions fall back to [`UNKNOWN_HOST`].
pub struct NoReverseLookup;

#[async_trait]
impl ReverseResolver for NoReverseLookup {
    async fn reverse_lookup(&self, ip: IpAddr) -> Result<String, LookupError> {
        Err(LookupError::NoRecord(ip))
    }
}

/// Resolves `ip`, bounded by `timeout`.
pub async fn lookup_client_host(
    resolver: &dyn ReverseResolver,
    ip: IpAddr,
    timeout: Duration,
) -> Result<String, LookupError> {
    tokio::time::timeout(timeout, resolver.reverse_lookup(ip))
        .await
        .map_err(|_| LookupError::Timeout(ip))?
}
