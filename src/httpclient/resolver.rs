//! DNS resolution filtered through the sanitizer
//!
//! `reqwest` dials whatever its resolver returns, so this resolver is the
//! dial hook: only addresses the sanitizer permits are ever handed to the
//! connector. Hosts that resolve exclusively to forbidden addresses fail the
//! connection with `ReservedAddr`.

use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};

use super::sanitizer::{ReservedAddr, Sanitizer};
use crate::metrics::SANITIZER_REJECTIONS_TOTAL;

/// Resolver that drops addresses rejected by the sanitizer
pub(crate) struct SanitizingResolver {
    sanitizer: Arc<Sanitizer>,
}

impl SanitizingResolver {
    pub(crate) fn new(sanitizer: Arc<Sanitizer>) -> Self {
        Self { sanitizer }
    }
}

/// Keep permitted addresses; if none survive, return the first rejection
pub(crate) fn filter_addrs(
    sanitizer: &Sanitizer,
    host: &str,
    resolved: impl IntoIterator<Item = SocketAddr>,
) -> Result<Vec<SocketAddr>, ReservedAddr> {
    let mut permitted = Vec::new();
    let mut rejected = None;

    for addr in resolved {
        match sanitizer.decide(addr.ip()) {
            Ok(()) => permitted.push(addr),
            Err(e) => {
                SANITIZER_REJECTIONS_TOTAL.inc();
                tracing::debug!(
                    host = %host,
                    addr = %addr,
                    "Dropping reserved address from resolution"
                );
                rejected.get_or_insert(e);
            }
        }
    }

    match (permitted.is_empty(), rejected) {
        (true, Some(rejected)) => Err(rejected),
        _ => Ok(permitted),
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

async fn resolve_sanitized(sanitizer: Arc<Sanitizer>, name: Name) -> Result<Addrs, BoxError> {
    let host = name.as_str().to_string();
    let resolved = tokio::net::lookup_host((host.as_str(), 0)).await?;

    let permitted = filter_addrs(&sanitizer, &host, resolved).map_err(|e| {
        tracing::warn!(host = %host, addr = %e.addr, "Refusing to dial reserved address");
        Box::new(e) as BoxError
    })?;

    if permitted.is_empty() {
        return Err(format!("no addresses found for {}", host).into());
    }

    Ok(Box::new(permitted.into_iter()))
}

impl Resolve for SanitizingResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(resolve_sanitized(self.sanitizer.clone(), name))
    }
}
