//! Outbound delivery
//!
//! A `Delivery` is one request bound for one remote inbox, tagged with the
//! identifiers producers use to cancel it. Producers push deliveries to the
//! shared `DeliveryQueue`; the `WorkerPool` drains it.

mod backoff;
mod classify;
mod pool;
mod worker;

use std::collections::HashSet;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use http::header::{DATE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use url::Url;

use crate::error::AppError;
use crate::httpclient::signing::{DIGEST, SIGNATURE};
use crate::httpclient::{Request, Signer};
use crate::queue::{Index, IndexedQueue};

pub use backoff::{RetryPolicy, backoff, parse_retry_after};
pub use classify::{Outcome, classify_error, classify_status};
pub use pool::WorkerPool;

/// Index field holding the sending actor
pub const ACTOR_ID: &str = "actor_id";
/// Index field holding the delivered object or activity
pub const OBJECT_ID: &str = "object_id";
/// Index field holding the receiving target
pub const TARGET_ID: &str = "target_id";

/// Shared queue of pending deliveries
pub type DeliveryQueue = IndexedQueue<Delivery>;

/// Create an empty queue indexed by actor, object and target
pub fn delivery_queue() -> DeliveryQueue {
    IndexedQueue::new([
        Index::new(ACTOR_ID, |d: &Delivery| d.actor_id.as_str()),
        Index::new(OBJECT_ID, |d: &Delivery| d.object_id.as_str()),
        Index::new(TARGET_ID, |d: &Delivery| d.target_id.as_str()),
    ])
}

/// One outbound request and its retry state
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Sending actor; empty when not applicable
    pub actor_id: String,
    /// Delivered object or activity; empty when not applicable
    pub object_id: String,
    /// Receiving target; empty when not applicable
    pub target_id: String,
    /// Request sent on every attempt
    pub request: Request,
    attempts: u32,
    next_attempt: Option<Instant>,
}

impl Delivery {
    /// Wrap `request` in a delivery with no identifiers
    pub fn new(request: Request) -> Self {
        Self {
            actor_id: String::new(),
            object_id: String::new(),
            target_id: String::new(),
            request,
            attempts: 0,
            next_attempt: None,
        }
    }

    /// Set the sending actor
    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = actor_id.into();
        self
    }

    /// Set the delivered object
    pub fn with_object(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = object_id.into();
        self
    }

    /// Set the receiving target
    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = target_id.into();
        self
    }

    /// Failed attempts so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Earliest time of the next attempt, `None` when due immediately
    pub fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }

    /// Time left before the next attempt is due
    pub fn remaining(&self, now: Instant) -> std::time::Duration {
        self.next_attempt
            .map(|next| next.saturating_duration_since(now))
            .unwrap_or_default()
    }

    pub(crate) fn schedule(&mut self, next: Instant) {
        self.next_attempt = Some(next);
    }

    pub(crate) fn record_failure(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    /// Snapshot for persistence
    pub fn to_record(&self) -> DeliveryRecord {
        let headers = self
            .request
            .headers
            .iter()
            .filter(|(name, _)| !is_per_attempt_header(name))
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        DeliveryRecord {
            actor_id: self.actor_id.clone(),
            object_id: self.object_id.clone(),
            target_id: self.target_id.clone(),
            method: self.request.method.as_str().to_string(),
            url: self.request.url.clone(),
            headers,
            body: self.request.body.as_ref().map(|body| BASE64.encode(body)),
        }
    }
}

fn is_per_attempt_header(name: &HeaderName) -> bool {
    *name == SIGNATURE || *name == DIGEST || *name == DATE
}

/// Serializable form of a pending delivery
///
/// Retry state is not kept; a restored delivery starts from its first
/// attempt. Signers are attached again on restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    #[serde(default)]
    pub actor_id: String,
    #[serde(default)]
    pub object_id: String,
    #[serde(default)]
    pub target_id: String,
    pub method: String,
    pub url: Url,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Base64 encoded body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl DeliveryRecord {
    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, AppError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Rebuild the delivery, attaching `signer` to its request
    ///
    /// # Errors
    /// Returns `InvalidRecord` if the method, a header or the body is malformed
    pub fn into_delivery(self, signer: Option<Arc<dyn Signer>>) -> Result<Delivery, AppError> {
        let method = Method::from_bytes(self.method.as_bytes())
            .map_err(|_| AppError::InvalidRecord(format!("invalid method {:?}", self.method)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| AppError::InvalidRecord(format!("invalid header name {:?}", name)))?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                AppError::InvalidRecord(format!("invalid value for header {}", name))
            })?;
            headers.append(name, value);
        }

        let mut request = Request::new(method, self.url);
        request.headers = headers;
        if let Some(body) = self.body {
            let body = BASE64
                .decode(body.as_bytes())
                .map_err(|e| AppError::InvalidRecord(format!("invalid body encoding: {}", e)))?;
            request = request.with_body(body);
        }
        if let Some(signer) = signer {
            request = request.with_signer(signer);
        }

        Ok(Delivery::new(request)
            .with_actor(self.actor_id)
            .with_object(self.object_id)
            .with_target(self.target_id))
    }
}

/// Deduplicate identical inbox URLs while keeping distinct personal inboxes.
///
/// This preserves recipients on the same domain that use different inbox paths.
fn unique_inbox_targets(inboxes: impl IntoIterator<Item = Url>) -> Vec<Url> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for inbox in inboxes {
        if seen.insert(inbox.as_str().to_string()) {
            targets.push(inbox);
        }
    }

    targets
}

/// Build one activity delivery per distinct inbox
pub(crate) fn inbox_deliveries(
    actor_id: &str,
    object_id: &str,
    inboxes: impl IntoIterator<Item = Url>,
    body: Bytes,
    signer: Option<Arc<dyn Signer>>,
) -> Vec<Delivery> {
    unique_inbox_targets(inboxes)
        .into_iter()
        .map(|inbox| {
            let target_id = inbox.as_str().to_string();
            let mut request = Request::post_activity(inbox, body.clone());
            if let Some(ref signer) = signer {
                request = request.with_signer(signer.clone());
            }
            Delivery::new(request)
                .with_actor(actor_id)
                .with_object(object_id)
                .with_target(target_id)
        })
        .collect()
}
