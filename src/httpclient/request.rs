//! Outgoing request description
//!
//! A `Request` is the reusable form of an HTTP request. The client turns it
//! into a fresh `reqwest::Request` for every send attempt, so retries never
//! reuse headers or signatures produced for an earlier attempt.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use url::Url;

use super::signing::Signer;

/// ActivityStreams media type used for inbox deliveries
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Reusable outgoing HTTP request
#[derive(Clone)]
pub struct Request {
    /// HTTP method
    pub method: Method,
    /// Destination URL
    pub url: Url,
    /// Request headers (Date/Signature/Digest are managed per attempt when signed)
    pub headers: HeaderMap,
    /// Request body
    pub body: Option<Bytes>,
    /// Per-request deadline on top of the client timeout
    pub timeout: Option<Duration>,
    signer: Option<Arc<dyn Signer>>,
}

impl Request {
    /// Create a request without headers or body
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            signer: None,
        }
    }

    /// POST an ActivityStreams document to an inbox
    pub fn post_activity(inbox: Url, body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, inbox)
            .with_header(CONTENT_TYPE, HeaderValue::from_static(ACTIVITY_JSON))
            .with_header(ACCEPT, HeaderValue::from_static(ACTIVITY_JSON))
            .with_body(body)
    }

    /// Set a header, replacing previous values
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the body
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set a per-request deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a signer invoked before every send attempt
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Attached signer, if any
    pub fn signer(&self) -> Option<&Arc<dyn Signer>> {
        self.signer.as_ref()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("body_len", &self.body.as_ref().map(Bytes::len))
            .field("timeout", &self.timeout)
            .field("signed", &self.signer.is_some())
            .finish()
    }
}
