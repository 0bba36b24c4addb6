//! Security-hardened outbound HTTP client
//!
//! Handles:
//! - Connection-concurrency limiting (one slot per in-flight request)
//! - Destination sanitization (resolver hook, literal IPs, redirects)
//! - Response body size capping
//! - Per-attempt request signing
//!
//! Signed requests go through a transport that does not follow redirects
//! on its own: every hop is checked and signed again before it is sent.
//!
//! The client never retries and never interprets failures; it hands every
//! error back to the caller as-is.

pub mod request;
mod resolver;
pub mod response;
pub mod sanitizer;
pub mod signing;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use http::{Method, StatusCode};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::{Host, Url};

use crate::config::HttpClientConfig;
use crate::error::{AppError, ClientError};
use crate::metrics::SANITIZER_REJECTIONS_TOTAL;

pub use request::{ACTIVITY_JSON, Request};
pub use response::Response;
pub use sanitizer::{ReservedAddr, Sanitizer};
pub use signing::{HttpSignatureSigner, Signer, SigningError};

use resolver::SanitizingResolver;
use response::Slot;

/// TCP connect timeout, TLS handshake included
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an idle pooled connection is kept
const IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(90);

/// TCP keepalive interval
const KEEPALIVE: Duration = Duration::from_secs(30);

/// Redirect hops followed before giving up
const MAX_REDIRECTS: usize = 10;

/// Outbound HTTP client shared by all delivery workers
#[derive(Debug)]
pub struct Client {
    inner: reqwest::Client,
    signed: reqwest::Client,
    slots: Arc<Semaphore>,
    sanitizer: Arc<Sanitizer>,
    max_open_conns: usize,
    max_body_size: u64,
    read_buffer_size: usize,
}

impl Client {
    /// Build the client from configuration
    ///
    /// # Errors
    /// Returns error if a CIDR range is invalid or the transport cannot be built
    pub fn new(config: &HttpClientConfig) -> Result<Self, AppError> {
        let sanitizer = Arc::new(Sanitizer::from_ranges(
            &config.allow_ranges,
            &config.block_ranges,
        )?);
        let max_open_conns = config.effective_max_open_conns();
        let max_idle_conns = config.effective_max_idle_conns();

        let inner = transport(config, &sanitizer, redirect_policy(sanitizer.clone()))?;
        let signed = transport(config, &sanitizer, reqwest::redirect::Policy::none())?;

        if config.write_buffer_size > 0 {
            tracing::debug!(
                write_buffer_size = config.write_buffer_size,
                "Transport manages its own write buffers; write_buffer_size is advisory"
            );
        }

        tracing::info!(
            max_open_conns,
            max_idle_conns,
            max_body_size = config.max_body_size,
            allow_ranges = config.allow_ranges.len(),
            block_ranges = config.block_ranges.len(),
            "HTTP client initialized"
        );

        Ok(Self {
            inner,
            signed,
            slots: Arc::new(Semaphore::new(max_open_conns)),
            sanitizer,
            max_open_conns,
            max_body_size: config.max_body_size,
            read_buffer_size: config.read_buffer_size,
        })
    }

    /// Configured number of connection slots
    pub fn max_open_conns(&self) -> usize {
        self.max_open_conns
    }

    /// Configured response body cap
    pub fn max_body_size(&self) -> u64 {
        self.max_body_size
    }

    /// Slots not currently held by a request
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Address policy used for every connection
    pub fn sanitizer(&self) -> &Sanitizer {
        &self.sanitizer
    }

    /// Send one attempt of `request`
    ///
    /// Waits for a free slot first; the slot is held by the returned
    /// response until it is closed or dropped.
    ///
    /// # Errors
    /// - `Cancelled` if `ctx` fires before a slot is free or while sending
    /// - `ReservedAddr` if the destination is forbidden
    /// - `BodyTooLarge` if the declared body exceeds the cap
    /// - `InvalidRequest`, `Signing`, `Transport` otherwise
    pub async fn execute(
        &self,
        ctx: &CancellationToken,
        request: &Request,
    ) -> Result<Response, ClientError> {
        // 1. Reject what can be rejected without I/O
        check_destination(&self.sanitizer, &request.url)?;

        // 2. Acquire a slot
        let permit = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(ClientError::Cancelled),
            permit = self.slots.clone().acquire_owned() => {
                permit.map_err(|_| ClientError::Cancelled)?
            }
        };
        let slot = Slot::new(permit);

        // 3. Build, sign and send
        let response = match request.signer() {
            Some(signer) => self.send_signed(ctx, request, &**signer).await?,
            None => {
                let outgoing = build(&self.inner, request, &Hop::first(request))?;
                send(ctx, &self.inner, outgoing).await?
            }
        };

        // 4. Refuse oversized bodies before reading them
        if let Some(length) = response.content_length() {
            if length > self.max_body_size {
                tracing::debug!(
                    url = %request.url,
                    length,
                    limit = self.max_body_size,
                    "Response body exceeds limit"
                );
                return Err(ClientError::BodyTooLarge {
                    limit: self.max_body_size,
                });
            }
        }

        Ok(Response::new(
            response,
            slot,
            self.max_body_size,
            self.read_buffer_size,
        ))
    }

    /// Send a signed request, signing every redirect hop for its own URL
    async fn send_signed(
        &self,
        ctx: &CancellationToken,
        request: &Request,
        signer: &dyn Signer,
    ) -> Result<reqwest::Response, ClientError> {
        let mut hop = Hop::first(request);
        let mut redirects = 0;

        loop {
            let mut outgoing = build(&self.signed, request, &hop)?;
            signing::prepare(&mut outgoing).map_err(|e| ClientError::Signing(e.to_string()))?;
            signer
                .sign(&mut outgoing)
                .map_err(|e| ClientError::Signing(e.to_string()))?;

            let response = send(ctx, &self.signed, outgoing).await?;
            let Some(next) = hop.follow(&response)? else {
                return Ok(response);
            };

            if redirects >= MAX_REDIRECTS {
                return Err(ClientError::InvalidRequest("too many redirects".to_string()));
            }
            redirects += 1;
            check_destination(&self.sanitizer, &next.url)?;

            tracing::debug!(
                from = %hop.url,
                to = %next.url,
                status = response.status().as_u16(),
                "Following redirect of signed request"
            );
            hop = next;
        }
    }
}

/// Method, URL and body of one hop of a request
#[derive(Debug, Clone)]
struct Hop {
    method: Method,
    url: Url,
    body: Option<Bytes>,
}

impl Hop {
    fn first(request: &Request) -> Self {
        Self {
            method: request.method.clone(),
            url: request.url.clone(),
            body: request.body.clone(),
        }
    }

    /// Hop a redirect response points to, `None` for anything else
    ///
    /// 307 and 308 repeat the request as is. 301, 302 and 303 drop the body
    /// and turn anything but GET and HEAD into GET.
    fn follow(&self, response: &reqwest::Response) -> Result<Option<Self>, ClientError> {
        let status = response.status();
        let keeps_method = match status {
            StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => true,
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER => false,
            _ => return Ok(None),
        };

        let Some(location) = response.headers().get(LOCATION) else {
            return Ok(None);
        };
        let location = location
            .to_str()
            .map_err(|_| ClientError::InvalidRequest("non-ASCII redirect location".to_string()))?;
        let url = response
            .url()
            .join(location)
            .map_err(|e| ClientError::InvalidRequest(format!("invalid redirect location: {}", e)))?;

        if keeps_method {
            return Ok(Some(Self {
                url,
                ..self.clone()
            }));
        }

        let method = match self.method {
            Method::GET | Method::HEAD => self.method.clone(),
            _ => Method::GET,
        };
        Ok(Some(Self {
            method,
            url,
            body: None,
        }))
    }
}

/// Build the transport shared by every request of one redirect mode
fn transport(
    config: &HttpClientConfig,
    sanitizer: &Arc<Sanitizer>,
    redirect: reqwest::redirect::Policy,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .user_agent(config.user_agent.as_str())
        .timeout(config.timeout())
        .connect_timeout(DIAL_TIMEOUT)
        .pool_idle_timeout(IDLE_CONN_TIMEOUT)
        .pool_max_idle_per_host(config.effective_max_idle_conns())
        .tcp_keepalive(KEEPALIVE)
        // A proxy would dial on our behalf and bypass the resolver hook.
        .no_proxy()
        .dns_resolver(Arc::new(SanitizingResolver::new(sanitizer.clone())))
        .redirect(redirect);

    if config.read_buffer_size > 0 {
        let window = u32::try_from(config.read_buffer_size).unwrap_or(u32::MAX);
        builder = builder
            .http2_initial_stream_window_size(window)
            .http2_initial_connection_window_size(window);
    }

    builder.build()
}

/// Fresh outgoing request for one hop
fn build(
    transport: &reqwest::Client,
    request: &Request,
    hop: &Hop,
) -> Result<reqwest::Request, ClientError> {
    let mut headers = request.headers.clone();
    if hop.body.is_none() {
        headers.remove(CONTENT_TYPE);
        headers.remove(CONTENT_LENGTH);
    }

    let mut builder = transport
        .request(hop.method.clone(), hop.url.clone())
        .headers(headers);

    if let Some(ref body) = hop.body {
        builder = builder.body(body.clone());
    }

    if let Some(timeout) = request.timeout {
        builder = builder.timeout(timeout);
    }

    builder.build().map_err(ClientError::from_transport)
}

/// Send one hop, racing cancellation
async fn send(
    ctx: &CancellationToken,
    transport: &reqwest::Client,
    outgoing: reqwest::Request,
) -> Result<reqwest::Response, ClientError> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(ClientError::Cancelled),
        response = transport.execute(outgoing) => response.map_err(ClientError::from_transport),
    }
}

/// IP of a URL whose host is an address literal
fn literal_ip(url: &Url) -> Option<IpAddr> {
    match url.host() {
        Some(Host::Ipv4(v4)) => Some(IpAddr::V4(v4)),
        Some(Host::Ipv6(v6)) => Some(IpAddr::V6(v6)),
        _ => None,
    }
}

/// Scheme, host and literal-address checks shared by requests and redirects
fn check_destination(sanitizer: &Sanitizer, url: &Url) -> Result<(), ClientError> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(ClientError::InvalidRequest(format!(
                "unsupported URL scheme: {}",
                scheme
            )));
        }
    }

    if url.host().is_none() {
        return Err(ClientError::InvalidRequest(
            "missing host in URL".to_string(),
        ));
    }

    // Literal addresses never reach the resolver.
    if let Some(ip) = literal_ip(url) {
        sanitizer.decide(ip).map_err(|e| {
            SANITIZER_REJECTIONS_TOTAL.inc();
            tracing::warn!(url = %url, "Refusing to dial reserved address");
            ClientError::ReservedAddr(e)
        })?;
    }

    Ok(())
}

fn redirect_policy(sanitizer: Arc<Sanitizer>) -> reqwest::redirect::Policy {
    reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }

        match check_destination(&sanitizer, attempt.url()) {
            Ok(()) => attempt.follow(),
            Err(ClientError::ReservedAddr(e)) => attempt.error(e),
            Err(e) => attempt.error(e.to_string()),
        }
    })
}
