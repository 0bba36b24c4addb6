//! HTTP Signatures for outgoing requests
//!
//! The client does not know how requests are signed. A `Signer` attached
//! to a request is invoked by the client right before every transmission,
//! after `Date` has been refreshed and stale `Signature`/`Digest` headers
//! have been removed, so a signature always covers the bytes that go out.
//!
//! `HttpSignatureSigner` implements the draft-cavage RSA-SHA256 scheme used
//! by Mastodon-compatible servers:
//! https://docs.joinmastodon.org/spec/security/

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::Utc;
use reqwest::header::{DATE, HeaderName, HeaderValue};
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// `Signature` header name
pub const SIGNATURE: HeaderName = HeaderName::from_static("signature");

/// `Digest` header name
pub const DIGEST: HeaderName = HeaderName::from_static("digest");

/// Signer failure
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct SigningError(pub String);

/// Signs an outgoing request in place
#[cfg_attr(test, mockall::automock)]
pub trait Signer: Send + Sync {
    /// Add signature headers to `request`
    fn sign(&self, request: &mut reqwest::Request) -> Result<(), SigningError>;
}

impl<F> Signer for F
where
    F: Fn(&mut reqwest::Request) -> Result<(), SigningError> + Send + Sync,
{
    fn sign(&self, request: &mut reqwest::Request) -> Result<(), SigningError> {
        self(request)
    }
}

/// Format a timestamp the way HTTP `Date` headers expect (RFC 7231)
pub fn http_date(now: chrono::DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Reset the headers a signature depends on before (re-)signing
pub(crate) fn prepare(request: &mut reqwest::Request) -> Result<(), SigningError> {
    let date = HeaderValue::from_str(&http_date(Utc::now()))
        .map_err(|e| SigningError(format!("invalid Date header: {}", e)))?;

    let headers = request.headers_mut();
    headers.remove(SIGNATURE);
    headers.remove(DIGEST);
    headers.insert(DATE, date);
    Ok(())
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

/// RSA-SHA256 HTTP Signature signer for a local actor key
pub struct HttpSignatureSigner {
    /// Full URL to the public key (actor#main-key)
    key_id: String,
    signing_key: SigningKey<Sha256>,
}

impl HttpSignatureSigner {
    /// Create a signer from a PKCS#8 PEM private key
    ///
    /// # Errors
    /// Returns error if the key cannot be parsed
    pub fn from_pem(
        key_id: impl Into<String>,
        private_key_pem: &str,
    ) -> Result<Self, SigningError> {
        let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .map_err(|e| SigningError(format!("invalid private key: {}", e)))?;

        Ok(Self {
            key_id: key_id.into(),
            signing_key: SigningKey::<Sha256>::new(private_key),
        })
    }

    /// Key ID advertised in the `Signature` header
    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

impl std::fmt::Debug for HttpSignatureSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSignatureSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl Signer for HttpSignatureSigner {
    fn sign(&self, request: &mut reqwest::Request) -> Result<(), SigningError> {
        // 1. Host and path exactly as the transport will send them
        let url = request.url();
        let host = url
            .host_str()
            .ok_or_else(|| SigningError("missing host in URL".to_string()))?;
        let host = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let path_and_query = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        let request_target = format!(
            "{} {}",
            request.method().as_str().to_lowercase(),
            path_and_query
        );

        // 2. Date was refreshed by the client for this attempt
        let date = request
            .headers()
            .get(DATE)
            .ok_or_else(|| SigningError("missing Date header".to_string()))?
            .to_str()
            .map_err(|_| SigningError("invalid Date header".to_string()))?
            .to_string();

        // 3. Digest if body present
        let digest = match request.body() {
            Some(body) => {
                let bytes = body
                    .as_bytes()
                    .ok_or_else(|| SigningError("cannot sign a streaming body".to_string()))?;
                Some(generate_digest(bytes))
            }
            None => None,
        };

        // 4. Build signing string
        let mut signing_parts = vec![
            format!("(request-target): {}", request_target),
            format!("host: {}", host),
            format!("date: {}", date),
        ];
        let mut headers_list = vec!["(request-target)", "host", "date"];

        if let Some(ref digest_value) = digest {
            signing_parts.push(format!("digest: {}", digest_value));
            headers_list.push("digest");
        }

        let signing_string = signing_parts.join("\n");

        // 5. Sign with RSA-SHA256
        let mut rng = rand::thread_rng();
        let signature = self
            .signing_key
            .sign_with_rng(&mut rng, signing_string.as_bytes());
        let signature_b64 = BASE64.encode(signature.to_bytes());

        let signature_header = format!(
            "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
            self.key_id,
            headers_list.join(" "),
            signature_b64
        );

        // 6. Attach headers
        let headers = request.headers_mut();
        if let Some(digest_value) = digest {
            headers.insert(
                DIGEST,
                HeaderValue::from_str(&digest_value)
                    .map_err(|e| SigningError(format!("invalid Digest header: {}", e)))?,
            );
        }
        headers.insert(
            SIGNATURE,
            HeaderValue::from_str(&signature_header)
                .map_err(|e| SigningError(format!("invalid Signature header: {}", e)))?,
        );

        Ok(())
    }
}
