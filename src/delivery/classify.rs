//! Attempt outcome classification
//!
//! The worker is the only place that decides what a failed attempt means.

use std::time::Duration;

use chrono::Utc;
use http::header::RETRY_AFTER;
use http::{HeaderMap, StatusCode};

use super::backoff::parse_retry_after;
use crate::error::ClientError;

/// What to do with a delivery after one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Delivered; drop
    Success,
    /// Worth retrying after a backoff
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// Never going to succeed; drop
    Permanent { reason: String },
    /// The worker is stopping; requeue
    Cancelled,
}

impl Outcome {
    /// Label used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Transient { .. } => "transient",
            Outcome::Permanent { .. } => "permanent",
            Outcome::Cancelled => "cancelled",
        }
    }
}

/// Classify a received response status
pub fn classify_status(status: StatusCode, headers: &HeaderMap) -> Outcome {
    if status.is_success() {
        return Outcome::Success;
    }

    let retryable = matches!(status.as_u16(), 408 | 425 | 429)
        || (status.is_server_error()
            && status != StatusCode::NOT_IMPLEMENTED
            && status != StatusCode::HTTP_VERSION_NOT_SUPPORTED);

    if !retryable {
        return Outcome::Permanent {
            reason: format!("HTTP {}", status),
        };
    }

    let retry_after = match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => headers
            .get(RETRY_AFTER)
            .and_then(|value| parse_retry_after(value, Utc::now())),
        _ => None,
    };

    Outcome::Transient {
        reason: format!("HTTP {}", status),
        retry_after,
    }
}

/// Classify an error returned by the client
pub fn classify_error(error: &ClientError) -> Outcome {
    match error {
        ClientError::Cancelled => Outcome::Cancelled,
        ClientError::ReservedAddr(_)
        | ClientError::BodyTooLarge { .. }
        | ClientError::InvalidRequest(_)
        | ClientError::Signing(_) => Outcome::Permanent {
            reason: error.to_string(),
        },
        ClientError::Transport(e) if e.is_builder() || e.is_redirect() => Outcome::Permanent {
            reason: error.to_string(),
        },
        ClientError::Transport(_) => Outcome::Transient {
            reason: error.to_string(),
            retry_after: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::httpclient::ReservedAddr;
    use http::HeaderValue;

    fn status(code: u16) -> Outcome {
        classify_status(
            StatusCode::from_u16(code).expect("status"),
            &HeaderMap::new(),
        )
    }

    #[test]
    fn success_statuses() {
        for code in [200, 201, 202, 204] {
            assert_eq!(status(code), Outcome::Success);
        }
    }

    #[test]
    fn transient_statuses() {
        for code in [408, 425, 429, 500, 502, 503, 504, 507] {
            assert_eq!(status(code).label(), "transient", "HTTP {code}");
        }
    }

    #[test]
    fn permanent_statuses() {
        for code in [301, 400, 401, 403, 404, 410, 422, 501, 505] {
            assert_eq!(status(code).label(), "permanent", "HTTP {code}");
        }
    }

    #[test]
    fn retry_after_is_read_for_throttling_responses() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("30"));

        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &headers),
            Outcome::Transient {
                reason: "HTTP 429 Too Many Requests".to_string(),
                retry_after: Some(Duration::from_secs(30)),
            }
        );

        let Outcome::Transient { retry_after, .. } =
            classify_status(StatusCode::BAD_GATEWAY, &headers)
        else {
            panic!("502 must be transient");
        };
        assert_eq!(retry_after, None);
    }

    #[test]
    fn client_errors() {
        assert_eq!(classify_error(&ClientError::Cancelled), Outcome::Cancelled);

        let reserved = ClientError::ReservedAddr(ReservedAddr {
            addr: "10.0.0.1".to_string(),
        });
        assert_eq!(classify_error(&reserved).label(), "permanent");
        assert_eq!(
            classify_error(&ClientError::BodyTooLarge { limit: 1 }).label(),
            "permanent"
        );
        assert_eq!(
            classify_error(&ClientError::Signing("no key".to_string())).label(),
            "permanent"
        );
    }
}
