//! Size-limited response holding a connection slot
//!
//! The slot acquired for an attempt travels with the response and is
//! released when the response is closed or dropped, whichever comes first.

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use tokio::sync::OwnedSemaphorePermit;
use url::Url;

use crate::error::ClientError;
use crate::metrics::HTTP_CLIENT_IN_FLIGHT;

/// One held connection-concurrency slot
#[derive(Debug)]
pub(crate) struct Slot {
    _permit: OwnedSemaphorePermit,
}

impl Slot {
    pub(crate) fn new(permit: OwnedSemaphorePermit) -> Self {
        HTTP_CLIENT_IN_FLIGHT.inc();
        Self { _permit: permit }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        HTTP_CLIENT_IN_FLIGHT.dec();
    }
}

/// Response returned by the safe client
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    url: Url,
    inner: Option<reqwest::Response>,
    slot: Option<Slot>,
    limit: u64,
    read: u64,
    initial_capacity: usize,
}

impl Response {
    pub(crate) fn new(
        inner: reqwest::Response,
        slot: Slot,
        limit: u64,
        initial_capacity: usize,
    ) -> Self {
        Self {
            status: inner.status(),
            headers: inner.headers().clone(),
            url: inner.url().clone(),
            inner: Some(inner),
            slot: Some(slot),
            limit,
            read: 0,
            initial_capacity,
        }
    }

    /// HTTP status
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Final URL after redirects
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Whether the body has been closed and the slot released
    pub fn is_closed(&self) -> bool {
        self.slot.is_none()
    }

    /// Next body chunk, `None` at end of body or once the size cap is reached
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, ClientError> {
        let remaining = self.limit.saturating_sub(self.read);
        if remaining == 0 {
            if self.inner.is_some() {
                tracing::debug!(
                    url = %self.url,
                    limit = self.limit,
                    "Response body truncated at limit"
                );
            }
            self.close();
            return Ok(None);
        }

        let Some(inner) = self.inner.as_mut() else {
            return Ok(None);
        };

        match inner.chunk().await {
            Ok(Some(mut chunk)) => {
                if chunk.len() as u64 > remaining {
                    chunk.truncate(remaining as usize);
                }
                self.read += chunk.len() as u64;
                Ok(Some(chunk))
            }
            Ok(None) => {
                self.close();
                Ok(None)
            }
            Err(e) => {
                self.close();
                Err(ClientError::from_transport(e))
            }
        }
    }

    /// Read the whole (capped) body and close
    pub async fn bytes(mut self) -> Result<Bytes, ClientError> {
        let mut buffer = BytesMut::with_capacity(self.initial_capacity);
        while let Some(chunk) = self.chunk().await? {
            buffer.extend_from_slice(&chunk);
        }
        self.close();
        Ok(buffer.freeze())
    }

    /// Close the body and release the slot
    ///
    /// Calling this more than once is a no-op.
    pub fn close(&mut self) {
        self.inner.take();
        self.slot.take();
    }
}
