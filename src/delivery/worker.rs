//! Delivery worker
//!
//! A worker repeatedly picks one candidate, fresh work from the shared queue
//! first and its own earliest backlog entry otherwise, waits out any
//! remaining backoff and makes one attempt. Backlog entries belong to this
//! worker alone until it stops, when they go back to the shared queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backoff::RetryPolicy;
use super::classify::{Outcome, classify_error, classify_status};
use super::{Delivery, DeliveryQueue};
use crate::httpclient::Client;
use crate::metrics::{
    DELIVERIES_TOTAL, DELIVERY_ATTEMPT_DURATION_SECONDS, DELIVERY_ATTEMPTS_TOTAL,
    DELIVERY_BACKLOG_SIZE,
};

/// Due time used when a backoff does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Instant `delay` after `now`, clamped for saturated backoffs
fn due_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay).unwrap_or(now + FAR_FUTURE)
}

/// Deliveries waiting for their backoff, earliest first
#[derive(Debug, Default)]
pub(crate) struct Backlog {
    entries: VecDeque<Delivery>,
}

impl Backlog {
    pub(crate) fn insert(&mut self, delivery: Delivery) {
        let due = delivery.next_attempt();
        let position = self
            .entries
            .partition_point(|entry| entry.next_attempt() <= due);
        self.entries.insert(position, delivery);
        DELIVERY_BACKLOG_SIZE.inc();
    }

    pub(crate) fn pop_earliest(&mut self) -> Option<Delivery> {
        let delivery = self.entries.pop_front()?;
        DELIVERY_BACKLOG_SIZE.dec();
        Some(delivery)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn drain(&mut self) -> Vec<Delivery> {
        DELIVERY_BACKLOG_SIZE.sub(self.entries.len() as i64);
        self.entries.drain(..).collect()
    }
}

impl Drop for Backlog {
    fn drop(&mut self) {
        // Entries still here were lost with a panicking worker.
        if !self.entries.is_empty() {
            DELIVERY_BACKLOG_SIZE.sub(self.entries.len() as i64);
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

/// One delivery worker; see the module docs
pub(crate) struct Worker {
    id: usize,
    queue: Arc<DeliveryQueue>,
    client: Arc<Client>,
    policy: RetryPolicy,
    backlog: Backlog,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        queue: Arc<DeliveryQueue>,
        client: Arc<Client>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            id,
            queue,
            client,
            policy,
            backlog: Backlog::default(),
        }
    }

    /// Run until `ctx` is cancelled
    pub(crate) async fn run(mut self, ctx: CancellationToken) {
        tracing::debug!(worker = self.id, "Delivery worker started");

        loop {
            if ctx.is_cancelled() {
                break;
            }

            // Taken before popping so a push racing the pop still opens it.
            let gate = self.queue.wait();

            let candidate = match self.queue.pop() {
                Some(delivery) => delivery,
                None => match self.backlog.pop_earliest() {
                    Some(delivery) => delivery,
                    None => match self.queue.pop_blocking(&ctx).await {
                        Some(delivery) => delivery,
                        None => break,
                    },
                },
            };

            let wait = candidate.remaining(Instant::now());
            if !wait.is_zero() {
                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => {
                        self.queue.push([candidate]);
                        break;
                    }
                    _ = gate.opened() => {
                        // Fresh work pre-empts the backoff wait.
                        self.backlog.insert(candidate);
                        continue;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            if let Flow::Stop = self.attempt(&ctx, candidate).await {
                break;
            }
        }

        self.flush();
        tracing::debug!(worker = self.id, "Delivery worker stopped");
    }

    async fn attempt(&mut self, ctx: &CancellationToken, mut delivery: Delivery) -> Flow {
        let started = std::time::Instant::now();

        let outcome = match self.client.execute(ctx, &delivery.request).await {
            Ok(mut response) => {
                let outcome = classify_status(response.status(), response.headers());
                response.close();
                outcome
            }
            Err(e) => classify_error(&e),
        };

        DELIVERY_ATTEMPT_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
        DELIVERY_ATTEMPTS_TOTAL
            .with_label_values(&[outcome.label()])
            .inc();

        match outcome {
            Outcome::Success => {
                DELIVERIES_TOTAL.with_label_values(&["delivered"]).inc();
                tracing::debug!(
                    worker = self.id,
                    url = %delivery.request.url,
                    attempts = delivery.attempts() + 1,
                    "Delivered"
                );
                Flow::Continue
            }
            Outcome::Permanent { reason } => {
                DELIVERIES_TOTAL.with_label_values(&["failed"]).inc();
                tracing::warn!(
                    worker = self.id,
                    url = %delivery.request.url,
                    reason = %reason,
                    "Dropping delivery after permanent failure"
                );
                Flow::Continue
            }
            Outcome::Transient {
                reason,
                retry_after,
            } => {
                let attempts = delivery.record_failure();
                if self.policy.exhausted(attempts) {
                    DELIVERIES_TOTAL.with_label_values(&["exhausted"]).inc();
                    tracing::warn!(
                        worker = self.id,
                        url = %delivery.request.url,
                        attempts,
                        reason = %reason,
                        "Dropping delivery after too many attempts"
                    );
                    return Flow::Continue;
                }

                let delay = self.policy.delay(attempts, retry_after);
                delivery.schedule(due_after(Instant::now(), delay));
                tracing::info!(
                    worker = self.id,
                    url = %delivery.request.url,
                    attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Delivery failed, backing off"
                );
                self.backlog.insert(delivery);
                Flow::Continue
            }
            Outcome::Cancelled => {
                self.queue.push([delivery]);
                Flow::Stop
            }
        }
    }

    fn flush(&mut self) {
        let pending = self.backlog.drain();
        if pending.is_empty() {
            return;
        }

        tracing::info!(
            worker = self.id,
            count = pending.len(),
            "Returning backlog to the shared queue"
        );
        self.queue.push(pending);
    }
}
