//! Supervised pool of delivery workers

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::backoff::RetryPolicy;
use super::worker::Worker;
use super::{ACTOR_ID, Delivery, DeliveryQueue, OBJECT_ID, TARGET_ID, delivery_queue};
use crate::config::DeliveryConfig;
use crate::httpclient::{Client, Signer};
use crate::metrics::WORKER_RESTARTS_TOTAL;

struct Running {
    token: CancellationToken,
    supervisors: Vec<JoinHandle<()>>,
}

/// Pool of workers draining one shared queue through one client
pub struct WorkerPool {
    client: Arc<Client>,
    queue: Arc<DeliveryQueue>,
    policy: RetryPolicy,
    running: Mutex<Option<Running>>,
}

impl WorkerPool {
    /// Create a stopped pool with an empty queue
    pub fn new(client: Arc<Client>, config: &DeliveryConfig) -> Self {
        Self::with_policy(client, RetryPolicy::from(config))
    }

    /// Create a stopped pool with explicit retry limits
    pub fn with_policy(client: Arc<Client>, policy: RetryPolicy) -> Self {
        Self {
            client,
            queue: Arc::new(delivery_queue()),
            policy,
            running: Mutex::new(None),
        }
    }

    /// Shared queue producers push to
    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    /// Client used by every worker
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Retry limits applied by every worker
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Whether workers are running
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn `size` supervised workers
    ///
    /// Does nothing if the pool is already running.
    pub fn start(&self, size: usize) {
        let mut running = self.running.lock();
        if running.is_some() {
            tracing::warn!("Worker pool already running");
            return;
        }

        let token = CancellationToken::new();
        let supervisors = (0..size)
            .map(|id| {
                tokio::spawn(supervise(
                    id,
                    self.queue.clone(),
                    self.client.clone(),
                    self.policy,
                    token.clone(),
                ))
            })
            .collect();

        tracing::info!(
            workers = size,
            max_attempts = self.policy.max_attempts,
            base_backoff_ms = self.policy.base.as_millis() as u64,
            "Worker pool started"
        );

        *running = Some(Running { token, supervisors });
    }

    /// Stop every worker and wait for them
    ///
    /// Afterwards every delivery that was in flight or backlogged is back in
    /// the shared queue. The pool can be started again.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(Running { token, supervisors }) = running else {
            return;
        };

        token.cancel();
        for supervisor in supervisors {
            if let Err(e) = supervisor.await {
                tracing::error!(error = %e, "Worker supervisor failed");
            }
        }

        tracing::info!(queued = self.queue.len(), "Worker pool stopped");
    }

    /// Push one delivery to the shared queue
    pub fn enqueue(&self, delivery: Delivery) {
        self.queue.push([delivery]);
    }

    /// Queue one signed activity POST per distinct inbox
    ///
    /// Returns the number of deliveries queued.
    pub fn enqueue_to_inboxes(
        &self,
        actor_id: &str,
        object_id: &str,
        inboxes: impl IntoIterator<Item = Url>,
        body: impl Into<Bytes>,
        signer: Option<Arc<dyn Signer>>,
    ) -> usize {
        let deliveries = super::inbox_deliveries(actor_id, object_id, inboxes, body.into(), signer);
        let count = deliveries.len();

        tracing::debug!(actor_id, object_id, count, "Queueing activity deliveries");
        self.queue.push(deliveries);
        count
    }

    /// Cancel queued deliveries sent by `actor_id`
    pub fn delete_by_actor(&self, actor_id: &str) -> usize {
        self.queue.delete_by_index(ACTOR_ID, actor_id)
    }

    /// Cancel queued deliveries of `object_id`
    pub fn delete_by_object(&self, object_id: &str) -> usize {
        self.queue.delete_by_index(OBJECT_ID, object_id)
    }

    /// Cancel queued deliveries to `target_id`
    pub fn delete_by_target(&self, target_id: &str) -> usize {
        self.queue.delete_by_index(TARGET_ID, target_id)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            tracing::warn!("Worker pool dropped while running; backlogs may be lost");
            running.token.cancel();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("queue", &self.queue)
            .field("policy", &self.policy)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Keep one worker slot alive, respawning after panics
async fn supervise(
    id: usize,
    queue: Arc<DeliveryQueue>,
    client: Arc<Client>,
    policy: RetryPolicy,
    token: CancellationToken,
) {
    loop {
        let worker = Worker::new(id, queue.clone(), client.clone(), policy);
        let handle = tokio::spawn(worker.run(token.clone()));

        match handle.await {
            Ok(()) => return,
            Err(e) if e.is_panic() => {
                tracing::error!(worker = id, "Delivery worker panicked");
                if token.is_cancelled() {
                    return;
                }
                WORKER_RESTARTS_TOTAL.inc();
                tracing::info!(worker = id, "Restarting delivery worker");
            }
            Err(e) => {
                tracing::warn!(worker = id, error = %e, "Delivery worker aborted");
                return;
            }
        }
    }
}
