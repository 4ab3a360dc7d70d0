//! Worker pool running several poll loops against one store.

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::job::Payload;
use crate::store::{SharedStore, Store};
use crate::worker::{JobContext, Worker};

/// Builder for WorkerPool.
pub struct WorkerPoolBuilder<F, Fut>
where
    F: Fn(JobContext, Payload) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    config: QueueConfig,
    workers: usize,
    shutdown_timeout: Duration,
    handler: Option<F>,
    store: Option<SharedStore>,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> Default for WorkerPoolBuilder<F, Fut>
where
    F: Fn(JobContext, Payload) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<F, Fut> WorkerPoolBuilder<F, Fut>
where
    F: Fn(JobContext, Payload) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: QueueConfig::default(),
            workers: 1,
            shutdown_timeout: Duration::from_secs(30),
            handler: None,
            store: None,
            _phantom: PhantomData,
        }
    }

    /// Set the store.
    pub fn store(mut self, store: impl Store + 'static) -> Self {
        self.store = Some(SharedStore::new(store));
        self
    }

    /// Set the queue configuration.
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of poll loops.
    pub fn workers(mut self, num: usize) -> Self {
        self.workers = num;
        self
    }

    /// Set how long to wait for loops to return after shutdown is requested.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the job handler.
    pub fn handler(mut self, handler: F) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Build the WorkerPool with the configured store.
    pub fn build(self) -> Result<WorkerPool<F, Fut, SharedStore>> {
        let store = self
            .store
            .clone()
            .ok_or_else(|| QueueError::Config("Store is required".to_string()))?;
        self.build_with_store(store)
    }

    /// Build the WorkerPool with a custom store.
    pub fn build_with_store<S: Store + Clone + 'static>(
        self,
        store: S,
    ) -> Result<WorkerPool<F, Fut, S>> {
        let handler = self
            .handler
            .ok_or_else(|| QueueError::Config("Handler is required".to_string()))?;
        if self.workers == 0 {
            return Err(QueueError::Config("At least one worker is required".to_string()));
        }
        self.config.validate()?;

        Ok(WorkerPool {
            config: self.config,
            workers: self.workers,
            shutdown_timeout: self.shutdown_timeout,
            handler,
            store,
            pool_id: generate_pool_id(),
            root: CancellationToken::new(),
            _phantom: PhantomData,
        })
    }
}

/// Runs `workers` poll loops concurrently.
///
/// All loops share one root token. Cancelling it stops claiming and cancels
/// every job in flight.
pub struct WorkerPool<F, Fut, S = SharedStore>
where
    F: Fn(JobContext, Payload) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = bool> + Send + 'static,
    S: Store + Clone + 'static,
{
    config: QueueConfig,
    workers: usize,
    shutdown_timeout: Duration,
    handler: F,
    store: S,
    pool_id: String,
    root: CancellationToken,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> WorkerPool<F, Fut, SharedStore>
where
    F: Fn(JobContext, Payload) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    /// Create a new builder for WorkerPool.
    pub fn builder() -> WorkerPoolBuilder<F, Fut> {
        WorkerPoolBuilder::new()
    }
}

impl<F, Fut, S> WorkerPool<F, Fut, S>
where
    F: Fn(JobContext, Payload) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = bool> + Send + 'static,
    S: Store + Clone + 'static,
{
    /// Get the pool ID.
    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    /// Root token of the pool. Cancel it to shut the pool down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Run until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Run until `shutdown` resolves or the root token is cancelled.
    ///
    /// Loops that have not returned `shutdown_timeout` after cancellation are
    /// aborted. Their jobs stay `running` and are reclaimed once stale.
    pub async fn run_until<Sd>(&self, shutdown: Sd) -> Result<()>
    where
        Sd: Future<Output = ()> + Send,
    {
        let mut tasks = JoinSet::new();

        for worker_id in 0..self.workers {
            let worker = Worker::new(
                worker_id,
                self.store.clone(),
                self.config.clone(),
                self.handler.clone(),
                self.root.clone(),
            );
            tasks.spawn(async move { worker.run().await });
        }

        tracing::info!(
            workers = self.workers,
            lanes = ?self.config.lanes,
            pool_id = %self.pool_id,
            "Worker pool started"
        );

        tokio::select! {
            _ = shutdown => {}
            _ = self.root.cancelled() => {}
        }
        tracing::info!(pool_id = %self.pool_id, "Shutdown requested");
        self.root.cancel();

        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Worker task panicked");
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = tasks.len(),
                "Shutdown timeout reached, aborting workers"
            );
            tasks.shutdown().await;
        }

        tracing::info!(pool_id = %self.pool_id, "Worker pool stopped");
        Ok(())
    }
}

/// Generate a pool ID from host, process and start time.
pub fn generate_pool_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let pid = std::process::id();
    let ts = chrono::Utc::now().timestamp();
    format!("{}-{}-{}", host, pid, ts)
}
