use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc, oneshot};

use crate::error::CallError;
use crate::worker::WorkerThread;

/// Configuration for the callable pool.
#[derive(Clone)]
pub struct PoolConfig {
    /// Number of worker threads (default: num_cpus).
    pub num_workers: usize,
    /// Execution timeout in milliseconds (0 = no timeout).
    pub request_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get().max(1),
            request_timeout_ms: 0,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CallMode {
    Structured,
    Passthrough,
}

/// Everything a worker needs to run one call. The capability bundle arrives
/// pre-built (or pre-failed) so the worker can keep the contract's order:
/// compilation failures are reported before credential failures.
pub struct CallRequest {
    pub source: String,
    pub capabilities: Result<serde_json::Value, CallError>,
    pub data: serde_json::Value,
    pub http_request: Option<serde_json::Value>,
    pub(crate) mode: CallMode,
}

impl CallRequest {
    pub fn new(
        source: String,
        capabilities: Result<serde_json::Value, CallError>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            source,
            capabilities,
            data,
            http_request: None,
            mode: CallMode::Structured,
        }
    }

    pub fn with_http_request(mut self, request: serde_json::Value) -> Self {
        self.http_request = Some(request);
        self
    }
}

/// Outcome of a structured call: exactly one variant per request.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Resolved(serde_json::Value),
    Rejected(serde_json::Value),
}

/// Outcome of a passthrough call. `Response` carries the recorded response
/// state written by the callable; `NotHandled` means the callable delegated
/// via next() without writing anything.
#[derive(Debug, Clone, PartialEq)]
pub enum PassthroughOutcome {
    Response(serde_json::Value),
    NotHandled,
    Rejected(serde_json::Value),
}

pub(crate) enum WorkerReply {
    Call(CallOutcome),
    Passthrough(PassthroughOutcome),
}

pub(crate) struct WorkerRequest {
    pub(crate) request: CallRequest,
    pub(crate) response_tx: oneshot::Sender<WorkerReply>,
}

/// Counters for pool health; fresh_compiles vs cache_hits makes the
/// compile-once-per-source invariant observable.
#[derive(Default)]
pub struct PoolMetrics {
    pub total_requests: AtomicU64,
    pub fresh_compiles: AtomicU64,
    pub cache_hits: AtomicU64,
}

impl PoolMetrics {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "total_requests": self.total_requests.load(Ordering::Relaxed),
            "fresh_compiles": self.fresh_compiles.load(Ordering::Relaxed),
            "cache_hits": self.cache_hits.load(Ordering::Relaxed),
        })
    }
}

/// Load stats for a worker, used when assigning new sources.
#[derive(Default)]
pub(crate) struct WorkerLoad {
    pub(crate) queued_requests: AtomicUsize,
    pub(crate) active_requests: AtomicUsize,
}

struct WorkerHandle {
    request_tx: mpsc::UnboundedSender<WorkerRequest>,
    load: Arc<WorkerLoad>,
    #[allow(dead_code)]
    thread: JoinHandle<()>,
}

/// The callable pool. Requests for a given source text always land on the
/// worker that holds its compiled callable: a source is assigned to the
/// least-loaded worker on first sight and the assignment is sticky from
/// then on, so identical text compiles once per process while distinct
/// sources spread across workers.
pub struct CallablePool {
    workers: Vec<WorkerHandle>,
    metrics: Arc<PoolMetrics>,
    assignments: Mutex<HashMap<u64, usize>>,
}

impl CallablePool {
    pub fn new(config: PoolConfig) -> Self {
        let metrics = Arc::new(PoolMetrics::default());
        let worker_count = config.num_workers.max(1);
        let mut workers = Vec::with_capacity(worker_count);

        tracing::info!("Initializing callable pool: {} workers", worker_count);

        for worker_id in 0..worker_count {
            let (tx, rx) = mpsc::unbounded_channel();
            let load = Arc::new(WorkerLoad::default());
            let worker_load = Arc::clone(&load);
            let worker_metrics = Arc::clone(&metrics);
            let timeout_ms = config.request_timeout_ms;

            let thread = thread::spawn(move || {
                let mut worker =
                    WorkerThread::new(worker_id, timeout_ms, worker_metrics, worker_load);
                worker.run(rx);
            });

            workers.push(WorkerHandle {
                request_tx: tx,
                load,
                thread,
            });
        }

        Self {
            workers,
            metrics,
            assignments: Mutex::new(HashMap::new()),
        }
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    /// Structured call: resolve or reject, nothing ever escapes.
    pub async fn execute(&self, mut request: CallRequest) -> CallOutcome {
        request.mode = CallMode::Structured;
        match self.dispatch(request).await {
            Ok(WorkerReply::Call(outcome)) => outcome,
            Ok(WorkerReply::Passthrough(_)) => CallOutcome::Rejected(
                CallError::Invocation("worker returned a passthrough reply".to_string())
                    .rejection(),
            ),
            Err(err) => CallOutcome::Rejected(err.rejection()),
        }
    }

    /// Passthrough call: the callable owns the response; the reply carries
    /// whatever it recorded.
    pub async fn execute_passthrough(&self, mut request: CallRequest) -> PassthroughOutcome {
        request.mode = CallMode::Passthrough;
        match self.dispatch(request).await {
            Ok(WorkerReply::Passthrough(outcome)) => outcome,
            Ok(WorkerReply::Call(_)) => PassthroughOutcome::Rejected(
                CallError::Invocation("worker returned a structured reply".to_string()).rejection(),
            ),
            Err(err) => PassthroughOutcome::Rejected(err.rejection()),
        }
    }

    async fn dispatch(&self, request: CallRequest) -> Result<WorkerReply, CallError> {
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        let worker_index = self.select_worker(&request.source);

        let (response_tx, response_rx) = oneshot::channel();
        let worker = &self.workers[worker_index];
        worker.load.queued_requests.fetch_add(1, Ordering::Relaxed);
        worker
            .request_tx
            .send(WorkerRequest {
                request,
                response_tx,
            })
            .map_err(|_| CallError::Invocation("worker thread unavailable".to_string()))?;

        response_rx
            .await
            .map_err(|_| CallError::Invocation("worker dropped the reply channel".to_string()))
    }

    fn select_worker(&self, source: &str) -> usize {
        if self.workers.len() <= 1 {
            return 0;
        }
        let hash = hash_source(source);
        let mut assignments = self.assignments.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(index) = assignments.get(&hash) {
            return *index;
        }
        let index = self.least_loaded_worker();
        assignments.insert(hash, index);
        index
    }

    fn least_loaded_worker(&self) -> usize {
        let mut best = (0, usize::MAX);
        for (index, worker) in self.workers.iter().enumerate() {
            let queued = worker.load.queued_requests.load(Ordering::Relaxed);
            let active = worker.load.active_requests.load(Ordering::Relaxed);
            let load = queued + active;
            if load < best.1 {
                best = (index, load);
            }
        }
        best.0
    }
}

fn hash_source(source: &str) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}
