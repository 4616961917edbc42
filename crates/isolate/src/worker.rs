use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use deno_core::{JsRuntime, ModuleCodeString, RuntimeOptions, serde_v8, v8};
use tokio::sync::mpsc;

use crate::bootstrap::{BOOTSTRAP, runtime_extensions};
use crate::error::CallError;
use crate::pool::{CallMode, CallOutcome, PassthroughOutcome, PoolMetrics, WorkerLoad};
use crate::pool::{CallRequest, WorkerReply, WorkerRequest};

/// Worker thread that owns isolates locally. JsRuntime is !Send, so each
/// worker keeps its runtime and callable cache on its own thread and talks
/// to the pool over channels.
pub(crate) struct WorkerThread {
    worker_id: usize,
    request_timeout_ms: u64,
    metrics: Arc<PoolMetrics>,
    load: Arc<WorkerLoad>,
}

/// One V8 isolate plus the compiled callables living in it. Sources assigned
/// to this worker share the isolate's global scope; the cache is unbounded
/// and lives for the life of the process.
struct CallIsolate {
    runtime: JsRuntime,
    callables: HashMap<String, v8::Global<v8::Function>>,
}

impl CallIsolate {
    fn new() -> Result<Self, String> {
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: runtime_extensions(),
            ..Default::default()
        });
        runtime
            .execute_script("bootstrap.js", ModuleCodeString::from(BOOTSTRAP.to_string()))
            .map_err(|err| format!("bootstrap failed: {}", err))?;
        Ok(Self {
            runtime,
            callables: HashMap::new(),
        })
    }

    /// Evaluates source text into a callable, memoizing per exact source.
    /// Evaluation failures are not cached; a later identical submission
    /// reattempts compilation.
    fn compile(
        &mut self,
        source: &str,
        metrics: &PoolMetrics,
    ) -> Result<v8::Global<v8::Function>, CallError> {
        if let Some(callable) = self.callables.get(source) {
            metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(callable.clone());
        }

        let value = self
            .runtime
            .execute_script("callable.js", ModuleCodeString::from(source.to_string()))
            .map_err(|err| CallError::Compilation(err.to_string()))?;

        deno_core::scope!(scope, &mut self.runtime);
        let local = v8::Local::new(scope, &value);
        let function =
            v8::Local::<v8::Function>::try_from(local).map_err(|_| CallError::CompilationResult)?;
        let callable = v8::Global::new(scope, function);
        self.callables.insert(source.to_string(), callable.clone());
        metrics.fresh_compiles.fetch_add(1, Ordering::Relaxed);
        Ok(callable)
    }

    /// Installs the per-invocation globals the drivers read: the callable,
    /// the capability seed, the payload data and (for passthrough calls)
    /// the request envelope.
    fn set_invocation_globals(
        &mut self,
        callable: &v8::Global<v8::Function>,
        seed: &serde_json::Value,
        data: &serde_json::Value,
        http_request: Option<&serde_json::Value>,
    ) -> Result<(), CallError> {
        deno_core::scope!(scope, &mut self.runtime);
        let context = scope.get_current_context();
        let global = context.global(scope);

        let callable_local = v8::Local::new(scope, callable);
        set_global(scope, &global, "__callable", callable_local.into())?;

        let seed_value = serde_v8::to_v8(scope, seed)
            .map_err(|err| CallError::Serialization(format!("capability seed to v8: {}", err)))?;
        set_global(scope, &global, "__contextSeed", seed_value)?;

        let data_value = serde_v8::to_v8(scope, data)
            .map_err(|err| CallError::Serialization(format!("payload data to v8: {}", err)))?;
        set_global(scope, &global, "__callData", data_value)?;

        if let Some(request) = http_request {
            let request_value = serde_v8::to_v8(scope, request).map_err(|err| {
                CallError::Serialization(format!("request envelope to v8: {}", err))
            })?;
            set_global(scope, &global, "__httpRequest", request_value)?;
        }

        Ok(())
    }

    /// Runs the invocation driver and settles its promise, pumping the event
    /// loop when the callable returned a pending result. The driver catches
    /// thrown values itself and reports them under `rejected`, so a rejected
    /// driver promise means the invocation machinery broke, not user code.
    async fn drive(&mut self, mode: CallMode) -> Result<serde_json::Value, CallError> {
        let script = match mode {
            CallMode::Structured => "globalThis.__invokeCallable()",
            CallMode::Passthrough => "globalThis.__invokePassthrough()",
        };
        let result = self
            .runtime
            .execute_script("invoke.js", ModuleCodeString::from(script.to_string()))
            .map_err(|err| CallError::Invocation(err.to_string()))?;

        let mut needs_event_loop = false;
        {
            deno_core::scope!(scope, &mut self.runtime);
            let local = v8::Local::new(scope, &result);
            if let Ok(promise) = v8::Local::<v8::Promise>::try_from(local) {
                needs_event_loop = matches!(promise.state(), v8::PromiseState::Pending);
            }
        }

        if needs_event_loop {
            self.runtime
                .run_event_loop(deno_core::PollEventLoopOptions::default())
                .await
                .map_err(|err| CallError::Invocation(format!("event loop failed: {}", err)))?;
        }

        deno_core::scope!(scope, &mut self.runtime);
        let local = v8::Local::new(scope, &result);
        let settled = if let Ok(promise) = v8::Local::<v8::Promise>::try_from(local) {
            match promise.state() {
                v8::PromiseState::Fulfilled => promise.result(scope),
                v8::PromiseState::Rejected => {
                    let reason = promise.result(scope);
                    return Err(CallError::Invocation(reason.to_rust_string_lossy(scope)));
                }
                v8::PromiseState::Pending => {
                    return Err(CallError::Invocation(
                        "callable's promise never settled".to_string(),
                    ));
                }
            }
        } else {
            local
        };

        serde_v8::from_v8::<serde_json::Value>(scope, settled)
            .map_err(|err| CallError::Serialization(err.to_string()))
    }
}

fn set_global<'s>(
    scope: &v8::PinScope<'s, '_>,
    global: &v8::Local<'s, v8::Object>,
    name: &str,
    value: v8::Local<'s, v8::Value>,
) -> Result<(), CallError> {
    let key = v8::String::new(scope, name)
        .ok_or_else(|| CallError::Invocation(format!("failed to allocate global key {}", name)))?;
    global.set(scope, key.into(), value);
    Ok(())
}

impl WorkerThread {
    pub(crate) fn new(
        worker_id: usize,
        request_timeout_ms: u64,
        metrics: Arc<PoolMetrics>,
        load: Arc<WorkerLoad>,
    ) -> Self {
        Self {
            worker_id,
            request_timeout_ms,
            metrics,
            load,
        }
    }

    /// Main loop, runs on a dedicated thread with its own current-thread
    /// tokio runtime (needed for async ops inside V8).
    pub(crate) fn run(&mut self, mut rx: mpsc::UnboundedReceiver<WorkerRequest>) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("Failed to create tokio runtime for worker");

        tracing::debug!("Worker {} started", self.worker_id);

        rt.block_on(async {
            let mut isolate = match CallIsolate::new() {
                Ok(isolate) => isolate,
                Err(err) => {
                    tracing::error!("Worker {} failed to start isolate: {}", self.worker_id, err);
                    return;
                }
            };

            while let Some(request) = rx.recv().await {
                self.load.queued_requests.fetch_sub(1, Ordering::Relaxed);
                self.load.active_requests.fetch_add(1, Ordering::Relaxed);
                let (reply, poisoned) = self.process(&mut isolate, request.request).await;
                self.load.active_requests.fetch_sub(1, Ordering::Relaxed);
                let _ = request.response_tx.send(reply);

                if poisoned {
                    // terminate_execution leaves the isolate unusable;
                    // rebuild it and drop its callable cache.
                    tracing::warn!("Worker {} rebuilding isolate after termination", self.worker_id);
                    match CallIsolate::new() {
                        Ok(fresh) => isolate = fresh,
                        Err(err) => {
                            tracing::error!(
                                "Worker {} failed to rebuild isolate: {}",
                                self.worker_id,
                                err
                            );
                            return;
                        }
                    }
                }
            }
        });

        tracing::debug!("Worker {} shutting down", self.worker_id);
    }

    /// Pipeline order mirrors the structured-call contract: compile first,
    /// then unwrap the capability bundle, then context + invoke.
    async fn process(
        &self,
        isolate: &mut CallIsolate,
        request: CallRequest,
    ) -> (WorkerReply, bool) {
        let mode = request.mode;
        let reject = |err: &CallError| match mode {
            CallMode::Structured => WorkerReply::Call(CallOutcome::Rejected(err.rejection())),
            CallMode::Passthrough => {
                WorkerReply::Passthrough(PassthroughOutcome::Rejected(err.rejection()))
            }
        };

        let callable = match isolate.compile(&request.source, &self.metrics) {
            Ok(callable) => callable,
            Err(err) => return (reject(&err), false),
        };

        let seed = match request.capabilities {
            Ok(seed) => seed,
            Err(err) => return (reject(&err), false),
        };

        if let Err(err) = isolate.set_invocation_globals(
            &callable,
            &seed,
            &request.data,
            request.http_request.as_ref(),
        ) {
            return (reject(&err), false);
        }

        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = if self.request_timeout_ms > 0 {
            let timeout_ms = self.request_timeout_ms;
            let flag = Arc::clone(&timed_out);
            let handle = isolate.runtime.v8_isolate().thread_safe_handle();
            Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                flag.store(true, Ordering::Relaxed);
                handle.terminate_execution();
            }))
        } else {
            None
        };

        let driven = isolate.drive(mode).await;

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        if timed_out.load(Ordering::Relaxed) {
            let err = CallError::Invocation(format!(
                "execution terminated after {}ms",
                self.request_timeout_ms
            ));
            return (reject(&err), true);
        }

        let settled = match driven {
            Ok(settled) => settled,
            Err(err) => return (reject(&err), false),
        };

        let reply = match mode {
            CallMode::Structured => WorkerReply::Call(structured_outcome(settled)),
            CallMode::Passthrough => WorkerReply::Passthrough(passthrough_outcome(settled)),
        };
        (reply, false)
    }
}

fn structured_outcome(settled: serde_json::Value) -> CallOutcome {
    if let Some(rejected) = settled.get("rejected") {
        CallOutcome::Rejected(rejected.clone())
    } else {
        let resolved = settled
            .get("resolved")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        CallOutcome::Resolved(resolved)
    }
}

fn passthrough_outcome(settled: serde_json::Value) -> PassthroughOutcome {
    let finished = |state: Option<&serde_json::Value>| {
        state
            .and_then(|state| state.get("finished"))
            .and_then(|finished| finished.as_bool())
            .unwrap_or(false)
    };

    if let Some(rejected) = settled.get("rejected") {
        // A response the callable already wrote wins over the rejection body.
        if finished(settled.get("state")) {
            return PassthroughOutcome::Response(settled["state"].clone());
        }
        return PassthroughOutcome::Rejected(rejected.clone());
    }

    let state = settled
        .get("resolved")
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    let wants_next = state
        .get("next")
        .and_then(|next| next.as_bool())
        .unwrap_or(false);
    if wants_next && !finished(Some(&state)) {
        return PassthroughOutcome::NotHandled;
    }
    PassthroughOutcome::Response(state)
}
