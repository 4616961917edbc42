//! Call pipeline: configuration, credential-derived capability bundles,
//! call/response envelopes, and the two dispatchers driving the isolate
//! pool.

mod config;
mod dispatch;
mod envelope;
mod identity;

pub use config::{RuntimeConfig, is_truthy};
pub use dispatch::{PassthroughReply, execute_call, execute_http_call};
pub use envelope::{CallParams, RequestEnvelope, ResponseEnvelope};
pub use identity::{AdminCapability, CapabilityBundle, DataCapability, build_capabilities};

use isolate::CallablePool;

/// Shared service state: the worker pool and the startup configuration.
pub struct RuntimeState {
    pub config: RuntimeConfig,
    pub pool: CallablePool,
}

impl RuntimeState {
    pub fn new(config: RuntimeConfig) -> Self {
        let pool = CallablePool::new(config.pool_config());
        Self { config, pool }
    }
}
