//! Worker-thread pool of V8 isolates that compiles submitted source text
//! into callables, caches them per source, and invokes them with a
//! capability-bearing context.

mod bootstrap;
mod error;
mod pool;
mod worker;

pub use error::CallError;
pub use pool::{
    CallMode, CallOutcome, CallRequest, CallablePool, PassthroughOutcome, PoolConfig, PoolMetrics,
};
