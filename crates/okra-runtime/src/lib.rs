//! Pool of pre-instantiated WebAssembly worker instances.
//!
//! Three layered pieces: [`CompiledModule`] compiles guest bytecode once,
//! [`Worker`] is a single guest instance reachable through the host-guest
//! ABI (`_initialize`, `allocate`, `deallocate`, `handle_request`), and
//! [`WorkerPool`] arbitrates a bounded set of them. Callers outside this
//! crate only need [`WorkerPool::invoke`], [`WorkerPool::active_workers`],
//! and [`WorkerPool::shutdown`] — everything else is an implementation
//! detail kept public for composition and testing.

mod errors;
mod module;
mod pool;
mod worker;

pub use errors::{CompileError, ConfigError, InstantiateError, PoolError, WorkerError};
pub use module::CompiledModule;
pub use pool::{PoolConfig, WorkerPool};
pub use worker::Worker;

pub use tokio_util::sync::CancellationToken;
