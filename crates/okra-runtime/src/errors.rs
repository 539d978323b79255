use thiserror::Error;

/// Bad [`crate::PoolConfig`] supplied to [`crate::WorkerPool::new`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("max_workers must be at least 1")]
    MaxWorkersZero,

    #[error("min_workers ({min}) must not exceed max_workers ({max})")]
    MinExceedsMax { min: usize, max: usize },
}

/// Guest bytecode failed to parse, validate, or link.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("cannot create wasm engine: {0}")]
    Engine(#[source] wasmtime::Error),

    #[error("guest bytecode failed to parse or validate: {0}")]
    Invalid(#[source] wasmtime::Error),

    #[error("cannot resolve host imports for guest module: {0}")]
    Link(#[source] wasmtime::Error),
}

/// Instance creation, export resolution, or `_initialize` failed.
#[derive(Error, Debug)]
pub enum InstantiateError {
    #[error("cannot instantiate guest module: {0}")]
    Instantiate(#[source] wasmtime::Error),

    #[error("guest module is missing required export `{0}`")]
    MissingExport(&'static str),

    #[error("guest module does not export a linear memory named `memory`")]
    MissingMemory,

    #[error("guest `_initialize` failed: {0}")]
    Initialize(#[source] wasmtime::Error),
}

/// Failure while marshalling a single `invoke` call through the host-guest ABI.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("guest allocate() returned 0 (out of memory)")]
    Alloc,

    #[error("guest linear memory access out of bounds: {0}")]
    Memory(String),

    #[error("guest handle_request() signaled failure")]
    Guest,

    #[error("wasm trap while invoking guest: {0}")]
    Trap(#[source] wasmtime::Error),
}

/// Error surfaced by [`crate::WorkerPool`]'s public operations.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Instantiate(#[from] InstantiateError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("the caller was canceled before a worker became available")]
    Canceled,

    #[error("the worker pool is shutting down or has already shut down")]
    ShutDown,

    #[error("error closing a worker during shutdown: {0}")]
    Close(String),
}
