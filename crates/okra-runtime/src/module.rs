use wasmtime::{Config, Engine, Linker, Module};

use crate::errors::CompileError;
use crate::worker::{self, Worker};

/// An immutable, compile-once artifact produced from guest bytecode.
///
/// `instantiate` is the sole mutating operation; it is safe to call
/// concurrently from many tasks and produces a fresh [`Worker`] each time.
pub struct CompiledModule {
    engine: Engine,
    instance_pre: wasmtime::InstancePre<()>,
}

impl CompiledModule {
    /// Parses and validates `bytecode`, resolving host imports once. No guest
    /// code runs as part of this call.
    pub fn compile(bytecode: &[u8]) -> Result<Self, CompileError> {
        let config = Config::new();
        let engine = Engine::new(&config).map_err(CompileError::Engine)?;
        let module = Module::new(&engine, bytecode).map_err(CompileError::Invalid)?;

        // No host imports are part of the ABI; an empty linker is enough to
        // resolve the InstancePre.
        let linker: Linker<()> = Linker::new(&engine);
        let instance_pre = linker
            .instantiate_pre(&module)
            .map_err(CompileError::Link)?;

        Ok(Self {
            engine,
            instance_pre,
        })
    }

    /// Produces a fresh guest instance: a new `Store`, the four required ABI
    /// exports resolved by name, and `_initialize` invoked once. Any missing
    /// export or a failing `_initialize` yields an error; nothing is left
    /// half-constructed on the error path.
    pub fn instantiate(&self) -> Result<Worker, crate::errors::InstantiateError> {
        worker::instantiate(&self.engine, &self.instance_pre)
    }

    /// Releases the compilation artifact and engine handle. Callers must
    /// ensure every `Worker` produced by this module has already been closed.
    pub fn close(self) {
        drop(self);
    }
}
