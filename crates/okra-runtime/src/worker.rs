use wasmtime::{Engine, Instance, InstancePre, Memory, Store, TypedFunc};

use crate::errors::{InstantiateError, WorkerError};

const EXPORT_INITIALIZE: &str = "_initialize";
const EXPORT_ALLOCATE: &str = "allocate";
const EXPORT_DEALLOCATE: &str = "deallocate";
const EXPORT_HANDLE_REQUEST: &str = "handle_request";
const EXPORT_MEMORY: &str = "memory";

/// A single guest instance: one linear memory, one set of exported ABI
/// functions, one `Store`. Not internally synchronized — callers (the pool)
/// guarantee at most one in-flight `invoke` at a time.
pub struct Worker {
    store: Store<()>,
    memory: Memory,
    allocate: TypedFunc<u32, u32>,
    deallocate: TypedFunc<u32, ()>,
    handle_request: TypedFunc<(u32, u32, u32, u32), u64>,
}

pub(crate) fn instantiate(
    engine: &Engine,
    instance_pre: &InstancePre<()>,
) -> Result<Worker, InstantiateError> {
    let mut store = Store::new(engine, ());
    let instance: Instance = instance_pre
        .instantiate(&mut store)
        .map_err(InstantiateError::Instantiate)?;

    let initialize = instance
        .get_typed_func::<(), ()>(&mut store, EXPORT_INITIALIZE)
        .map_err(|_| InstantiateError::MissingExport(EXPORT_INITIALIZE))?;
    let allocate = instance
        .get_typed_func::<u32, u32>(&mut store, EXPORT_ALLOCATE)
        .map_err(|_| InstantiateError::MissingExport(EXPORT_ALLOCATE))?;
    let deallocate = instance
        .get_typed_func::<u32, ()>(&mut store, EXPORT_DEALLOCATE)
        .map_err(|_| InstantiateError::MissingExport(EXPORT_DEALLOCATE))?;
    let handle_request = instance
        .get_typed_func::<(u32, u32, u32, u32), u64>(&mut store, EXPORT_HANDLE_REQUEST)
        .map_err(|_| InstantiateError::MissingExport(EXPORT_HANDLE_REQUEST))?;
    let memory = instance
        .get_memory(&mut store, EXPORT_MEMORY)
        .ok_or(InstantiateError::MissingMemory)?;

    initialize
        .call(&mut store, ())
        .map_err(InstantiateError::Initialize)?;

    Ok(Worker {
        store,
        memory,
        allocate,
        deallocate,
        handle_request,
    })
}

impl Worker {
    /// Runs one request through the host-guest ABI:
    ///
    /// 1. `allocate(method.len())` -> method buffer, or [`WorkerError::Alloc`]
    /// 2. write `method` into the guest buffer
    /// 3. `allocate(input.len())` -> input buffer, freeing the method buffer
    ///    first if this allocation fails
    /// 4. write `input` into the guest buffer
    /// 5. `handle_request(method_ptr, method_len, input_ptr, input_len)`
    /// 6. decode the packed `u64` result; `0` means guest failure
    /// 7. read the output bytes at the decoded pointer/length
    /// 8. `deallocate` the output buffer
    /// 9. `deallocate` the method and input buffers on every path, including
    ///    errors raised after step 1
    pub fn invoke(&mut self, method: &[u8], input: &[u8]) -> Result<Vec<u8>, WorkerError> {
        let method_ptr = self.guest_alloc(method)?;
        let input_ptr = match self.guest_alloc(input) {
            Ok(ptr) => ptr,
            Err(err) => {
                self.free(method_ptr);
                return Err(err);
            }
        };

        let call_result = self.handle_request.call(
            &mut self.store,
            (
                method_ptr,
                method.len() as u32,
                input_ptr,
                input.len() as u32,
            ),
        );

        self.free(method_ptr);
        self.free(input_ptr);

        let packed = call_result.map_err(WorkerError::Trap)?;
        if packed == 0 {
            return Err(WorkerError::Guest);
        }

        let out_ptr = (packed >> 32) as u32;
        let out_len = (packed & 0xFFFF_FFFF) as u32;

        let mut out = vec![0u8; out_len as usize];
        self.memory
            .read(&self.store, out_ptr as usize, &mut out)
            .map_err(|err| WorkerError::Memory(err.to_string()))?;

        self.deallocate
            .call(&mut self.store, out_ptr)
            .map_err(WorkerError::Trap)?;

        Ok(out)
    }

    /// Allocates a guest buffer of `bytes.len()` and copies `bytes` into it.
    /// The guest's linear memory may have been grown by a previous call, so
    /// the bounds check happens against the current memory view, not one
    /// cached at instantiation time. If the write fails, the buffer `allocate`
    /// just handed back is freed before the error is propagated — the guest
    /// must never be left holding a buffer the host has no other reference
    /// to.
    fn guest_alloc(&mut self, bytes: &[u8]) -> Result<u32, WorkerError> {
        let ptr = self
            .allocate
            .call(&mut self.store, bytes.len() as u32)
            .map_err(WorkerError::Trap)?;
        if ptr == 0 {
            return Err(WorkerError::Alloc);
        }
        if let Err(err) = self.memory.write(&mut self.store, ptr as usize, bytes) {
            self.free(ptr);
            return Err(WorkerError::Memory(err.to_string()));
        }
        Ok(ptr)
    }

    fn free(&mut self, ptr: u32) {
        // Best-effort: a trap here means the guest is already in a bad state,
        // which the pool discovers through invoke's own Result instead.
        let _ = self.deallocate.call(&mut self.store, ptr);
    }

    /// Tears down the instance and its `Store`.
    pub fn close(self) {
        drop(self);
    }
}
