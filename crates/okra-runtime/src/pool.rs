use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{ConfigError, PoolError};
use crate::module::CompiledModule;
use crate::worker::Worker;

/// Constructor-time configuration for a [`WorkerPool`]. This is the only
/// configuration surface the core exposes: no env vars, no files.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Workers eagerly instantiated when the pool is constructed.
    pub min_workers: usize,
    /// Hard ceiling on the number of simultaneously live workers.
    pub max_workers: usize,
}

impl PoolConfig {
    fn validate(self) -> Result<Self, ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::MaxWorkersZero);
        }
        if self.min_workers > self.max_workers {
            return Err(ConfigError::MinExceedsMax {
                min: self.min_workers,
                max: self.max_workers,
            });
        }
        Ok(self)
    }
}

/// The arbiter: a bounded collection of idle workers backed by a single
/// [`CompiledModule`], growing lazily up to `max_workers` and pre-warming
/// `min_workers` at construction.
pub struct WorkerPool {
    module: CompiledModule,
    config: PoolConfig,
    idle: Mutex<VecDeque<Worker>>,
    worker_count: AtomicUsize,
    active_count: AtomicUsize,
    released: Notify,
    shut_down: AtomicBool,
    shutdown_once: OnceCell<Arc<Option<String>>>,
}

impl WorkerPool {
    /// Pre-warms `config.min_workers` instances from `module`. If any
    /// pre-warm instantiation fails, every worker already created is closed
    /// and the error is returned; no partial pool is left behind.
    pub fn new(config: PoolConfig, module: CompiledModule) -> Result<Self, PoolError> {
        let config = config.validate()?;

        let mut idle = VecDeque::with_capacity(config.max_workers);
        for _ in 0..config.min_workers {
            match module.instantiate() {
                Ok(worker) => idle.push_back(worker),
                Err(err) => {
                    for worker in idle {
                        worker.close();
                    }
                    return Err(PoolError::Instantiate(err));
                }
            }
        }

        let worker_count = idle.len();
        info!(worker_count, config.min_workers, config.max_workers, "pool pre-warmed");

        Ok(Self {
            module,
            config,
            idle: Mutex::new(idle),
            worker_count: AtomicUsize::new(worker_count),
            active_count: AtomicUsize::new(0),
            released: Notify::new(),
            shut_down: AtomicBool::new(false),
            shutdown_once: OnceCell::new(),
        })
    }

    /// Runs `method`/`input` through a worker acquired from the pool,
    /// releasing the worker on every exit path (success, guest error, or
    /// cancellation during acquire) via a scoped release guard.
    pub async fn invoke(
        &self,
        cancel: &CancellationToken,
        method: &[u8],
        input: &[u8],
    ) -> Result<Vec<u8>, PoolError> {
        let mut guard = WorkerGuard {
            pool: self,
            worker: Some(self.acquire(cancel).await?),
        };
        let worker = guard
            .worker
            .as_mut()
            .expect("guard holds a worker until dropped");
        worker.invoke(method, input).map_err(PoolError::from)
        // `guard` drops here, releasing the worker back to the pool
        // regardless of the outcome above.
    }

    /// Number of workers currently loaned out to callers.
    pub fn active_workers(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    /// Idempotent. The first call drains and closes every idle worker and
    /// flips the shutdown flag; concurrent and later calls observe the same
    /// outcome without running the drain twice. Workers on loan at the time
    /// of the call are closed by their own `release` once returned.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        let outcome = self
            .shutdown_once
            .get_or_init(|| async {
                // The flag flips and the idle collection is drained under the
                // same lock `release` checks/pushes under, so the two can
                // never interleave: a worker `release` is concurrently
                // returning either lands in `idle` before this drain sees it,
                // or `release` observes `shut_down` already set and closes
                // the worker itself instead of enqueuing it.
                let drained: Vec<Worker> = {
                    let mut idle = self.idle.lock().expect("idle mutex poisoned");
                    self.shut_down.store(true, Ordering::Release);
                    idle.drain(..).collect()
                };

                let closed = drained.len();
                for worker in drained {
                    worker.close();
                    self.worker_count.fetch_sub(1, Ordering::AcqRel);
                }

                // Wake every blocked acquirer so it observes shut_down and
                // returns PoolError::ShutDown instead of waiting forever.
                self.released.notify_waiters();

                info!(closed, "pool shut down");
                Arc::new(None)
            })
            .await;

        match outcome.as_ref() {
            Some(message) => Err(PoolError::Close(message.clone())),
            None => Ok(()),
        }
    }

    /// Takes an idle worker if one exists, otherwise grows lazily up to
    /// `max_workers`, otherwise blocks until a release or shutdown wakes it.
    /// A non-blocking fast path is always attempted first and is explicitly
    /// allowed to win against a task already blocked waiting for a release.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<Worker, PoolError> {
        loop {
            // Registered before any condition check so a release that lands
            // between our check and the await below is not missed.
            let notified = self.released.notified();

            if self.shut_down.load(Ordering::Acquire) {
                return Err(PoolError::ShutDown);
            }
            if cancel.is_cancelled() {
                return Err(PoolError::Canceled);
            }

            if let Some(worker) = self.idle.lock().expect("idle mutex poisoned").pop_front() {
                self.active_count.fetch_add(1, Ordering::AcqRel);
                debug!(active = self.active_workers(), "acquired idle worker");
                return Ok(worker);
            }

            let current = self.worker_count.load(Ordering::Acquire);
            if current < self.config.max_workers {
                if self
                    .worker_count
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    match self.module.instantiate() {
                        Ok(worker) => {
                            self.active_count.fetch_add(1, Ordering::AcqRel);
                            debug!(worker_count = current + 1, "grew pool");
                            return Ok(worker);
                        }
                        Err(err) => {
                            self.worker_count.fetch_sub(1, Ordering::AcqRel);
                            return Err(PoolError::Instantiate(err));
                        }
                    }
                }
                // Lost the race to grow; loop back and re-check idle/growth.
                continue;
            }

            tokio::pin!(notified);
            tokio::select! {
                _ = &mut notified => continue,
                _ = cancel.cancelled() => {
                    warn!("acquire canceled while waiting for a worker");
                    return Err(PoolError::Canceled);
                }
            }
        }
    }

    /// Returns a worker to the idle collection, or closes it if the pool has
    /// shut down or the idle collection is already at capacity (can only
    /// happen transiently around a shutdown race).
    ///
    /// The `shut_down` check happens *after* acquiring the idle lock, the
    /// same lock `shutdown` holds while flipping the flag and draining —
    /// otherwise a worker could be checked-as-not-shutting-down here, then
    /// have `shutdown` drain an idle collection that doesn't contain it yet,
    /// then get pushed into `idle` after the drain, where nothing will ever
    /// pop or close it again.
    fn release(&self, worker: Worker) {
        self.active_count.fetch_sub(1, Ordering::AcqRel);

        let mut idle = self.idle.lock().expect("idle mutex poisoned");
        if self.shut_down.load(Ordering::Acquire) {
            drop(idle);
            worker.close();
            self.worker_count.fetch_sub(1, Ordering::AcqRel);
            self.released.notify_waiters();
            return;
        }

        if idle.len() < self.config.max_workers {
            idle.push_back(worker);
            drop(idle);
            self.released.notify_one();
        } else {
            drop(idle);
            worker.close();
            self.worker_count.fetch_sub(1, Ordering::AcqRel);
            self.released.notify_one();
        }
    }
}

/// RAII guard pairing every successful `acquire` with exactly one `release`,
/// including on panics unwinding through `invoke`.
struct WorkerGuard<'a> {
    pool: &'a WorkerPool,
    worker: Option<Worker>,
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.release(worker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_workers: min,
            max_workers: max,
        }
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, 0)]
    #[case(5, 0)]
    fn rejects_zero_max_workers(#[case] min: usize, #[case] max: usize) {
        assert!(matches!(
            config(min, max).validate(),
            Err(ConfigError::MaxWorkersZero)
        ));
    }

    #[rstest]
    #[case(3, 2)]
    #[case(2, 1)]
    #[case(10, 9)]
    fn rejects_min_above_max(#[case] min: usize, #[case] max: usize) {
        assert!(matches!(
            config(min, max).validate(),
            Err(ConfigError::MinExceedsMax { min: m, max: mx }) if m == min && mx == max
        ));
    }

    #[rstest]
    #[case(0, 1)]
    #[case(2, 2)]
    #[case(0, 64)]
    fn accepts_valid_configs(#[case] min: usize, #[case] max: usize) {
        assert!(config(min, max).validate().is_ok());
    }
}
