//! # Device Thread
//!
//! All device API calls in the crate run on exactly one thread per context.
//! Other threads interact with the device only by queuing closures.
//!
//! ## Queue discipline
//!
//! * **FIFO.** Tasks run in submission order, so two dispatches queued in
//!   order reach the device in that order.
//! * **Fire-and-forget** submission ([`DeviceExecutor::submit`]) returns as
//!   soon as the task is queued.
//! * **Blocking** submission ([`DeviceExecutor::run_blocking`]) waits on a
//!   one-shot channel the task fulfils. This is the only place a caller
//!   thread suspends.
//! * The device thread itself only blocks on the queue's condition variable
//!   while idle.
//!
//! ## Cancellation
//!
//! None. A queued task always runs. Shutdown closes the queue to new work,
//! lets the worker drain what is already queued and then releases the device
//! on the worker thread.
//!
//! ## Panics
//!
//! A panicking task is caught and logged; the worker keeps serving the queue.
//! Result channels and [`Completion`] guards owned by the task are dropped
//! during unwinding, so waiting callers observe
//! [`ExecutorError::TaskDropped`] instead of hanging.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crate::engine::error::{ExecutorError, GpuResult};
use crate::gpu::config::{ContextConfig, DispatchLimits, PackingStrategy};
use crate::gpu::context::{DeviceCapabilities, GPUContext};
use crate::gpu::pipeline::PipelineCache;


/// State owned by the device thread and lent to every task.
///
/// ## Role
/// Bundles the long-lived device state a task may need:
/// * the device and queue,
/// * the cache of conversion-kernel pipelines,
/// * the effective dispatch ceiling and transfer settings.

pub(crate) struct Runtime {
    pub context: GPUContext,
    pub conversions: PipelineCache,
    pub limits: DispatchLimits,
    pub packing: PackingStrategy,
    pub readback_timeout: Duration,
    pub transfer: TransferLimits,
}

/// Device limits every transfer is planned against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransferLimits {
    /// Largest range one conversion kernel binds.
    pub max_binding_bytes: u64,
    /// Required alignment of a bound range's offset.
    pub offset_alignment: u64,
    /// Largest single allocation.
    pub max_buffer_bytes: u64,
}

impl Runtime {
    fn new(config: &ContextConfig) -> GpuResult<Self> {
        let context = GPUContext::new(config)?;
        let device_limits = context.device.limits();
        let limits = config
            .dispatch_limits
            .clamped_to(device_limits.max_compute_workgroups_per_dimension);
        let transfer = TransferLimits {
            max_binding_bytes: u64::from(device_limits.max_storage_buffer_binding_size)
                .min(config.max_conversion_binding),
            offset_alignment: u64::from(device_limits.min_storage_buffer_offset_alignment),
            max_buffer_bytes: device_limits.max_buffer_size,
        };
        log::debug!("transfer limits: {transfer:?}");

        Ok(Self {
            context,
            conversions: PipelineCache::new(),
            limits,
            packing: config.packing,
            readback_timeout: config.readback_timeout,
            transfer,
        })
    }
}

type Task = Box<dyn FnOnce(&mut Runtime) + Send + 'static>;

struct TaskQueue {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct Shared {
    queue: Mutex<TaskQueue>,
    ready: Condvar,
}

/// Owner of the device thread and its task queue.

pub(crate) struct DeviceExecutor {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl DeviceExecutor {

    /// Starts the device thread.
    ///
    /// The thread initializes the device first and reports the outcome
    /// through `on_ready` before serving any task. If initialization fails
    /// the queue is closed and already-queued tasks are dropped.
    ///
    /// ## Errors
    /// [`ExecutorError::SpawnFailed`] if the OS refuses the thread.

    pub fn spawn(
        config: ContextConfig,
        on_ready: impl FnOnce(GpuResult<DeviceCapabilities>) + Send + 'static,
    ) -> Result<Self, ExecutorError> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(TaskQueue { tasks: VecDeque::new(), closed: false }),
            ready: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("{}-device", config.label))
            .spawn(move || worker_main(worker_shared, config, on_ready))
            .map_err(|e| {
                log::error!("failed to spawn device thread: {e}");
                ExecutorError::SpawnFailed
            })?;

        let worker_id = handle.thread().id();
        Ok(Self { shared, worker: Mutex::new(Some(handle)), worker_id })
    }

    /// Queues `task` and returns immediately.
    ///
    /// ## Errors
    /// [`ExecutorError::ShutDown`] once the queue is closed; the task is
    /// dropped without running.

    pub fn submit(
        &self,
        task: impl FnOnce(&mut Runtime) + Send + 'static,
    ) -> Result<(), ExecutorError> {
        {
            let mut queue = self
                .shared
                .queue
                .lock()
                .map_err(|_| ExecutorError::LockPoisoned { what: "device task queue" })?;
            if queue.closed {
                return Err(ExecutorError::ShutDown);
            }
            queue.tasks.push_back(Box::new(task));
        }
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Queues `task` and blocks until it has run.
    ///
    /// ## Errors
    /// * [`ExecutorError::Reentrant`] when called from the device thread,
    ///   which would otherwise wait on itself forever.
    /// * [`ExecutorError::ShutDown`] if the queue is closed.
    /// * [`ExecutorError::TaskDropped`] if the task was dropped or panicked.
    /// * Whatever error `task` itself returns.

    pub fn run_blocking<R: Send + 'static>(
        &self,
        task: impl FnOnce(&mut Runtime) -> GpuResult<R> + Send + 'static,
    ) -> GpuResult<R> {
        if self.on_worker() {
            return Err(ExecutorError::Reentrant.into());
        }

        let (tx, rx) = mpsc::sync_channel(1);
        self.submit(move |runtime| {
            let _ = tx.send(task(runtime));
        })?;
        rx.recv()?
    }

    /// `true` when the calling thread is the device thread.
    #[inline]
    pub fn on_worker(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// `true` once the queue is closed.
    pub fn is_shut_down(&self) -> bool {
        self.shared
            .queue
            .lock()
            .map(|queue| queue.closed)
            .unwrap_or(true)
    }

    /// Closes the queue and waits for the worker to drain it.
    ///
    /// Called from the device thread itself (for instance by a callback that
    /// drops the last context handle) this only closes the queue; the worker
    /// exits after its current task.

    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.closed = true;
        }
        self.shared.ready.notify_all();

        if self.on_worker() {
            return;
        }

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("device thread terminated with a panic");
            }
        }
    }
}

impl Drop for DeviceExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_main(
    shared: Arc<Shared>,
    config: ContextConfig,
    on_ready: impl FnOnce(GpuResult<DeviceCapabilities>),
) {
    let mut runtime = match Runtime::new(&config) {
        Ok(runtime) => {
            let capabilities = runtime.context.capabilities();
            run_guarded("ready callback", || on_ready(Ok(capabilities)));
            runtime
        }
        Err(e) => {
            log::error!("device initialization failed: {e}");
            let abandoned = {
                let mut queue = shared.queue.lock().unwrap_or_else(PoisonError::into_inner);
                queue.closed = true;
                std::mem::take(&mut queue.tasks)
            };
            if !abandoned.is_empty() {
                log::warn!("dropping {} task(s) queued before initialization failed", abandoned.len());
            }
            drop(abandoned);
            run_guarded("ready callback", || on_ready(Err(e)));
            return;
        }
    };

    while let Some(task) = next_task(&shared) {
        run_guarded("device task", || task(&mut runtime));
    }

    log::debug!("device thread for {} exiting", config.label);
}

fn next_task(shared: &Shared) -> Option<Task> {
    let mut queue = shared.queue.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
        if let Some(task) = queue.tasks.pop_front() {
            return Some(task);
        }
        if queue.closed {
            return None;
        }
        queue = shared.ready.wait(queue).unwrap_or_else(PoisonError::into_inner);
    }
}

fn run_guarded(what: &str, f: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        log::error!("{what} panicked: {}", panic_message(payload.as_ref()));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Completion guard
// ─────────────────────────────────────────────────────────────────────────────

/// One-shot completion callback that always fires exactly once.
///
/// If the guard is dropped without [`complete`](Completion::complete) being
/// called (the task was never run, or it panicked), the callback receives
/// [`ExecutorError::TaskDropped`].

pub(crate) struct Completion<T> {
    callback: Option<Box<dyn FnOnce(GpuResult<T>) + Send + 'static>>,
}

impl<T> Completion<T> {
    pub fn new(callback: impl FnOnce(GpuResult<T>) + Send + 'static) -> Self {
        Self { callback: Some(Box::new(callback)) }
    }

    pub fn complete(mut self, result: GpuResult<T>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Err(ExecutorError::TaskDropped.into()));
        }
    }
}
