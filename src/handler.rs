//! Handlers and the contexts they execute in.
//!
//! A [`Handler`] is either blocking (a plain closure) or async (a closure
//! returning a future). Async handlers are awaited on the runtime. Blocking
//! handlers are handed to an [`ExecutionContext`] chosen at registration:
//!
//! - [`BlockingPool`] (the default) runs them on tokio's blocking threads,
//!   bounded by a semaphore, so slow handlers never stall message intake.
//! - [`Inline`] runs them directly on the calling task, for cheap handlers
//!   that never block.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;

use crate::envelope::CallRequest;
use crate::error::FunctionError;

/// Result of one handler invocation.
pub type HandlerResult = Result<Value, FunctionError>;

/// Boxed future yielding a [`HandlerResult`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'static>>;

/// A blocking unit of work handed to an [`ExecutionContext`].
pub type UnitOfWork = Box<dyn FnOnce() -> HandlerResult + Send + 'static>;

type BlockingFn = dyn Fn(CallRequest) -> HandlerResult + Send + Sync;
type AsyncFn = dyn Fn(CallRequest) -> HandlerFuture + Send + Sync;

/// Default bound on concurrently running blocking handlers.
pub const DEFAULT_BLOCKING_CONCURRENCY: usize = 64;

/// A callable registered under a function name.
#[derive(Clone)]
pub enum Handler {
    Blocking(Arc<BlockingFn>),
    Async(Arc<AsyncFn>),
}

impl Handler {
    /// Wrap a synchronous closure.
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(CallRequest) -> HandlerResult + Send + Sync + 'static,
    {
        Handler::Blocking(Arc::new(f))
    }

    /// Wrap an async closure.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(CallRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Handler::Async(Arc::new(move |request| Box::pin(f(request))))
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, Handler::Blocking(_))
    }

    /// Run the handler once.
    ///
    /// Panics are caught and reported as `HandlerPanic` errors.
    pub fn invoke(&self, request: CallRequest, execution: &dyn ExecutionContext) -> HandlerFuture {
        match self {
            Handler::Blocking(f) => {
                let f = Arc::clone(f);
                execution.run(Box::new(move || f(request)))
            }
            Handler::Async(f) => {
                let future = f(request);
                Box::pin(async move {
                    match tokio::spawn(future).await {
                        Ok(result) => result,
                        Err(e) => Err(FunctionError::panicked(e.to_string())),
                    }
                })
            }
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Blocking(_) => f.write_str("Handler::Blocking"),
            Handler::Async(_) => f.write_str("Handler::Async"),
        }
    }
}

/// Where a blocking handler runs.
pub trait ExecutionContext: Send + Sync {
    /// Run this unit of work and return its result or error.
    fn run(&self, work: UnitOfWork) -> HandlerFuture;
}

/// Runs work directly on the calling task.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inline;

impl ExecutionContext for Inline {
    fn run(&self, work: UnitOfWork) -> HandlerFuture {
        Box::pin(async move {
            catch_unwind(AssertUnwindSafe(work))
                .unwrap_or_else(|panic| Err(FunctionError::panicked(panic_message(&*panic))))
        })
    }
}

/// Runs work on tokio's blocking thread pool, at most `N` at a time.
#[derive(Debug, Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
}

impl BlockingPool {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for BlockingPool {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKING_CONCURRENCY)
    }
}

impl ExecutionContext for BlockingPool {
    fn run(&self, work: UnitOfWork) -> HandlerFuture {
        let permits = Arc::clone(&self.permits);
        Box::pin(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| FunctionError::panicked("blocking pool closed"))?;
            match tokio::task::spawn_blocking(work).await {
                Ok(result) => result,
                Err(e) => Err(FunctionError::panicked(e.to_string())),
            }
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
