//! Task scheduling and id generation
//!
//! Endpoints never spawn on their own. Every background task (sending loop,
//! channel readers, timers) goes through an injected [`Scheduler`], and
//! every generated id through an [`IdGenerator`].

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::error::{Result, TrapError};

pub type Task = BoxFuture<'static, ()>;

/// Runs tasks now or after a delay
pub trait Scheduler: Send + Sync + 'static {
    fn execute(&self, task: Task);

    /// Run `task` once `delay` has passed, unless cancelled first
    fn execute_after(&self, delay: Duration, task: Task) -> TaskHandle;
}

/// Cancellation handle of a delayed task
#[derive(Clone, Default)]
pub struct TaskHandle {
    abort: Option<AbortHandle>,
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn from_abort(abort: AbortHandle) -> Self {
        Self {
            abort: Some(abort),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wrap `task` so that it does nothing once the returned handle is
    /// cancelled. For schedulers without native cancellation.
    pub fn guard(task: Task) -> (Self, Task) {
        let handle = Self::default();
        let cancelled = handle.cancelled.clone();
        let task: Task = Box::pin(async move {
            if !cancelled.load(Ordering::SeqCst) {
                task.await;
            }
        });
        (handle, task)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Scheduler backed by the tokio runtime it was created in
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler for the runtime the caller is running in
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| TrapError::NoRuntime)
    }
}

impl Scheduler for TokioScheduler {
    fn execute(&self, task: Task) {
        self.handle.spawn(task);
    }

    fn execute_after(&self, delay: Duration, task: Task) -> TaskHandle {
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        TaskHandle::from_abort(join.abort_handle())
    }
}

/// Source of session and peer ids
pub trait IdGenerator: Send + Sync + 'static {
    fn generate(&self) -> String;
}

/// Random v4 UUIDs
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_execute_after_runs() {
        let scheduler = TokioScheduler::current().unwrap();
        let ran = Arc::new(AtomicU32::new(0));
        let counter = ran.clone();
        scheduler.execute_after(
            Duration::from_millis(5),
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_task_never_runs() {
        let scheduler = TokioScheduler::current().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let handle = scheduler.execute_after(
            Duration::from_millis(20),
            Box::pin(async move { flag.store(true, Ordering::SeqCst) }),
        );
        handle.cancel();
        assert!(handle.is_cancelled());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_guarded_task() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let (handle, task) =
            TaskHandle::guard(Box::pin(async move { flag.store(true, Ordering::SeqCst) }));
        handle.cancel();
        task.await;
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_no_runtime() {
        assert!(matches!(TokioScheduler::current(), Err(TrapError::NoRuntime)));
    }

    #[test]
    fn test_uuid_ids_are_unique() {
        let ids = UuidGenerator;
        assert_ne!(ids.generate(), ids.generate());
        assert_eq!(ids.generate().len(), 36);
    }
}
