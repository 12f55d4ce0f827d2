use std::future::Future;
use std::time::Instant;

use tokio::task::JoinHandle;

/// Execute a callback on dropping of the container type.
///
/// The callback must not panic under any circumstance. Since it is called while dropping an item,
/// this might result in aborting program execution.
pub struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CallOnDrop {
    /// Creates a new `CallOnDrop`.
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }

    /// Disarms the guard so that the callback never runs.
    pub fn disarm(mut self) {
        self.f.take();
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

/// A handle to a spawned task which aborts the task when dropped.
///
/// Background tasks owned by a service should not outlive it. Holding on to this handle ties the
/// lifetime of the task to the lifetime of the handle.
#[derive(Debug)]
pub struct CancelOnDrop<T> {
    handle: JoinHandle<T>,
}

impl<T> CancelOnDrop<T> {
    pub fn new(handle: JoinHandle<T>) -> Self {
        Self { handle }
    }

    /// Whether the underlying task has already run to completion (or was aborted).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Drop for CancelOnDrop<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// State of the [`MeasureGuard`].
#[derive(Clone, Copy, Debug)]
enum MeasureState {
    /// The future is not ready.
    Pending,
    /// The future has terminated with a status.
    Done(&'static str),
}

/// A guard to [`measure`] the execution of futures.
struct MeasureGuard<'a> {
    state: MeasureState,
    task_name: &'a str,
    creation_time: Instant,
}

impl<'a> MeasureGuard<'a> {
    fn new(task_name: &'a str) -> Self {
        Self {
            state: MeasureState::Pending,
            task_name,
            creation_time: Instant::now(),
        }
    }

    fn done(mut self, status: &'static str) {
        self.state = MeasureState::Done(status);
    }
}

impl Drop for MeasureGuard<'_> {
    fn drop(&mut self) {
        let status = match self.state {
            MeasureState::Pending => "canceled",
            MeasureState::Done(status) => status,
        };

        metric!(
            timer(self.task_name) = self.creation_time.elapsed(),
            "status" => status,
        );
    }
}

/// Measures the timing of a future and reports it as a timer metric named `task_name`.
///
/// The metric is tagged with a status derived with the `get_status` function, or `"canceled"` if
/// the future was dropped before it completed. See the [`m`] module for status helpers.
pub fn measure<'a, S, F>(
    task_name: &'a str,
    get_status: S,
    f: F,
) -> impl Future<Output = F::Output> + 'a
where
    F: 'a + Future,
    S: 'a + FnOnce(&F::Output) -> &'static str,
{
    let guard = MeasureGuard::new(task_name);

    async move {
        let output = f.await;
        guard.done(get_status(&output));
        output
    }
}

/// Status helpers for [`measure`].
pub mod m {
    use crate::caching::CacheError;

    /// Creates a status derived from a cache result:
    ///
    ///  - `"ok"` if the load resolved to `Ok(_)`
    ///  - `"cancelled"` if the load was cancelled
    ///  - `"err"` for any other error
    pub fn cache_result<T>(result: &Result<T, CacheError>) -> &'static str {
        match result {
            Ok(_) => "ok",
            Err(CacheError::LoadCancelled) => "cancelled",
            Err(_) => "err",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_call_on_drop() {
        let calls = Arc::new(AtomicUsize::new(0));

        {
            let calls = Arc::clone(&calls);
            let _guard = CallOnDrop::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let guard = {
            let calls = Arc::clone(&calls);
            CallOnDrop::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        guard.disarm();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_on_drop() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = CancelOnDrop::new(tokio::spawn(async move {
            // keeps the sender alive until the task is aborted
            let _tx = tx;
            std::future::pending::<()>().await;
        }));
        assert!(!handle.is_finished());

        drop(handle);
        // the sender is dropped once the task is aborted
        assert!(rx.await.is_err());
    }
}
