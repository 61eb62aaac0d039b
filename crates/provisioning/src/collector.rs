//! Fan-out/fan-in of concurrently running tasks.
//!
//! [`ushering_to`] opens a scope around a caller-owned `Vec`. Inside the scope
//! the caller submits futures through an [`Usher`] (with
//! [`Usher::submit`] or `usher += future`); each one is spawned immediately and
//! runs concurrently with every other submission and with the rest of the
//! scope body. When the body returns, successfully or not, the scope waits
//! for every submitted task and appends each successful result to the
//! target in the order the tasks *completed*.
//!
//! Failures never cancel siblings. The first failure (by completion order)
//! is returned once everything has drained; later failures are logged at
//! `warn` and dropped.
//!
//! Tasks never outlive the scope. If the scope is left early (the body
//! panics, or the `ushering_to` future is dropped by a timeout or
//! cancellation) every task still running is aborted.
//!
//! There is no concurrency cap here. Callers that need one must bound the
//! submitted futures themselves (e.g. with a semaphore).

use std::any::Any;
use std::future::Future;
use std::ops::AddAssign;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// A submitted task that panicked instead of returning.
///
/// The error type of an [`ushering_to`] scope must be constructible from this
/// so a panic surfaces like any other task failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPanic {
    pub message: String,
}

impl TaskPanic {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked with a non-string payload".to_string()
        };
        Self { message }
    }
}

impl std::fmt::Display for TaskPanic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task panicked: {}", self.message)
    }
}

/// Abort handles of every task spawned in one scope.
///
/// Once closed, late registrations are aborted on arrival.
#[derive(Default)]
struct TaskRegistry {
    closed: bool,
    handles: Vec<AbortHandle>,
}

type SharedRegistry = Arc<Mutex<TaskRegistry>>;

fn lock(registry: &SharedRegistry) -> MutexGuard<'_, TaskRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Aborts whatever is still running when the scope is left.
///
/// After a full drain every handle is already finished and this is a no-op.
struct AbortOnExit(SharedRegistry);

impl Drop for AbortOnExit {
    fn drop(&mut self) {
        let mut registry = lock(&self.0);
        registry.closed = true;
        let mut aborted = 0usize;
        for handle in registry.handles.drain(..) {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!(aborted, "Collector scope left early; aborted unfinished tasks");
        }
    }
}

/// Submission handle for an open [`ushering_to`] scope.
///
/// Clones submit into the same scope, so a task may carry a clone and fan out
/// further work of its own. The scope does not finish draining until every
/// clone has been dropped.
pub struct Usher<T, E> {
    completed: mpsc::UnboundedSender<Result<T, E>>,
    submitted: Arc<AtomicUsize>,
    tasks: SharedRegistry,
}

impl<T, E> Clone for Usher<T, E> {
    fn clone(&self) -> Self {
        Self {
            completed: self.completed.clone(),
            submitted: Arc::clone(&self.submitted),
            tasks: Arc::clone(&self.tasks),
        }
    }
}

impl<T, E> Usher<T, E>
where
    T: Send + 'static,
    E: From<TaskPanic> + Send + 'static,
{
    /// Spawns `task` onto the current tokio runtime.
    ///
    /// The task starts running as soon as the runtime schedules it; on a
    /// current-thread runtime tasks start in submission order.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn submit<F>(&self, task: F)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let seq = self.submitted.fetch_add(1, Ordering::Relaxed);
        let completed = self.completed.clone();
        debug!(task = seq, "Submitted task");
        let handle = tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(E::from(TaskPanic::from_payload(payload))),
            };
            debug!(task = seq, ok = outcome.is_ok(), "Task completed");
            // The receiver lives until every sender (this one included) is gone.
            let _ = completed.send(outcome);
        });

        let mut registry = lock(&self.tasks);
        if registry.closed {
            handle.abort();
        } else {
            registry.handles.push(handle.abort_handle());
        }
    }

    /// Number of tasks submitted through this scope so far, across all clones.
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::Relaxed)
    }
}

impl<T, E, F> AddAssign<F> for Usher<T, E>
where
    T: Send + 'static,
    E: From<TaskPanic> + Send + 'static,
    F: Future<Output = Result<T, E>> + Send + 'static,
{
    fn add_assign(&mut self, task: F) {
        self.submit(task);
    }
}

/// Runs `body` with a fresh [`Usher`], then drains every submitted task into
/// `target`.
///
/// Successful results are appended in completion order. The scope returns:
///
/// - the body's error, if the body failed (task failures are then logged);
/// - otherwise the first task failure by completion order;
/// - otherwise the body's value.
///
/// In every case all submitted tasks have finished before this returns. If
/// the returned future is dropped before completion, or the body panics,
/// unfinished tasks are aborted instead.
pub async fn ushering_to<T, E, B, Fut, R>(target: &mut Vec<T>, body: B) -> Result<R, E>
where
    T: Send + 'static,
    E: From<TaskPanic> + std::fmt::Display + Send + 'static,
    B: FnOnce(Usher<T, E>) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let submitted = Arc::new(AtomicUsize::new(0));
    let tasks = SharedRegistry::default();
    let _abort_on_exit = AbortOnExit(Arc::clone(&tasks));
    let usher = Usher {
        completed: tx,
        submitted: Arc::clone(&submitted),
        tasks,
    };

    let body_outcome = body(usher).await;

    let mut first_failure: Option<E> = None;
    let mut drained = 0usize;
    while let Some(outcome) = rx.recv().await {
        drained += 1;
        match outcome {
            Ok(value) => target.push(value),
            Err(err) if first_failure.is_none() && body_outcome.is_ok() => {
                first_failure = Some(err);
            }
            Err(err) => warn!(error = %err, "Discarding failure after an earlier one"),
        }
    }
    debug!(
        submitted = submitted.load(Ordering::Relaxed),
        drained,
        "Collector scope drained"
    );

    match (body_outcome, first_failure) {
        (Err(err), _) => Err(err),
        (Ok(_), Some(err)) => Err(err),
        (Ok(value), None) => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Failed(&'static str),
        Panicked(String),
    }

    impl From<TaskPanic> for TestError {
        fn from(p: TaskPanic) -> Self {
            Self::Panicked(p.message)
        }
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    async fn after(ms: u64, value: &'static str) -> Result<&'static str, TestError> {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(value)
    }

    async fn fail_after(ms: u64, tag: &'static str) -> Result<&'static str, TestError> {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Err(TestError::Failed(tag))
    }

    #[tokio::test(start_paused = true)]
    async fn results_arrive_in_completion_order() {
        let mut results = Vec::new();
        ushering_to(&mut results, |mut usher| async move {
            usher += after(30, "t1");
            usher += after(10, "t2");
            usher += after(20, "t3");
            Ok::<_, TestError>(())
        })
        .await
        .unwrap();

        assert_eq!(results, vec!["t2", "t3", "t1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_order_is_independent_of_submission_order() {
        let mut forward = Vec::new();
        ushering_to(&mut forward, |usher| async move {
            usher.submit(after(10, "a"));
            usher.submit(after(20, "b"));
            usher.submit(after(30, "c"));
            Ok::<_, TestError>(())
        })
        .await
        .unwrap();

        let mut reversed = Vec::new();
        ushering_to(&mut reversed, |usher| async move {
            usher.submit(after(30, "c"));
            usher.submit(after(20, "b"));
            usher.submit(after(10, "a"));
            Ok::<_, TestError>(())
        })
        .await
        .unwrap();

        assert_eq!(forward, vec!["a", "b", "c"]);
        assert_eq!(reversed, forward);
    }

    #[tokio::test(start_paused = true)]
    async fn first_failure_is_returned_after_siblings_finish() {
        let mut results = Vec::new();
        let outcome = ushering_to(&mut results, |mut usher| async move {
            usher += fail_after(20, "second");
            usher += fail_after(10, "first");
            usher += after(50, "slow");
            Ok::<_, TestError>(())
        })
        .await;

        assert_eq!(outcome, Err(TestError::Failed("first")));
        assert_eq!(results, vec!["slow"]);
    }

    #[tokio::test(start_paused = true)]
    async fn body_failure_still_drains_submitted_tasks() {
        let mut results = Vec::new();
        let outcome: Result<(), TestError> = ushering_to(&mut results, |mut usher| async move {
            usher += after(10, "done");
            usher += fail_after(5, "task");
            Err(TestError::Failed("body"))
        })
        .await;

        assert_eq!(outcome, Err(TestError::Failed("body")));
        assert_eq!(results, vec!["done"]);
    }

    #[tokio::test]
    async fn panicking_task_surfaces_as_error() {
        let mut results: Vec<&'static str> = Vec::new();
        let outcome = ushering_to(&mut results, |usher| async move {
            usher.submit(async {
                if true {
                    panic!("kaboom");
                }
                Ok("unreachable")
            });
            usher.submit(after(0, "fine"));
            Ok::<_, TestError>(())
        })
        .await;

        assert_eq!(outcome, Err(TestError::Panicked("kaboom".to_string())));
        assert_eq!(results, vec!["fine"]);
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_run_while_the_body_continues() {
        let mut results = Vec::new();
        ushering_to(&mut results, |usher| async move {
            usher.submit(after(10, "early"));
            // Long enough for the submitted task to finish before the next submission.
            tokio::time::sleep(Duration::from_millis(50)).await;
            usher.submit(after(1, "late"));
            assert_eq!(usher.submitted(), 2);
            Ok::<_, TestError>(())
        })
        .await
        .unwrap();

        assert_eq!(results, vec!["early", "late"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cloned_usher_can_fan_out_from_inside_a_task() {
        let mut results = Vec::new();
        ushering_to(&mut results, |usher| async move {
            let nested = usher.clone();
            usher.submit(async move {
                nested.submit(after(10, "grandchild"));
                Ok("child")
            });
            Ok::<_, TestError>(())
        })
        .await
        .unwrap();

        assert_eq!(results, vec!["child", "grandchild"]);
    }

    fn flag_after(
        ms: u64,
        flag: &Arc<AtomicBool>,
    ) -> impl Future<Output = Result<&'static str, TestError>> {
        let flag = Arc::clone(flag);
        async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            flag.store(true, Ordering::SeqCst);
            Ok("finished")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_scope_aborts_unfinished_tasks() {
        let ran = Arc::new(AtomicBool::new(false));
        let mut results = Vec::new();

        let outcome = tokio::time::timeout(
            Duration::from_millis(5),
            ushering_to(&mut results, |mut usher| {
                let ran = Arc::clone(&ran);
                async move {
                    usher += flag_after(50, &ran);
                    Ok::<_, TestError>(())
                }
            }),
        )
        .await;
        assert!(outcome.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!ran.load(Ordering::SeqCst));
        assert!(results.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_body_aborts_submitted_tasks() {
        let ran = Arc::new(AtomicBool::new(false));
        let task_flag = Arc::clone(&ran);

        let scope = tokio::spawn(async move {
            let mut results = Vec::new();
            ushering_to(&mut results, |mut usher| async move {
                usher += flag_after(50, &task_flag);
                if true {
                    panic!("body failed");
                }
                Ok::<_, TestError>(())
            })
            .await
        });

        assert!(scope.await.unwrap_err().is_panic());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn empty_scope_returns_body_value() {
        let mut results: Vec<u32> = Vec::new();
        let value = ushering_to(&mut results, |_usher| async { Ok::<_, TestError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(results.is_empty());
    }
}
