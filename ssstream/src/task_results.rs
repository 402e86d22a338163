//! Helper for running a set of fallible async tasks where the first failure wins.
use crate::Result;
use snafu::prelude::*;
use std::future::Future;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Runs submitted tasks concurrently and yields their results in the order they complete.
///
/// As soon as any task fails (or panics), every other task is cancelled and the failure is
/// yielded; nothing is yielded after that.  Tasks can also be cancelled from elsewhere using the
/// token from [`Self::cancellation`], in which case each of them fails with
/// [`crate::StreamUploadError::Aborted`].
pub(crate) struct TaskResults<T> {
    tasks: JoinSet<Result<T>>,
    cancel: CancellationToken,
    failed: bool,
}

impl<T: Send + 'static> TaskResults<T> {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
            failed: false,
        }
    }

    /// Spawn `task` on the current runtime
    pub fn submit<F>(&mut self, task: F)
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let cancel = self.cancel.clone();

        self.tasks.spawn(async move {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => crate::error::AbortedSnafu.fail(),
                result = task => result,
            }
        });
    }

    /// Token which cancels all of the tasks when cancelled
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of tasks which haven't yet been yielded
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for the next task to finish.
    ///
    /// Returns `None` when all tasks have been yielded, or after a failure has been yielded.
    pub async fn next(&mut self) -> Option<Result<T>> {
        if self.failed {
            return None;
        }

        let result = self
            .tasks
            .join_next()
            .await?
            .context(crate::error::WorkerTaskFailedSnafu)
            .and_then(|result| result);

        if result.is_err() {
            self.failed = true;
            self.abort();
        }

        Some(result)
    }

    /// Wait for all tasks to finish, returning their results in completion order, or the first
    /// failure.
    pub async fn await_completion(mut self) -> Result<Vec<T>> {
        let mut results = Vec::with_capacity(self.tasks.len());

        while let Some(result) = self.next().await {
            results.push(result?);
        }

        Ok(results)
    }

    /// Cancel every task which is still running.  Repeated calls have no effect.
    pub fn abort(&mut self) {
        self.cancel.cancel();
        self.tasks.abort_all();
    }
}
