//! Serializing executor
//!
//! Every mutation of the queue helper's state flows through one dispatcher:
//! an unbounded channel of jobs drained by a single task. External inputs
//! (client calls, network frames, timers, observer callbacks) post jobs and
//! return immediately; jobs from one source run in source order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A unit of work executed with exclusive access to the state
pub type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Handle used to post work onto the dispatcher from any thread
pub struct DispatcherHandle<S> {
    tx: mpsc::UnboundedSender<Job<S>>,
    stopped: Arc<AtomicBool>,
}

impl<S> Clone for DispatcherHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<S: Send + 'static> DispatcherHandle<S> {
    /// Post a job; silently dropped once the dispatcher has stopped
    pub fn post(&self, job: impl FnOnce(&mut S) + Send + 'static) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let _ = self.tx.send(Box::new(job));
    }

    /// Stop the dispatcher after the jobs already queued have run
    pub fn stop(&self) {
        let stopped = self.stopped.clone();
        let _ = self.tx.send(Box::new(move |_state: &mut S| {
            stopped.store(true, Ordering::Release);
        }));
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Receiving half of a dispatcher, consumed by [`run`]
pub struct JobReceiver<S> {
    rx: mpsc::UnboundedReceiver<Job<S>>,
    stopped: Arc<AtomicBool>,
}

/// Create a dispatcher channel without starting the drain task.
///
/// Lets the state embed its own handle before the loop starts; pair with
/// [`run`].
pub fn channel<S>() -> (DispatcherHandle<S>, JobReceiver<S>) {
    let (tx, rx) = mpsc::unbounded_channel::<Job<S>>();
    let stopped = Arc::new(AtomicBool::new(false));
    let handle = DispatcherHandle {
        tx,
        stopped: stopped.clone(),
    };
    (handle, JobReceiver { rx, stopped })
}

/// Drive the dispatcher loop owning `state` on a spawned task
pub fn run<S: Send + 'static>(receiver: JobReceiver<S>, mut state: S) -> tokio::task::JoinHandle<()> {
    let JobReceiver { mut rx, stopped } = receiver;
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            job(&mut state);
            if stopped.load(Ordering::Acquire) {
                break;
            }
        }
        debug!("dispatcher stopped");
    })
}

/// Spawn the dispatcher task owning `state`.
///
/// The returned handle is the only way to reach the state; dropping every
/// handle (or calling [`DispatcherHandle::stop`]) terminates the task.
pub fn spawn<S: Send + 'static>(state: S) -> DispatcherHandle<S> {
    let (handle, receiver) = channel();
    run(receiver, state);
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_jobs_run_in_post_order() {
        let handle = spawn(Vec::<u32>::new());
        for i in 0..10 {
            handle.post(move |v| v.push(i));
        }

        let (tx, rx) = oneshot::channel();
        handle.post(move |v| {
            let _ = tx.send(v.clone());
        });
        let seen = rx.await.unwrap();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_stop_drops_later_jobs() {
        let handle = spawn(0u32);
        handle.post(|n| *n += 1);
        handle.stop();

        // wait for the stop to take effect
        while !handle.is_stopped() {
            tokio::task::yield_now().await;
        }
        handle.post(|n| *n += 100); // dropped

        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn test_posts_from_many_tasks_all_run() {
        let handle = spawn(0u32);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..100 {
                    handle.post(|n| *n += 1);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let (tx, rx) = oneshot::channel();
        handle.post(move |n| {
            let _ = tx.send(*n);
        });
        assert_eq!(rx.await.unwrap(), 800);
    }
}
