use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Notify};

use crate::error::Error;

/// Supervises background tasks and coordinates graceful shutdown.
///
/// Tasks are spawned through the stopper so that [`Stopper::stop`] can
/// signal quiescence and wait for every outstanding task to finish. Once
/// stopping, new tasks are refused with [`Error::Stopped`].
#[derive(Clone, Debug)]
pub struct Stopper {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    quiesce: watch::Sender<bool>,
    pending: AtomicUsize,
    drained: Notify,
}

struct TaskGuard(Arc<Inner>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

impl Default for Stopper {
    fn default() -> Self {
        let (quiesce, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                quiesce,
                pending: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }
}

impl Stopper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a supervised task. Fails once the stopper is quiescing.
    pub fn run_async_task<F>(&self, task: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_quiescing() {
            return Err(Error::Stopped);
        }
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        let guard = TaskGuard(Arc::clone(&self.inner));
        tokio::spawn(async move {
            let _guard = guard;
            task.await;
        });
        Ok(())
    }

    pub fn is_quiescing(&self) -> bool {
        *self.inner.quiesce.borrow()
    }

    /// Resolves once shutdown has been requested. Long-running tasks
    /// select on this to abandon their work.
    pub async fn should_quiesce(&self) {
        let mut rx = self.inner.quiesce.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Signals quiescence and waits for all supervised tasks to finish.
    pub async fn stop(&self) {
        self.inner.quiesce.send_replace(true);
        loop {
            let drained = self.inner.drained.notified();
            if self.inner.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }
}
