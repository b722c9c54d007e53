use std::sync::{
    atomic::{AtomicBool, Ordering::SeqCst},
    Arc,
};
use std::time::Duration;
use tokio::{select, sync::Notify, time::sleep};

/// Session wide stop flag shared by every task.
///
/// Loops check [`StopSignal::is_stopped`] on each iteration; long waits go through
/// [`StopSignal::sleep`] so they end as soon as the flag is raised.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(SeqCst)
    }

    /// Sleep for `period`. Returns false if the signal fired before or during the wait.
    pub async fn sleep(&self, period: Duration) -> bool {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // register before checking the flag, notify_waiters only wakes registered waiters
        notified.as_mut().enable();

        if self.is_stopped() {
            return false;
        }

        select! {
            _ = &mut notified => false,
            _ = sleep(period) => !self.is_stopped(),
        }
    }
}
