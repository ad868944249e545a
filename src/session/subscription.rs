//! Owner-held background listeners.
//!
//! Every long-lived listener is spawned through [`SubscriptionHandle::spawn`] and
//! the handle is stored by whoever owns the listener. Cancelling (or dropping)
//! the handle signals the task through a oneshot; there are no implicit global
//! listeners.
use log::{debug, warn};
use std::future::Future;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

pub struct SubscriptionHandle {
    name: &'static str,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Spawn `body`, handing it the shutdown receiver it must select on.
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(body(rx));
        debug!("Subscription '{}' started", name);
        Self {
            name,
            shutdown: Some(tx),
            task: Some(task),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Signal the task and wait (bounded) for it to exit.
    pub async fn cancel(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            match timeout(Duration::from_secs(2), task).await {
                Ok(_) => debug!("Subscription '{}' stopped", self.name),
                Err(_) => warn!("Subscription '{}' did not stop within 2s", self.name),
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
