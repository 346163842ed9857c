//! Cooperative shutdown of the indexer loop.

use tokio::sync::watch;

/// Creates a connected trigger and shutdown token pair.
pub fn channel() -> (Trigger, Shutdown) {
    let (sender, receiver) = watch::channel(false);
    (Trigger(sender), Shutdown(receiver))
}

/// Requests a shutdown.
#[derive(Debug)]
pub struct Trigger(watch::Sender<bool>);

impl Trigger {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

/// Observes shutdown requests. Dropping the [`Trigger`] also counts as a
/// request.
#[derive(Clone, Debug)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub fn requested(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }

    /// Resolves once a shutdown was requested.
    pub async fn wait(&mut self) {
        // An error means the trigger is gone.
        let _ = self.0.wait_for(|requested| *requested).await;
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::time::Duration, tokio::time};

    #[tokio::test]
    async fn resolves_on_trigger() {
        let (trigger, mut shutdown) = channel();
        assert!(!shutdown.requested());

        let waiter = tokio::spawn({
            let mut shutdown = shutdown.clone();
            async move { shutdown.wait().await }
        });
        trigger.shutdown();
        time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        assert!(shutdown.requested());
        shutdown.wait().await;
    }

    #[tokio::test]
    async fn resolves_when_trigger_is_dropped() {
        let (trigger, mut shutdown) = channel();
        drop(trigger);

        assert!(shutdown.requested());
        time::timeout(Duration::from_secs(1), shutdown.wait())
            .await
            .unwrap();
    }
}
