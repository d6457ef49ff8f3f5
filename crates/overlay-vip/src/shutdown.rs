use std::future;

use tokio::sync::watch;

/// Process shutdown signal shared by the upstream clients.
///
/// Without a receiver the signal never fires. A dropped sender is treated
/// the same way: only an explicit `true` cancels.
#[derive(Debug, Clone, Default)]
pub(crate) struct Shutdown(Option<watch::Receiver<bool>>);

impl Shutdown {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self(Some(rx))
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.0.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once shutdown has been requested.
    pub(crate) async fn triggered(&self) {
        let Some(rx) = &self.0 else {
            return future::pending().await;
        };

        let mut rx = rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return future::pending().await;
            }
        }
    }
}
