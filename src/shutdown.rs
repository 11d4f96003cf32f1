use tokio::sync::watch;

/// Process-wide shutdown fan-out. One controller lives in the composition
/// root; every background task holds a [`ShutdownSignal`] and selects on
/// `recv()` next to its main work arm.
#[derive(Clone)]
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Flip the flag. Idempotent; every subscriber wakes at most once.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    /// Resolves once shutdown is triggered. Safe to call repeatedly; after
    /// the trigger it resolves immediately.
    pub async fn recv(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        // Err means the controller is gone, which also means shutdown.
        let _ = self.rx.wait_for(|v| *v).await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_wakes_all_subscribers() {
        let ctl = ShutdownController::new();
        let mut a = ctl.subscribe();
        let mut b = ctl.subscribe();

        ctl.trigger();
        tokio::time::timeout(Duration::from_secs(1), a.recv())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), b.recv())
            .await
            .unwrap();
        assert!(ctl.is_triggered());
    }

    #[tokio::test]
    async fn recv_after_trigger_is_immediate() {
        let ctl = ShutdownController::new();
        ctl.trigger();
        let mut s = ctl.subscribe();
        tokio::time::timeout(Duration::from_millis(50), s.recv())
            .await
            .unwrap();
        assert!(s.is_triggered());
    }
}
