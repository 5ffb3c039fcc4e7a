use tokio::sync::watch;

/// Receiving side of a cooperative shutdown.
///
/// Every clone observes the same signal, including clones created after the
/// signal was sent. Dropping the [`ShutdownSender`] counts as a shutdown.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> (ShutdownSender, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (ShutdownSender(tx), ShutdownSignal { rx })
    }

    /// Wait until shutdown is requested.
    pub async fn recv(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }
}

#[derive(Debug)]
pub struct ShutdownSender(watch::Sender<bool>);

impl ShutdownSender {
    pub fn send_signal(self) {
        let _ = self.0.send(true);
    }
}
