use tokio::sync::watch;

/// Initiates an orderly shutdown of all holders of a [`ShutdownHandle`].
///
/// Dropping the controller has the same effect as calling
/// [`shutdown`](Self::shutdown), so a task that owns the controller cannot
/// leave the rest of the system running by accident.
#[derive(Debug)]
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    /// Creates a new controller in the running state.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Creates a handle observing this controller.
    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            rx: self.tx.subscribe(),
        }
    }

    /// Signals shutdown to every handle.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observes a [`ShutdownController`].
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    rx: watch::Receiver<bool>,
}

impl ShutdownHandle {
    /// Waits until shutdown is signaled.
    ///
    /// Also resolves when the controller is dropped.
    pub async fn notified(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Returns `true` if shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }
}
