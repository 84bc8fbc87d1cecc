use crate::core_error::FtpError;
use log::{debug, info, warn};
use std::future::Future;
use std::thread::JoinHandle;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;

/// The single reactor thread owning every socket and timer of the engine.
///
/// Workers and connections run as tasks on a current-thread runtime, so no FTP
/// logic ever runs on more than one thread. Foreground code reaches the reactor
/// through [`Dispatcher::spawn`] or the blocking [`Dispatcher::call`].
pub struct Dispatcher {
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn start() -> Result<Self, FtpError> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("rouilleftp-dispatcher".into())
            .spawn(move || {
                debug!("Dispatcher thread started");
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                // Pending tasks are dropped with the runtime, closing their sockets.
                runtime.shutdown_background();
                debug!("Dispatcher thread stopped");
            })?;

        info!("Dispatcher running");
        Ok(Self {
            handle,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Runs `future` on the reactor and blocks the calling thread until it completes.
    ///
    /// This is the only rendezvous between a foreground thread and the reactor.
    /// Calling it from inside the reactor would deadlock, so it is refused.
    pub fn call<F, T>(&self, future: F) -> Result<T, FtpError>
    where
        F: Future<Output = Result<T, FtpError>> + Send + 'static,
        T: Send + 'static,
    {
        if Handle::try_current().is_ok() {
            return Err(FtpError::CalledFromDispatcher);
        }
        let (tx, rx) = oneshot::channel();
        self.handle.spawn(async move {
            let _ = tx.send(future.await);
        });
        rx.blocking_recv().map_err(|_| FtpError::DispatcherGone)?
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Dispatcher thread panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_call_returns_result() {
        let dispatcher = Dispatcher::start().unwrap();
        let value = dispatcher
            .call(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(42)
            })
            .unwrap();
        assert_eq!(value, 42);
        dispatcher.shutdown();
    }

    #[test]
    fn test_call_propagates_error() {
        let dispatcher = Dispatcher::start().unwrap();
        let result: Result<(), _> = dispatcher.call(async { Err(FtpError::NotConnected) });
        assert!(matches!(result, Err(FtpError::NotConnected)));
    }

    #[tokio::test]
    async fn test_call_from_runtime_is_refused() {
        let dispatcher = Dispatcher::start().unwrap();
        let result = dispatcher.call(async { Ok(()) });
        assert!(matches!(result, Err(FtpError::CalledFromDispatcher)));
        // Joining the reactor thread from a runtime is fine, it exits promptly.
        dispatcher.shutdown();
    }
}
