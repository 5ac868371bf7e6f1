//! Lifecycle controller shared by the server driver and whoever launched it.
//!
//! The driver is the only writer of the start and close outcomes; any number
//! of callers may wait on them from async tasks or plain threads. Each outcome
//! is recorded exactly once, and a second attempt is reported as a
//! [`ControllerError`] instead of being ignored.

use crate::error::{ControllerError, StartError};
use parking_lot::{Condvar, Mutex};
use std::net::SocketAddr;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Where a server run currently is.
///
/// ```text
/// NotStarted -> Starting -> Running -> Stopping -> Stopped
///                       \-> StartFailed ---------> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    /// The driver has not been launched.
    #[default]
    NotStarted,
    /// The driver is validating configuration and binding.
    Starting,
    /// The listener is accepting connections.
    Running,
    /// A stop was requested; connections are draining.
    Stopping,
    /// Startup failed; resources are being released.
    StartFailed,
    /// Everything has been released.
    Stopped,
}

impl LifecycleState {
    /// Returns true once the run has fully ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Stopped)
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: LifecycleState,
    start: Option<Result<SocketAddr, StartError>>,
    closed: bool,
    stop_requested: bool,
}

impl Inner {
    fn check_start_signal(&self, to: LifecycleState) -> Result<(), ControllerError> {
        if self.closed {
            return Err(ControllerError::AlreadyClosed);
        }
        if self.start.is_some() {
            return Err(ControllerError::StartAlreadySignaled);
        }
        if self.state != LifecycleState::Starting {
            return Err(ControllerError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        Ok(())
    }
}

/// Start/stop coordination for one server run.
///
/// Create one per run, share it through an `Arc`, and hand it to
/// [`crate::serve`].
#[derive(Debug, Default)]
pub struct ServerController {
    inner: Mutex<Inner>,
    /// Wakes blocking waiters.
    changed: Condvar,
    /// Wakes async waiters.
    notify: Notify,
    stop: CancellationToken,
}

impl ServerController {
    /// Creates a controller for a run that has not been launched yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state.
    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    /// Marks the run as launched.
    ///
    /// Fails if this controller was already used for a run.
    pub fn begin_start(&self) -> Result<(), ControllerError> {
        let mut inner = self.inner.lock();
        if inner.state != LifecycleState::NotStarted || inner.closed {
            return Err(violation(ControllerError::InvalidTransition {
                from: inner.state,
                to: LifecycleState::Starting,
            }));
        }
        inner.state = LifecycleState::Starting;
        Ok(())
    }

    /// Records that the listener is bound at `addr`.
    pub fn signal_started(&self, addr: SocketAddr) -> Result<(), ControllerError> {
        let mut inner = self.inner.lock();
        inner
            .check_start_signal(LifecycleState::Running)
            .map_err(violation)?;
        inner.start = Some(Ok(addr));
        inner.state = if inner.stop_requested {
            LifecycleState::Stopping
        } else {
            LifecycleState::Running
        };
        drop(inner);

        self.wake();
        Ok(())
    }

    /// Records that the server could not start.
    pub fn signal_start_failed(&self, reason: StartError) -> Result<(), ControllerError> {
        let mut inner = self.inner.lock();
        inner
            .check_start_signal(LifecycleState::StartFailed)
            .map_err(violation)?;
        inner.start = Some(Err(reason));
        inner.state = LifecycleState::StartFailed;
        drop(inner);

        self.wake();
        Ok(())
    }

    /// Asks the driver to shut down.
    ///
    /// Idempotent, and safe to call before startup has completed.
    pub fn request_stop(&self) {
        let mut inner = self.inner.lock();
        let first = !inner.stop_requested;
        inner.stop_requested = true;
        if inner.state == LifecycleState::Running {
            inner.state = LifecycleState::Stopping;
        }
        drop(inner);

        if first {
            debug!("server stop requested");
        }
        self.stop.cancel();
    }

    /// Returns true once [`request_stop`](Self::request_stop) was called.
    pub fn is_stop_requested(&self) -> bool {
        self.inner.lock().stop_requested
    }

    /// Resolves once a stop has been requested.
    pub async fn stop_requested(&self) {
        self.stop.cancelled().await;
    }

    /// Records that the listener and all connection tasks are gone.
    ///
    /// If no start outcome was recorded, a failed start is recorded first so
    /// that start waiters are released too.
    pub fn signal_closed(&self) -> Result<(), ControllerError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(violation(ControllerError::AlreadyClosed));
        }
        if inner.start.is_none() {
            inner.start = Some(Err(StartError::Aborted(
                "server closed before startup completed".into(),
            )));
        }
        inner.closed = true;
        inner.state = LifecycleState::Stopped;
        drop(inner);

        self.wake();
        Ok(())
    }

    /// Waits for the start outcome.
    ///
    /// Returns the bound address, or why the server did not start.
    pub async fn wait_for_start(&self) -> Result<SocketAddr, StartError> {
        self.wait_until(|inner| inner.start.clone()).await
    }

    /// Blocking variant of [`wait_for_start`](Self::wait_for_start).
    ///
    /// Must not be called from inside an async task.
    pub fn blocking_wait_for_start(&self) -> Result<SocketAddr, StartError> {
        self.block_until(|inner| inner.start.clone())
    }

    /// Waits until every resource of the run has been released.
    pub async fn wait_for_close(&self) {
        self.wait_until(|inner| inner.closed.then_some(())).await;
    }

    /// Blocking variant of [`wait_for_close`](Self::wait_for_close).
    ///
    /// Must not be called from inside an async task.
    pub fn blocking_wait_for_close(&self) {
        self.block_until(|inner| inner.closed.then_some(()));
    }

    async fn wait_until<T>(&self, probe: impl Fn(&Inner) -> Option<T>) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before probing so a wake between the two is not lost.
            notified.as_mut().enable();

            let ready = probe(&*self.inner.lock());
            if let Some(value) = ready {
                return value;
            }
            notified.await;
        }
    }

    fn block_until<T>(&self, probe: impl Fn(&Inner) -> Option<T>) -> T {
        let mut inner = self.inner.lock();
        loop {
            if let Some(value) = probe(&*inner) {
                return value;
            }
            self.changed.wait(&mut inner);
        }
    }

    fn wake(&self) {
        self.changed.notify_all();
        self.notify.notify_waiters();
    }
}

fn violation(err: ControllerError) -> ControllerError {
    error!(error = %err, "lifecycle controller misused");
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "127.0.0.1:15200".parse().unwrap()
    }

    #[test]
    fn successful_run_transitions() {
        let controller = ServerController::new();
        assert_eq!(controller.state(), LifecycleState::NotStarted);

        controller.begin_start().unwrap();
        assert_eq!(controller.state(), LifecycleState::Starting);

        controller.signal_started(addr()).unwrap();
        assert_eq!(controller.state(), LifecycleState::Running);
        assert_eq!(controller.blocking_wait_for_start(), Ok(addr()));

        controller.request_stop();
        assert_eq!(controller.state(), LifecycleState::Stopping);

        controller.signal_closed().unwrap();
        assert_eq!(controller.state(), LifecycleState::Stopped);
        assert!(controller.state().is_terminal());
        controller.blocking_wait_for_close();
    }

    #[test]
    fn failed_start_transitions() {
        let controller = ServerController::new();
        controller.begin_start().unwrap();
        controller
            .signal_start_failed(StartError::PortInUse { addr: addr() })
            .unwrap();

        assert_eq!(controller.state(), LifecycleState::StartFailed);
        assert_eq!(
            controller.blocking_wait_for_start(),
            Err(StartError::PortInUse { addr: addr() })
        );

        controller.signal_closed().unwrap();
        assert_eq!(controller.state(), LifecycleState::Stopped);
    }

    #[test]
    fn double_start_signal_is_rejected() {
        let controller = ServerController::new();
        controller.begin_start().unwrap();
        controller.signal_started(addr()).unwrap();

        assert_eq!(
            controller.signal_started(addr()),
            Err(ControllerError::StartAlreadySignaled)
        );
        assert_eq!(
            controller.signal_start_failed(StartError::Cancelled),
            Err(ControllerError::StartAlreadySignaled)
        );
        // The first outcome stands.
        assert_eq!(controller.blocking_wait_for_start(), Ok(addr()));
    }

    #[test]
    fn signals_after_close_are_rejected() {
        let controller = ServerController::new();
        controller.begin_start().unwrap();
        controller.signal_closed().unwrap();

        assert_eq!(
            controller.signal_started(addr()),
            Err(ControllerError::AlreadyClosed)
        );
        assert_eq!(controller.signal_closed(), Err(ControllerError::AlreadyClosed));
    }

    #[test]
    fn signal_before_launch_is_rejected() {
        let controller = ServerController::new();
        assert_eq!(
            controller.signal_started(addr()),
            Err(ControllerError::InvalidTransition {
                from: LifecycleState::NotStarted,
                to: LifecycleState::Running,
            })
        );
    }

    #[test]
    fn controller_cannot_be_reused() {
        let controller = ServerController::new();
        controller.begin_start().unwrap();
        assert!(controller.begin_start().is_err());
    }

    #[test]
    fn close_without_start_outcome_releases_start_waiters() {
        let controller = ServerController::new();
        controller.begin_start().unwrap();
        controller.signal_closed().unwrap();

        assert!(matches!(
            controller.blocking_wait_for_start(),
            Err(StartError::Aborted(_))
        ));
    }

    #[test]
    fn request_stop_is_idempotent() {
        let controller = ServerController::new();
        controller.request_stop();
        controller.request_stop();
        assert!(controller.is_stop_requested());
        assert_eq!(controller.state(), LifecycleState::NotStarted);

        controller.begin_start().unwrap();
        controller.signal_started(addr()).unwrap();
        // A stop requested during startup takes effect as soon as the run starts.
        assert_eq!(controller.state(), LifecycleState::Stopping);
        controller.request_stop();
        assert_eq!(controller.state(), LifecycleState::Stopping);
    }

    #[test]
    fn blocking_waiters_on_other_threads_are_released() {
        let controller = Arc::new(ServerController::new());
        controller.begin_start().unwrap();

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let controller = Arc::clone(&controller);
                thread::spawn(move || {
                    let started = controller.blocking_wait_for_start();
                    controller.blocking_wait_for_close();
                    started
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        controller.signal_started(addr()).unwrap();
        controller.request_stop();
        controller.signal_closed().unwrap();

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Ok(addr()));
        }
    }

    #[tokio::test]
    async fn async_waiters_are_released() {
        let controller = Arc::new(ServerController::new());
        controller.begin_start().unwrap();

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                let started = controller.wait_for_start().await;
                controller.wait_for_close().await;
                started
            })
        };

        tokio::task::yield_now().await;
        controller
            .signal_start_failed(StartError::Cancelled)
            .unwrap();
        controller.signal_closed().unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Err(StartError::Cancelled));
    }

    #[tokio::test]
    async fn stop_requested_resolves_after_request() {
        let controller = Arc::new(ServerController::new());
        let watcher = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.stop_requested().await })
        };

        controller.request_stop();
        tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .unwrap()
            .unwrap();
    }
}
