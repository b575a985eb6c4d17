//! Idempotent shutdown coordination.
//!
//! A [`LifecycleManager`] owns the session's shared resource (the solver
//! server and its sockets) and moves through
//! `Starting → Running → Stopping → Stopped`. Normal completion, a signal
//! and an error path may all call [`LifecycleManager::stop`]; a
//! compare-and-swap on the state lets exactly one of them perform teardown,
//! the rest return `false` without side effects.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Lifecycle states; transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LifecycleState {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Starting,
            1 => LifecycleState::Running,
            2 => LifecycleState::Stopping,
            _ => LifecycleState::Stopped,
        }
    }
}

/// Termination signals the orchestrator reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    Hangup,
    Quit,
}

impl ShutdownSignal {
    /// Conventional signal number.
    pub fn number(self) -> i32 {
        match self {
            ShutdownSignal::Hangup => 1,
            ShutdownSignal::Interrupt => 2,
            ShutdownSignal::Quit => 3,
            ShutdownSignal::Terminate => 15,
        }
    }

    /// Shell-style exit status for a process ended by this signal.
    pub fn exit_code(self) -> u8 {
        (128 + self.number()) as u8
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Hangup => "SIGHUP",
            ShutdownSignal::Quit => "SIGQUIT",
        };
        f.write_str(name)
    }
}

/// What asked for the shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopTrigger {
    Completed,
    Signal(ShutdownSignal),
    Error,
}

impl fmt::Display for StopTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopTrigger::Completed => f.write_str("completed"),
            StopTrigger::Signal(signal) => write!(f, "signal {}", signal),
            StopTrigger::Error => f.write_str("error"),
        }
    }
}

/// A resource that can be released with a bounded grace period.
///
/// Implementations must not fail: problems are logged, never returned.
pub trait Teardown {
    fn teardown(&mut self, grace: Duration) -> impl Future<Output = ()>;
}

/// Exactly-once shutdown coordinator for one resource.
#[derive(Debug)]
pub struct LifecycleManager<R> {
    state: AtomicU8,
    grace: Duration,
    resource: Mutex<Option<R>>,
}

impl<R: Teardown> LifecycleManager<R> {
    /// A manager in `Starting` with no resource yet.
    pub fn new(grace: Duration) -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Starting as u8),
            grace,
            resource: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Hand over the resource and move to `Running`.
    ///
    /// If a stop already won the race (e.g. a signal during startup), the
    /// resource is torn down on the spot and `false` is returned.
    pub async fn install(&self, mut resource: R) -> bool {
        let mut slot = self.resource.lock().await;
        let promoted = self
            .state
            .compare_exchange(
                LifecycleState::Starting as u8,
                LifecycleState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if promoted {
            *slot = Some(resource);
            debug!("Lifecycle running");
            true
        } else {
            drop(slot);
            info!(state = ?self.state(), "Resource installed after shutdown began; releasing it");
            resource.teardown(self.grace).await;
            false
        }
    }

    /// Access the managed resource (`None` before install or after stop).
    pub async fn resource(&self) -> MutexGuard<'_, Option<R>> {
        self.resource.lock().await
    }

    /// Claim the `Stopping` transition. Only the first caller gets `true`.
    fn begin_stopping(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= LifecycleState::Stopping as u8 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                LifecycleState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Tear everything down once.
    ///
    /// Returns `true` for the call that performed teardown and `false` for
    /// every later (or concurrent) call. Never fails.
    pub async fn stop(&self, trigger: StopTrigger) -> bool {
        if !self.begin_stopping() {
            debug!(trigger = %trigger, state = ?self.state(), "Stop already in progress");
            return false;
        }

        info!(trigger = %trigger, "Stopping");
        let resource = self.resource.lock().await.take();
        if let Some(mut resource) = resource {
            resource.teardown(self.grace).await;
        }
        self.state
            .store(LifecycleState::Stopped as u8, Ordering::Release);
        info!("Stopped");
        true
    }
}

/// Listener for SIGINT, SIGTERM, SIGHUP and SIGQUIT.
///
/// Handlers are registered by [`install`](Self::install); signals arriving
/// afterwards are queued until [`recv`](Self::recv) is polled.
#[cfg(unix)]
pub struct ShutdownSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    pub async fn recv(&mut self) -> ShutdownSignal {
        let received = tokio::select! {
            _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
            _ = self.terminate.recv() => ShutdownSignal::Terminate,
            _ = self.hangup.recv() => ShutdownSignal::Hangup,
            _ = self.quit.recv() => ShutdownSignal::Quit,
        };
        info!(signal = %received, "Received shutdown signal");
        received
    }
}

#[cfg(not(unix))]
pub struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) -> ShutdownSignal {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Ctrl-C listener failed; waiting forever");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl-C");
        ShutdownSignal::Interrupt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// Counts teardowns.
    struct Counting(Arc<AtomicUsize>);

    impl Teardown for Counting {
        async fn teardown(&mut self, _grace: Duration) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager() -> (LifecycleManager<Counting>, Arc<AtomicUsize>) {
        (
            LifecycleManager::new(Duration::from_millis(10)),
            Arc::new(AtomicUsize::new(0)),
        )
    }

    #[tokio::test]
    async fn test_states_move_forward() {
        let (lifecycle, count) = manager();
        assert_eq!(lifecycle.state(), LifecycleState::Starting);
        assert!(lifecycle.install(Counting(Arc::clone(&count))).await);
        assert_eq!(lifecycle.state(), LifecycleState::Running);
        assert!(lifecycle.resource().await.is_some());

        assert!(lifecycle.stop(StopTrigger::Completed).await);
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
        assert!(lifecycle.resource().await.is_none());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_twice_tears_down_once() {
        let (lifecycle, count) = manager();
        lifecycle.install(Counting(Arc::clone(&count))).await;

        assert!(lifecycle.stop(StopTrigger::Signal(ShutdownSignal::Interrupt)).await);
        assert!(!lifecycle.stop(StopTrigger::Completed).await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_concurrent_stops_single_winner() {
        let (lifecycle, count) = manager();
        lifecycle.install(Counting(Arc::clone(&count))).await;

        let (a, b, c) = tokio::join!(
            lifecycle.stop(StopTrigger::Signal(ShutdownSignal::Terminate)),
            lifecycle.stop(StopTrigger::Completed),
            lifecycle.stop(StopTrigger::Error),
        );
        assert_eq!([a, b, c].iter().filter(|won| **won).count(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_before_install_releases_late_resource() {
        let (lifecycle, count) = manager();
        assert!(lifecycle.stop(StopTrigger::Signal(ShutdownSignal::Hangup)).await);
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);

        assert!(!lifecycle.install(Counting(Arc::clone(&count))).await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(lifecycle.resource().await.is_none());
    }

    #[test]
    fn test_signal_exit_codes() {
        assert_eq!(ShutdownSignal::Interrupt.exit_code(), 130);
        assert_eq!(ShutdownSignal::Terminate.exit_code(), 143);
        assert_eq!(ShutdownSignal::Hangup.exit_code(), 129);
        assert_eq!(ShutdownSignal::Quit.exit_code(), 131);
        assert_eq!(
            StopTrigger::Signal(ShutdownSignal::Quit).to_string(),
            "signal SIGQUIT"
        );
    }
}
