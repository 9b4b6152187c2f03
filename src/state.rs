//! Shared server state: configuration, the terminate flag and the idle clock.

use crate::metadata::WireFormat;
use crate::page::PageGenerator;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Deadline for reading one request from a connection.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Restartable countdown to automatic shutdown.
///
/// A zero timeout disables the clock.
#[derive(Debug)]
pub struct IdleClock {
    timeout: Duration,
    origin: Instant,
    /// Nanoseconds after `origin`.
    deadline: AtomicU64,
}

impl IdleClock {
    pub fn new(timeout: Duration) -> Self {
        let clock = Self {
            timeout,
            origin: Instant::now(),
            deadline: AtomicU64::new(0),
        };
        clock.reset();
        clock
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_enabled(&self) -> bool {
        !self.timeout.is_zero()
    }

    /// Push the deadline to `timeout` from now.
    pub fn reset(&self) {
        let at = self.origin.elapsed() + self.timeout;
        let nanos = u64::try_from(at.as_nanos()).unwrap_or(u64::MAX);
        self.deadline.store(nanos, Ordering::SeqCst);
    }

    fn deadline(&self) -> Instant {
        self.origin + Duration::from_nanos(self.deadline.load(Ordering::SeqCst))
    }

    /// Resolve once the clock runs out without having been reset. Never
    /// resolves when disabled.
    pub async fn expired(&self) {
        if !self.is_enabled() {
            return std::future::pending().await;
        }
        loop {
            let deadline = self.deadline();
            tokio::time::sleep_until(deadline).await;
            if Instant::now() >= self.deadline() {
                return;
            }
        }
    }
}

/// Everything a connection worker needs.
pub struct ServerState {
    pub socket: PathBuf,
    pub default_dir: PathBuf,
    pub format: WireFormat,
    pub request_timeout: Duration,
    pub generator: Arc<dyn PageGenerator>,
    pub idle: IdleClock,
    terminate: AtomicBool,
}

impl ServerState {
    pub fn new(
        socket: PathBuf,
        default_dir: PathBuf,
        format: WireFormat,
        max_idle: Duration,
        generator: Arc<dyn PageGenerator>,
    ) -> Self {
        Self {
            socket,
            default_dir,
            format,
            request_timeout: REQUEST_TIMEOUT,
            generator,
            idle: IdleClock::new(max_idle),
            terminate: AtomicBool::new(false),
        }
    }

    pub fn request_shutdown(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub fn shutting_down(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }
}
