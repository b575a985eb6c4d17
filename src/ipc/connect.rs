//! Bounded-retry connection against a slow-starting server process.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::ConnectionError;
use crate::process::{describe_status, ProcessHandle};

/// Per-attempt connect timeout.
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);

/// Fixed pause between attempts.
const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);

/// Polls a TCP address until it accepts, the supervised process dies, or
/// the overall deadline passes.
///
/// Unlike a plain retry loop, every iteration first checks whether the
/// server already exited: an exited server can never become reachable, so
/// that case fails immediately and quotes the server's captured output.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionEstablisher {
    timeout: Duration,
    attempt_timeout: Duration,
    backoff: Duration,
}

impl ConnectionEstablisher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            backoff: DEFAULT_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Connect to `address`, supervising `server` while retrying.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::ServerExited`] as soon as `server` is seen to
    ///   have exited, with its captured stdout/stderr
    /// - [`ConnectionError::Timeout`] once the deadline passes, with the last
    ///   underlying connect error
    pub async fn connect(
        &self,
        address: &str,
        server: &mut ProcessHandle,
    ) -> Result<TcpStream, ConnectionError> {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut attempts = 0u32;

        loop {
            let exited = match server.try_exit_status() {
                Ok(status) => status,
                Err(e) => {
                    return Err(ConnectionError::Io {
                        address: address.to_string(),
                        source: e,
                    })
                }
            };
            if let Some(status) = exited {
                let output = server.drain_output().await;
                return Err(ConnectionError::ServerExited {
                    address: address.to_string(),
                    status: describe_status(&status),
                    stdout: output.stdout,
                    stderr: output.stderr,
                });
            }

            attempts += 1;
            let last_error =
                match timeout(self.attempt_timeout, TcpStream::connect(address)).await {
                    Ok(Ok(stream)) => {
                        info!(address, attempts, "Connected");
                        return Ok(stream);
                    }
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => format!("attempt timed out after {:?}", self.attempt_timeout),
                };
            debug!(address, attempts, error = %last_error, "Connect attempt failed");

            let now = Instant::now();
            if now >= deadline {
                return Err(ConnectionError::Timeout {
                    address: address.to_string(),
                    elapsed: now - start,
                    last_error,
                });
            }
            tokio::time::sleep(self.backoff.min(deadline - now)).await;
        }
    }
}

impl Default for ConnectionEstablisher {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_CONNECT_TIMEOUT)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::{StageSpec, StdoutMode};
    use std::process::Stdio;
    use tokio::net::TcpListener;

    fn spawn_sh(script: &str) -> ProcessHandle {
        let spec = StageSpec::new("server", "sh").args(["-c", script]);
        ProcessHandle::spawn(&spec, Stdio::null(), StdoutMode::Capture).expect("spawn")
    }

    /// An address nothing listens on.
    async fn closed_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        drop(listener);
        address
    }

    #[tokio::test]
    async fn test_connects_when_listener_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        let mut server = spawn_sh("sleep 30");

        let establisher = ConnectionEstablisher::new(Duration::from_secs(5));
        let stream = establisher
            .connect(&address, &mut server)
            .await
            .expect("should connect");
        assert_eq!(stream.peer_addr().unwrap().to_string(), address);

        server.terminate(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_connects_after_late_bind() {
        let address = closed_address().await;
        let late = address.clone();
        let binder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            let listener = TcpListener::bind(&late).await.expect("rebind");
            let _ = listener.accept().await;
        });
        let mut server = spawn_sh("sleep 30");

        let establisher = ConnectionEstablisher::new(Duration::from_secs(5));
        establisher
            .connect(&address, &mut server)
            .await
            .expect("should connect once bound");

        server.terminate(Duration::from_secs(1)).await;
        binder.abort();
    }

    #[tokio::test]
    async fn test_exited_server_fails_before_timeout() {
        let address = closed_address().await;
        let mut server = spawn_sh("echo 'Failed to start DLX TCP server.'; echo 'port busy' >&2; exit 1");

        let establisher = ConnectionEstablisher::new(Duration::from_secs(30));
        let start = Instant::now();
        let err = establisher
            .connect(&address, &mut server)
            .await
            .expect_err("should fail");
        assert!(start.elapsed() < Duration::from_secs(10));

        match err {
            ConnectionError::ServerExited {
                status,
                stdout,
                stderr,
                ..
            } => {
                assert_eq!(status, "exit code 1");
                assert!(stdout.contains("Failed to start DLX TCP server."));
                assert!(stderr.contains("port busy"));
            }
            other => panic!("expected ServerExited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_reports_last_error() {
        let address = closed_address().await;
        let mut server = spawn_sh("sleep 30");

        let establisher = ConnectionEstablisher::new(Duration::from_millis(300))
            .with_backoff(Duration::from_millis(50));
        let err = establisher
            .connect(&address, &mut server)
            .await
            .expect_err("should time out");

        match err {
            ConnectionError::Timeout {
                elapsed,
                last_error,
                ..
            } => {
                assert!(elapsed >= Duration::from_millis(300));
                assert!(last_error.to_lowercase().contains("refused"), "{}", last_error);
            }
            other => panic!("expected Timeout, got {:?}", other),
        }

        server.terminate(Duration::from_secs(1)).await;
    }
}
