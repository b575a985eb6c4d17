//! Long-running solver server with its request and solution sockets.
//!
//! ```text
//! ┌──────────────┐  request (one connection per submission,  ┌──────────────┐
//! │ orchestrator │ ─────────── write, half-close) ─────────► │  dlx server  │
//! │              │ ◄────────── solution (one connection, ─── │ (local or    │
//! └──────────────┘             one frame per submission)     │  container)  │
//!                                                            └──────────────┘
//! ```
//!
//! Submissions are strictly serialized: `submit` takes `&mut self` and does
//! not return until the frame's terminator has been read. Any failure during
//! a submission poisons the session; there is no reconnection.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Extra time the container runtime gets on top of the stop grace period.
const CONTAINER_STOP_SLACK: Duration = Duration::from_secs(2);

use super::connect::ConnectionEstablisher;
use super::framing::{read_frame, DlxsFrame};
use crate::config::{ContainerSettings, ServerEndpoint, ServerLaunch, SessionConfig};
use crate::error::{ConnectionError, DlxError, Result};
use crate::lifecycle::Teardown;
use crate::process::{ProcessHandle, StageSpec, StdoutMode};

/// Command line that starts the solver server for `config`.
pub fn server_spec(config: &SessionConfig) -> StageSpec {
    let endpoint = &config.endpoint;
    let req = endpoint.request_port.to_string();
    let sol = endpoint.solution_port.to_string();

    match &config.launch {
        ServerLaunch::Local => StageSpec::new("dlx-server", &config.binaries.solver)
            .args(["--server", req.as_str(), sol.as_str()]),
        ServerLaunch::Container(container) => {
            let mut spec = StageSpec::new("dlx-server", &container.runtime).args([
                "run".to_string(),
                "--rm".to_string(),
                "--name".to_string(),
                container.name.clone(),
                "-p".to_string(),
                format!("{}:{}", req, req),
                "-p".to_string(),
                format!("{}:{}", sol, sol),
            ]);
            if let Some(platform) = &container.platform {
                spec = spec.args(["--platform", platform.as_str()]);
            }
            spec.args([
                container.image.as_str(),
                crate::config::SOLVER_BINARY,
                "--server",
                req.as_str(),
                sol.as_str(),
            ])
        }
    }
}

/// A supervised solver server plus its long-lived solution connection.
#[derive(Debug)]
pub struct SolverServerSession {
    endpoint: ServerEndpoint,
    launch: ServerLaunch,
    server: ProcessHandle,
    solution: Option<BufReader<TcpStream>>,
    establisher: ConnectionEstablisher,
    submissions: u64,
    poisoned: Option<String>,
}

impl SolverServerSession {
    /// Spawn the server described by `config` and connect the solution
    /// socket.
    ///
    /// # Errors
    ///
    /// - [`DlxError::Configuration`] if the server cannot be launched
    /// - [`DlxError::Connection`] if it never becomes reachable (the server
    ///   is torn down before returning)
    pub async fn start(config: &SessionConfig) -> Result<Self> {
        let spec = server_spec(config);
        info!(command = %spec.command_line(), "Starting solver server");

        let server = ProcessHandle::spawn(&spec, Stdio::null(), StdoutMode::Capture).map_err(
            |e| {
                DlxError::Configuration(format!(
                    "Failed to launch solver server ({}): {}",
                    spec.program.display(),
                    e
                ))
            },
        )?;

        Self::attach(
            server,
            config.endpoint.clone(),
            config.launch.clone(),
            ConnectionEstablisher::new(config.connect_timeout),
            config.shutdown_grace,
        )
        .await
    }

    /// Take ownership of an already spawned server and connect to it.
    pub async fn attach(
        mut server: ProcessHandle,
        endpoint: ServerEndpoint,
        launch: ServerLaunch,
        establisher: ConnectionEstablisher,
        grace: Duration,
    ) -> Result<Self> {
        let address = endpoint.solution_address();
        let solution = match establisher.connect(&address, &mut server).await {
            Ok(stream) => stream,
            Err(e) => {
                stop_container(&launch, grace).await;
                server.terminate(grace).await;
                return Err(e.into());
            }
        };
        info!(address = %address, pid = ?server.id(), "Solver server session ready");

        Ok(Self {
            endpoint,
            launch,
            server,
            solution: Some(BufReader::new(solution)),
            establisher,
            submissions: 0,
            poisoned: None,
        })
    }

    /// Completed submissions.
    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    pub fn is_usable(&self) -> bool {
        self.solution.is_some() && self.poisoned.is_none()
    }

    /// Send one encoded problem and read back its solution frame.
    ///
    /// # Errors
    ///
    /// [`DlxError::Connection`] or [`DlxError::Protocol`]; either one leaves
    /// the session unusable.
    pub async fn submit(&mut self, request: &[u8]) -> Result<DlxsFrame> {
        if let Some(reason) = &self.poisoned {
            return Err(ConnectionError::Closed(format!(
                "an earlier submission failed: {}",
                reason
            ))
            .into());
        }

        match self.exchange(request).await {
            Ok(frame) => {
                self.submissions += 1;
                Ok(frame)
            }
            Err(e) => {
                self.poisoned = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<DlxsFrame> {
        if self.solution.is_none() {
            return Err(ConnectionError::Closed("session has been shut down".to_string()).into());
        }

        let address = self.endpoint.request_address();
        let mut stream = self.establisher.connect(&address, &mut self.server).await?;
        let io_error = |source: std::io::Error| ConnectionError::Io {
            address: address.clone(),
            source,
        };
        stream.write_all(request).await.map_err(io_error)?;
        // Half-close: the server reads the request until EOF.
        stream.shutdown().await.map_err(io_error)?;
        drop(stream);
        debug!(bytes = request.len(), address = %address, "Request sent");

        let solution = self
            .solution
            .as_mut()
            .ok_or_else(|| ConnectionError::Closed("session has been shut down".to_string()))?;
        let frame = read_frame(solution).await?;
        debug!(
            solutions = frame.solutions().len(),
            submission = self.submissions + 1,
            "Frame received"
        );
        Ok(frame)
    }

    /// Stop the server and close the solution connection.
    ///
    /// The server is asked to stop (container stop and/or SIGTERM), given
    /// `grace` to exit, then killed. Connections are closed last.
    pub async fn shutdown(&mut self, grace: Duration) {
        info!(submissions = self.submissions, "Shutting down solver server session");
        stop_container(&self.launch, grace).await;
        self.server.terminate(grace).await;
        if let Some(mut solution) = self.solution.take() {
            let _ = solution.get_mut().shutdown().await;
        }
    }
}

impl Teardown for SolverServerSession {
    async fn teardown(&mut self, grace: Duration) {
        self.shutdown(grace).await;
    }
}

/// Stop the container behind `launch`, if any. Problems are logged.
pub async fn stop_container(launch: &ServerLaunch, grace: Duration) {
    if let ServerLaunch::Container(container) = launch {
        if let Err(e) = container_stop(container, grace).await {
            warn!(container = %container.name, error = %e, "Failed to stop container");
        }
    }
}

/// `<runtime> stop -t <grace> <name>`; an already-gone container is fine.
///
/// The runtime itself is bounded by `grace` plus [`CONTAINER_STOP_SLACK`]
/// and killed when it overruns.
async fn container_stop(container: &ContainerSettings, grace: Duration) -> std::io::Result<()> {
    let grace_secs = grace.as_secs().to_string();
    let limit = grace + CONTAINER_STOP_SLACK;
    let mut stop = Command::new(&container.runtime);
    stop.args(["stop", "-t", grace_secs.as_str(), container.name.as_str()])
        .stdin(Stdio::null())
        .kill_on_drop(true);
    let output = match tokio::time::timeout(limit, stop.output()).await {
        Ok(output) => output?,
        Err(_) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{} stop did not finish within {:?}", container.runtime, limit),
            ))
        }
    };

    if output.status.success() {
        info!(container = %container.name, "Container stopped");
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("No such container") || stderr.contains("is not running") {
        debug!(container = %container.name, "Container already gone");
        Ok(())
    } else {
        Err(std::io::Error::other(format!(
            "{} stop failed: {}",
            container.runtime,
            stderr.trim()
        )))
    }
}
