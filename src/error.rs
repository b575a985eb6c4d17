//! Error taxonomy for the orchestrator.
//!
//! Every failure the orchestrator can surface falls into one of a handful of
//! categories, each with its own process exit status so callers (shell
//! scripts, CI jobs) can tell a missing executable apart from a solver crash.
//!
//! | Category        | Exit | Recovered locally? |
//! |-----------------|------|--------------------|
//! | Usage           | 64   | no                 |
//! | Validation      | 65   | yes (unit skipped) |
//! | Connection      | 69   | no                 |
//! | Process         | 70   | no                 |
//! | Io              | 74   | no                 |
//! | Protocol        | 76   | no                 |
//! | Configuration   | 78   | no                 |

use std::time::Duration;

use thiserror::Error;

/// Top-level error type returned by every orchestrator operation.
#[derive(Debug, Error)]
pub enum DlxError {
    /// Malformed command line (unknown pipeline, bad option, missing value).
    #[error("{0}")]
    Usage(String),

    /// Missing executable, build folder, puzzle file or malformed config.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed puzzle input. Recovered by skipping the offending unit.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The solver's DLXS stream was malformed or ended early.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// One or more spawned stages exited unsuccessfully.
    #[error(transparent)]
    Process(#[from] PipelineFailure),

    /// The solver server could not be reached.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Local I/O failure (answer file, temp file, stdout).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DlxError {
    /// Process exit status for this error (sysexits-style).
    pub fn exit_code(&self) -> u8 {
        match self {
            DlxError::Usage(_) => 64,
            DlxError::Validation(_) => 65,
            DlxError::Connection(_) => 69,
            DlxError::Process(_) => 70,
            DlxError::Io(_) => 74,
            DlxError::Protocol(_) => 76,
            DlxError::Configuration(_) => 78,
        }
    }

    /// Short category label used in log lines.
    pub fn category(&self) -> &'static str {
        match self {
            DlxError::Usage(_) => "usage",
            DlxError::Validation(_) => "validation",
            DlxError::Connection(_) => "connection",
            DlxError::Process(_) => "process",
            DlxError::Io(_) => "io",
            DlxError::Protocol(_) => "protocol",
            DlxError::Configuration(_) => "configuration",
        }
    }
}

/// Failures while decoding a DLXS frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The stream closed before a fixed-size field was fully received.
    #[error("Incomplete DLXS stream: needed {expected} bytes for {context}, received {received}")]
    Incomplete {
        /// Which part of the frame was being read.
        context: &'static str,
        /// Bytes requested.
        expected: usize,
        /// Bytes that arrived before end-of-stream.
        received: usize,
    },

    /// The first four bytes were not `DLXS`.
    #[error("Invalid DLXS magic {found:02X?}")]
    BadMagic {
        /// The bytes actually received.
        found: [u8; 4],
    },

    /// A row carries more entries than the 16-bit count field can express.
    #[error("DLXS row holds {0} entries; at most 65535 fit in one row")]
    RowTooLarge(usize),

    /// A solution row is indistinguishable from the terminator.
    #[error("DLXS solution row cannot be empty with solution id 0 (reserved for the terminator)")]
    MisplacedTerminator,

    /// The underlying stream failed.
    #[error("I/O error reading DLXS stream: {0}")]
    Io(#[source] std::io::Error),
}

/// A single stage that exited unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{stage} failed with {status}. Command: {command_line}{}", format_diagnostics(.diagnostics))]
pub struct ProcessFailure {
    /// Stage name (e.g. `sudoku_encoder`).
    pub stage: String,
    /// Exit code, or `None` when the stage was killed by a signal.
    pub exit_code: Option<i32>,
    /// Human-readable termination description.
    pub status: String,
    /// Full command line that was executed.
    pub command_line: String,
    /// Captured stderr, trimmed.
    pub diagnostics: String,
}

/// Every failing stage of one pipeline run, in stage order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", format_failures(.failures))]
pub struct PipelineFailure {
    pub failures: Vec<ProcessFailure>,
}

impl PipelineFailure {
    pub fn single(failure: ProcessFailure) -> Self {
        Self {
            failures: vec![failure],
        }
    }

    /// Names of the failing stages.
    pub fn stages(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.stage.as_str()).collect()
    }
}

fn format_diagnostics(diagnostics: &str) -> String {
    if diagnostics.is_empty() {
        String::new()
    } else {
        format!("\n{}", diagnostics)
    }
}

fn format_failures(failures: &[ProcessFailure]) -> String {
    failures
        .iter()
        .map(ProcessFailure::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Failures establishing or using a connection to the solver server.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The supervised server exited, so it can never become reachable.
    #[error("Server process exited ({status}) before {address} became reachable{}", format_output(.stdout, .stderr))]
    ServerExited {
        address: String,
        status: String,
        stdout: String,
        stderr: String,
    },

    /// Deadline passed without a successful connection.
    #[error("Timed out after {elapsed:?} connecting to {address}: {last_error}")]
    Timeout {
        address: String,
        elapsed: Duration,
        last_error: String,
    },

    /// An established connection failed mid-transfer.
    #[error("Connection to {address} failed: {source}")]
    Io {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The session was already torn down or poisoned by an earlier failure.
    #[error("Solver session is closed: {0}")]
    Closed(String),
}

fn format_output(stdout: &str, stderr: &str) -> String {
    let mut text = String::new();
    if !stdout.trim().is_empty() {
        text.push_str("\nstdout:\n");
        text.push_str(stdout.trim_end());
    }
    if !stderr.trim().is_empty() {
        text.push_str("\nstderr:\n");
        text.push_str(stderr.trim_end());
    }
    text
}

pub type Result<T> = std::result::Result<T, DlxError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(stage: &str, code: i32, stderr: &str) -> ProcessFailure {
        ProcessFailure {
            stage: stage.to_string(),
            exit_code: Some(code),
            status: format!("exit code {}", code),
            command_line: format!("/bin/{} arg", stage),
            diagnostics: stderr.to_string(),
        }
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = [
            DlxError::Usage("u".into()),
            DlxError::Configuration("c".into()),
            DlxError::Validation("v".into()),
            DlxError::Protocol(ProtocolError::MisplacedTerminator),
            DlxError::Process(PipelineFailure::single(failure("dlx", 1, ""))),
            DlxError::Connection(ConnectionError::Closed("x".into())),
            DlxError::Io(std::io::Error::new(std::io::ErrorKind::Other, "io")),
        ];
        let mut codes: Vec<u8> = errors.iter().map(DlxError::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|&c| c != 0));

        let mut categories: Vec<&str> = errors.iter().map(DlxError::category).collect();
        categories.sort_unstable();
        categories.dedup();
        assert_eq!(categories.len(), errors.len());
    }

    #[test]
    fn test_process_failure_display() {
        let err = failure("dlx", 3, "matrix is empty");
        assert_eq!(
            err.to_string(),
            "dlx failed with exit code 3. Command: /bin/dlx arg\nmatrix is empty"
        );

        let quiet = failure("sudoku_decoder", 1, "");
        assert_eq!(
            quiet.to_string(),
            "sudoku_decoder failed with exit code 1. Command: /bin/sudoku_decoder arg"
        );
    }

    #[test]
    fn test_pipeline_failure_lists_every_stage() {
        let err = PipelineFailure {
            failures: vec![failure("sudoku_encoder", 2, "bad"), failure("dlx", 141, "")],
        };
        assert_eq!(
            err.to_string(),
            "sudoku_encoder failed with exit code 2. Command: /bin/sudoku_encoder arg\nbad\n\
             dlx failed with exit code 141. Command: /bin/dlx arg"
        );
        assert!(std::error::Error::source(&err).is_none());
        assert_eq!(err.stages(), vec!["sudoku_encoder", "dlx"]);
    }

    #[test]
    fn test_server_exited_includes_captured_output() {
        let err = ConnectionError::ServerExited {
            address: "127.0.0.1:5556".into(),
            status: "exit code 1".into(),
            stdout: "Failed to start DLX TCP server.\n".into(),
            stderr: String::new(),
        };
        let text = err.to_string();
        assert!(text.contains("127.0.0.1:5556"));
        assert!(text.contains("stdout:\nFailed to start DLX TCP server."));
        assert!(!text.contains("stderr:"));
    }

    #[test]
    fn test_incomplete_display() {
        let err = ProtocolError::Incomplete {
            context: "row header",
            expected: 6,
            received: 2,
        };
        assert_eq!(
            err.to_string(),
            "Incomplete DLXS stream: needed 6 bytes for row header, received 2"
        );
    }
}
