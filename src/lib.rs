//! DLX Orchestrator Library
//!
//! Drives an external Dancing-Links exact-cover solver two ways:
//!
//! - `pipelines` - one-shot batch runs (`encoder | dlx | decoder > answers`)
//! - `interactive` + `ipc` - repeated solving against a long-running
//!   `dlx --server` over a request socket and a solution socket
//!
//! Supporting modules:
//!
//! - `process` - spawned children, N-stage pipe chaining, graceful stop
//! - `lifecycle` - exactly-once teardown and shutdown signals
//! - `cli` - command-line flags and their `DLX_*` environment fallbacks
//! - `config` - endpoint, binaries and launch mode, layered from CLI/env/file
//! - `error` - error taxonomy and exit codes
//!
//! # Interactive use
//!
//! ```ignore
//! use dlx_orchestrator::ipc::SolverServerSession;
//!
//! let mut session = SolverServerSession::start(&config).await?;
//! let frame = session.submit(&request_bytes).await?;
//! for row in frame.solutions() {
//!     println!("solution {}: {:?}", row.solution_id, row.entries);
//! }
//! session.shutdown(config.shutdown_grace).await;
//! ```

pub mod cli;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod interactive;
pub mod ipc;
pub mod lifecycle;
pub mod pipelines;
pub mod process;
