//! External process supervision.
//!
//! - [`ProcessHandle`]: one spawned child with captured stderr (and optionally
//!   stdout), graceful termination and exit-status caching
//! - [`ProcessPipeline`]: N handles chained stdout → stdin into a final sink
//!
//! ```ignore
//! use dlx_orchestrator::process::{ProcessPipeline, StageSpec};
//!
//! let pipeline = ProcessPipeline::new(vec![
//!     StageSpec::new("encoder", "build/sudoku_encoder").arg("puzzle.txt"),
//!     StageSpec::new("solver", "build/dlx"),
//!     StageSpec::new("decoder", "build/sudoku_decoder").arg("puzzle.txt"),
//! ]);
//! pipeline.run(Stdio::null(), Stdio::from(answers_file)).await?;
//! ```

mod handle;
mod pipeline;

pub use handle::{
    describe_status, CapturedOutput, ProcessHandle, StageReport, StageSpec, StdoutMode,
};
pub use pipeline::ProcessPipeline;
