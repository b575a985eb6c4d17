//! Encoder and decoder invocations around one server submission.

use std::io::Write;
use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::config::Binaries;
use crate::error::{ConnectionError, DlxError, PipelineFailure, Result};
use crate::interactive::{Puzzle, PuzzleSolver};
use crate::ipc::{DlxsFrame, SolverServerSession};
use crate::lifecycle::LifecycleManager;
use crate::process::{ProcessHandle, StageSpec, StdoutMode};

/// Solves puzzles through the server session owned by a lifecycle manager.
///
/// Per puzzle: write it to a temp file, run `sudoku_encoder <file>`, submit
/// the request bytes, then run `sudoku_decoder <file>` with the solution
/// frame on stdin.
pub struct ServerSolver<'a> {
    binaries: Binaries,
    lifecycle: &'a LifecycleManager<SolverServerSession>,
}

impl<'a> ServerSolver<'a> {
    pub fn new(binaries: Binaries, lifecycle: &'a LifecycleManager<SolverServerSession>) -> Self {
        Self {
            binaries,
            lifecycle,
        }
    }

    async fn submit(&self, request: &[u8]) -> Result<DlxsFrame> {
        let mut guard = self.lifecycle.resource().await;
        let session = guard.as_mut().ok_or_else(|| {
            ConnectionError::Closed("solver server session has been stopped".to_string())
        })?;
        session.submit(request).await
    }
}

impl PuzzleSolver for ServerSolver<'_> {
    async fn solve(&mut self, puzzle: &Puzzle) -> Result<Vec<u8>> {
        let mut file = tempfile::Builder::new()
            .prefix("dlx-puzzle-")
            .suffix(".txt")
            .tempfile()?;
        file.write_all(puzzle.to_text().as_bytes())?;
        file.flush()?;

        let request = encode_puzzle(&self.binaries.encoder, file.path()).await?;
        let frame = self.submit(&request).await?;
        decode_frame(&self.binaries.decoder, file.path(), &frame).await
    }
}

/// `sudoku_encoder <puzzle>`; returns the request bytes.
pub async fn encode_puzzle(encoder: &Path, puzzle: &Path) -> Result<Vec<u8>> {
    let spec = StageSpec::new(crate::config::ENCODER_BINARY, encoder).arg(puzzle);
    run_collaborator(&spec, None).await
}

/// `sudoku_decoder <puzzle>` with the re-encoded frame on stdin; returns the
/// printable solution text.
pub async fn decode_frame(decoder: &Path, puzzle: &Path, frame: &DlxsFrame) -> Result<Vec<u8>> {
    let spec = StageSpec::new(crate::config::DECODER_BINARY, decoder).arg(puzzle);
    run_collaborator(&spec, Some(&frame.encode())).await
}

/// Run one stage to completion, optionally feeding `input` to its stdin,
/// and return everything it wrote to stdout.
///
/// Stdin is fed while stdout is read so neither side can stall on a full
/// pipe.
async fn run_collaborator(spec: &StageSpec, input: Option<&[u8]>) -> Result<Vec<u8>> {
    let stdin = if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    };
    let mut handle = ProcessHandle::spawn(spec, stdin, StdoutMode::Pipe).map_err(|e| {
        DlxError::Configuration(format!(
            "Failed to launch {} ({}): {}",
            spec.name,
            spec.program.display(),
            e
        ))
    })?;

    let mut stdout = handle
        .take_stdout()
        .ok_or_else(|| std::io::Error::other(format!("stdout of {} was not piped", spec.name)))?;
    let pipe = handle.take_stdin();

    let feed = async move {
        if let (Some(mut pipe), Some(bytes)) = (pipe, input) {
            pipe.write_all(bytes).await?;
            pipe.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    };
    let collect = async {
        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await.map(|_| out)
    };
    let (fed, collected) = tokio::join!(feed, collect);

    let report = handle.finish().await;
    if let Some(failure) = report.failure() {
        return Err(PipelineFailure::single(failure).into());
    }
    // A stage may legitimately exit before draining its input.
    if let Err(e) = fed {
        if e.kind() != std::io::ErrorKind::BrokenPipe {
            return Err(e.into());
        }
    }
    let out = collected?;
    debug!(stage = %spec.name, bytes = out.len(), "Collaborator finished");
    Ok(out)
}
