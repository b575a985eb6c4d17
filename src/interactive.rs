//! Line-oriented puzzle intake for a running solver server.
//!
//! Lines are trimmed; blank lines are separators. Every other line must be
//! exactly [`GRID_SIZE`] characters and is appended to the current
//! [`PuzzleBuffer`]. A full buffer becomes a [`Puzzle`] and is handed to a
//! [`PuzzleSolver`]; whatever it returns is written to the output.

use std::future::Future;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, info, warn};

use crate::error::{DlxError, Result};

/// Rows per puzzle and characters per row.
pub const GRID_SIZE: usize = 9;

const BANNER: &str = "Enter Sudoku puzzles (9 lines each). Separate puzzles with a blank line.\n";
const READY: &str = "Ready for next puzzle...\n";
const SKIP_NOTICE: &str = "Each line must contain 9 digits; skipping.\n";
const PARTIAL_NOTICE: &str = "Incomplete puzzle ignored\n";

/// A complete 9×9 puzzle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Puzzle {
    lines: Vec<String>,
}

impl Puzzle {
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Newline-terminated text, one row per line.
    pub fn to_text(&self) -> String {
        let mut text = self.lines.join("\n");
        text.push('\n');
        text
    }
}

/// Rows collected so far for the next puzzle.
#[derive(Debug, Default)]
pub struct PuzzleBuffer {
    lines: Vec<String>,
}

impl PuzzleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Append one trimmed, non-blank row.
    ///
    /// Returns the completed puzzle (and resets) on the ninth row.
    ///
    /// # Errors
    ///
    /// [`DlxError::Validation`] if the row is not exactly [`GRID_SIZE`]
    /// characters; the buffer is left unchanged.
    pub fn push(&mut self, line: &str) -> Result<Option<Puzzle>> {
        let width = line.chars().count();
        if width != GRID_SIZE {
            return Err(DlxError::Validation(format!(
                "expected {} characters, got {}: {:?}",
                GRID_SIZE, width, line
            )));
        }

        self.lines.push(line.to_string());
        if self.lines.len() < GRID_SIZE {
            return Ok(None);
        }
        Ok(Some(Puzzle {
            lines: std::mem::take(&mut self.lines),
        }))
    }
}

/// Turns one puzzle into printable solution text.
pub trait PuzzleSolver {
    fn solve(&mut self, puzzle: &Puzzle) -> impl Future<Output = Result<Vec<u8>>>;
}

/// What happened over one interactive run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InteractiveSummary {
    pub solved: usize,
    pub rejected_lines: usize,
    /// Rows left in the buffer at end of input, if any.
    pub ignored_partial: Option<usize>,
}

/// Reads puzzles from a line stream and solves them one at a time.
#[derive(Debug)]
pub struct InteractiveSession<S> {
    solver: S,
}

impl<S: PuzzleSolver> InteractiveSession<S> {
    pub fn new(solver: S) -> Self {
        Self { solver }
    }

    pub fn into_solver(self) -> S {
        self.solver
    }

    /// Consume `input` until end-of-stream or the first solve error.
    ///
    /// Malformed rows are reported and skipped. A solve error ends the loop
    /// and is returned; no further input is read. A partial puzzle left at
    /// end of input is reported on `diagnostics`.
    pub async fn run<R, W, E>(
        &mut self,
        input: R,
        output: &mut W,
        diagnostics: &mut E,
    ) -> Result<InteractiveSummary>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        output.write_all(BANNER.as_bytes()).await?;
        output.flush().await?;

        let mut lines = input.lines();
        let mut buffer = PuzzleBuffer::new();
        let mut summary = InteractiveSummary::default();

        while let Some(raw) = lines.next_line().await? {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            let puzzle = match buffer.push(line) {
                Ok(Some(puzzle)) => puzzle,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "Rejected puzzle line");
                    summary.rejected_lines += 1;
                    output.write_all(SKIP_NOTICE.as_bytes()).await?;
                    output.flush().await?;
                    continue;
                }
            };

            let solution = match self.solver.solve(&puzzle).await {
                Ok(solution) => solution,
                Err(e) => {
                    error!(error = %e, solved = summary.solved, "Error solving puzzle");
                    return Err(e);
                }
            };
            summary.solved += 1;
            output.write_all(&solution).await?;
            output.write_all(READY.as_bytes()).await?;
            output.flush().await?;
        }

        if !buffer.is_empty() {
            warn!(lines = buffer.len(), "Incomplete puzzle ignored");
            diagnostics.write_all(PARTIAL_NOTICE.as_bytes()).await?;
            diagnostics.flush().await?;
            summary.ignored_partial = Some(buffer.len());
        }

        info!(
            solved = summary.solved,
            rejected_lines = summary.rejected_lines,
            "Input exhausted"
        );
        Ok(summary)
    }
}
