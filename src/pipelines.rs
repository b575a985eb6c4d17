//! Batch pipelines: `execute <pipeline> [options] [<pipeline> [options]]...`
//!
//! The flat token list is cut into invocations at every token that names a
//! registered pipeline. Each invocation's options are parsed by that
//! pipeline's own schema just before it runs, and invocations run strictly
//! one after another; the first failure aborts the rest.
//!
//! A value that happens to equal a pipeline name (`--puzzle sudoku`) starts a
//! new invocation. Quote-free shells cannot express the difference, so the
//! splitter keeps that behavior.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use clap::Parser;
use tracing::info;

use crate::config::{absolutize, Binaries, DECODER_BINARY, ENCODER_BINARY, SOLVER_BINARY};
use crate::error::{DlxError, Result};
use crate::process::{ProcessPipeline, StageSpec};

/// The closed set of batch pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Sudoku,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 1] = [PipelineKind::Sudoku];

    pub fn name(self) -> &'static str {
        match self {
            PipelineKind::Sudoku => "sudoku",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Comma-separated registered names.
    pub fn available() -> String {
        Self::ALL
            .iter()
            .map(|kind| kind.name())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// One named group of tokens from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineInvocation {
    pub kind: PipelineKind,
    pub raw_args: Vec<String>,
}

impl PipelineInvocation {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Parse this invocation's options and run it to completion.
    ///
    /// `default_build_folder` applies when the invocation has no
    /// `--build-folder` of its own.
    pub async fn run(&self, default_build_folder: &Path) -> Result<()> {
        match self.kind {
            PipelineKind::Sudoku => {
                let args = SudokuArgs::parse_tokens(&self.raw_args)?;
                run_sudoku(&args, default_build_folder).await
            }
        }
    }
}

/// Cut `tokens` into invocations.
///
/// # Errors
///
/// [`DlxError::Usage`] for an empty list or when the first token of a group
/// is not a registered pipeline.
pub fn split_invocations(tokens: &[String]) -> Result<Vec<PipelineInvocation>> {
    if tokens.is_empty() {
        return Err(DlxError::Usage(format!(
            "No pipelines specified. Usage: dlx-orchestrator execute <pipeline> [args] ... (available: {})",
            PipelineKind::available()
        )));
    }

    let mut invocations = Vec::new();
    let mut index = 0;
    while index < tokens.len() {
        let name = &tokens[index];
        let kind = PipelineKind::from_name(name).ok_or_else(|| {
            DlxError::Usage(format!(
                "Unknown pipeline '{}'. Available: {}",
                name,
                PipelineKind::available()
            ))
        })?;
        index += 1;

        let start = index;
        while index < tokens.len() && PipelineKind::from_name(&tokens[index]).is_none() {
            index += 1;
        }
        invocations.push(PipelineInvocation {
            kind,
            raw_args: tokens[start..index].to_vec(),
        });
    }
    Ok(invocations)
}

/// Run `invocations` in order, stopping at the first failure.
///
/// Returns the number completed.
pub async fn run_all(invocations: &[PipelineInvocation], default_build_folder: &Path) -> Result<usize> {
    for (index, invocation) in invocations.iter().enumerate() {
        info!(
            pipeline = invocation.name(),
            position = index + 1,
            total = invocations.len(),
            "Running pipeline"
        );
        invocation.run(default_build_folder).await?;
    }
    Ok(invocations.len())
}

/// Options of the `sudoku` pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(
    name = "sudoku",
    no_binary_name = true,
    about = "Solve a Sudoku puzzle file through encoder | dlx | decoder"
)]
pub struct SudokuArgs {
    /// Path to the Sudoku puzzle text file
    #[arg(long)]
    pub puzzle: PathBuf,

    /// Destination for decoded solutions (default: <puzzle-name>-answers.txt in the current directory)
    #[arg(long)]
    pub answers: Option<PathBuf>,

    /// Folder containing sudoku_encoder, dlx and sudoku_decoder
    #[arg(long)]
    pub build_folder: Option<PathBuf>,
}

impl SudokuArgs {
    /// Parse one invocation's tokens; errors are local to this pipeline.
    pub fn parse_tokens(tokens: &[String]) -> Result<Self> {
        Self::try_parse_from(tokens).map_err(|e| {
            DlxError::Usage(format!(
                "{}: {}",
                PipelineKind::Sudoku.name(),
                e.to_string().trim_end()
            ))
        })
    }
}

/// `<cwd>/<puzzle-stem>-answers.txt`.
pub fn default_answers_path(puzzle: &Path) -> Result<PathBuf> {
    let stem = puzzle
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(std::env::current_dir()?.join(format!("{}-answers.txt", stem)))
}

/// The three stages for one puzzle.
pub fn sudoku_pipeline(binaries: &Binaries, puzzle: &Path) -> ProcessPipeline {
    ProcessPipeline::new(vec![
        StageSpec::new(ENCODER_BINARY, &binaries.encoder).arg(puzzle),
        StageSpec::new(SOLVER_BINARY, &binaries.solver),
        StageSpec::new(DECODER_BINARY, &binaries.decoder).arg(puzzle),
    ])
}

async fn run_sudoku(args: &SudokuArgs, default_build_folder: &Path) -> Result<()> {
    let puzzle = absolutize(&args.puzzle)?;
    let answers = match &args.answers {
        Some(path) => absolutize(path)?,
        None => default_answers_path(&puzzle)?,
    };

    if !puzzle.is_file() {
        return Err(DlxError::Configuration(format!(
            "Puzzle file '{}' does not exist.",
            puzzle.display()
        )));
    }
    if let Some(parent) = answers.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let build_folder = args
        .build_folder
        .as_deref()
        .unwrap_or(default_build_folder);
    let binaries = Binaries::resolve(build_folder)?;

    info!(
        puzzle = %puzzle.display(),
        answers = %answers.display(),
        "sudoku pipeline starting"
    );

    let sink = File::create(&answers)?;
    sudoku_pipeline(&binaries, &puzzle)
        .run(Stdio::null(), Stdio::from(sink))
        .await?;

    info!(answers = %answers.display(), "sudoku pipeline complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tokens(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_registry_lookup() {
        assert_eq!(PipelineKind::from_name("sudoku"), Some(PipelineKind::Sudoku));
        assert_eq!(PipelineKind::from_name("Sudoku"), None);
        assert_eq!(PipelineKind::available(), "sudoku");
    }

    #[test]
    fn test_split_single_invocation() {
        let invocations =
            split_invocations(&tokens("sudoku --puzzle a.txt --answers out.txt")).unwrap();
        assert_eq!(
            invocations,
            vec![PipelineInvocation {
                kind: PipelineKind::Sudoku,
                raw_args: tokens("--puzzle a.txt --answers out.txt"),
            }]
        );
    }

    #[test]
    fn test_split_multiple_invocations_in_order() {
        let invocations = split_invocations(&tokens(
            "sudoku --puzzle a.txt sudoku --puzzle b.txt --answers b.txt sudoku",
        ))
        .unwrap();
        let args: Vec<_> = invocations.iter().map(|i| i.raw_args.clone()).collect();
        assert_eq!(
            args,
            vec![
                tokens("--puzzle a.txt"),
                tokens("--puzzle b.txt --answers b.txt"),
                Vec::new(),
            ]
        );
    }

    #[test]
    fn test_split_empty_is_usage_error() {
        let err = split_invocations(&[]).expect_err("empty");
        assert!(matches!(err, DlxError::Usage(ref msg) if msg.contains("No pipelines specified")));
        assert!(err.to_string().contains("available: sudoku"));
    }

    #[test]
    fn test_split_unknown_pipeline_names_token() {
        let err = split_invocations(&tokens("chess --board x")).expect_err("unknown");
        assert_eq!(err.to_string(), "Unknown pipeline 'chess'. Available: sudoku");
    }

    #[test]
    fn test_option_value_equal_to_pipeline_name_splits() {
        // Known ambiguity: the value is taken as the start of a new invocation.
        let invocations = split_invocations(&tokens("sudoku --puzzle sudoku")).unwrap();
        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[0].raw_args, tokens("--puzzle"));
        assert!(invocations[1].raw_args.is_empty());
        assert!(SudokuArgs::parse_tokens(&invocations[0].raw_args).is_err());
    }

    #[test]
    fn test_sudoku_args_parse() {
        let args = SudokuArgs::parse_tokens(&tokens(
            "--puzzle tests/p.txt --answers out/p.txt --build-folder bin",
        ))
        .unwrap();
        assert_eq!(
            args,
            SudokuArgs {
                puzzle: PathBuf::from("tests/p.txt"),
                answers: Some(PathBuf::from("out/p.txt")),
                build_folder: Some(PathBuf::from("bin")),
            }
        );
    }

    #[test]
    fn test_sudoku_args_errors_are_local() {
        let missing = SudokuArgs::parse_tokens(&tokens("--answers x.txt")).expect_err("missing");
        assert!(matches!(missing, DlxError::Usage(ref msg) if msg.starts_with("sudoku: ")));
        assert!(missing.to_string().contains("--puzzle"));

        let unknown =
            SudokuArgs::parse_tokens(&tokens("--puzzle p.txt --colour red")).expect_err("unknown");
        assert!(unknown.to_string().starts_with("sudoku: "));
    }

    #[test]
    fn test_default_answers_path_uses_cwd_and_stem() {
        let path = default_answers_path(Path::new("/data/puzzles/hard.txt")).unwrap();
        assert_eq!(path, std::env::current_dir().unwrap().join("hard-answers.txt"));
    }

    #[test]
    fn test_sudoku_pipeline_stages() {
        let binaries = Binaries {
            encoder: PathBuf::from("/b/sudoku_encoder"),
            solver: PathBuf::from("/b/dlx"),
            decoder: PathBuf::from("/b/sudoku_decoder"),
        };
        let pipeline = sudoku_pipeline(&binaries, Path::new("/p/a.txt"));
        let lines: Vec<_> = pipeline.stages().iter().map(StageSpec::command_line).collect();
        assert_eq!(
            lines,
            vec![
                "/b/sudoku_encoder /p/a.txt".to_string(),
                "/b/dlx".to_string(),
                "/b/sudoku_decoder /p/a.txt".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_puzzle_is_configuration_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let args = SudokuArgs {
            puzzle: dir.path().join("absent.txt"),
            answers: Some(dir.path().join("out.txt")),
            build_folder: Some(dir.path().to_path_buf()),
        };
        let err = run_sudoku(&args, Path::new("build"))
            .await
            .expect_err("missing puzzle");
        assert!(
            matches!(err, DlxError::Configuration(ref msg) if msg.starts_with("Puzzle file '")),
            "{:?}",
            err
        );
    }

    #[tokio::test]
    async fn test_missing_binaries_is_configuration_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let puzzle = dir.path().join("p.txt");
        std::fs::write(&puzzle, "x").unwrap();
        let args = SudokuArgs {
            puzzle,
            answers: Some(dir.path().join("nested/out.txt")),
            build_folder: Some(dir.path().to_path_buf()),
        };
        let err = run_sudoku(&args, Path::new("build"))
            .await
            .expect_err("no binaries");
        assert!(err.to_string().contains("sudoku_encoder"));
        assert!(dir.path().join("nested").is_dir());
    }
}
