//! N-stage process pipeline (`a | b | c > sink`).
//!
//! Close order: stage *i*'s stdout is taken out of its handle and moved into
//! stage *i+1*'s spawn, after which the orchestrator holds no copy of that
//! pipe. A producer therefore sees EPIPE as soon as its consumer exits, and a
//! consumer sees EOF as soon as its producer exits.
//!
//! Join order: every stage is waited on, in stage order, regardless of
//! earlier failures. Failures are evaluated only after all stages exited.

use std::process::Stdio;

use tracing::{debug, info, warn};

use super::handle::{ProcessHandle, StageReport, StageSpec, StdoutMode};
use crate::error::{DlxError, PipelineFailure, Result};

/// An ordered list of stages to run connected by pipes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessPipeline {
    stages: Vec<StageSpec>,
}

impl ProcessPipeline {
    pub fn new(stages: Vec<StageSpec>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Run every stage, feeding `input` to the first and writing the last
    /// stage's stdout into `sink`.
    ///
    /// # Errors
    ///
    /// - [`DlxError::Configuration`] if a stage cannot be launched (the
    ///   stages already running are killed and reaped first)
    /// - [`DlxError::Process`] listing every stage that exited unsuccessfully
    ///
    /// On error the sink may hold partial output and must be discarded.
    pub async fn run(&self, input: Stdio, sink: Stdio) -> Result<Vec<StageReport>> {
        if self.stages.is_empty() {
            return Err(DlxError::Configuration(
                "pipeline has no stages".to_string(),
            ));
        }

        let handles = self.spawn_all(input, sink).await?;

        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            reports.push(handle.finish().await);
        }

        let failures: Vec<_> = reports.iter().filter_map(StageReport::failure).collect();
        if !failures.is_empty() {
            for failure in &failures {
                warn!(stage = %failure.stage, status = %failure.status, "Stage failed");
            }
            return Err(PipelineFailure { failures }.into());
        }

        info!(stages = reports.len(), "Pipeline completed");
        Ok(reports)
    }

    async fn spawn_all(&self, input: Stdio, sink: Stdio) -> Result<Vec<ProcessHandle>> {
        let last = self.stages.len() - 1;
        let mut handles: Vec<ProcessHandle> = Vec::with_capacity(self.stages.len());
        let mut next_stdin = Some(input);
        let mut sink = Some(sink);

        for (index, spec) in self.stages.iter().enumerate() {
            let stdin = next_stdin.take().unwrap_or_else(Stdio::null);
            let stdout = if index == last {
                StdoutMode::To(sink.take().unwrap_or_else(Stdio::null))
            } else {
                StdoutMode::Pipe
            };

            let mut handle = match ProcessHandle::spawn(spec, stdin, stdout) {
                Ok(handle) => handle,
                Err(e) => {
                    abort_all(handles).await;
                    return Err(DlxError::Configuration(format!(
                        "Failed to launch {} ({}): {}",
                        spec.name,
                        spec.program.display(),
                        e
                    )));
                }
            };

            if index != last {
                // Moving the pipe out of the producer's handle is what closes
                // our copy once the consumer has been spawned.
                let pipe = match handle
                    .take_stdout()
                    .map(|out| -> std::io::Result<Stdio> { out.try_into() })
                {
                    Some(Ok(pipe)) => pipe,
                    Some(Err(e)) => {
                        handles.push(handle);
                        abort_all(handles).await;
                        return Err(DlxError::Io(e));
                    }
                    None => {
                        handles.push(handle);
                        abort_all(handles).await;
                        return Err(DlxError::Io(std::io::Error::other(format!(
                            "stdout of {} was not piped",
                            spec.name
                        ))));
                    }
                };
                next_stdin = Some(pipe);
            }

            debug!(stage = %spec.name, index, "Stage wired");
            handles.push(handle);
        }

        Ok(handles)
    }
}

/// Kill and reap stages spawned before a launch failure.
async fn abort_all(handles: Vec<ProcessHandle>) {
    for mut handle in handles {
        handle.terminate(std::time::Duration::ZERO).await;
    }
}
