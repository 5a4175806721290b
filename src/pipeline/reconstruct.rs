//! The reconstruction step behind a worker.
//!
//! The fit itself is external. `CommandReconstructor` stages the job payload
//! in a temporary directory and runs a command as
//! `<program> <args...> <input-file> <output-file>`. The output file becomes
//! the result payload and the last non-empty stdout line is the score.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ReconstructError;
use crate::message::{JobDescription, Score};

/// Output of one reconstruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    pub score: Score,
    pub payload: Vec<u8>,
}

/// Runs the reconstruction for one job. May take minutes.
#[async_trait]
pub trait Reconstructor: Send + Sync {
    async fn reconstruct(&self, job: &JobDescription) -> Result<Reconstruction, ReconstructError>;
}

/// Reconstructs by running an external command on staged files.
#[derive(Debug, Clone)]
pub struct CommandReconstructor {
    program: String,
    args: Vec<String>,
    /// Parent directory for the per-job staging directory.
    scratch_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl CommandReconstructor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            scratch_dir: None,
            timeout: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Kills the command and reports a crash if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn staging_dir(&self) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("skyscan-job-");
        match &self.scratch_dir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
    }
}

/// Parses the score from the command's stdout.
///
/// `None` if there is no line or it is not a number. A literal `nan` parses
/// to an undefined score.
fn parse_score(stdout: &str) -> Option<Score> {
    let line = stdout.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    line.parse::<f64>().ok().map(Score::new)
}

#[async_trait]
impl Reconstructor for CommandReconstructor {
    async fn reconstruct(&self, job: &JobDescription) -> Result<Reconstruction, ReconstructError> {
        let start = Instant::now();
        let staging = self.staging_dir()?;
        let input = staging.path().join("in.bin");
        let output = staging.path().join("out.bin");
        tokio::fs::write(&input, &job.payload).await?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&input)
            .arg(&output)
            .env("SKYSCAN_NSIDE", job.job_key.nside.to_string())
            .env("SKYSCAN_PIXEL", job.job_key.pixel.to_string())
            .env("SKYSCAN_VARIANT", job.variant.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %self.program, key = %job.job_key, variant = job.variant, "Starting reconstruction");

        let run = cmd.output();
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
                ReconstructError::Crashed(format!(
                    "{} timed out after {}s",
                    self.program,
                    limit.as_secs()
                ))
            })?,
            None => run.await,
        };
        let out = result.map_err(|e| {
            ReconstructError::Crashed(format!("failed to spawn {}: {}", self.program, e))
        })?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(ReconstructError::Crashed(format!(
                "{} exited with {}: {}",
                self.program,
                out.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&out.stdout);
        let score = parse_score(&stdout).ok_or_else(|| {
            ReconstructError::FitFailed(format!("{} reported no score", self.program))
        })?;

        let payload = match tokio::fs::read(&output).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(key = %job.job_key, variant = job.variant, "Reconstruction wrote no output file");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            key = %job.job_key,
            variant = job.variant,
            score = %score,
            elapsed_secs = start.elapsed().as_secs_f64(),
            "Reconstruction finished"
        );

        Ok(Reconstruction { score, payload })
    }
}
