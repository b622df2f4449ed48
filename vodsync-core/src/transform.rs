use std::io;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::TranscodeSection;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("transcoder {program} is unavailable: {source}")]
    Unavailable { program: PathBuf, source: io::Error },
    #[error("transcoder exited with status {status:?}: {stderr}")]
    CommandFailure { status: Option<i32>, stderr: String },
    #[error("transcoder produced no output at {0}")]
    EmptyOutput(PathBuf),
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
}

pub type TransformResult<T> = Result<T, TransformError>;

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> io::Result<Output> {
        command.kill_on_drop(true).output().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOptions {
    pub enabled: bool,
    pub program: PathBuf,
    pub crf: u8,
    pub preset: String,
    pub audio_bitrate: String,
    pub max_width: Option<u32>,
    pub work_dir: PathBuf,
}

impl From<&TranscodeSection> for TransformOptions {
    fn from(section: &TranscodeSection) -> Self {
        Self {
            enabled: section.enabled,
            program: section.ffmpeg.clone(),
            crf: section.crf,
            preset: section.preset.clone(),
            audio_bitrate: section.audio_bitrate.clone(),
            max_width: section.max_width,
            work_dir: section.work_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutcome {
    pub path: PathBuf,
    pub transformed: bool,
}

impl TransformOutcome {
    fn passthrough(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            transformed: false,
        }
    }
}

/// Single-attempt ffmpeg re-encode that fails open to the input artifact.
pub struct Transcoder {
    options: TransformOptions,
    executor: Arc<dyn CommandExecutor>,
}

impl std::fmt::Debug for Transcoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcoder")
            .field("options", &self.options)
            .finish()
    }
}

impl Transcoder {
    pub fn new(options: TransformOptions) -> Self {
        Self {
            options,
            executor: Arc::new(SystemCommandExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Where the transcoded copy of `artifact` is written. Kept outside the
    /// watched directory.
    pub fn output_path_for(&self, artifact: &Path) -> PathBuf {
        let stem = artifact
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact".to_string());
        self.options.work_dir.join(format!("{stem}_transcoded.mp4"))
    }

    pub fn build_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            self.options.preset.clone(),
            "-crf".to_string(),
            self.options.crf.to_string(),
        ];
        if let Some(width) = self.options.max_width {
            args.push("-vf".to_string());
            args.push(format!("scale='min({width},iw)':-2"));
        }
        args.extend([
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            self.options.audio_bitrate.clone(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            output.to_string_lossy().to_string(),
        ]);
        args
    }

    /// Returns the transcoded artifact, or the input unchanged when the stage
    /// is disabled, the tool is missing, or the run fails.
    pub async fn transform(&self, artifact: &Path) -> TransformOutcome {
        if !self.options.enabled {
            return TransformOutcome::passthrough(artifact);
        }
        let output = self.output_path_for(artifact);
        match self.run_transcode(artifact, &output).await {
            Ok(()) => {
                info!(input = %artifact.display(), output = %output.display(), "transcoded artifact");
                TransformOutcome {
                    path: output,
                    transformed: true,
                }
            }
            Err(err) => {
                warn!(input = %artifact.display(), error = %err, "transcode failed, delivering original artifact");
                if let Err(remove_err) = fs::remove_file(&output).await {
                    if remove_err.kind() != io::ErrorKind::NotFound {
                        warn!(path = %output.display(), error = %remove_err, "failed to remove partial transcode output");
                    }
                }
                TransformOutcome::passthrough(artifact)
            }
        }
    }

    async fn run_transcode(&self, input: &Path, output: &Path) -> TransformResult<()> {
        fs::create_dir_all(&self.options.work_dir)
            .await
            .map_err(|source| TransformError::Io {
                source,
                path: self.options.work_dir.clone(),
            })?;
        let mut command = Command::new(&self.options.program);
        command.args(self.build_args(input, output));
        let result = self
            .executor
            .run(&mut command)
            .await
            .map_err(|source| match source.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                    TransformError::Unavailable {
                        program: self.options.program.clone(),
                        source,
                    }
                }
                _ => TransformError::Io {
                    source,
                    path: self.options.program.clone(),
                },
            })?;
        if !result.status.success() {
            return Err(TransformError::CommandFailure {
                status: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        match fs::metadata(output).await {
            Ok(metadata) if metadata.len() > 0 => Ok(()),
            _ => Err(TransformError::EmptyOutput(output.to_path_buf())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[cfg(unix)]
    use std::os::unix::process::ExitStatusExt;
    #[cfg(windows)]
    use std::os::windows::process::ExitStatusExt;

    #[derive(Clone, Copy)]
    enum Behaviour {
        WriteOutput,
        Fail,
        SucceedWithoutOutput,
        Missing,
    }

    struct FakeExecutor {
        behaviour: Behaviour,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl FakeExecutor {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CommandExecutor for FakeExecutor {
        async fn run(&self, command: &mut Command) -> io::Result<Output> {
            let args: Vec<String> = command
                .as_std()
                .get_args()
                .map(|arg| arg.to_string_lossy().to_string())
                .collect();
            self.calls.lock().unwrap().push(args.clone());
            let output_path = PathBuf::from(args.last().cloned().unwrap_or_default());
            match self.behaviour {
                Behaviour::Missing => Err(io::Error::new(io::ErrorKind::NotFound, "ffmpeg")),
                Behaviour::WriteOutput => {
                    std::fs::write(&output_path, b"encoded")?;
                    Ok(Output {
                        status: std::process::ExitStatus::from_raw(0),
                        stdout: Vec::new(),
                        stderr: Vec::new(),
                    })
                }
                Behaviour::SucceedWithoutOutput => Ok(Output {
                    status: std::process::ExitStatus::from_raw(0),
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                }),
                Behaviour::Fail => {
                    std::fs::write(&output_path, b"partial")?;
                    Ok(Output {
                        status: std::process::ExitStatus::from_raw(256),
                        stdout: Vec::new(),
                        stderr: b"invalid data".to_vec(),
                    })
                }
            }
        }
    }

    fn options(work_dir: &Path, enabled: bool) -> TransformOptions {
        TransformOptions {
            enabled,
            program: PathBuf::from("ffmpeg"),
            crf: 28,
            preset: "fast".into(),
            audio_bitrate: "128k".into(),
            max_width: Some(1280),
            work_dir: work_dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn disabled_stage_passes_artifact_through() {
        let dir = tempdir().unwrap();
        let executor = FakeExecutor::new(Behaviour::WriteOutput);
        let transcoder =
            Transcoder::new(options(dir.path(), false)).with_executor(executor.clone());
        let input = dir.path().join("W1_Foe_Pull1_Sep03_10-16PM.mp4");
        let outcome = transcoder.transform(&input).await;
        assert_eq!(outcome, TransformOutcome::passthrough(&input));
        assert!(executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn successful_run_returns_work_dir_output() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("work");
        let executor = FakeExecutor::new(Behaviour::WriteOutput);
        let transcoder = Transcoder::new(options(&work, true)).with_executor(executor.clone());
        let input = dir.path().join("W1_Foe_Pull1_Sep03_10-16PM.mp4");
        let outcome = transcoder.transform(&input).await;
        assert!(outcome.transformed);
        assert_eq!(outcome.path, work.join("W1_Foe_Pull1_Sep03_10-16PM_transcoded.mp4"));

        let calls = executor.calls.lock().unwrap();
        let args = &calls[0];
        assert!(args.windows(2).any(|w| w[0] == "-crf" && w[1] == "28"));
        assert!(args.windows(2).any(|w| w[0] == "-b:a" && w[1] == "128k"));
        assert!(args.contains(&"scale='min(1280,iw)':-2".to_string()));
    }

    #[tokio::test]
    async fn missing_tool_falls_back_to_input() {
        let dir = tempdir().unwrap();
        let transcoder = Transcoder::new(options(dir.path(), true))
            .with_executor(FakeExecutor::new(Behaviour::Missing));
        let input = dir.path().join("clip.mp4");
        let outcome = transcoder.transform(&input).await;
        assert_eq!(outcome, TransformOutcome::passthrough(&input));
    }

    #[tokio::test]
    async fn failed_run_removes_partial_output() {
        let dir = tempdir().unwrap();
        let transcoder = Transcoder::new(options(dir.path(), true))
            .with_executor(FakeExecutor::new(Behaviour::Fail));
        let input = dir.path().join("clip.mp4");
        let outcome = transcoder.transform(&input).await;
        assert!(!outcome.transformed);
        assert!(!transcoder.output_path_for(&input).exists());
    }

    #[tokio::test]
    async fn empty_output_falls_back_to_input() {
        let dir = tempdir().unwrap();
        let transcoder = Transcoder::new(options(dir.path(), true))
            .with_executor(FakeExecutor::new(Behaviour::SucceedWithoutOutput));
        let input = dir.path().join("clip.mp4");
        let outcome = transcoder.transform(&input).await;
        assert_eq!(outcome.path, input);
    }
}
