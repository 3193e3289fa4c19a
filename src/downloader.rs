// src/downloader.rs

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::models::{EventStatus, ProgressEvent};

/// Errors raised by an extraction engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// The engine ran and reported a failure of its own.
    #[error("{0}")]
    Reported(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed engine output: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// What to fetch and where the engine should write it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub url: String,
    pub format_id: String,
    /// Output path with an `%(ext)s` placeholder for the final extension.
    pub output_template: PathBuf,
}

/// One encoding offered for a media URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormatInfo {
    pub id: String,
    pub ext: String,
    pub resolution: String,
    pub filesize: Option<u64>,
    pub bitrate: Option<f64>,
    pub vcodec: String,
    pub acodec: String,
    pub format_note: String,
    pub url: String,
    pub protocol: String,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub fps: Option<f64>,
    pub dynamic_range: Option<String>,
}

/// Metadata returned by [`ExtractionEngine::analyze`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    pub id: String,
    pub title: String,
    pub description: String,
    pub author: String,
    pub uploader: String,
    pub duration: f64,
    pub view_count: u64,
    pub thumbnail: String,
    pub url: String,
    pub webpage_url: String,
    pub formats: Vec<FormatInfo>,
}

/// The external collaborator that resolves URLs and moves the bytes.
#[async_trait]
pub trait ExtractionEngine: Send + Sync {
    async fn analyze(&self, url: &str) -> Result<MediaInfo, EngineError>;

    /// Performs the transfer, sending progress events in the order they
    /// happen. Returns once the output file is final.
    async fn download(
        &self,
        request: TransferRequest,
        progress: mpsc::UnboundedSender<ProgressEvent>,
    ) -> Result<(), EngineError>;
}

const PROGRESS_PREFIX: &str = "progress|";
const PROGRESS_TEMPLATE: &str = "download:progress|%(progress.status)s|%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress.speed)s|%(progress.eta)s";

/// Drives the `yt-dlp` program as a child process.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
}

impl Default for YtDlp {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> EngineError {
        EngineError::Spawn {
            program: self.program.display().to_string(),
            source,
        }
    }

    fn download_args(request: &TransferRequest) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            request.format_id.clone(),
            "-o".to_string(),
            request.output_template.to_string_lossy().into_owned(),
            "--quiet".to_string(),
            "--no-warnings".to_string(),
            "--progress".to_string(),
            "--newline".to_string(),
            "--progress-template".to_string(),
            PROGRESS_TEMPLATE.to_string(),
            "--socket-timeout".to_string(),
            "30".to_string(),
            "--retries".to_string(),
            "3".to_string(),
            "--no-overwrites".to_string(),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
        ];
        if request.format_id.contains("video") {
            args.push("--recode-video".to_string());
            args.push("mp4".to_string());
        }
        args.push("--".to_string());
        args.push(request.url.clone());
        args
    }
}

#[async_trait]
impl ExtractionEngine for YtDlp {
    async fn analyze(&self, url: &str) -> Result<MediaInfo, EngineError> {
        let output = self
            .command()
            .args(["-J", "--skip-download", "--no-warnings", "--", url])
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Reported(failure_message(&stderr, output.status)));
        }
        let info: Value = serde_json::from_slice(&output.stdout)?;
        Ok(media_info_from_json(url, &info))
    }

    async fn download(
        &self,
        request: TransferRequest,
        progress: mpsc::UnboundedSender<ProgressEvent>,
    ) -> Result<(), EngineError> {
        let mut child = self
            .command()
            .args(Self::download_args(&request))
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // yt-dlp may print bytes that are not UTF-8 (titles, local code
        // pages), so both streams are decoded lossily.
        let read_progress = async {
            let Some(stdout) = stdout else { return Ok::<_, std::io::Error>(()) };
            let mut lines = BufReader::new(stdout).split(b'\n');
            while let Some(line) = lines.next_segment().await? {
                if let Some(event) = parse_progress_line(&String::from_utf8_lossy(&line)) {
                    // The receiver going away only means nobody is watching.
                    let _ = progress.send(event);
                }
            }
            Ok(())
        };
        let read_errors = async {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                stderr.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(String::from_utf8_lossy(&buf).into_owned())
        };

        let (progress_result, stderr_result) = tokio::join!(read_progress, read_errors);
        let status = child.wait().await?;
        let stderr = match stderr_result {
            Ok(stderr) => stderr,
            Err(e) => {
                tracing::warn!("could not read yt-dlp stderr: {e}");
                String::new()
            }
        };
        if !status.success() {
            return Err(EngineError::Reported(failure_message(&stderr, status)));
        }
        progress_result?;
        Ok(())
    }
}

/// Parses one stdout line produced by [`PROGRESS_TEMPLATE`].
/// yt-dlp prints `NA` for fields it does not know.
pub fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let fields: Vec<&str> = rest.split('|').collect();
    if fields.len() != 6 {
        return None;
    }
    let number = |s: &str| s.trim().parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0);
    let count = |s: &str| number(s).map(|v| v as u64);

    let status = match fields[0].trim() {
        "downloading" => EventStatus::Downloading,
        "finished" => EventStatus::Finished,
        _ => EventStatus::Other,
    };
    Some(ProgressEvent {
        status,
        downloaded_bytes: count(fields[1]),
        total_bytes: count(fields[2]),
        total_bytes_estimate: count(fields[3]),
        speed: number(fields[4]),
        eta: count(fields[5]),
    })
}

fn failure_message(stderr: &str, status: ExitStatus) -> String {
    reported_error(stderr).unwrap_or_else(|| format!("yt-dlp exited with {status}"))
}

/// The last `ERROR:` line, or the whole of stderr when there is none.
fn reported_error(stderr: &str) -> Option<String> {
    let line = stderr
        .lines()
        .rev()
        .find_map(|l| l.trim().strip_prefix("ERROR:"))
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty());
    line.or_else(|| Some(stderr.trim().to_string()).filter(|s| !s.is_empty()))
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Builds [`MediaInfo`] from yt-dlp's JSON, dropping formats that carry
/// neither audio nor video.
pub fn media_info_from_json(url: &str, info: &Value) -> MediaInfo {
    let formats = info
        .get("formats")
        .and_then(Value::as_array)
        .map(|formats| {
            formats
                .iter()
                .filter_map(|f| {
                    let vcodec = str_field(f, "vcodec").unwrap_or_else(|| "none".into());
                    let acodec = str_field(f, "acodec").unwrap_or_else(|| "none".into());
                    if vcodec == "none" && acodec == "none" {
                        return None;
                    }
                    let height = f.get("height").and_then(Value::as_u64);
                    Some(FormatInfo {
                        id: str_field(f, "format_id").unwrap_or_default(),
                        ext: str_field(f, "ext").unwrap_or_else(|| "mp4".into()),
                        resolution: height.map_or_else(|| "N/A".into(), |h| h.to_string()),
                        filesize: f
                            .get("filesize")
                            .and_then(Value::as_u64)
                            .or_else(|| f.get("filesize_approx").and_then(Value::as_u64)),
                        bitrate: f.get("tbr").and_then(Value::as_f64),
                        vcodec,
                        acodec,
                        format_note: str_field(f, "format_note").unwrap_or_default(),
                        url: str_field(f, "url").unwrap_or_default(),
                        protocol: str_field(f, "protocol").unwrap_or_else(|| "http".into()),
                        width: f.get("width").and_then(Value::as_u64),
                        height,
                        fps: f.get("fps").and_then(Value::as_f64),
                        dynamic_range: str_field(f, "dynamic_range"),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let uploader = str_field(info, "uploader");
    MediaInfo {
        id: str_field(info, "id").unwrap_or_default(),
        title: str_field(info, "title").unwrap_or_else(|| "Unknown Title".into()),
        description: str_field(info, "description").unwrap_or_default(),
        author: uploader
            .clone()
            .or_else(|| str_field(info, "channel"))
            .unwrap_or_else(|| "Unknown Author".into()),
        uploader: uploader.unwrap_or_default(),
        duration: info.get("duration").and_then(Value::as_f64).unwrap_or(0.0),
        view_count: info.get("view_count").and_then(Value::as_u64).unwrap_or(0),
        thumbnail: str_field(info, "thumbnail").unwrap_or_default(),
        url: url.to_string(),
        webpage_url: str_field(info, "webpage_url").unwrap_or_else(|| url.to_string()),
        formats,
    }
}
