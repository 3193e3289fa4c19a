#![allow(dead_code)]

use async_trait::async_trait;
use media_downloader::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Semaphore};

/// Engine stand-in whose behaviour is picked by the URL:
/// `fail` returns an error, `panic` panics, `slow` waits on the gate,
/// `nofile` succeeds without writing anything, anything else succeeds and
/// writes `<name>.mp4`.
pub struct FakeEngine {
    pub events: Vec<ProgressEvent>,
    pub gate: Arc<Semaphore>,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<TransferRequest>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::with_events(vec![
            ProgressEvent::downloading(25, Some(100)),
            ProgressEvent::downloading(100, Some(100)),
        ])
    }

    pub fn with_events(events: Vec<ProgressEvent>) -> Self {
        Self {
            events,
            gate: Arc::new(Semaphore::new(0)),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Lets `n` slow downloads finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<TransferRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExtractionEngine for FakeEngine {
    async fn analyze(&self, url: &str) -> Result<MediaInfo, EngineError> {
        if url.contains("fail") {
            return Err(EngineError::Reported("Unsupported URL".into()));
        }
        if url.contains("broken") {
            return Err(EngineError::Spawn {
                program: "yt-dlp".into(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not installed"),
            });
        }
        let info = serde_json::json!({
            "id": "abc",
            "title": "Test clip",
            "uploader": "Tester",
            "formats": [
                {"format_id": "18", "ext": "mp4", "vcodec": "avc1", "acodec": "mp4a", "height": 360}
            ]
        });
        Ok(media_downloader::downloader::media_info_from_json(url, &info))
    }

    async fn download(
        &self,
        request: TransferRequest,
        progress: mpsc::UnboundedSender<ProgressEvent>,
    ) -> Result<(), EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        for event in &self.events {
            let _ = progress.send(event.clone());
        }
        if request.url.contains("slow") {
            let permit = self.gate.acquire().await.expect("gate closed");
            permit.forget();
        }
        if request.url.contains("panic") {
            panic!("engine exploded");
        }
        if request.url.contains("fail") {
            return Err(EngineError::Reported("HTTP Error 403: Forbidden".into()));
        }

        if request.url.contains("nofile") {
            return Ok(());
        }

        let target = request
            .output_template
            .to_string_lossy()
            .replace("%(ext)s", "mp4");
        tokio::fs::write(target, b"media").await?;
        Ok(())
    }
}

/// A manager over a fresh temp directory.
pub struct Harness {
    pub dir: TempDir,
    pub engine: Arc<FakeEngine>,
    pub manager: Arc<JobManager>,
}

impl Harness {
    pub async fn new(workers: usize) -> Self {
        Self::build(FakeEngine::new(), workers, None).await
    }

    pub async fn build(engine: FakeEngine, workers: usize, retain_finished: Option<usize>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json"));
        store
            .save(&Settings {
                download_path: dir.path().join("media"),
                max_concurrent_downloads: workers,
                ..Settings::default()
            })
            .await
            .unwrap();

        let engine = Arc::new(engine);
        let manager = Arc::new(JobManager::new(store, engine.clone(), retain_finished).await);
        Self {
            dir,
            engine,
            manager,
        }
    }

    pub fn media_dir(&self) -> PathBuf {
        self.dir.path().join("media")
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Polls until the job satisfies `done`, panicking after a few seconds.
pub async fn wait_for<F>(manager: &JobManager, id: &str, done: F) -> JobRecord
where
    F: Fn(&JobRecord) -> bool,
{
    for _ in 0..500 {
        let job = manager.get_job(id).await.unwrap();
        if done(&job) {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} did not reach the expected state");
}

pub async fn wait_terminal(manager: &JobManager, id: &str) -> JobRecord {
    wait_for(manager, id, |job| job.status().is_terminal()).await
}

pub fn under(dir: &Path, file: &str) -> String {
    dir.join(file).to_string_lossy().into_owned()
}
