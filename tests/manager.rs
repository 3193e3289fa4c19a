mod common;

use common::{under, wait_for, wait_terminal, FakeEngine, Harness};
use media_downloader::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

#[tokio::test]
async fn new_job_is_not_finished_before_any_work() {
    let h = Harness::new(1).await;
    let id = h.manager.start_download("https://example.com/slow", "best", "clip").await.unwrap();

    let job = h.manager.get_job(&id).await.unwrap();
    assert!(matches!(job.status(), JobStatus::Queued | JobStatus::Downloading));
    assert_eq!(job.url(), "https://example.com/slow");
    assert_eq!(job.format_id(), "best");
    assert_eq!(job.filename(), "clip");
    assert!(job.completed_at().is_none());

    h.engine.release(1);
    wait_terminal(&h.manager, &id).await;
}

#[tokio::test]
async fn empty_inputs_are_rejected_without_creating_a_job() {
    let h = Harness::new(1).await;
    for (url, format, name) in [("", "best", "a"), ("https://x", " ", "a"), ("https://x", "best", "")] {
        let err = h.manager.start_download(url, format, name).await.unwrap_err();
        assert!(matches!(err, ManagerError::InvalidRequest(_)), "{err}");
    }
    assert!(h.manager.list_jobs().await.is_empty());
    assert_eq!(h.engine.calls(), 0);
}

#[tokio::test]
async fn unknown_id_is_not_found() {
    let h = Harness::new(1).await;
    let err = h.manager.get_job("nope").await.unwrap_err();
    assert!(matches!(err, ManagerError::JobNotFound(id) if id == "nope"));
}

#[tokio::test]
async fn successful_job_records_output_file() {
    let h = Harness::new(2).await;
    let id = h.manager.start_download("https://example.com/v", "22", "My: clip?").await.unwrap();

    let job = wait_terminal(&h.manager, &id).await;
    assert_eq!(job.status(), JobStatus::Completed);
    assert_eq!(job.progress(), 100.0);
    assert!(job.completed_at().is_some());
    assert!(job.error().is_none());
    assert_eq!(job.filepath(), Some(under(&h.media_dir(), "My clip.mp4").as_str()));
    assert_eq!(job.downloaded_bytes(), 100);
    assert_eq!(job.total_bytes(), Some(100));

    let request = &h.engine.requests()[0];
    assert_eq!(request.format_id, "22");
    assert_eq!(request.output_template, h.media_dir().join("My clip.%(ext)s"));
}

#[tokio::test]
async fn missing_output_file_still_completes() {
    let h = Harness::new(1).await;
    let id = h.manager.start_download("https://example.com/nofile", "best", "clip").await.unwrap();

    let job = wait_terminal(&h.manager, &id).await;
    assert_eq!(job.status(), JobStatus::Completed);
    assert!(job.filepath().is_none());
}

#[tokio::test]
async fn failing_job_is_isolated_from_the_next_one() {
    let h = Harness::new(1).await;
    let bad = h.manager.start_download("https://example.com/fail", "best", "bad").await.unwrap();
    let good = h.manager.start_download("https://example.com/ok", "best", "good").await.unwrap();

    let bad = wait_terminal(&h.manager, &bad).await;
    assert_eq!(bad.status(), JobStatus::Error);
    assert_eq!(bad.error(), Some("HTTP Error 403: Forbidden"));
    assert!(bad.completed_at().is_some());
    assert!(bad.filepath().is_none());

    let good = wait_terminal(&h.manager, &good).await;
    assert_eq!(good.status(), JobStatus::Completed);
}

#[tokio::test]
async fn unusable_output_directory_fails_before_engine_runs() {
    let h = Harness::new(1).await;
    tokio::fs::remove_dir_all(h.media_dir()).await.unwrap();
    tokio::fs::write(h.media_dir(), b"not a directory").await.unwrap();

    let id = h.manager.start_download("https://example.com/v", "best", "clip").await.unwrap();
    let job = wait_terminal(&h.manager, &id).await;
    assert_eq!(job.status(), JobStatus::Error);
    assert!(job.error().is_some_and(|e| e.contains("could not prepare")));
    assert!(job.completed_at().is_some());
    assert!(job.filepath().is_none());
    assert_eq!(h.engine.calls(), 0);

    // The worker is still usable once the directory is fixed.
    tokio::fs::remove_file(h.media_dir()).await.unwrap();
    let next = h.manager.start_download("https://example.com/v", "best", "next").await.unwrap();
    assert_eq!(wait_terminal(&h.manager, &next).await.status(), JobStatus::Completed);
}

#[tokio::test]
async fn panicking_engine_marks_job_failed_and_pool_survives() {
    let h = Harness::new(1).await;
    let crashed = h.manager.start_download("https://example.com/panic", "best", "x").await.unwrap();

    let job = wait_terminal(&h.manager, &crashed).await;
    assert_eq!(job.status(), JobStatus::Error);
    assert!(job.error().unwrap().contains("engine exploded"));
    assert!(job.completed_at().is_some());

    let next = h.manager.start_download("https://example.com/ok", "best", "y").await.unwrap();
    assert_eq!(wait_terminal(&h.manager, &next).await.status(), JobStatus::Completed);
    assert_eq!(h.manager.pool().panicked(), 1);
}

#[tokio::test]
async fn oversubscribed_pool_runs_every_job_once() {
    let h = Harness::new(2).await;
    let mut ids = Vec::new();
    for i in 0..20 {
        let id = h
            .manager
            .start_download(&format!("https://example.com/{i}"), "best", &format!("file{i}"))
            .await
            .unwrap();
        ids.push(id);
    }
    for id in &ids {
        assert_eq!(wait_terminal(&h.manager, id).await.status(), JobStatus::Completed);
    }
    assert_eq!(h.engine.calls(), 20);
    let urls: HashSet<String> = h.engine.requests().into_iter().map(|r| r.url).collect();
    assert_eq!(urls.len(), 20);
}

#[tokio::test]
async fn concurrent_starts_never_share_an_id() {
    let h = Harness::new(4).await;
    let mut handles = Vec::new();
    for i in 0..1000 {
        let manager = h.manager.clone();
        handles.push(tokio::spawn(async move {
            manager.start_download("https://example.com/same", "best", &format!("n{i}")).await
        }));
    }
    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap().unwrap());
    }
    assert_eq!(ids.len(), 1000);
    assert_eq!(h.manager.list_jobs().await.len(), 1000);
}

#[tokio::test]
async fn list_jobs_keeps_insertion_order() {
    let h = Harness::new(1).await;
    let mut ids = Vec::new();
    for name in ["first", "second", "third"] {
        ids.push(h.manager.start_download("https://example.com/v", "best", name).await.unwrap());
    }
    let listed: Vec<String> = h.manager.list_jobs().await.iter().map(|j| j.id().to_string()).collect();
    assert_eq!(listed, ids);
    for id in &ids {
        wait_terminal(&h.manager, id).await;
    }
}

fn rank(status: JobStatus) -> u8 {
    match status {
        JobStatus::Queued => 0,
        JobStatus::Downloading => 1,
        JobStatus::Completed | JobStatus::Error => 2,
    }
}

#[tokio::test]
async fn sampled_status_only_moves_forward() {
    let h = Harness::new(1).await;
    let id = h.manager.start_download("https://example.com/slow", "best", "clip").await.unwrap();

    let sampler = {
        let manager = h.manager.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let mut last = manager.get_job(&id).await.unwrap();
            for _ in 0..300 {
                let now = manager.get_job(&id).await.unwrap();
                assert!(rank(now.status()) >= rank(last.status()));
                if last.status().is_terminal() {
                    assert_eq!(now.status(), last.status());
                    assert_eq!(now.completed_at(), last.completed_at());
                }
                assert_eq!(now.completed_at().is_some(), now.status().is_terminal());
                last = now;
                tokio::task::yield_now().await;
            }
        })
    };

    wait_for(&h.manager, &id, |j| j.status() == JobStatus::Downloading).await;
    h.engine.release(1);
    wait_terminal(&h.manager, &id).await;
    sampler.await.unwrap();
}

#[tokio::test]
async fn progress_events_are_applied_in_order() {
    let events = (1..=5)
        .map(|i| ProgressEvent::downloading(i * 10, Some(100)))
        .collect();
    let h = Harness::build(FakeEngine::with_events(events), 1, None).await;
    let id = h.manager.start_download("https://example.com/slow", "best", "clip").await.unwrap();

    let job = wait_for(&h.manager, &id, |j| j.downloaded_bytes() == 50).await;
    assert_eq!(job.status(), JobStatus::Downloading);
    assert_eq!(job.progress(), 50.0);

    h.engine.release(1);
    assert_eq!(wait_terminal(&h.manager, &id).await.progress(), 100.0);
}

#[tokio::test]
async fn unknown_size_never_reaches_hundred_before_completion() {
    let events = (0..20).map(|i| ProgressEvent::downloading(i, None)).collect();
    let h = Harness::build(FakeEngine::with_events(events), 1, None).await;
    let id = h.manager.start_download("https://example.com/slow", "best", "clip").await.unwrap();

    let job = wait_for(&h.manager, &id, |j| j.downloaded_bytes() == 19).await;
    assert_eq!(job.progress(), 90.0);
    assert_eq!(job.status(), JobStatus::Downloading);

    h.engine.release(1);
    assert_eq!(wait_terminal(&h.manager, &id).await.progress(), 100.0);
}

#[tokio::test]
async fn new_directory_applies_only_to_later_jobs() {
    let h = Harness::new(2).await;
    let early = h.manager.start_download("https://example.com/slow", "best", "early").await.unwrap();
    wait_for(&h.manager, &early, |j| j.status() == JobStatus::Downloading).await;

    let moved = h.path("moved");
    let mut settings = h.manager.settings().await;
    settings.download_path = moved.clone();
    h.manager.save_settings(settings).await.unwrap();
    assert!(moved.is_dir());

    let late = h.manager.start_download("https://example.com/v", "best", "late").await.unwrap();
    let late = wait_terminal(&h.manager, &late).await;
    assert_eq!(late.filepath(), Some(under(&moved, "late.mp4").as_str()));

    h.engine.release(1);
    let early = wait_terminal(&h.manager, &early).await;
    assert_eq!(early.filepath(), Some(under(&h.media_dir(), "early.mp4").as_str()));

    let reloaded = SettingsStore::new(h.path("settings.json")).load().await;
    assert_eq!(reloaded.download_path, moved);
}

#[tokio::test]
async fn retention_limit_evicts_oldest_finished_jobs() {
    let h = Harness::build(FakeEngine::new(), 1, Some(2)).await;
    let mut ids = Vec::new();
    for i in 0..4 {
        let id = h
            .manager
            .start_download(&format!("https://example.com/{i}"), "best", &format!("f{i}"))
            .await
            .unwrap();
        ids.push(id);
    }
    // The last job is the one that triggers the final eviction pass.
    for _ in 0..500 {
        if h.manager.pool().finished() == 4 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let kept: Vec<String> = h.manager.list_jobs().await.iter().map(|j| j.id().to_string()).collect();
    assert_eq!(kept, ids[2..].to_vec());
    assert!(matches!(h.manager.get_job(&ids[0]).await, Err(ManagerError::JobNotFound(_))));
}

#[tokio::test]
async fn analyze_validates_and_delegates() {
    let h = Harness::new(1).await;
    assert!(matches!(h.manager.analyze(" ").await, Err(ManagerError::InvalidRequest(_))));

    let info = h.manager.analyze("https://example.com/v").await.unwrap();
    assert_eq!(info.title, "Test clip");
    assert_eq!(info.formats.len(), 1);

    let err = h.manager.analyze("https://example.com/fail").await.unwrap_err();
    assert!(matches!(err, ManagerError::Engine(EngineError::Reported(_))));
}

#[tokio::test]
async fn jobs_sharing_engine_do_not_block_status_reads() {
    let h = Harness::new(1).await;
    let engine = Arc::clone(&h.engine);
    let id = h.manager.start_download("https://example.com/slow", "best", "held").await.unwrap();
    wait_for(&h.manager, &id, |j| j.status() == JobStatus::Downloading).await;

    // The engine is parked inside the transfer; reads and new submissions
    // must still go through.
    assert_eq!(h.manager.list_jobs().await.len(), 1);
    let queued = h.manager.start_download("https://example.com/v", "best", "next").await.unwrap();
    assert_eq!(h.manager.get_job(&queued).await.unwrap().status(), JobStatus::Queued);

    engine.release(1);
    wait_terminal(&h.manager, &id).await;
    wait_terminal(&h.manager, &queued).await;
}
