//! End-to-end task engine scenarios against a fake flat-JSON upstream.
//!
//! These exercise the full path: create -> queue -> worker -> adapter ->
//! commit -> terminal state, plus pause/resume, cancel, duplicate
//! rejection, retry after upstream recovery, and restart recovery.

mod support;

use pica_server::comic::Source;
use pica_server::task::{SchedulerError, TaskParams, TaskStatus};
use pica_server::Policy;
use support::{
    engine, engine_at, mount_gallery_json, mount_two_page_gallery, point_nhentai_at, requests_to,
    wait_status, wait_until,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_s1_download_commits_library_row_and_files() {
    let upstream = MockServer::start().await;
    let (page1, page2) = mount_two_page_gallery(&upstream).await;

    let engine = engine().await;
    point_nhentai_at(&engine.store, &upstream).await;

    let task = engine
        .scheduler
        .create_download_task(Source::Nhentai, "177013", TaskParams::default())
        .await
        .expect("create");

    let done = wait_status(&engine.store, &task.id, TaskStatus::Succeeded).await;
    assert_eq!(done.comic_id.as_deref(), Some("nhentai177013"));
    assert_eq!(done.total, 3, "cover + 2 pages");
    assert_eq!(done.progress, done.total);

    let comic_dir = engine.storage.comic_dir("nhentai177013");
    assert_eq!(std::fs::read(comic_dir.join("cover.jpg")).unwrap(), b"cover-bytes");
    assert_eq!(std::fs::read(comic_dir.join("pages/1.jpg")).unwrap(), page1);
    assert_eq!(std::fs::read(comic_dir.join("pages/2.png")).unwrap(), page2);

    // Staging is gone after commit.
    assert!(!engine.storage.task_dir(&task.id).exists());

    let row = engine.library.get("nhentai177013").await.unwrap().unwrap();
    assert_eq!(row.title, "Sample Gallery");
    assert_eq!(row.size, (page1.len() + page2.len()) as i64);
    assert!(row.cover_path.is_some());
    assert_eq!(row.meta().unwrap().id, "nhentai177013");
}

#[tokio::test]
async fn test_s2_retry_budget_exhaustion_then_manual_retry() {
    let upstream = MockServer::start().await;
    mount_gallery_json(&upstream, 0).await;
    Mock::given(method("GET"))
        .and(path("/galleries/1/cover.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"cover".to_vec()))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/galleries/1/1.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"page-1".to_vec()))
        .mount(&upstream)
        .await;
    // Page 2: three 429s (exactly the 1 + fileRetries=2 attempt budget),
    // then recovery.
    Mock::given(method("GET"))
        .and(path("/galleries/1/2.png"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(3)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/galleries/1/2.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"page-2".to_vec()))
        .mount(&upstream)
        .await;

    let engine = engine().await;
    point_nhentai_at(&engine.store, &upstream).await;

    let task = engine
        .scheduler
        .create_download_task(Source::Nhentai, "177013", TaskParams::default())
        .await
        .expect("create");

    let failed = wait_status(&engine.store, &task.id, TaskStatus::Failed).await;
    let message = failed.message.expect("failure message");
    assert!(message.contains("bad status: 429"), "{message}");

    // Completed files stay in staging; the failed page does not exist.
    let staging = engine.storage.task_dir(&task.id);
    assert!(staging.join("pages/1.jpg").exists());
    assert!(!staging.join("pages/2.png").exists());

    // Manual retry after upstream recovery resumes from staging.
    engine.scheduler.retry(&task.id).await.expect("retry");
    let done = wait_status(&engine.store, &task.id, TaskStatus::Succeeded).await;
    assert_eq!(done.progress, 3);
    assert_eq!(done.total, 3);

    // Page 1 was downloaded exactly once across both runs.
    assert_eq!(requests_to(&upstream, "/galleries/1/1.jpg").await, 1);
}

#[tokio::test]
async fn test_s3_pause_keeps_staging_and_resume_skips_done_files() {
    let upstream = MockServer::start().await;
    mount_gallery_json(&upstream, 0).await;
    Mock::given(method("GET"))
        .and(path("/galleries/1/cover.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"cover".to_vec()))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/galleries/1/1.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"page-1".to_vec()))
        .mount(&upstream)
        .await;
    // Page 2 is slow, leaving a window to pause after page 1 lands.
    Mock::given(method("GET"))
        .and(path("/galleries/1/2.png"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"page-2".to_vec())
                .set_delay(std::time::Duration::from_millis(800)),
        )
        .mount(&upstream)
        .await;

    let engine = engine().await;
    point_nhentai_at(&engine.store, &upstream).await;

    let task = engine
        .scheduler
        .create_download_task(Source::Nhentai, "177013", TaskParams::default())
        .await
        .expect("create");

    let staging = engine.storage.task_dir(&task.id);
    let page1 = staging.join("pages/1.jpg");
    wait_until("page 1 on disk", || {
        page1.exists() && std::fs::metadata(&page1).map(|m| m.len() > 0).unwrap_or(false)
    })
    .await;

    engine.scheduler.pause(&task.id).await.expect("pause");
    wait_status(&engine.store, &task.id, TaskStatus::Paused).await;

    // Paused: staging intact.
    assert!(staging.join("pages/1.jpg").exists());

    engine.scheduler.resume(&task.id).await.expect("resume");
    let done = wait_status(&engine.store, &task.id, TaskStatus::Succeeded).await;
    assert_eq!(done.progress, 3);

    // Resume-without-rework: page 1 fetched exactly once overall.
    assert_eq!(requests_to(&upstream, "/galleries/1/1.jpg").await, 1);
    assert!(requests_to(&upstream, "/galleries/1/2.png").await >= 1);

    let comic_dir = engine.storage.comic_dir("nhentai177013");
    assert!(comic_dir.join("pages/1.jpg").exists());
    assert!(comic_dir.join("pages/2.png").exists());
}

#[tokio::test]
async fn test_s4_cancel_tears_down_staging() {
    let upstream = MockServer::start().await;
    mount_gallery_json(&upstream, 0).await;
    // Every file transfer is slow so cancel lands mid-download.
    for file_path in ["/galleries/1/cover.jpg", "/galleries/1/1.jpg", "/galleries/1/2.png"] {
        Mock::given(method("GET"))
            .and(path(file_path))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![9u8; 1024])
                    .set_delay(std::time::Duration::from_millis(700)),
            )
            .mount(&upstream)
            .await;
    }

    let engine = engine().await;
    point_nhentai_at(&engine.store, &upstream).await;

    let task = engine
        .scheduler
        .create_download_task(Source::Nhentai, "177013", TaskParams::default())
        .await
        .expect("create");

    wait_status(&engine.store, &task.id, TaskStatus::Running).await;
    engine.scheduler.cancel(&task.id).await.expect("cancel");
    wait_status(&engine.store, &task.id, TaskStatus::Canceled).await;

    assert!(
        !engine.storage.task_dir(&task.id).exists(),
        "cancel must tear down staging"
    );
}

#[tokio::test]
async fn test_s5_duplicate_submissions() {
    let upstream = MockServer::start().await;
    // Delay the gallery fetch so the first task is still active when the
    // duplicate arrives.
    mount_gallery_json(&upstream, 300).await;
    Mock::given(method("GET"))
        .and(path("/galleries/1/cover.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"c".to_vec()))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/galleries/1/1.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"1".to_vec()))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/galleries/1/2.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"2".to_vec()))
        .mount(&upstream)
        .await;

    let engine = engine().await;
    point_nhentai_at(&engine.store, &upstream).await;

    let first = engine
        .scheduler
        .create_download_task(Source::Nhentai, "177013", TaskParams::default())
        .await
        .expect("first create");

    let duplicate = engine
        .scheduler
        .create_download_task(Source::Nhentai, "177013", TaskParams::default())
        .await;
    assert!(
        matches!(duplicate, Err(SchedulerError::TaskExists)),
        "active duplicate must be rejected"
    );

    wait_status(&engine.store, &first.id, TaskStatus::Succeeded).await;

    let third = engine
        .scheduler
        .create_download_task(Source::Nhentai, "177013", TaskParams::default())
        .await;
    match third {
        Err(SchedulerError::AlreadyDownloaded { comic_id }) => {
            assert_eq!(comic_id, "nhentai177013");
        }
        other => panic!("expected AlreadyDownloaded, got {other:?}"),
    }
}

#[tokio::test]
async fn test_restart_recovery_rewrites_running_and_requeues_queued() {
    let dir = tempfile::tempdir().unwrap();

    // Simulate the previous process: rows left behind in running/queued
    // states, stop tokens lost with the process.
    let queued_id;
    {
        let engine = engine_at(dir.path(), Policy::default()).await;
        // Keep the requeued task off the real network: unreachable local
        // upstream, fails fast after its retry budget.
        engine
            .store
            .put_auth(
                Source::Nhentai,
                r#"{"apiBaseUrl":"http://127.0.0.1:9","imageBaseUrl":"http://127.0.0.1:9","thumbBaseUrl":"http://127.0.0.1:9"}"#,
            )
            .await
            .unwrap();

        let running = engine
            .store
            .insert(Source::Nhentai, "111", &TaskParams::default())
            .await
            .unwrap();
        engine.store.mark_running(&running.id).await.unwrap();

        queued_id = engine
            .store
            .insert(Source::Nhentai, "222", &TaskParams::default())
            .await
            .unwrap()
            .id;

        // Orphan staging with no surviving row.
        std::fs::create_dir_all(engine.storage.task_dir("ghost-task")).unwrap();
    }

    // Fresh process over the same storage. The requeued task runs against
    // the unreachable upstream and fails; what matters is that it was not
    // lost and the interrupted one was rewritten.
    let engine = engine_at(dir.path(), Policy::default()).await;
    engine.scheduler.recover_and_start().await.expect("recovery");

    let tasks = engine.store.list(10).await.unwrap();
    let interrupted = tasks.iter().find(|t| t.target == "111").unwrap();
    assert_eq!(interrupted.status(), TaskStatus::Failed);
    assert_eq!(interrupted.message.as_deref(), Some("server restarted"));

    let requeued = wait_status(&engine.store, &queued_id, TaskStatus::Failed).await;
    assert_ne!(
        requeued.message.as_deref(),
        Some("server restarted"),
        "the queued task must have been re-run, not rewritten"
    );

    assert!(
        !engine.storage.task_dir("ghost-task").exists(),
        "orphan staging must be swept"
    );
}

#[tokio::test]
async fn test_delete_refused_while_running_then_allowed() {
    let upstream = MockServer::start().await;
    mount_gallery_json(&upstream, 600).await;

    let engine = engine().await;
    point_nhentai_at(&engine.store, &upstream).await;

    let task = engine
        .scheduler
        .create_download_task(Source::Nhentai, "177013", TaskParams::default())
        .await
        .expect("create");

    wait_status(&engine.store, &task.id, TaskStatus::Running).await;
    let refused = engine.scheduler.delete(&task.id).await;
    assert!(matches!(refused, Err(SchedulerError::TaskRunning)));

    engine.scheduler.cancel(&task.id).await.expect("cancel");
    wait_status(&engine.store, &task.id, TaskStatus::Canceled).await;

    engine.scheduler.delete(&task.id).await.expect("delete");
    assert!(matches!(
        engine.scheduler.delete(&task.id).await,
        Err(SchedulerError::NotFound)
    ));
}

#[tokio::test]
async fn test_missing_auth_fails_with_key_name() {
    let engine = engine().await;
    // No auth stored for the cookie-gated source.
    let task = engine
        .scheduler
        .create_download_task(
            Source::Ehentai,
            "https://e-hentai.org/g/2618183/5d2b1f0a51/",
            TaskParams::default(),
        )
        .await
        .expect("create");

    let failed = wait_status(&engine.store, &task.id, TaskStatus::Failed).await;
    let message = failed.message.expect("message");
    assert!(message.contains("missing auth.cookie"), "{message}");
}
