//! Shared helpers for the integration suites: a fresh engine over a
//! temporary storage directory, status polling, and a fake JSON-API
//! upstream.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pica_server::comic::Source;
use pica_server::task::{Task, TaskScheduler, TaskStatus, TaskStore};
use pica_server::{Database, Library, Policy, Storage};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A complete engine over its own storage directory.
pub struct TestEngine {
    pub storage: Storage,
    pub store: Arc<TaskStore>,
    pub library: Library,
    pub scheduler: Arc<TaskScheduler>,
    _dir: Option<tempfile::TempDir>,
}

/// Fresh engine over a fresh temporary directory.
pub async fn engine() -> TestEngine {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut built = engine_at(dir.path(), Policy::default()).await;
    built._dir = Some(dir);
    built
}

/// Engine over an existing directory (used to simulate a restart).
pub async fn engine_at(root: &Path, policy: Policy) -> TestEngine {
    let storage = Storage::new(root);
    storage.ensure_layout().expect("storage layout");

    let db = Database::new(&storage.db_path()).await.expect("database");
    let store = Arc::new(TaskStore::new(db.clone()));
    let library = Library::new(db);
    let scheduler = TaskScheduler::new(
        Arc::clone(&store),
        library.clone(),
        storage.clone(),
        policy,
        false,
    );

    TestEngine {
        storage,
        store,
        library,
        scheduler,
        _dir: None,
    }
}

/// Polls a task until it reaches `want` or the timeout expires.
pub async fn wait_status(store: &TaskStore, id: &str, want: TaskStatus) -> Task {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let task = store.get(id).await.expect("task row");
        if task.status() == want {
            return task;
        }
        assert!(
            Instant::now() < deadline,
            "task {id} stuck in {} waiting for {want}",
            task.status()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Polls until `probe` returns true or the timeout expires.
pub async fn wait_until<F>(what: &str, mut probe: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(15);
    while !probe() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Stores auth pointing the flat-JSON adapter at a fake upstream.
pub async fn point_nhentai_at(store: &TaskStore, upstream: &MockServer) {
    let payload = serde_json::json!({
        "apiBaseUrl": upstream.uri(),
        "imageBaseUrl": upstream.uri(),
        "thumbBaseUrl": upstream.uri(),
    });
    store
        .put_auth(Source::Nhentai, &payload.to_string())
        .await
        .expect("store auth");
}

/// Mounts a two-page gallery (`media_id` "1", types j/p) plus its images.
///
/// Returns the page-body bytes so tests can assert on file contents.
pub async fn mount_two_page_gallery(server: &MockServer) -> (Vec<u8>, Vec<u8>) {
    mount_gallery_json(server, 0).await;

    let page1 = b"jpeg-bytes-page-1".to_vec();
    let page2 = b"png-bytes-page-2!".to_vec();

    Mock::given(method("GET"))
        .and(path("/galleries/1/cover.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"cover-bytes".to_vec()))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/galleries/1/1.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(page1.clone()))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/galleries/1/2.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(page2.clone()))
        .mount(server)
        .await;

    (page1, page2)
}

/// Mounts only the gallery JSON, optionally delayed.
pub async fn mount_gallery_json(server: &MockServer, delay_ms: u64) {
    let gallery = serde_json::json!({
        "media_id": "1",
        "title": {"english": "Sample Gallery", "japanese": "サンプル"},
        "images": {
            "cover": {"t": "j"},
            "pages": [{"t": "j"}, {"t": "p"}]
        },
        "tags": [
            {"type": "tag", "name": "sample"},
            {"type": "language", "name": "japanese"}
        ]
    });
    let mut template = ResponseTemplate::new(200).set_body_json(gallery);
    if delay_ms > 0 {
        template = template.set_delay(Duration::from_millis(delay_ms));
    }
    Mock::given(method("GET"))
        .and(path("/api/gallery/177013"))
        .respond_with(template)
        .mount(server)
        .await;
}

/// Counts requests whose path equals `wanted`.
pub async fn requests_to(server: &MockServer, wanted: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == wanted)
        .count()
}
