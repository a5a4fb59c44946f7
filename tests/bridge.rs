//! Async plugin surface

use catrender::bridge::{BatchRequest, Bridge, RenderEvent, RenderRequest};
use catrender::job::RenderJob;
use catrender::platform::Platform;
use catrender::rendering::worker::{RenderImageRequest, WorkerOptions, WorkerRenderer};
use catrender::service::ResumeOutcome;
use catrender::{RenderConfig, Storage};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn bridge(dir: &std::path::Path) -> Bridge {
    init_logs();
    let config = RenderConfig {
        item_throttle_ms: 0,
        complete_stop_delay_ms: 0,
        error_stop_delay_ms: 0,
        ..Default::default()
    };
    let renderer = Arc::new(WorkerRenderer::new(WorkerOptions {
        scale: 1,
        ..Default::default()
    }));
    Bridge::with_renderer(Platform::headless(Storage::new(dir)), config, renderer)
}

fn request(product: &str, label: &str) -> RenderImageRequest {
    RenderImageRequest {
        html: r#"<div style="width: 60px; height: 30px; background-color: #336699"><p>Cat</p></div>"#.into(),
        product_id: product.into(),
        catalogue_label: label.into(),
        catalogue_type: None,
        options: WorkerOptions {
            scale: 1,
            ..Default::default()
        },
    }
}

#[tokio::test]
async fn render_rejects_missing_fields() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = bridge(dir.path());
    let err = bridge
        .render(RenderRequest {
            html: Some("<p>x</p>".into()),
            file_name: None,
            folder_name: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Invalid input: html or fileName missing");
    bridge.shutdown();
}

async fn wait_for(storage: &Storage, folder: &str, file: &str) -> bool {
    for _ in 0..100 {
        if storage.exists(folder, file) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    storage.exists(folder, file)
}

#[tokio::test]
async fn render_runs_the_job_in_the_background() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = bridge(dir.path());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    bridge.on_event(Arc::new(move |e: &RenderEvent| sink.lock().unwrap().push(e.clone())));

    bridge
        .render(RenderRequest {
            html: Some("<h1>Teddy</h1>".into()),
            file_name: Some("x.png".into()),
            folder_name: None,
        })
        .await
        .unwrap();
    assert!(bridge.queue().is_started());

    let completed = || {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, RenderEvent::Complete { file_name, .. } if file_name == "x.png"))
    };
    for _ in 0..100 {
        if completed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(completed());
    assert!(bridge.queue().pending().is_empty());
    let bytes = Storage::new(dir.path()).read("renders", "x.png").unwrap();
    assert_eq!(&bytes[1..4], b"PNG");
    bridge.shutdown();
}

#[tokio::test]
async fn render_batch_uses_default_folder() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = bridge(dir.path());
    let reply = bridge
        .render_batch(BatchRequest {
            render_jobs: vec![RenderJob::new("<p>a</p>", "a.png"), RenderJob::new("<p>b</p>", "b.png")],
            folder_name: None,
        })
        .await
        .unwrap();
    assert_eq!(reply.job_count, 2);
    assert_eq!(reply.message, "2 render jobs enqueued");

    let storage = Storage::new(dir.path());
    assert!(wait_for(&storage, "renders", "a.png").await);
    assert!(wait_for(&storage, "renders", "b.png").await);

    assert!(bridge
        .render_batch(BatchRequest {
            render_jobs: Vec::new(),
            folder_name: None,
        })
        .await
        .is_err());
    bridge.shutdown();
}

#[tokio::test]
async fn cancel_renders_drops_units_not_yet_started() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = bridge(dir.path());
    // persisted directly, so the queue worker is not running
    bridge.queue().enqueue(RenderJob::new("<p>later</p>", "later.png")).unwrap();
    assert!(!bridge.queue().is_started());
    assert_eq!(bridge.cancel_renders().await.unwrap(), 1);
    assert!(bridge.queue().pending().is_empty());
    bridge.shutdown();
}

#[tokio::test]
async fn start_rendering_requires_render_data() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = bridge(dir.path());
    bridge.cancel_worker().await.unwrap();
    let err = bridge.start_rendering(serde_json::json!({})).await.unwrap_err();
    assert_eq!(err.to_string(), "Invalid input: Render data is required");
    assert!(!bridge.get_status().await.is_running);
    bridge.shutdown();
}

#[tokio::test]
async fn legacy_session_reports_progress_and_completes() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = bridge(dir.path());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    bridge.on_event(Arc::new(move |e: &RenderEvent| sink.lock().unwrap().push(e.clone())));

    let reply = bridge
        .start_rendering(serde_json::json!({
            "renderData": {"items": [{"id": "x1", "name": "Xylo"}], "width": 50, "height": 50}
        }))
        .await
        .unwrap();
    assert!(reply.success);

    let mut waited = 0;
    while bridge.get_status().await.is_running && waited < 100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += 1;
    }
    assert!(!bridge.get_status().await.is_running);
    assert!(Storage::new(dir.path()).exists("rendered", "x1.png"));
    let events = events.lock().unwrap();
    assert!(events.contains(&RenderEvent::Progress {
        current: 1,
        total: 1,
        item: "Xylo".into()
    }));
    bridge.shutdown();
}

#[tokio::test]
async fn worker_render_is_cached_and_exported() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = bridge(dir.path());

    let done = bridge.render_in_worker(request("42", "Master")).await.unwrap();
    assert!(done.success);
    assert_eq!(done.product_id, "42");

    let cached = bridge.cache().get("Master", "42").unwrap();
    assert_eq!(cached.base64, done.base64);
    assert!(Storage::new(dir.path()).exists("Master", "product_42_Master.png"));
    assert!(bridge
        .cache()
        .get_data_uri("Master", "42")
        .unwrap()
        .starts_with("data:image/png;base64,"));

    // a new session replaces the old one and still renders
    assert!(bridge.render_in_worker(request("43", "Master")).await.is_ok());
    bridge.cancel_worker().await.unwrap();
    bridge.shutdown();
}

#[tokio::test]
async fn pending_jobs_resume_into_queue() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = bridge(dir.path());
    assert!(bridge.save_pending_jobs(vec![RenderJob::new("<p>later</p>", "later.png")]).await);
    assert_eq!(bridge.pending_jobs().await.len(), 1);

    let outcome = bridge.start_background_rendering().await.unwrap();
    assert_eq!(outcome, ResumeOutcome::Enqueued(1));
    assert!(bridge.pending_jobs().await.is_empty());

    let storage = Storage::new(dir.path());
    let mut waited = 0;
    while !storage.exists("renders", "later.png") && waited < 100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += 1;
    }
    assert!(storage.exists("renders", "later.png"));
    bridge.shutdown();
}
