//! Legacy batch path: canvas renderer, rendering task and foreground service

use catrender::job::OutputFormat;
use catrender::platform::{NotifierCall, Platform, RecordingNotifier};
use catrender::rendering::canvas::CanvasRenderer;
use catrender::rendering::raster;
use catrender::service::{CancellationToken, RenderingService, RenderingTask, TaskCallback, TaskState};
use catrender::{Error, RenderConfig, Storage, LEGACY_FOLDER};
use base64::Engine as _;
use image::RgbaImage;
use std::sync::Arc;
use std::time::Duration;

fn png_base64(w: u32, h: u32) -> String {
    let img = RgbaImage::from_pixel(w, h, image::Rgba([200, 30, 30, 255]));
    let bytes = raster::encode(&img, OutputFormat::Png, 90).unwrap();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

struct Quiet;

impl TaskCallback for Quiet {
    fn on_progress(&self, _current: usize, _total: usize, _item_name: &str) {}
    fn on_complete(&self) {}
    fn on_error(&self, _message: &str) {}
}

/// Cancels the task as soon as item `at` has been announced
struct CancelAt {
    at: usize,
    token: CancellationToken,
}

impl TaskCallback for CancelAt {
    fn on_progress(&self, current: usize, _total: usize, _item_name: &str) {
        if current == self.at {
            self.token.cancel();
        }
    }
    fn on_complete(&self) {}
    fn on_error(&self, _message: &str) {}
}

fn renderer() -> Arc<CanvasRenderer> {
    Arc::new(CanvasRenderer::new(&RenderConfig::default()))
}

#[test]
fn corrupt_source_still_yields_an_artifact_per_item() {
    let dir = tempfile::tempdir().unwrap();
    let data = serde_json::json!({
        "items": [
            {"id": "p1", "name": "Red Car", "imagePath": format!("data:image/png;base64,{}", png_base64(30, 20))},
            {"id": "p2", "name": "Broken", "imagePath": "data:image/png;base64,!!!not-base64!!!"},
            {"id": "p3", "name": "No Image", "imagePath": ""}
        ],
        "width": 300,
        "height": 300
    });
    let mut task = RenderingTask::new(Storage::new(dir.path()), renderer(), data.to_string(), Duration::ZERO);
    assert_eq!(task.run(&Quiet), TaskState::Complete);

    let storage = Storage::new(dir.path());
    assert_eq!(storage.list(LEGACY_FOLDER), vec!["p1.png", "p2.png", "p3.png"]);
    for name in ["p1.png", "p2.png", "p3.png"] {
        let bytes = storage.read(LEGACY_FOLDER, name).unwrap();
        let img = image::load_from_memory(&bytes).unwrap();
        assert_eq!((img.width(), img.height()), (300, 300));
    }

    // the decoded source lands in the top region
    let p1 = image::load_from_memory(&storage.read(LEGACY_FOLDER, "p1.png").unwrap()).unwrap().to_rgba8();
    let px = p1.get_pixel(150, 90).0;
    assert!(px[0] > 180 && px[1] < 50 && px[2] < 50, "unexpected pixel {:?}", px);
}

#[test]
fn cancellation_after_item_k_keeps_first_k() {
    let dir = tempfile::tempdir().unwrap();
    let items: Vec<_> = (1..=5)
        .map(|i| serde_json::json!({"id": format!("i{}", i), "name": format!("Item {}", i)}))
        .collect();
    let data = serde_json::json!({"items": items, "width": 64, "height": 64});

    let token = CancellationToken::new();
    let mut task = RenderingTask::new(Storage::new(dir.path()), renderer(), data.to_string(), Duration::ZERO)
        .with_token(token.clone());
    let state = task.run(&CancelAt { at: 2, token });

    assert_eq!(state, TaskState::Cancelled);
    assert_eq!(task.state(), &TaskState::Cancelled);
    assert_eq!(task.rendered(), 2);
    assert_eq!(Storage::new(dir.path()).list(LEGACY_FOLDER), vec!["i1.png", "i2.png"]);
}

#[test]
fn second_session_is_rejected_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let notifier = Arc::new(RecordingNotifier::new());
    let config = RenderConfig {
        item_throttle_ms: 300,
        complete_stop_delay_ms: 0,
        error_stop_delay_ms: 0,
        ..Default::default()
    };
    let service = RenderingService::new(
        Platform::new(Storage::new(dir.path()), notifier.clone()),
        renderer(),
        config,
    );
    let data = r#"{"items":[{"id":"a","name":"A"},{"id":"b","name":"B"},{"id":"c","name":"C"}],"width":32,"height":32}"#;

    let session = service.start(data).unwrap();
    assert!(service.is_running());
    assert!(matches!(service.start(data), Err(Error::AlreadyRunning)));

    assert!(service.stop());
    assert_eq!(session.wait(), TaskState::Cancelled);
    assert!(!service.is_running());
    assert_eq!(notifier.calls().last(), Some(&NotifierCall::Stop));

    // a new session is accepted once the previous one is gone
    let again = service.start(data).unwrap();
    again.cancel();
    again.wait();
}
