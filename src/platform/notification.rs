//! Progress notification surface used by the foreground service

use log::info;
use std::sync::Mutex;

/// Content of the ongoing rendering notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub content: String,
    pub progress: u32,
    pub max: u32,
}

impl Notification {
    pub fn new(title: impl Into<String>, content: impl Into<String>, progress: u32, max: u32) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            progress,
            max,
        }
    }
}

/// Notification sink. `start_foreground` must be called before any
/// long-running work starts.
pub trait Notifier: Send + Sync {
    fn start_foreground(&self, n: &Notification);
    fn update(&self, n: &Notification);
    fn stop_foreground(&self);
}

/// Writes every notification to the log
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        LogNotifier
    }
}

impl Default for LogNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for LogNotifier {
    fn start_foreground(&self, n: &Notification) {
        info!("[foreground] {}: {}", n.title, n.content);
    }

    fn update(&self, n: &Notification) {
        info!("[notification] {}: {} ({}/{})", n.title, n.content, n.progress, n.max);
    }

    fn stop_foreground(&self) {
        info!("[foreground] stopped");
    }
}

/// One call observed by a `RecordingNotifier`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierCall {
    Start(Notification),
    Update(Notification),
    Stop,
}

/// Keeps every call in memory
#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<NotifierCall>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<NotifierCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn last_update(&self) -> Option<Notification> {
        self.calls().into_iter().rev().find_map(|c| match c {
            NotifierCall::Update(n) => Some(n),
            _ => None,
        })
    }

    fn push(&self, call: NotifierCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl Notifier for RecordingNotifier {
    fn start_foreground(&self, n: &Notification) {
        self.push(NotifierCall::Start(n.clone()));
    }

    fn update(&self, n: &Notification) {
        self.push(NotifierCall::Update(n.clone()));
    }

    fn stop_foreground(&self) {
        self.push(NotifierCall::Stop);
    }
}
