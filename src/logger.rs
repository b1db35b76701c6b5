//! In-memory log ring surfaced through `getHealth`.
//!
//! A custom tracing layer captures INFO-and-above events into a bounded
//! ring (newest last) that is persisted best-effort so a support request can
//! see what happened before the last restart. This sits alongside the
//! normal fmt subscriber, it does not replace it.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

const MAX_LOGS: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub time: String,
    pub msg: String,
}

pub struct LogStore {
    path: PathBuf,
    entries: Mutex<VecDeque<Entry>>,
}

impl LogStore {
    /// Open the store, reloading any entries persisted by a prior boot.
    pub fn open(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        let entries = std::fs::read(&path)
            .ok()
            .and_then(|raw| serde_json::from_slice::<VecDeque<Entry>>(&raw).ok())
            .unwrap_or_default();
        Arc::new(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn push(&self, msg: String) {
        let mut entries = self.entries.lock().expect("log ring poisoned");
        entries.push_back(Entry {
            time: Local::now().format("%H:%M:%S").to_string(),
            msg,
        });
        while entries.len() > MAX_LOGS {
            entries.pop_front();
        }
        // Best effort; losing the log file is never worth failing the caller.
        if let Ok(raw) = serde_json::to_vec(&*entries) {
            let _ = std::fs::write(&self.path, raw);
        }
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.entries
            .lock()
            .expect("log ring poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

/// Tracing layer feeding the log store.
pub struct LogLayer {
    store: Arc<LogStore>,
}

impl LogLayer {
    pub fn new(store: Arc<LogStore>) -> Self {
        Self { store }
    }
}

impl<S: Subscriber> Layer<S> for LogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::INFO {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if visitor.message.is_empty() {
            return;
        }

        self.store.push(format!("{level} {}", visitor.message));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn ring_is_bounded() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path().join("logs.json"));

        for i in 0..(MAX_LOGS + 25) {
            store.push(format!("entry {i}"));
        }

        let entries = store.entries();
        assert_eq!(entries.len(), MAX_LOGS);
        assert_eq!(entries.last().unwrap().msg, format!("entry {}", MAX_LOGS + 24));
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs.json");

        let store = LogStore::open(&path);
        store.push("before restart".into());
        drop(store);

        let reopened = LogStore::open(&path);
        assert_eq!(reopened.entries().len(), 1);
        assert_eq!(reopened.entries()[0].msg, "before restart");
    }
}
