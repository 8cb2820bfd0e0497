//! Activity log: the user-facing line log.
//!
//! Every entry is timestamped, kept in a bounded ring for the dashboard,
//! and mirrored to `tracing`. Debug entries are dropped unless the
//! persisted debug preference is on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

const DEFAULT_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Debug,
    Error,
    Success,
}

#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub message: String,
}

impl std::fmt::Display for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.level {
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Error => "ERROR",
            Level::Success => "OK",
        };
        write!(
            f,
            "[{}] {:<5} {}",
            self.timestamp.format("%H:%M:%S"),
            tag,
            self.message
        )
    }
}

#[derive(Clone)]
pub struct ActivityLog {
    entries: Arc<Mutex<VecDeque<Entry>>>,
    debug: Arc<AtomicBool>,
    capacity: usize,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ActivityLog {
    pub fn new(debug: bool) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(64))),
            debug: Arc::new(AtomicBool::new(debug)),
            capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn set_debug(&self, on: bool) {
        self.debug.store(on, Ordering::Relaxed);
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        self.push(Level::Info, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(outcome = "success", "{}", message);
        self.push(Level::Success, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{}", message);
        self.push(Level::Error, message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        if !self.debug_enabled() {
            return;
        }
        let message = message.into();
        tracing::debug!("{}", message);
        self.push(Level::Debug, message);
    }

    fn push(&self, level: Level, message: String) {
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(Entry {
                timestamp: Utc::now(),
                level,
                message,
            });
        }
    }

    /// Snapshot, oldest first.
    pub fn entries(&self) -> Vec<Entry> {
        self.entries
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, level: Level) -> usize {
        self.entries
            .lock()
            .map(|e| e.iter().filter(|x| x.level == level).count())
            .unwrap_or(0)
    }
}
