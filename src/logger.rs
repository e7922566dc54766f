//! Bounded, lossy log channel shared by the listener and every session.
//!
//! Producers never block: when the buffer is full the oldest entry is
//! evicted to make room, and if that still fails the new entry is dropped.
//! A slow or absent consumer can therefore never stall protocol handling.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Local};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Debug => "DEBUG",
        };
        f.write_str(s)
    }
}

/// One timestamped notification. Immutable once created.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub time: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}",
            self.time.format("%H:%M:%S"),
            self.level,
            self.message
        )
    }
}

struct Shared {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        // A panic while holding the lock only poisons log entries; keep going.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Multi-producer handle. Cheap to clone, safe to share across tasks.
#[derive(Clone)]
pub struct Logger {
    shared: Arc<Shared>,
}

/// The single consumer end returned by [`Logger::channel`].
pub struct LogReceiver {
    shared: Arc<Shared>,
}

impl Logger {
    pub fn channel(capacity: usize) -> (Logger, LogReceiver) {
        let shared = Arc::new(Shared {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        });
        (
            Logger {
                shared: shared.clone(),
            },
            LogReceiver { shared },
        )
    }

    /// Best-effort, non-blocking send: evict the oldest entry if the buffer
    /// is full, and drop the new entry if there is still no room.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            time: Local::now(),
            level,
            message: message.into(),
        };

        {
            let mut entries = self.shared.lock();
            if entries.len() >= self.shared.capacity {
                entries.pop_front();
            }
            if entries.len() < self.shared.capacity {
                entries.push_back(entry);
            }
        }

        self.shared.notify.notify_one();
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }
}

impl LogReceiver {
    /// Waits for the next entry.
    pub async fn recv(&mut self) -> LogEntry {
        loop {
            // Register for a wakeup before checking, so an entry pushed
            // between the check and the await is not missed.
            let notified = self.shared.notify.notified();
            if let Some(entry) = self.try_recv() {
                return entry;
            }
            notified.await;
        }
    }

    pub fn try_recv(&self) -> Option<LogEntry> {
        self.shared.lock().pop_front()
    }
}
