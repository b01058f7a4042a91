//! Log broadcast buffer — bounded replay history plus live fan-out.
//!
//! Every append happens under one lock: the entry is pushed, the oldest
//! entries are evicted past capacity, and the serialized entry is handed to
//! the broadcast channel before the lock is released. Observers that
//! subscribe through [`LogBroadcast::subscribe`] take their snapshot under
//! the same lock, so replay and live delivery never overlap or leave a gap.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::broadcast;

use super::models::{LogEntry, LogKind};
use super::ws::{WsMessage, broadcast_message};

pub const DEFAULT_LOG_CAPACITY: usize = 50;

/// Capacity of the live fan-out channel, in serialized messages.
const CHANNEL_CAPACITY: usize = 256;

pub struct LogBroadcast {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
    tx: broadcast::Sender<String>,
}

impl LogBroadcast {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity + 1)),
            tx,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Timestamp, store and fan out a new entry.
    pub fn append(&self, kind: LogKind, text: impl Into<String>) -> LogEntry {
        let entry = LogEntry::new(kind, text);
        mirror_to_console(&entry);

        let mut entries = self.lock();
        entries.push_back(entry.clone());
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        broadcast_message(
            &self.tx,
            &WsMessage::LogMessage {
                entry: entry.clone(),
            },
        );
        entry
    }

    pub fn info(&self, text: impl Into<String>) -> LogEntry {
        self.append(LogKind::Info, text)
    }

    pub fn warn(&self, text: impl Into<String>) -> LogEntry {
        self.append(LogKind::Warn, text)
    }

    pub fn error(&self, text: impl Into<String>) -> LogEntry {
        self.append(LogKind::Error, text)
    }

    pub fn success(&self, text: impl Into<String>) -> LogEntry {
        self.append(LogKind::Success, text)
    }

    pub fn input(&self, text: impl Into<String>) -> LogEntry {
        self.append(LogKind::Input, text)
    }

    /// Current buffer contents, oldest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.lock().iter().cloned().collect()
    }

    /// Snapshot and live receiver taken atomically.
    pub fn subscribe(&self) -> (Vec<LogEntry>, broadcast::Receiver<String>) {
        let entries = self.lock();
        let rx = self.tx.subscribe();
        (entries.iter().cloned().collect(), rx)
    }

    /// Drop all history, then record a confirming entry.
    ///
    /// Observers receive the fresh history as a whole rather than a single
    /// entry, so every connected view resets together.
    pub fn clear(&self) -> LogEntry {
        let entry = LogEntry::new(
            LogKind::Info,
            "Log history cleared by operator request.",
        );
        mirror_to_console(&entry);

        let mut entries = self.lock();
        entries.clear();
        entries.push_back(entry.clone());
        broadcast_message(
            &self.tx,
            &WsMessage::LogHistory {
                entries: entries.iter().cloned().collect(),
            },
        );
        entry
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn mirror_to_console(entry: &LogEntry) {
    match entry.kind {
        LogKind::Error => tracing::error!(target: "deckhand::console", "{}", entry.text),
        LogKind::Warn => tracing::warn!(target: "deckhand::console", "{}", entry.text),
        LogKind::Info | LogKind::Success => {
            tracing::info!(target: "deckhand::console", kind = entry.kind.as_str(), "{}", entry.text)
        }
        LogKind::Input => tracing::debug!(target: "deckhand::console", "{}", entry.text),
    }
}
