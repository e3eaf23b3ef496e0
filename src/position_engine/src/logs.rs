use ic_canister_log::{declare_log_buffer, export as export_logs, GlobalBuffer, Sink};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// High-priority messages.
declare_log_buffer!(name = INFO_BUF, capacity = 1000);

// Low-priority info messages.
declare_log_buffer!(name = DEBUG_BUF, capacity = 1000);

// Trace of price-feed calls.
declare_log_buffer!(name = TRACE_PRICE_BUF, capacity = 1000);

pub const INFO: PrintProxySink = PrintProxySink("INFO", &INFO_BUF);
pub const DEBUG: PrintProxySink = PrintProxySink("DEBUG", &DEBUG_BUF);
pub const TRACE_PRICE: PrintProxySink = PrintProxySink("TRACE_PRICE", &TRACE_PRICE_BUF);

pub struct PrintProxySink(&'static str, &'static GlobalBuffer);

impl Sink for PrintProxySink {
    fn append(&self, entry: ic_canister_log::LogEntry) {
        #[cfg(debug_assertions)]
        eprintln!("{} {}:{} {}", self.0, entry.file, entry.line, entry.message);
        self.1.append(entry)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Info,
    TracePrice,
    Debug,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::Info, Priority::TracePrice, Priority::Debug];

    fn buffer(self) -> &'static GlobalBuffer {
        match self {
            Priority::Info => &INFO_BUF,
            Priority::TracePrice => &TRACE_PRICE_BUF,
            Priority::Debug => &DEBUG_BUF,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Priority::Info),
            "trace_price" => Ok(Priority::TracePrice),
            "debug" => Ok(Priority::Debug),
            _ => Err(format!("unknown log priority '{}'", s)),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: u64,
    pub priority: Priority,
    pub file: String,
    pub line: u32,
    pub message: String,
    pub counter: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Log {
    pub entries: Vec<LogEntry>,
}

impl Log {
    pub fn push_logs(&mut self, priority: Priority) {
        for entry in export_logs(priority.buffer()) {
            self.entries.push(LogEntry {
                timestamp: entry.timestamp,
                counter: entry.counter,
                priority,
                file: entry.file.to_string(),
                line: entry.line,
                message: entry.message,
            });
        }
    }

    pub fn push_all(&mut self) {
        for priority in Priority::ALL {
            self.push_logs(priority);
        }
    }

    /// Keeps only entries recorded at or after `since` (nanoseconds).
    pub fn retain_since(&mut self, since: u64) {
        self.entries.retain(|entry| entry.timestamp >= since);
    }

    /// JSON export of the collected entries. When the body would exceed
    /// `max_body_size` bytes the oldest entries are dropped first.
    pub fn serialize_logs(&self, max_body_size: usize) -> String {
        let mut entries = self.entries.clone();
        entries.sort_by_key(|entry| (entry.timestamp, entry.counter));

        let mut start = 0;
        loop {
            let body = serde_json::to_string(&Log {
                entries: entries[start..].to_vec(),
            })
            .unwrap_or_default();
            if body.len() <= max_body_size || start >= entries.len() {
                return body;
            }
            // Drop roughly the overflowing share in one step.
            let overflow = body.len() - max_body_size;
            let avg = body.len() / (entries.len() - start).max(1);
            start += (overflow / avg.max(1)).max(1);
            start = start.min(entries.len());
        }
    }
}

/// Collects the buffered logs of `priority` (all of them when `None`) as JSON.
pub fn export_json(priority: Option<Priority>, since: u64, max_body_size: usize) -> String {
    let mut log = Log::default();
    match priority {
        Some(priority) => log.push_logs(priority),
        None => log.push_all(),
    }
    log.retain_since(since);
    log.serialize_logs(max_body_size)
}
