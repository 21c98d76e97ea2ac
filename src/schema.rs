//! Strongly-typed schema for the engine's own ambient NDJSON log.
//!
//! This is the `tracing` mirror described in SPEC_FULL.md §10.1 — entries
//! about the proxy engine's own operation (connections accepted, certs
//! minted, sessions closed, errors). It is distinct from the domain-level
//! `TracerEvent` stream (`scanner::TracerEvent`), which goes through the
//! external `AddTracerEvent` interface instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Root log entry structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Schema version for migration support
    pub schema_version: u32,
    /// ISO 8601 timestamp
    pub timestamp: DateTime<Utc>,
    /// Date in YYYY-MM-DD format for file organization
    pub date: String,
    /// The actual log event
    pub event: EngineLogEvent,
}

/// Engine debug/info/error log event, mirrored from a `tracing` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineLogEvent {
    /// Log level: TRACE, DEBUG, INFO, WARN, ERROR
    pub level: String,
    /// Log message
    pub message: String,
    /// The rust module path that generated the event
    pub target: Option<String>,
    /// Source file
    pub file: Option<String>,
    /// Line number
    pub line: Option<u32>,
}

impl LogEntry {
    pub fn new_engine_event(
        level: String,
        message: String,
        target: Option<String>,
        file: Option<String>,
        line: Option<u32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            timestamp: now,
            date: now.format("%Y-%m-%d").to_string(),
            event: EngineLogEvent {
                level,
                message,
                target,
                file,
                line,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_serializes_to_json() {
        let entry = LogEntry::new_engine_event(
            "INFO".to_string(),
            "proxy listening".to_string(),
            Some("tracewire::engine".to_string()),
            None,
            None,
        );
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("proxy listening"));
        assert!(json.contains("\"schema_version\":1"));
    }
}
