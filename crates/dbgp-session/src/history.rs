//! Per-session log of inspected variable values.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use serde_json::Value;

/// One recorded inspection. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub step: u64,
    /// RFC 3339, UTC.
    pub timestamp: String,
    pub variable_name: String,
    pub value: Value,
}

#[derive(Debug)]
pub struct HistoryRecorder {
    max_per_variable: usize,
    entries: HashMap<String, VecDeque<HistoryEntry>>,
}

impl HistoryRecorder {
    /// `max_per_variable` of zero is treated as one.
    pub fn new(max_per_variable: usize) -> Self {
        Self {
            max_per_variable: max_per_variable.max(1),
            entries: HashMap::new(),
        }
    }

    pub fn append(&mut self, name: &str, value: Value, step: u64) -> HistoryEntry {
        let entry = HistoryEntry {
            step,
            timestamp: now_rfc3339(),
            variable_name: name.to_string(),
            value,
        };
        let log = self.entries.entry(name.to_string()).or_default();
        // Steps come from a monotonically increasing counter; clamp so a
        // late writer can never break the ordering.
        let entry = match log.back() {
            Some(last) if last.step > entry.step => HistoryEntry {
                step: last.step,
                ..entry
            },
            _ => entry,
        };
        if log.len() == self.max_per_variable {
            log.pop_front();
        }
        log.push_back(entry.clone());
        entry
    }

    /// Up to `limit` entries for `name`, newest first, starting with the
    /// newest entry whose step is at most `latest - steps_ago`.
    pub fn query(&self, name: &str, steps_ago: u64, limit: usize) -> Vec<HistoryEntry> {
        let Some(log) = self.entries.get(name) else {
            return Vec::new();
        };
        let Some(latest) = log.back().map(|entry| entry.step) else {
            return Vec::new();
        };
        let Some(threshold) = latest.checked_sub(steps_ago) else {
            return Vec::new();
        };
        log.iter()
            .rev()
            .skip_while(|entry| entry.step > threshold)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "<unknown>".to_owned())
}
