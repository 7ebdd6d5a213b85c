use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

const DEFAULT_MAX_LINES: usize = 10_000;

/// Lines of output attached to a task log when a start fails.
pub const RECENT_OUTPUT_LINES: usize = 20;

/// Captured stdout/stderr lines, one ring per service (or per check run).
pub struct LogBuffer {
    max_lines: usize,
    rings: RwLock<HashMap<String, VecDeque<String>>>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            rings: RwLock::new(HashMap::new()),
        }
    }

    /// Append a line, dropping the oldest one when the ring is full.
    pub fn push(&self, key: &str, line: String) {
        let mut rings = self.rings.write().expect("LogBuffer lock poisoned");
        let ring = rings.entry(key.to_string()).or_default();
        if ring.len() == self.max_lines {
            ring.pop_front();
        }
        ring.push_back(line);
    }

    /// Last `n` lines, oldest first.
    pub fn tail(&self, key: &str, n: usize) -> Vec<String> {
        let rings = self.rings.read().expect("LogBuffer lock poisoned");
        let Some(ring) = rings.get(key) else {
            return Vec::new();
        };
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).cloned().collect()
    }

    /// Indented block of the most recent lines, for error reports.
    pub fn recent_output(&self, key: &str) -> Option<String> {
        let lines = self.tail(key, RECENT_OUTPUT_LINES);
        if lines.is_empty() {
            return None;
        }
        let mut out = String::from("Most recent service output:");
        for line in lines {
            out.push_str("\n    ");
            out.push_str(&line);
        }
        Some(out)
    }

    pub fn clear(&self, key: &str) {
        let mut rings = self.rings.write().expect("LogBuffer lock poisoned");
        rings.remove(key);
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}
