//! Execution history records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{Phase, PhaseStatus, RunResult};

/// One phase attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseEntry {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    pub status: PhaseStatus,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub reconstructed: bool,
}

impl PhaseEntry {
    pub fn new(phase: Phase, iteration: Option<u32>, status: PhaseStatus) -> Self {
        Self {
            phase,
            iteration,
            status,
            duration_ms: 0,
            summary: String::new(),
            reconstructed: false,
        }
    }
}

/// Phase detail of one run. Plan and scope run at most once; the iterated
/// phases keep one entry per attempt in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseLog {
    pub plan: Option<PhaseEntry>,
    pub code: Vec<PhaseEntry>,
    pub review: Vec<PhaseEntry>,
    pub test: Vec<PhaseEntry>,
    pub scope: Option<PhaseEntry>,
}

impl PhaseLog {
    pub fn push(&mut self, entry: PhaseEntry) {
        match entry.phase {
            Phase::Plan => self.plan = Some(entry),
            Phase::Code => self.code.push(entry),
            Phase::Review => self.review.push(entry),
            Phase::Test => self.test.push(entry),
            Phase::Scope => self.scope = Some(entry),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.plan.is_none()
            && self.code.is_empty()
            && self.review.is_empty()
            && self.test.is_empty()
            && self.scope.is_none()
    }

    /// All entries in protocol order.
    pub fn entries(&self) -> Vec<&PhaseEntry> {
        let mut out = Vec::new();
        out.extend(self.plan.iter());
        out.extend(self.code.iter());
        out.extend(self.review.iter());
        out.extend(self.test.iter());
        out.extend(self.scope.iter());
        out
    }
}

/// One run of one task, as appended to `history/<id>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub timestamp: DateTime<Utc>,
    pub result: RunResult,
    pub total_duration_ms: u64,
    pub iterations: u32,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_phase: Option<Phase>,
    pub phases: PhaseLog,
    #[serde(default, skip_serializing_if = "is_false")]
    pub reconstructed: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_log_routes_entries_by_phase() {
        let mut log = PhaseLog::default();
        assert!(log.is_empty());
        log.push(PhaseEntry::new(Phase::Plan, None, PhaseStatus::Ok));
        log.push(PhaseEntry::new(Phase::Code, Some(1), PhaseStatus::Failed));
        log.push(PhaseEntry::new(Phase::Code, Some(2), PhaseStatus::Ok));
        log.push(PhaseEntry::new(Phase::Scope, None, PhaseStatus::Ok));

        assert!(log.plan.is_some());
        assert_eq!(log.code.len(), 2);
        assert_eq!(log.entries().len(), 4);
        assert_eq!(log.entries()[3].phase, Phase::Scope);
    }

    #[test]
    fn reconstructed_flag_is_omitted_when_false() {
        let entry = PhaseEntry::new(Phase::Test, Some(1), PhaseStatus::Timeout);
        let value = serde_json::to_value(&entry).expect("serialize");
        assert!(value.get("reconstructed").is_none());
        assert_eq!(value["status"], "timeout");
        assert_eq!(value["durationMs"], 0);
    }
}
