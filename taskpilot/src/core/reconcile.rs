//! Repair of history records whose phase detail is missing or malformed.
//!
//! Pure: the caller supplies the raw record and an index of the artifacts
//! on disk for that task. Nothing here touches the filesystem.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::record::{ExecutionRecord, PhaseEntry, PhaseLog};
use crate::core::types::{Phase, PhaseStatus, RunResult};

/// Artifacts present for a task, keyed by stem (`plan`, `code-2`, ...).
///
/// The value is the status recorded inside the artifact when it could be read.
pub type ArtifactIndex = BTreeMap<String, Option<PhaseStatus>>;

/// History record as found on disk, before validation.
///
/// Built field by field so one bad value never costs the whole record.
#[derive(Debug, Clone, Default)]
pub struct RawRecord {
    pub timestamp: Option<DateTime<Utc>>,
    pub result: Option<RunResult>,
    pub total_duration_ms: u64,
    pub iterations: u32,
    pub summary: String,
    pub error: Option<String>,
    pub error_phase: Option<Phase>,
    pub phases: Option<Value>,
    pub reconstructed: bool,
    /// A field was present but unreadable.
    pub malformed: bool,
}

impl RawRecord {
    pub fn from_value(value: &Value) -> Self {
        let mut raw = RawRecord::default();
        let Some(map) = value.as_object() else {
            raw.malformed = true;
            return raw;
        };
        let mut bad = false;

        raw.timestamp = typed(map.get("timestamp"), &mut bad);
        raw.result = typed(map.get("result"), &mut bad);
        raw.error_phase = typed(map.get("errorPhase"), &mut bad);
        raw.total_duration_ms = typed(map.get("totalDurationMs"), &mut bad).unwrap_or(0);
        raw.iterations = typed(map.get("iterations"), &mut bad).unwrap_or(0);
        raw.summary = typed(map.get("summary"), &mut bad).unwrap_or_default();
        raw.error = typed(map.get("error"), &mut bad);
        raw.reconstructed = typed(map.get("reconstructed"), &mut bad).unwrap_or(false);
        raw.phases = map.get("phases").filter(|v| !v.is_null()).cloned();
        raw.malformed = bad;
        raw
    }
}

/// Absent and null read as `None`; anything unparseable also flags `bad`.
fn typed<T: DeserializeOwned>(value: Option<&Value>, bad: &mut bool) -> Option<T> {
    let value = value.filter(|v| !v.is_null())?;
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            *bad = true;
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub record: ExecutionRecord,
    pub repaired: bool,
}

/// Turn a raw record into a valid one, rebuilding `phases` from artifacts
/// when they are absent or do not have the expected shape. A missing result
/// is derived from the phases.
pub fn reconcile(raw: RawRecord, artifacts: &ArtifactIndex) -> Reconciled {
    let mut repaired = raw.malformed;

    let parsed = raw
        .phases
        .clone()
        .and_then(|value| serde_json::from_value::<PhaseLog>(value).ok());
    let phases = match parsed {
        Some(log) => log,
        None => {
            repaired = true;
            rebuild_phases(raw.iterations, artifacts)
        }
    };

    let timestamp = raw.timestamp.unwrap_or_else(|| {
        repaired = true;
        DateTime::<Utc>::UNIX_EPOCH
    });
    let result = raw.result.unwrap_or_else(|| {
        repaired = true;
        derive_result(&phases)
    });

    Reconciled {
        record: ExecutionRecord {
            timestamp,
            result,
            total_duration_ms: raw.total_duration_ms,
            iterations: raw.iterations,
            summary: raw.summary,
            error: raw.error,
            error_phase: raw.error_phase,
            phases,
            reconstructed: raw.reconstructed || repaired,
        },
        repaired,
    }
}

/// Best guess at a run's result from its phases. Success needs a passing scope.
pub fn derive_result(phases: &PhaseLog) -> RunResult {
    let entries = phases.entries();
    if entries.iter().any(|e| e.status == PhaseStatus::Timeout) {
        return RunResult::Timeout;
    }
    match phases.scope.as_ref().map(|e| e.status) {
        Some(PhaseStatus::Ok) => return RunResult::Success,
        Some(PhaseStatus::Rejected) => return RunResult::ScopeIncomplete,
        _ => {}
    }
    let failed = |entry: Option<&PhaseEntry>| {
        entry.is_some_and(|e| matches!(e.status, PhaseStatus::Failed | PhaseStatus::Rejected))
    };
    if failed(phases.test.last()) {
        RunResult::TestFailed
    } else if failed(phases.review.last()) {
        RunResult::ReviewFailed
    } else {
        RunResult::Failed
    }
}

/// Rebuild phase detail from artifact names.
///
/// Plan, scope and every code iteration up to the recorded count are always
/// listed; those without an artifact are `lost`. Review and test only ran
/// when code passed, so they are listed only where an artifact exists.
pub fn rebuild_phases(iterations: u32, artifacts: &ArtifactIndex) -> PhaseLog {
    let mut highest = BTreeMap::<Phase, u32>::new();
    for stem in artifacts.keys() {
        if let Some((phase, Some(iteration))) = parse_artifact_stem(stem) {
            let slot = highest.entry(phase).or_default();
            *slot = (*slot).max(iteration);
        }
    }

    let mut log = PhaseLog::default();
    log.push(entry_from(artifacts, Phase::Plan, None));

    let code_max = iterations.max(highest.get(&Phase::Code).copied().unwrap_or(0));
    for i in 1..=code_max {
        log.push(entry_from(artifacts, Phase::Code, Some(i)));
    }
    for phase in [Phase::Review, Phase::Test] {
        let max = highest.get(&phase).copied().unwrap_or(0);
        for i in 1..=max {
            if artifacts.contains_key(&artifact_stem(phase, Some(i))) {
                log.push(entry_from(artifacts, phase, Some(i)));
            }
        }
    }
    if artifacts.contains_key(&artifact_stem(Phase::Scope, None)) || !log.code.is_empty() {
        log.push(entry_from(artifacts, Phase::Scope, None));
    }
    log
}

fn entry_from(artifacts: &ArtifactIndex, phase: Phase, iteration: Option<u32>) -> PhaseEntry {
    let status = match artifacts.get(&artifact_stem(phase, iteration)) {
        Some(Some(status)) => *status,
        Some(None) => PhaseStatus::Unknown,
        None => PhaseStatus::Lost,
    };
    let mut entry = PhaseEntry::new(phase, iteration, status);
    entry.summary = match status {
        PhaseStatus::Lost => "no artifact on disk".to_string(),
        _ => "reconstructed from artifact".to_string(),
    };
    entry.reconstructed = true;
    entry
}

/// File stem for a phase artifact: `plan`, `scope`, `code-1`, `review-3`.
pub fn artifact_stem(phase: Phase, iteration: Option<u32>) -> String {
    match iteration {
        Some(i) if phase.is_iterated() => format!("{}-{i}", phase.as_str()),
        _ => phase.as_str().to_string(),
    }
}

/// Inverse of [`artifact_stem`].
pub fn parse_artifact_stem(stem: &str) -> Option<(Phase, Option<u32>)> {
    if let Some(phase) = Phase::parse(stem) {
        return (!phase.is_iterated()).then_some((phase, None));
    }
    let (name, iteration) = stem.rsplit_once('-')?;
    let phase = Phase::parse(name)?;
    let iteration: u32 = iteration.parse().ok()?;
    (phase.is_iterated() && iteration > 0).then_some((phase, Some(iteration)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn index(entries: &[(&str, Option<PhaseStatus>)]) -> ArtifactIndex {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn stems_round_trip_and_reject_garbage() {
        assert_eq!(artifact_stem(Phase::Code, Some(2)), "code-2");
        assert_eq!(artifact_stem(Phase::Plan, Some(2)), "plan");
        assert_eq!(parse_artifact_stem("review-3"), Some((Phase::Review, Some(3))));
        assert_eq!(parse_artifact_stem("scope"), Some((Phase::Scope, None)));
        assert_eq!(parse_artifact_stem("code"), None);
        assert_eq!(parse_artifact_stem("plan-1"), None);
        assert_eq!(parse_artifact_stem("code-0"), None);
        assert_eq!(parse_artifact_stem("notes"), None);
    }

    #[test]
    fn well_formed_record_is_untouched() {
        let raw = RawRecord::from_value(&json!({
            "timestamp": "2026-01-02T03:04:05Z",
            "result": "success",
            "totalDurationMs": 10,
            "iterations": 1,
            "summary": "done",
            "phases": {
                "plan": {"phase": "plan", "status": "ok", "durationMs": 1, "summary": "p"},
                "code": [{"phase": "code", "iteration": 1, "status": "ok", "durationMs": 2, "summary": "c"}],
                "review": [],
                "test": [],
                "scope": null
            }
        }));
        let out = reconcile(raw, &ArtifactIndex::new());
        assert!(!out.repaired);
        assert!(!out.record.reconstructed);
        assert_eq!(out.record.phases.code.len(), 1);
    }

    #[test]
    fn missing_phases_are_rebuilt_and_missing_artifacts_are_lost() {
        let raw = RawRecord::from_value(&json!({
            "timestamp": "2026-01-02T03:04:05Z",
            "result": "test-failed",
            "iterations": 3,
            "summary": "tests kept failing"
        }));
        let artifacts = index(&[
            ("plan", Some(PhaseStatus::Ok)),
            ("code-1", Some(PhaseStatus::Ok)),
            ("review-1", Some(PhaseStatus::Ok)),
            ("test-1", Some(PhaseStatus::Failed)),
            ("code-3", None),
        ]);
        let out = reconcile(raw, &artifacts);
        assert!(out.repaired);
        assert!(out.record.reconstructed);

        let phases = &out.record.phases;
        assert_eq!(phases.plan.as_ref().map(|e| e.status), Some(PhaseStatus::Ok));
        let code: Vec<PhaseStatus> = phases.code.iter().map(|e| e.status).collect();
        assert_eq!(
            code,
            vec![PhaseStatus::Ok, PhaseStatus::Lost, PhaseStatus::Unknown]
        );
        assert_eq!(phases.review.len(), 1);
        assert_eq!(phases.test[0].status, PhaseStatus::Failed);
        assert_eq!(phases.scope.as_ref().map(|e| e.status), Some(PhaseStatus::Lost));
        assert!(phases.entries().iter().all(|e| e.reconstructed));
    }

    #[test]
    fn no_artifacts_never_yields_ok() {
        let raw = RawRecord {
            iterations: 2,
            phases: Some(json!({"plan": "garbage"})),
            ..RawRecord::default()
        };
        let out = reconcile(raw, &ArtifactIndex::new());
        assert!(out.repaired);
        assert_eq!(out.record.result, RunResult::Failed);
        assert!(
            out.record
                .phases
                .entries()
                .iter()
                .all(|e| e.status == PhaseStatus::Lost)
        );
        assert_eq!(out.record.phases.code.len(), 2);
    }

    #[test]
    fn bad_fields_keep_the_record_and_derive_the_result() {
        let raw = RawRecord::from_value(&json!({
            "timestamp": "yesterday-ish",
            "result": "weird",
            "iterations": 1,
            "summary": "kept",
            "error": "review said no"
        }));
        assert!(raw.malformed);
        assert_eq!(raw.summary, "kept");

        let artifacts = index(&[
            ("plan", Some(PhaseStatus::Ok)),
            ("code-1", Some(PhaseStatus::Ok)),
            ("review-1", Some(PhaseStatus::Rejected)),
        ]);
        let out = reconcile(raw, &artifacts);
        assert!(out.repaired);
        assert!(out.record.reconstructed);
        assert_eq!(out.record.timestamp, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(out.record.result, RunResult::ReviewFailed);
        assert_eq!(out.record.summary, "kept");
        assert_eq!(out.record.error.as_deref(), Some("review said no"));
    }

    #[test]
    fn non_object_record_is_fully_reconstructed() {
        let raw = RawRecord::from_value(&json!(42));
        assert!(raw.malformed);
        let out = reconcile(raw, &index(&[("scope", Some(PhaseStatus::Ok))]));
        assert!(out.record.reconstructed);
        assert_eq!(out.record.result, RunResult::Success);
    }
}
