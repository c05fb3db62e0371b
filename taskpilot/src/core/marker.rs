//! Outcome markers in agent output.
//!
//! Every phase asks the agent to end with a line such as
//! `REVISION: rechazado - missing tests`. The agent is free-form and
//! non-deterministic, so this module is the contract boundary: it finds the
//! last marker in a bounded tail of the output and classifies the phase,
//! falling back to the process exit code when no marker is present.

use crate::core::types::{Phase, PhaseStatus};

/// Tag and outcome words a phase expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseProtocol {
    pub tag: &'static str,
    /// Outcome word meaning success. Empty for `plan`, whose value is the plan itself.
    pub pass: &'static str,
    pub fail: &'static str,
}

pub fn protocol(phase: Phase) -> PhaseProtocol {
    match phase {
        Phase::Plan => PhaseProtocol {
            tag: "PLAN:",
            pass: "",
            fail: "",
        },
        Phase::Code => PhaseProtocol {
            tag: "RESULTADO:",
            pass: "completado",
            fail: "fallido",
        },
        Phase::Review => PhaseProtocol {
            tag: "REVISION:",
            pass: "aprobado",
            fail: "rechazado",
        },
        Phase::Test => PhaseProtocol {
            tag: "PRUEBAS:",
            pass: "ok",
            fail: "fallido",
        },
        Phase::Scope => PhaseProtocol {
            tag: "ALCANCE:",
            pass: "ok",
            fail: "incompleto",
        },
    }
}

/// Tag under which SCOPE reports knowledge for the project context.
pub const NOTES_TAG: &str = "CONTEXTO:";

const KNOWN_TAGS: [&str; 6] = [
    "PLAN:",
    "RESULTADO:",
    "REVISION:",
    "PRUEBAS:",
    "ALCANCE:",
    NOTES_TAG,
];

/// Result of scanning output for a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub found: bool,
    pub tag: String,
    pub value: String,
}

/// Classified outcome of one phase run that exited on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub status: PhaseStatus,
    /// False when the exit-code fallback decided the status.
    pub via_marker: bool,
    /// Free text: the plan, the rejection reason, or a tail of the output.
    pub detail: String,
}

/// Find the last line in the final `window_lines` lines that starts with `tag`.
///
/// Leading markdown decoration (`*`, `#`, `>`, `-`, backticks) is ignored and the
/// tag matches case-insensitively. If the text after the tag is empty, the
/// following non-empty lines become the value, up to the next tagged line.
pub fn find_marker(output: &str, tag: &str, window_lines: usize) -> Marker {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(window_lines);
    let window = &lines[start..];

    for (idx, line) in window.iter().enumerate().rev() {
        let Some(rest) = strip_tag(line, tag) else {
            continue;
        };
        let mut value = clean_value(rest);
        if value.is_empty() {
            value = window[idx + 1..]
                .iter()
                .take_while(|l| !KNOWN_TAGS.iter().any(|known| strip_tag(l, known).is_some()))
                .map(|l| l.trim())
                .filter(|l| !l.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
        }
        return Marker {
            found: true,
            tag: tag.to_string(),
            value,
        };
    }

    Marker {
        found: false,
        tag: tag.to_string(),
        value: String::new(),
    }
}

/// Classify a phase from its captured output and exit code.
pub fn classify(
    phase: Phase,
    output: &str,
    exit_code: Option<i32>,
    window_lines: usize,
) -> Classification {
    let proto = protocol(phase);
    let marker = find_marker(output, proto.tag, window_lines);
    let exited_ok = exit_code == Some(0);

    if phase == Phase::Plan {
        if marker.found && !marker.value.is_empty() {
            return Classification {
                status: PhaseStatus::Ok,
                via_marker: true,
                detail: marker.value,
            };
        }
        // Without a marker the tail of the output is the plan.
        return Classification {
            status: if exited_ok {
                PhaseStatus::Ok
            } else {
                PhaseStatus::Failed
            },
            via_marker: false,
            detail: tail_lines(output, window_lines),
        };
    }

    if marker.found {
        let (word, rest) = split_outcome(&marker.value);
        let detail = if rest.is_empty() {
            marker.value.clone()
        } else {
            rest
        };
        if word == proto.pass {
            return Classification {
                status: PhaseStatus::Ok,
                via_marker: true,
                detail,
            };
        }
        if word == proto.fail {
            let status = match phase {
                Phase::Review | Phase::Scope => PhaseStatus::Rejected,
                _ => PhaseStatus::Failed,
            };
            return Classification {
                status,
                via_marker: true,
                detail,
            };
        }
        // A tag with an unrecognized verdict is ambiguous, never a pass.
        return Classification {
            status: PhaseStatus::Unknown,
            via_marker: true,
            detail: format!(
                "unrecognized outcome after {}: {}",
                proto.tag,
                first_line_of(&marker.value)
            ),
        };
    }

    Classification {
        status: if exited_ok {
            PhaseStatus::Ok
        } else {
            PhaseStatus::Unknown
        },
        via_marker: false,
        detail: fallback_detail(output, exit_code),
    }
}

fn strip_tag<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    let trimmed = line.trim_start_matches(|c: char| {
        c.is_whitespace() || matches!(c, '*' | '#' | '>' | '-' | '`' | '_')
    });
    let head = trimmed.get(..tag.len())?;
    if head.eq_ignore_ascii_case(tag) {
        Some(&trimmed[tag.len()..])
    } else {
        None
    }
}

fn clean_value(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| matches!(c, '*' | '`' | '_'))
        .trim()
        .to_string()
}

/// Split `"rechazado - falta validar"` into `("rechazado", "falta validar")`.
fn split_outcome(value: &str) -> (String, String) {
    let first_line = value.lines().next().unwrap_or_default();
    let mut parts = first_line.trim().splitn(2, char::is_whitespace);
    let word = parts
        .next()
        .unwrap_or_default()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    let mut rest = parts
        .next()
        .unwrap_or_default()
        .trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '-' | ':' | ',' | '.' | '—'))
        .trim()
        .to_string();
    let tail: Vec<&str> = value.lines().skip(1).collect();
    if !tail.is_empty() {
        if !rest.is_empty() {
            rest.push('\n');
        }
        rest.push_str(tail.join("\n").trim());
    }
    (word, rest)
}

/// Last `max_lines` non-empty lines of `output`.
pub fn tail_lines(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

fn first_line_of(value: &str) -> &str {
    match value.lines().next() {
        Some(line) if !line.trim().is_empty() => line.trim(),
        _ => "(empty)",
    }
}

fn fallback_detail(output: &str, exit_code: Option<i32>) -> String {
    let code = match exit_code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    };
    let tail = tail_lines(output, 10);
    if tail.is_empty() {
        format!("no outcome marker (exit {code})")
    } else {
        format!("no outcome marker (exit {code})\n{tail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_last_marker_in_window() {
        let output = "RESULTADO: fallido - first try\nmore work\nRESULTADO: completado todo listo\n";
        let marker = find_marker(output, "RESULTADO:", 40);
        assert!(marker.found);
        assert_eq!(marker.value, "completado todo listo");
    }

    #[test]
    fn marker_outside_window_is_ignored() {
        let mut output = String::from("REVISION: aprobado\n");
        for i in 0..50 {
            output.push_str(&format!("line {i}\n"));
        }
        let marker = find_marker(&output, "REVISION:", 20);
        assert!(!marker.found);
        assert_eq!(marker.value, "");
    }

    #[test]
    fn empty_value_consumes_following_lines() {
        let output = "thinking...\nPLAN:\n\n1. add model\n2. wire handler\n";
        let marker = find_marker(output, "PLAN:", 40);
        assert!(marker.found);
        assert_eq!(marker.value, "1. add model\n2. wire handler");
    }

    #[test]
    fn consumed_value_stops_at_next_tag() {
        let output = "CONTEXTO:\nTests live in tests/api.rs\nUse sqlx macros\nALCANCE: ok";
        let notes = find_marker(output, NOTES_TAG, 40);
        assert_eq!(notes.value, "Tests live in tests/api.rs\nUse sqlx macros");
        let c = classify(Phase::Scope, output, Some(0), 40);
        assert_eq!(c.status, PhaseStatus::Ok);
    }

    #[test]
    fn markdown_decoration_and_case_are_tolerated() {
        let output = "**revision:** Rechazado - falta manejo de errores";
        let c = classify(Phase::Review, output, Some(0), 40);
        assert_eq!(c.status, PhaseStatus::Rejected);
        assert!(c.via_marker);
        assert_eq!(c.detail, "falta manejo de errores");
    }

    #[test]
    fn explicit_failure_wins_over_clean_exit() {
        let c = classify(Phase::Code, "RESULTADO: fallido: no compila", Some(0), 40);
        assert_eq!(c.status, PhaseStatus::Failed);
        assert_eq!(c.detail, "no compila");
    }

    #[test]
    fn test_phase_passes_on_ok() {
        let c = classify(Phase::Test, "cargo test\nPRUEBAS: ok 42 passed", Some(0), 40);
        assert_eq!(c.status, PhaseStatus::Ok);
        assert_eq!(c.detail, "42 passed");
    }

    #[test]
    fn scope_incomplete_is_rejected() {
        let c = classify(Phase::Scope, "ALCANCE: incompleto - falta el endpoint DELETE", Some(0), 40);
        assert_eq!(c.status, PhaseStatus::Rejected);
        assert_eq!(c.detail, "falta el endpoint DELETE");
    }

    #[test]
    fn missing_marker_falls_back_to_exit_code() {
        let ok = classify(Phase::Code, "did some things", Some(0), 40);
        assert_eq!(ok.status, PhaseStatus::Ok);
        assert!(!ok.via_marker);

        let failed = classify(Phase::Code, "did some things", Some(2), 40);
        assert_eq!(failed.status, PhaseStatus::Unknown);
        assert!(failed.detail.contains("exit 2"));

        let killed = classify(Phase::Test, "", None, 40);
        assert_eq!(killed.status, PhaseStatus::Unknown);
        assert!(killed.detail.contains("exit signal"));
    }

    #[test]
    fn unknown_outcome_word_is_not_success_without_clean_exit() {
        let c = classify(Phase::Review, "REVISION: quizas", Some(1), 40);
        assert_eq!(c.status, PhaseStatus::Unknown);
        assert!(c.via_marker);
    }

    /// A clean exit must not turn a negated or misspelled verdict into a pass.
    #[test]
    fn unrecognized_verdict_is_unknown_even_on_clean_exit() {
        for (phase, output) in [
            (Phase::Review, "REVISION: no aprobado - faltan pruebas"),
            (Phase::Review, "REVISION: rechazada"),
            (Phase::Scope, "ALCANCE: fallido"),
            (Phase::Code, "RESULTADO:"),
            (Phase::Test, "PRUEBAS: todo bien"),
        ] {
            let c = classify(phase, output, Some(0), 40);
            assert_eq!(c.status, PhaseStatus::Unknown, "{output}");
            assert!(c.via_marker, "{output}");
            assert!(c.detail.contains("unrecognized outcome"), "{output}");
        }
    }

    #[test]
    fn plan_without_marker_uses_output_tail() {
        let output = "step one\n\nstep two\n";
        let c = classify(Phase::Plan, output, Some(0), 40);
        assert_eq!(c.status, PhaseStatus::Ok);
        assert!(!c.via_marker);
        assert_eq!(c.detail, "step one\nstep two");

        let failed = classify(Phase::Plan, output, Some(1), 40);
        assert_eq!(failed.status, PhaseStatus::Failed);
    }

    #[test]
    fn plan_marker_value_is_the_plan() {
        let c = classify(Phase::Plan, "noise\nPLAN: touch src/lib.rs only", Some(1), 40);
        assert_eq!(c.status, PhaseStatus::Ok);
        assert_eq!(c.detail, "touch src/lib.rs only");
    }

    #[test]
    fn multi_line_reason_is_kept() {
        let output = "REVISION:\nrechazado\n- no tests\n- unused import";
        let c = classify(Phase::Review, output, Some(0), 40);
        assert_eq!(c.status, PhaseStatus::Rejected);
        assert_eq!(c.detail, "- no tests\n- unused import");
    }
}
