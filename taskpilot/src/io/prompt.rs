//! Per-phase prompt builder.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When the rendered prompt exceeds the byte budget, droppable sections go
//! first in a fixed order, then the largest remaining section is truncated.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::{Phase, Task};

const TASK_PARTIAL: &str = include_str!("prompts/_task.md");
const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const CODE_TEMPLATE: &str = include_str!("prompts/code.md");
const REVIEW_TEMPLATE: &str = include_str!("prompts/review.md");
const TEST_TEMPLATE: &str = include_str!("prompts/test.md");
const SCOPE_TEMPLATE: &str = include_str!("prompts/scope.md");
const SESSION_TEMPLATE: &str = include_str!("prompts/session.md");

/// Drop order when over budget, least valuable first.
const DROP_ORDER: [&str; 5] = ["context", "attempts", "previous", "project", "plan"];

/// Task fields exposed to templates.
#[derive(Debug, Clone, Serialize)]
struct TaskContext {
    id: String,
    title: String,
    kind: &'static str,
    priority: String,
    description: String,
    acceptance: Vec<String>,
}

impl TaskContext {
    fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            kind: task.kind.as_str(),
            priority: format!("{:?}", task.priority).to_lowercase(),
            description: task.description.trim().to_string(),
            acceptance: task.acceptance.clone(),
        }
    }
}

/// Everything a phase prompt may draw on.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    pub project_description: String,
    pub project_context: String,
    /// Plan produced by the PLAN phase of this run.
    pub plan: Option<String>,
    /// One line per earlier attempt in this run.
    pub attempts: Vec<String>,
    /// Why the previous attempt failed; drives the next CODE attempt.
    pub feedback: Option<String>,
    pub iteration: Option<u32>,
    pub max_iterations: u32,
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Renders phase prompts within a byte budget.
pub struct PromptBuilder {
    env: Environment<'static>,
    section_re: Regex,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("_task", TASK_PARTIAL)
            .context("load task partial")?;
        for phase in Phase::ALL {
            env.add_template(phase.as_str(), template_for(phase))
                .with_context(|| format!("load {phase} template"))?;
        }
        env.add_template("session", SESSION_TEMPLATE)
            .context("load session template")?;
        let section_re = Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .context("compile section marker regex")?;
        Ok(Self {
            env,
            section_re,
            budget_bytes,
        })
    }

    /// Render the prompt for `phase`.
    pub fn build(&self, phase: Phase, task: &Task, input: &PromptInputs) -> Result<String> {
        self.render(phase.as_str(), task, input)
    }

    /// Render the opening prompt of an interactive operator session.
    pub fn build_session(&self, task: &Task, input: &PromptInputs) -> Result<String> {
        self.render("session", task, input)
    }

    fn render(&self, name: &str, task: &Task, input: &PromptInputs) -> Result<String> {
        let template = self
            .env
            .get_template(name)
            .with_context(|| format!("missing {name} template"))?;
        let non_empty = |s: &str| {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        };
        let rendered = template
            .render(context! {
                task => TaskContext::from_task(task),
                project => non_empty(&input.project_description),
                context => non_empty(&input.project_context),
                previous_error => task.last_error.as_deref().and_then(non_empty),
                previous_error_phase => task.last_error_phase.map(|p| p.as_str()),
                plan => input.plan.as_deref().and_then(non_empty),
                attempts => &input.attempts,
                feedback => input.feedback.as_deref().and_then(non_empty),
                iteration => input.iteration,
                max_iterations => input.max_iterations,
            })
            .with_context(|| format!("render {name} prompt"))?;

        let mut sections = self.parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }

    fn parse_sections(&self, rendered: &str) -> Vec<ParsedSection> {
        let matches: Vec<_> = self.section_re.captures_iter(rendered).collect();
        let mut sections = Vec::new();
        for (i, caps) in matches.iter().enumerate() {
            let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            let end = matches
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map_or(rendered.len(), |m| m.start());
            let content = rendered[whole.end()..end].trim().to_string();
            let required = kind.as_str() == "required";
            if !content.is_empty() {
                sections.push(ParsedSection {
                    key: key.as_str().to_string(),
                    required,
                    content,
                });
            }
        }
        sections
    }
}

fn template_for(phase: Phase) -> &'static str {
    match phase {
        Phase::Plan => PLAN_TEMPLATE,
        Phase::Code => CODE_TEMPLATE,
        Phase::Review => REVIEW_TEMPLATE,
        Phase::Test => TEST_TEMPLATE,
        Phase::Scope => SCOPE_TEMPLATE,
    }
}

fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    // Still over: shorten the largest section, keeping its head.
    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(largest) = sections.iter_mut().max_by_key(|s| s.content.len()) else {
        return;
    };
    let excess = total - budget;
    let keep = largest.content.len().saturating_sub(excess + 12);
    let mut cut = keep;
    while cut > 0 && !largest.content.is_char_boundary(cut) {
        cut -= 1;
    }
    let before_len = largest.content.len();
    largest.content.truncate(cut);
    largest.content.push_str("\n[truncated]");
    debug!(
        section = %largest.key,
        before_len,
        after_len = largest.content.len(),
        "truncated section for budget"
    );
}

fn render_sections(sections: &[ParsedSection]) -> String {
    let mut out = sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    out.push('\n');
    out
}
