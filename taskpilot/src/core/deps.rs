//! Dependency resolution and candidate selection.
//!
//! The graph is implicit: each task's `depends_on` across every column.
//! It is rebuilt for every scheduling decision, so nothing here caches.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::types::{Task, TaskStatus};

/// Why a `todo` task can or cannot run now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    /// The task sits on a dependency cycle; members are sorted ids.
    OnCycle(Vec<String>),
    /// Dependencies that are missing or not yet `done`.
    BlockedBy(Vec<String>),
}

/// Outcome of one selection pass over the `todo` column.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub selected: Option<Task>,
    /// Skipped candidates, in scan order.
    pub skipped: Vec<(String, Eligibility)>,
}

/// Strongly connected components that form cycles (size > 1 or a self-edge).
///
/// Edges to unknown ids are ignored. Output is deterministic: each component
/// is sorted and components are ordered by their smallest id.
pub fn find_cycles(tasks: &[Task]) -> Vec<Vec<String>> {
    let mut graph: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for task in tasks {
        graph.entry(task.id.as_str()).or_default();
    }
    for task in tasks {
        let edges: Vec<&str> = task
            .depends_on
            .iter()
            .map(String::as_str)
            .filter(|dep| graph.contains_key(dep))
            .collect();
        if let Some(slot) = graph.get_mut(task.id.as_str()) {
            slot.extend(edges);
        }
    }

    let mut tarjan = Tarjan::new(&graph);
    for node in graph.keys() {
        if !tarjan.index.contains_key(node) {
            tarjan.visit(node);
        }
    }

    let mut cycles: Vec<Vec<String>> = tarjan
        .components
        .into_iter()
        .filter(|component| {
            component.len() > 1
                || graph
                    .get(component[0])
                    .is_some_and(|edges| edges.contains(&component[0]))
        })
        .map(|component| {
            let mut ids: Vec<String> = component.into_iter().map(str::to_string).collect();
            ids.sort();
            ids
        })
        .collect();
    cycles.sort();
    cycles
}

struct Tarjan<'a> {
    graph: &'a BTreeMap<&'a str, Vec<&'a str>>,
    next_index: usize,
    index: BTreeMap<&'a str, usize>,
    lowlink: BTreeMap<&'a str, usize>,
    stack: Vec<&'a str>,
    on_stack: BTreeSet<&'a str>,
    components: Vec<Vec<&'a str>>,
}

impl<'a> Tarjan<'a> {
    fn new(graph: &'a BTreeMap<&'a str, Vec<&'a str>>) -> Self {
        Self {
            graph,
            next_index: 0,
            index: BTreeMap::new(),
            lowlink: BTreeMap::new(),
            stack: Vec::new(),
            on_stack: BTreeSet::new(),
            components: Vec::new(),
        }
    }

    fn open(&mut self, node: &'a str) {
        self.index.insert(node, self.next_index);
        self.lowlink.insert(node, self.next_index);
        self.next_index += 1;
        self.stack.push(node);
        self.on_stack.insert(node);
    }

    /// Depth-first from `root` with an explicit frame stack, so long
    /// dependency chains cannot exhaust the thread stack.
    fn visit(&mut self, root: &'a str) {
        let graph = self.graph;
        // (node, next edge to follow)
        let mut frames: Vec<(&'a str, usize)> = vec![(root, 0)];
        self.open(root);

        while let Some(frame) = frames.last_mut() {
            let (node, cursor) = *frame;
            let edges = graph.get(node).map(Vec::as_slice).unwrap_or_default();
            if let Some(&next) = edges.get(cursor) {
                frame.1 += 1;
                if !self.index.contains_key(next) {
                    self.open(next);
                    frames.push((next, 0));
                } else if self.on_stack.contains(next) {
                    let low = self.lowlink[node].min(self.index[next]);
                    self.lowlink.insert(node, low);
                }
                continue;
            }

            frames.pop();
            if let Some(&(parent, _)) = frames.last() {
                let low = self.lowlink[parent].min(self.lowlink[node]);
                self.lowlink.insert(parent, low);
            }
            if self.lowlink[node] == self.index[node] {
                let mut component = Vec::new();
                while let Some(member) = self.stack.pop() {
                    self.on_stack.remove(member);
                    component.push(member);
                    if member == node {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
    }
}

/// Dependencies of `task` that do not resolve to a `done` task.
pub fn unmet_dependencies(task: &Task, all: &[Task]) -> Vec<String> {
    let done: BTreeSet<&str> = all
        .iter()
        .filter(|t| t.status == TaskStatus::Done)
        .map(|t| t.id.as_str())
        .collect();
    task.depends_on
        .iter()
        .filter(|dep| !done.contains(dep.as_str()))
        .cloned()
        .collect()
}

/// Sort candidates: priority descending, then `created_at`, then id.
pub fn order_candidates(candidates: &mut [Task]) {
    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Pick the first eligible `todo` task.
///
/// `all` must contain every task across all columns so cycles spanning
/// non-`todo` tasks are still detected.
pub fn select_candidate(all: &[Task]) -> Selection {
    let cycles = find_cycles(all);
    let mut candidates: Vec<Task> = all
        .iter()
        .filter(|t| t.status == TaskStatus::Todo)
        .cloned()
        .collect();
    order_candidates(&mut candidates);

    let mut selection = Selection::default();
    for candidate in candidates {
        let eligibility = check(&candidate, all, &cycles);
        if eligibility == Eligibility::Eligible {
            selection.selected = Some(candidate);
            break;
        }
        selection.skipped.push((candidate.id.clone(), eligibility));
    }
    selection
}

fn check(task: &Task, all: &[Task], cycles: &[Vec<String>]) -> Eligibility {
    if let Some(cycle) = cycles.iter().find(|c| c.contains(&task.id)) {
        return Eligibility::OnCycle(cycle.clone());
    }
    let unmet = unmet_dependencies(task, all);
    if unmet.is_empty() {
        Eligibility::Eligible
    } else {
        Eligibility::BlockedBy(unmet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Priority;
    use chrono::{Duration, Utc};

    fn task(id: &str, status: TaskStatus, deps: &[&str]) -> Task {
        let mut t = Task::new(id, format!("{id} title"), status);
        t.depends_on = deps.iter().map(|d| d.to_string()).collect();
        t
    }

    #[test]
    fn mutual_dependency_flags_both_members() {
        let tasks = vec![
            task("a", TaskStatus::Todo, &["b"]),
            task("b", TaskStatus::Todo, &["a"]),
            task("c", TaskStatus::Todo, &[]),
        ];
        assert_eq!(find_cycles(&tasks), vec![vec!["a".to_string(), "b".to_string()]]);

        let selection = select_candidate(&tasks);
        assert_eq!(selection.selected.map(|t| t.id), Some("c".to_string()));
        let skipped: Vec<&str> = selection.skipped.iter().map(|(id, _)| id.as_str()).collect();
        assert!(skipped.contains(&"a"));
        assert!(skipped.contains(&"b"));
    }

    #[test]
    fn cycle_through_other_columns_is_detected() {
        let tasks = vec![
            task("a", TaskStatus::Todo, &["b"]),
            task("b", TaskStatus::Backlog, &["c"]),
            task("c", TaskStatus::Review, &["a"]),
        ];
        let cycles = find_cycles(&tasks);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 3);

        let selection = select_candidate(&tasks);
        assert!(selection.selected.is_none());
        assert!(matches!(selection.skipped[0].1, Eligibility::OnCycle(ref ids) if ids.len() == 3));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let tasks = vec![task("solo", TaskStatus::Todo, &["solo"])];
        assert_eq!(find_cycles(&tasks), vec![vec!["solo".to_string()]]);
    }

    #[test]
    fn long_chains_are_walked_without_recursion() {
        let n = 50_000;
        let ids: Vec<String> = (0..n).map(|i| format!("t{i:05}")).collect();
        let mut tasks: Vec<Task> = (0..n)
            .map(|i| {
                let next = ids[(i + 1) % n].as_str();
                task(&ids[i], TaskStatus::Backlog, &[next])
            })
            .collect();
        let cycles = find_cycles(&tasks);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), n);

        tasks[n - 1].depends_on.clear();
        assert!(find_cycles(&tasks).is_empty());
    }

    #[test]
    fn unknown_and_undone_dependencies_block() {
        let tasks = vec![
            task("a", TaskStatus::Todo, &["ghost", "b", "c"]),
            task("b", TaskStatus::Review, &[]),
            task("c", TaskStatus::Done, &[]),
        ];
        let selection = select_candidate(&tasks);
        assert!(selection.selected.is_none());
        assert_eq!(
            selection.skipped,
            vec![(
                "a".to_string(),
                Eligibility::BlockedBy(vec!["ghost".to_string(), "b".to_string()])
            )]
        );
    }

    #[test]
    fn candidates_order_by_priority_then_age_then_id() {
        let now = Utc::now();
        let mut low = task("low", TaskStatus::Todo, &[]);
        low.priority = Priority::Low;
        low.created_at = now - Duration::hours(5);
        let mut old = task("old", TaskStatus::Todo, &[]);
        old.created_at = now - Duration::hours(2);
        let mut new_b = task("b-new", TaskStatus::Todo, &[]);
        new_b.created_at = now;
        let mut new_a = task("a-new", TaskStatus::Todo, &[]);
        new_a.created_at = now;
        let mut urgent = task("urgent", TaskStatus::Todo, &[]);
        urgent.priority = Priority::Critical;
        urgent.created_at = now;

        let mut all = vec![low, new_b, old, urgent, new_a];
        order_candidates(&mut all);
        let ids: Vec<&str> = all.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["urgent", "old", "a-new", "b-new", "low"]);
    }

    #[test]
    fn blocked_higher_priority_task_yields_to_next() {
        let mut first = task("first", TaskStatus::Todo, &["dep"]);
        first.priority = Priority::High;
        let tasks = vec![
            first,
            task("dep", TaskStatus::InProgress, &[]),
            task("second", TaskStatus::Todo, &[]),
        ];
        let selection = select_candidate(&tasks);
        assert_eq!(selection.selected.map(|t| t.id), Some("second".to_string()));
        assert_eq!(selection.skipped.len(), 1);
    }
}
