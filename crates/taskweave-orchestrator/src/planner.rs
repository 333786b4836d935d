use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use taskweave_core::TaskType;

/// One subtask of a drafted plan. Each subtask depends on the one before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskDraft {
    /// Short subtask title.
    pub title: String,
    /// Clause of the request this subtask covers.
    pub description: String,
    /// Type inferred from the clause.
    pub task_type: TaskType,
}

/// A request turned into either a single task or a parent with subtasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDraft {
    /// Title of the root task.
    pub title: String,
    /// Full request text.
    pub description: String,
    /// Type of the root task.
    pub task_type: TaskType,
    /// Path mentioned in the request, if any.
    pub working_path: Option<String>,
    /// Empty when the request routes straight to one worker.
    pub subtasks: Vec<SubtaskDraft>,
}

impl PlanDraft {
    /// Whether the plan is a single task.
    pub fn is_direct(&self) -> bool {
        self.subtasks.is_empty()
    }
}

/// Turns free text into a plan draft.
pub trait DecompositionStrategy: Send + Sync {
    /// Draft a plan for `request`.
    fn decompose(&self, request: &str) -> PlanDraft;
}

/// Connector followed by an action verb starts a new clause: "..., then
/// review it", "... and write tests".
static CLAUSE_BREAK: LazyLock<Regex> = LazyLock::new(|| {
    compile(
        r"(?i)(?:\s*[,;]\s*|\s+)(?:and\s+then|and\s+also|then|and|also|after\s+that)\s+((?:write|add|create|build|compile|review|test|run|implement|research|investigate|analy[sz]e|assess|document|fix|verify|validate|check|deploy)\b)",
    )
});

static WORKING_PATH: LazyLock<Regex> = LazyLock::new(|| {
    compile(
        r#"(?i)\b(?:in|into|under|inside|at|to)\s+(?:the\s+)?(?:(?:directory|folder|path|project|repo)\s+)?[`'"]?((?:~|\.{1,2})?/[\w.\-/]*|[\w\-]+(?:/[\w.\-]+)+/?)"#,
    )
});

/// Checked in order, first match wins.
static TYPE_RULES: LazyLock<Vec<(Regex, TaskType)>> = LazyLock::new(|| {
    vec![
        (compile(r"(?i)\b(?:review|audit|critique)\b"), TaskType::Review),
        (compile(r"(?i)\b(?:tests?|testing|verify|validate|check)\b"), TaskType::Validation),
        (compile(r"(?i)\b(?:research|investigate|look\s+up|survey)\b"), TaskType::Research),
        (compile(r"(?i)\b(?:analy[sz]e|analysis|assess|profile|measure)\b"), TaskType::Analysis),
        (
            compile(r"(?i)\b(?:write|implement|create|build|compile|add|fix|refactor|generate|code|document|deploy)\b"),
            TaskType::Generation,
        ),
    ]
});

#[allow(clippy::expect_used)]
fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("built-in pattern is valid")
}

const MAX_TITLE_LEN: usize = 80;

/// Best-effort text heuristics. Splits a request on connector phrases that
/// introduce a new action and infers each clause's type from its verbs.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicDecomposer;

impl HeuristicDecomposer {
    /// The default decomposer.
    pub fn new() -> Self {
        Self
    }
}

impl DecompositionStrategy for HeuristicDecomposer {
    fn decompose(&self, request: &str) -> PlanDraft {
        let request = request.trim();
        let working_path = extract_working_path(request);
        let clauses = split_clauses(request);

        if clauses.len() < 2 {
            return PlanDraft {
                title: title_from(request),
                description: request.to_string(),
                task_type: infer_type(request),
                working_path,
                subtasks: Vec::new(),
            };
        }

        let subtasks = clauses
            .iter()
            .map(|clause| SubtaskDraft {
                title: title_from(clause),
                description: format!("{clause}\n\nPart of: {request}"),
                task_type: infer_type(clause),
            })
            .collect();
        PlanDraft {
            title: title_from(request),
            description: request.to_string(),
            task_type: TaskType::General,
            working_path,
            subtasks,
        }
    }
}

/// Infer a task type from the verbs in `text`.
pub fn infer_type(text: &str) -> TaskType {
    TYPE_RULES
        .iter()
        .find(|(pattern, _)| pattern.is_match(text))
        .map_or(TaskType::General, |(_, task_type)| *task_type)
}

/// First path-looking token introduced by "in", "into", "under" and the like.
pub fn extract_working_path(text: &str) -> Option<String> {
    WORKING_PATH
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':', '`', '\'', '"']))
        .filter(|p| !p.is_empty() && *p != "/")
        .map(String::from)
}

fn split_clauses(request: &str) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut start = 0;
    for caps in CLAUSE_BREAK.captures_iter(request) {
        let (Some(whole), Some(verb)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        push_clause(&mut clauses, &request[start..whole.start()]);
        start = verb.start();
    }
    push_clause(&mut clauses, &request[start..]);
    clauses
}

fn push_clause(clauses: &mut Vec<String>, raw: &str) {
    let clause = raw.trim().trim_end_matches(['.', ',', ';']).trim();
    if !clause.is_empty() {
        clauses.push(clause.to_string());
    }
}

fn title_from(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    let mut chars = first_line.chars();
    let mut title: String = match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };
    if title.chars().count() > MAX_TITLE_LEN {
        title = title.chars().take(MAX_TITLE_LEN - 3).collect::<String>() + "...";
    }
    title
}
