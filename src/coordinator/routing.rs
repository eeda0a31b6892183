use crate::agents::AgentKind;
use crate::task::Task;

const PLANNER_KEYWORDS: &[&str] = &["plan", "design", "architecture", "strategy"];
const TESTER_KEYWORDS: &[&str] = &["test", "testing", "validate", "verify"];
const CODER_KEYWORDS: &[&str] = &[
    "code",
    "implement",
    "develop",
    "create",
    "write",
    "build",
    "make",
    "generate",
    "app",
    "website",
    "application",
];

/// Pick the worker kind for a task from its title and description.
///
/// Keyword sets are tried in priority order (planner, tester, coder) over
/// the lower-cased text; matching is by substring. Tasks matching nothing
/// go to the coder. Pure and total; evaluated once per task before
/// dispatch.
pub fn route(task: &Task) -> AgentKind {
    let text = format!("{} {}", task.title, task.description).to_lowercase();
    for (keywords, kind) in [
        (PLANNER_KEYWORDS, AgentKind::Planner),
        (TESTER_KEYWORDS, AgentKind::Tester),
        (CODER_KEYWORDS, AgentKind::Coder),
    ] {
        if keywords.iter().any(|keyword| text.contains(keyword)) {
            return kind;
        }
    }
    AgentKind::Coder
}
