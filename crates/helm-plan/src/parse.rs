use helm_store::ToolKind;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// One step extracted from a generated plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: usize,
    pub text: String,
    /// Tool named by a `[browser]` / `[shell]` / `[data]` tag on the line.
    pub tool_hint: Option<ToolKind>,
}

const STEP_PATTERN: &str = concat!(
    r"^\s*(?:[-*+]\s+)?",
    r"(?:(?P<num>\d+)[.)]\s+)?",
    r"(?:\[(?P<check>[ xX]?)\]\s*)?",
    r"(?:\[(?P<tool>[A-Za-z]+)\]\s*)?",
    r"(?P<text>.*?)\s*$",
);

fn step_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(STEP_PATTERN).ok()).as_ref()
}

/// Splits plan text into ordered steps.
///
/// A line is a step when it carries a checkbox (`[ ]`, `[x]`), a list number
/// (`1.` / `1)`), or a bracketed tool tag. Every other line is skipped.
pub fn parse_plan(plan: &str) -> Vec<PlanStep> {
    plan.lines()
        .filter_map(parse_plan_line)
        .enumerate()
        .map(|(index, (text, tool_hint))| PlanStep {
            index,
            text,
            tool_hint,
        })
        .collect()
}

pub fn parse_plan_line(line: &str) -> Option<(String, Option<ToolKind>)> {
    let captures = step_pattern()?.captures(line)?;
    let numbered = captures.name("num").is_some();
    let checkbox = captures.name("check").is_some();
    let mut text = captures
        .name("text")
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();

    let mut tool_hint = None;
    if let Some(tag) = captures.name("tool") {
        match tag.as_str().parse::<ToolKind>() {
            Ok(kind) => tool_hint = Some(kind),
            // Not a tool tag; it belongs to the step text.
            Err(_) => text = format!("[{}] {}", tag.as_str(), text).trim().to_string(),
        }
    }

    if !(numbered || checkbox || tool_hint.is_some()) || text.is_empty() {
        return None;
    }
    Some((text, tool_hint))
}
