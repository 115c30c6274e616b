//! Prompt pack builder for generation and planning requests.
//!
//! Rendering is deterministic: the same inputs always produce the same prompt.
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`
//! so the builder can enforce a byte budget without understanding the text.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::analysis::ColumnProfile;
use crate::core::diagnosis::Diagnosis;
use crate::core::types::Schema;

const GENERATE_TEMPLATE: &str = include_str!("prompts/generate.md");
const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");

/// Droppable sections, least important first.
const DROP_ORDER: [&str; 4] = ["history", "analysis", "sample", "plan"];
const TRUNCATION_NOTICE: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("static section regex")
});

/// What the candidate must look like, as stated to the backend.
#[derive(Debug, Clone, Serialize)]
pub struct OutputContract {
    /// Human name of the candidate language.
    pub language: String,
    /// Fence tag the response should use.
    pub fence_tag: String,
    /// Entry point signature, e.g. `def parse(input_path: str)`.
    pub entry_signature: String,
    /// What the entry point must return.
    pub returns: String,
}

/// Everything a prompt is built from.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub target: &'a str,
    pub description: &'a str,
    pub notes: &'a [String],
    pub contract: &'a OutputContract,
    pub schema: &'a Schema,
    pub analysis: &'a [ColumnProfile],
    pub plan: Option<&'a str>,
    /// Diagnoses of prior attempts, oldest first.
    pub history: &'a [Diagnosis],
}

#[derive(Debug, Clone, Serialize)]
struct SchemaColumn<'a> {
    name: &'a str,
    kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct HistoryEntry {
    attempt: usize,
    kind: &'static str,
    text: String,
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// A rendered prompt and what the budget removed from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptPack {
    content: String,
    pub dropped: Vec<String>,
    pub truncated: Option<String>,
}

impl PromptPack {
    pub fn render(&self) -> &str {
        &self.content
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Builds prompt packs within a byte budget, dropping less critical sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
    history_window: usize,
}

impl PromptBuilder {
    /// `history_window` counts the latest diagnosis too.
    pub fn new(budget_bytes: usize, history_window: usize) -> Self {
        Self {
            budget_bytes,
            history_window,
        }
    }

    pub fn build_generation(&self, input: &PromptInputs<'_>) -> Result<PromptPack> {
        let rendered = self.render("generate", GENERATE_TEMPLATE, input)?;
        Ok(self.pack(&rendered))
    }

    pub fn build_plan(&self, input: &PromptInputs<'_>) -> Result<PromptPack> {
        let rendered = self.render("plan", PLAN_TEMPLATE, input)?;
        Ok(self.pack(&rendered))
    }

    fn render(&self, name: &str, source: &'static str, input: &PromptInputs<'_>) -> Result<String> {
        let mut env = Environment::new();
        env.add_template(name, source)
            .with_context(|| format!("load {name} template"))?;
        let template = env.get_template(name)?;

        let (earlier, latest) = self.split_history(input.history);
        let columns: Vec<SchemaColumn<'_>> = input
            .schema
            .columns
            .iter()
            .zip(&input.schema.kinds)
            .map(|(name, kind)| SchemaColumn {
                name,
                kind: kind.as_str(),
            })
            .collect();
        let analysis: Vec<String> = input.analysis.iter().map(ColumnProfile::describe).collect();

        template
            .render(context! {
                target => input.target,
                description => input.description.trim(),
                notes => input.notes,
                contract => input.contract,
                columns => columns,
                row_count => input.schema.row_count,
                sample => &input.schema.sample,
                analysis => analysis,
                plan => input.plan.map(str::trim).filter(|s| !s.is_empty()),
                history => earlier,
                failure => latest,
            })
            .with_context(|| format!("render {name} template"))
    }

    /// Split into the earlier window and the latest diagnosis.
    fn split_history(&self, history: &[Diagnosis]) -> (Vec<HistoryEntry>, Option<HistoryEntry>) {
        let entry = |idx: usize, diagnosis: &Diagnosis| HistoryEntry {
            attempt: idx + 1,
            kind: diagnosis.kind(),
            text: diagnosis.describe(),
        };
        let Some((last, rest)) = history.split_last() else {
            return (Vec::new(), None);
        };
        let keep = self.history_window.saturating_sub(1).min(rest.len());
        let start = rest.len() - keep;
        let earlier = rest[start..]
            .iter()
            .enumerate()
            .map(|(offset, d)| entry(start + offset, d))
            .collect();
        (earlier, Some(entry(rest.len(), last)))
    }

    fn pack(&self, rendered: &str) -> PromptPack {
        let mut sections = parse_sections(rendered);
        let (dropped, truncated) = apply_budget(&mut sections, self.budget_bytes);
        PromptPack {
            content: render_sections(&sections),
            dropped,
            truncated,
        }
    }
}

/// Split rendered output at section markers. Empty sections are discarded.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(mode)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        if content.is_empty() {
            continue;
        }
        sections.push(ParsedSection {
            key: key.as_str().to_string(),
            required: mode.as_str() == "required",
            content,
        });
    }

    sections
}

fn total_len(sections: &[ParsedSection]) -> usize {
    let separators = sections.len().saturating_sub(1) * 2;
    sections.iter().map(|s| s.content.len()).sum::<usize>() + separators
}

/// Drop droppable sections in [`DROP_ORDER`], then truncate the largest section.
fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) -> (Vec<String>, Option<String>) {
    let mut dropped = Vec::new();

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return (dropped, None);
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            let removed = sections.remove(idx);
            debug!(
                section = key,
                bytes_dropped = removed.content.len(),
                "dropped section for budget"
            );
            dropped.push(removed.key);
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return (dropped, None);
    }
    let Some(largest) = sections.iter_mut().max_by_key(|s| s.content.len()) else {
        return (dropped, None);
    };
    let before_len = largest.content.len();
    let allowed = before_len.saturating_sub(total - budget);
    let keep = allowed.saturating_sub(TRUNCATION_NOTICE.len());
    truncate_on_boundary(&mut largest.content, keep);
    largest.content.push_str(TRUNCATION_NOTICE);
    debug!(
        section = largest.key,
        before_len,
        after_len = largest.content.len(),
        "truncated section for budget"
    );
    (dropped, Some(largest.key.clone()))
}

fn truncate_on_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut idx = max;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    s.truncate(idx);
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diagnosis::CellDiff;
    use crate::core::types::ColumnKind;

    fn contract() -> OutputContract {
        OutputContract {
            language: "Python".to_string(),
            fence_tag: "python".to_string(),
            entry_signature: "def parse(input_path: str)".to_string(),
            returns: "a pandas DataFrame".to_string(),
        }
    }

    fn schema() -> Schema {
        Schema {
            columns: vec!["Date".to_string(), "Balance".to_string()],
            kinds: vec![ColumnKind::Text, ColumnKind::Numeric],
            row_count: 12,
            sample: vec![vec!["01-08-2024".to_string(), "1500".to_string()]],
        }
    }

    fn value_mismatch(row: usize) -> Diagnosis {
        Diagnosis::ValueMismatch {
            rows: vec![row],
            mismatched_cells: 1,
            samples: vec![CellDiff {
                row,
                column: "Balance".to_string(),
                got: "0".to_string(),
                expected: "<missing>".to_string(),
            }],
        }
    }

    fn build(history: &[Diagnosis], budget: usize) -> PromptPack {
        let contract = contract();
        let schema = schema();
        let notes = vec!["Dates are day-first.".to_string()];
        let input = PromptInputs {
            target: "icici",
            description: "Extract the transaction table from a bank statement PDF.",
            notes: &notes,
            contract: &contract,
            schema: &schema,
            analysis: &[],
            plan: Some("Read every page."),
            history,
        };
        PromptBuilder::new(budget, 3)
            .build_generation(&input)
            .expect("build prompt")
    }

    #[test]
    fn first_attempt_has_no_failure_section() {
        let pack = build(&[], 40_000);
        let content = pack.render();
        assert!(content.contains("`def parse(input_path: str)`"));
        assert!(content.contains("`Date`, `Balance`"));
        assert!(content.contains("12 rows"));
        assert!(!content.contains("### Latest Failure"));
        assert!(!content.contains("### Earlier Attempts"));
    }

    #[test]
    fn sections_appear_in_stable_order() {
        let history = vec![Diagnosis::GenerationEmpty, value_mismatch(4)];
        let pack = build(&history, 40_000);
        let content = pack.render();

        let order = [
            "### Contract",
            "### Task",
            "### Expected Schema",
            "### Reference Sample",
            "### Plan",
            "### Earlier Attempts",
            "### Latest Failure",
            "### Output Format",
        ];
        let positions: Vec<usize> = order
            .iter()
            .map(|h| content.find(h).unwrap_or_else(|| panic!("missing {h}")))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn latest_diagnosis_is_embedded_verbatim() {
        let history = vec![value_mismatch(4)];
        let pack = build(&history, 40_000);
        assert!(pack.render().contains(&history[0].describe()));
        assert!(pack.render().contains("Attempt 1"));
    }

    #[test]
    fn history_window_limits_earlier_attempts() {
        let history = vec![
            value_mismatch(1),
            value_mismatch(2),
            value_mismatch(3),
            value_mismatch(4),
        ];
        let pack = build(&history, 40_000);
        let content = pack.render();
        assert!(!content.contains("Attempt 1 "));
        assert!(content.contains("Attempt 2 "));
        assert!(content.contains("Attempt 3 "));
        assert!(content.contains("Attempt 4 "));
    }

    #[test]
    fn budget_drops_history_before_plan() {
        let history = vec![value_mismatch(1), value_mismatch(2)];
        let full = build(&history, 40_000);
        let earlier_len = full
            .render()
            .find("### Latest Failure")
            .expect("failure")
            - full.render().find("### Earlier Attempts").expect("history");

        let pack = build(&history, full.len() - earlier_len + 10);
        assert_eq!(pack.dropped, vec!["history".to_string()]);
        assert!(pack.render().contains("### Plan"));
        assert!(pack.render().contains("### Latest Failure"));
        assert!(pack.truncated.is_none());
    }

    #[test]
    fn tiny_budget_truncates_required_content() {
        let pack = build(&[value_mismatch(1)], 300);
        assert_eq!(pack.dropped, vec!["sample".to_string(), "plan".to_string()]);
        assert!(pack.truncated.is_some());
        assert!(pack.render().contains("[truncated]"));
        assert!(pack.render().contains("### Latest Failure") || pack.render().contains("### Contract"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut s = "añb".to_string();
        truncate_on_boundary(&mut s, 2);
        assert_eq!(s, "a");
    }

    #[test]
    fn plan_prompt_asks_for_no_code() {
        let contract = contract();
        let schema = schema();
        let input = PromptInputs {
            target: "icici",
            description: "Extract rows.",
            notes: &[],
            contract: &contract,
            schema: &schema,
            analysis: &[],
            plan: None,
            history: &[],
        };
        let pack = PromptBuilder::new(40_000, 3)
            .build_plan(&input)
            .expect("plan prompt");
        assert!(pack.render().contains("Do not write code"));
        assert!(pack.render().contains("`Date`, `Balance`"));
    }
}
