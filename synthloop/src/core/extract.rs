//! Isolation of candidate source code from a raw generation response.
//!
//! Extraction is conservative: when a response holds several plausible code
//! blocks and none can be singled out, it is rejected instead of guessed at.

use std::sync::LazyLock;

use regex::Regex;

static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^[ \t]*```[ \t]*([A-Za-z0-9_+.\-]*)[ \t]*\r?\n(.*?)^[ \t]*```[ \t]*\r?$")
        .expect("static block regex")
});
static FENCE_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*```.*$").expect("static fence regex"));

/// Language hints used to pick a block out of a response.
#[derive(Debug, Clone, Copy)]
pub struct ExtractRules<'a> {
    /// Fence tags accepted for the runtime (compared case-insensitively).
    pub fence_tags: &'a [&'a str],
    /// Matches the entry point declaration.
    pub entry_point: &'a Regex,
}

/// Result of extracting code from a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Code(String),
    Empty,
    Rejected { reason: String },
}

pub fn extract_code(raw: &str, rules: &ExtractRules<'_>) -> Extraction {
    if raw.trim().is_empty() {
        return Extraction::Empty;
    }

    let blocks: Vec<(String, &str)> = BLOCK_RE
        .captures_iter(raw)
        .filter_map(|caps| {
            let tag = caps.get(1)?.as_str().to_ascii_lowercase();
            let body = caps.get(2)?.as_str();
            Some((tag, body))
        })
        .collect();

    if !blocks.is_empty() {
        return select_block(&blocks, rules);
    }

    let fences: Vec<_> = FENCE_LINE_RE.find_iter(raw).collect();
    let code = match fences.as_slice() {
        [] => raw,
        [fence] => {
            let leading = raw[..fence.start()].trim().is_empty();
            if leading {
                &raw[fence.end()..]
            } else {
                &raw[..fence.start()]
            }
        }
        _ => {
            return Extraction::Rejected {
                reason: format!(
                    "response has {} unbalanced code fences; return exactly one fenced block",
                    fences.len()
                ),
            };
        }
    };
    finish(code)
}

fn select_block(blocks: &[(String, &str)], rules: &ExtractRules<'_>) -> Extraction {
    let candidates: Vec<&str> = blocks
        .iter()
        .filter(|(tag, _)| tag.is_empty() || rules.fence_tags.contains(&tag.as_str()))
        .map(|(_, body)| *body)
        .collect();

    match candidates.as_slice() {
        [] => Extraction::Rejected {
            reason: format!(
                "response has {} code blocks but none tagged as {}",
                blocks.len(),
                rules.fence_tags.first().copied().unwrap_or("code")
            ),
        },
        [only] => finish(only),
        many => {
            let declaring: Vec<&&str> = many
                .iter()
                .filter(|body| rules.entry_point.is_match(body))
                .collect();
            match declaring.as_slice() {
                [only] => finish(only),
                _ => Extraction::Rejected {
                    reason: format!(
                        "ambiguous response: {} code blocks and {} of them declare the entry point",
                        many.len(),
                        declaring.len()
                    ),
                },
            }
        }
    }
}

/// Drop leading blank lines and trailing whitespace without touching indentation.
fn finish(code: &str) -> Extraction {
    let body: Vec<&str> = code
        .lines()
        .skip_while(|line| line.trim().is_empty())
        .collect();
    let joined = body.join("\n");
    let trimmed = joined.trim_end();
    if trimmed.is_empty() {
        Extraction::Empty
    } else {
        Extraction::Code(trimmed.to_string())
    }
}
