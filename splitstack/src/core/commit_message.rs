//! Machine-parseable step commit messages.
//!
//! Layout:
//!
//! ```text
//! step(<n>): <title>
//!
//! Stack-Head: <head>
//! Topic: <topic>
//! Relative: <previous topic>
//! ```
//!
//! `Topic`/`Relative` follow the trailer convention used by stacked-PR tools;
//! `Relative` is omitted for the first step. Stack topology can be rebuilt from
//! these fields alone.

use std::sync::LazyLock;

use regex::Regex;

static SUBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^step\(([1-9][0-9]*)\): (.*)$").expect("static regex"));

/// Metadata carried by a step commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCommit {
    pub step: u32,
    pub title: String,
    pub head: Option<String>,
    pub topic: Option<String>,
    pub relative: Option<String>,
}

/// Render the commit message for a step.
pub fn format_commit_message(
    step: u32,
    title: &str,
    head: &str,
    topic: &str,
    relative: Option<&str>,
) -> String {
    let title = title.lines().next().unwrap_or_default().trim();
    let mut msg = format!("step({step}): {title}\n\nStack-Head: {head}\nTopic: {topic}");
    if let Some(relative) = relative {
        msg.push_str(&format!("\nRelative: {relative}"));
    }
    msg.push('\n');
    msg
}

/// Parse a commit message produced by [`format_commit_message`].
///
/// Returns `None` when the subject line is not a step subject.
pub fn parse_commit_message(message: &str) -> Option<StepCommit> {
    let mut lines = message.lines();
    let caps = SUBJECT_RE.captures(lines.next()?.trim_end())?;
    let mut commit = StepCommit {
        step: caps.get(1)?.as_str().parse().ok()?,
        title: caps.get(2)?.as_str().trim().to_string(),
        head: None,
        topic: None,
        relative: None,
    };
    for line in lines {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim() {
            "Stack-Head" => commit.head = Some(value),
            "Topic" => commit.topic = Some(value),
            "Relative" => commit.relative = Some(value),
            _ => {}
        }
    }
    Some(commit)
}
