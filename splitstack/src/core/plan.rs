//! Stack plan data model.

use serde::{Deserialize, Serialize};

use crate::core::branch::step_branch_name;

/// One step of a stack plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// 1-based ordinal within the plan.
    pub id: u32,
    #[serde(default)]
    pub title: String,
    /// Free-text implementation instructions for the editing agent.
    #[serde(default, alias = "goal")]
    pub instructions: String,
    /// Path patterns this step owns and may modify.
    #[serde(default)]
    pub allow: Vec<String>,
    /// Extra patterns the step may touch (e.g. shared config), also counted for coverage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared_allow: Vec<String>,
    /// Stacking-tool topic; defaults to the step branch name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

impl Step {
    /// All patterns this step may touch (`allow` followed by `shared_allow`).
    pub fn patterns(&self) -> Vec<&str> {
        self.allow
            .iter()
            .chain(self.shared_allow.iter())
            .map(String::as_str)
            .collect()
    }

    /// Title, falling back to a generic label when the planner left it empty.
    pub fn display_title(&self) -> String {
        if self.title.trim().is_empty() {
            format!("Step {}", self.id)
        } else {
            self.title.trim().to_string()
        }
    }

    pub fn topic_for(&self, head: &str) -> String {
        self.topic
            .clone()
            .filter(|topic| !topic.trim().is_empty())
            .unwrap_or_else(|| step_branch_name(head, self.id))
    }
}

/// Ordered sequence of steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(rename = "stack")]
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, id: u32) -> Option<&Step> {
        self.steps.iter().find(|step| step.id == id)
    }
}
