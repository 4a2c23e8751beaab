//! Objective decomposition and complexity classification.

use crate::core::task::TaskKind;
use crate::error::{Error, Result};
use crate::ports::{ComplexityAnalysis, ComplexityClassifier, Note};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Output of the research phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchContext {
    pub notes: Vec<Note>,
}

impl ResearchContext {
    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}

/// One unit of work in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    /// Plan-local identifier referenced by `depends_on`.
    pub key: String,
    pub title: String,
    pub description: String,
    pub kind: TaskKind,
    /// Role of the agent that will take the task.
    pub role: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub estimated_minutes: Option<u32>,
    /// Keys of tasks that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl PlannedTask {
    pub fn new(key: &str, kind: TaskKind, role: &str, title: &str) -> Self {
        Self {
            key: key.to_string(),
            title: title.to_string(),
            description: String::new(),
            kind,
            role: role.to_string(),
            priority: 0,
            capabilities: Vec::new(),
            estimated_minutes: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, key: &str) -> Self {
        self.depends_on.push(key.to_string());
        self
    }
}

/// Ordered list of planned tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub tasks: Vec<PlannedTask>,
}

impl Plan {
    pub fn new(tasks: Vec<PlannedTask>) -> Self {
        Self { tasks }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.key == key)
    }

    /// Check keys are unique and every dependency names a known key.
    ///
    /// Cycles are left to the graph manager.
    pub fn validate(&self) -> Result<()> {
        let mut keys = HashSet::new();
        for task in &self.tasks {
            if !keys.insert(task.key.as_str()) {
                return Err(Error::Validation(format!("duplicate plan key '{}'", task.key)));
            }
        }
        for task in &self.tasks {
            for dep in &task.depends_on {
                if !keys.contains(dep.as_str()) {
                    return Err(Error::Validation(format!(
                        "plan task '{}' depends on unknown key '{}'",
                        task.key, dep
                    )));
                }
            }
        }
        Ok(())
    }

    /// Dependency indices for each task, in plan order.
    pub fn dependency_indices(&self) -> Result<Vec<Vec<usize>>> {
        self.validate()?;
        Ok(self
            .tasks
            .iter()
            .map(|t| {
                t.depends_on
                    .iter()
                    .filter_map(|k| self.index_of(k))
                    .collect()
            })
            .collect())
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, objective: &str, context: &ResearchContext) -> Result<Plan>;
}

/// Analysis, then implementation, then testing.
#[derive(Debug, Clone, Default)]
pub struct DefaultPlanner;

#[async_trait]
impl Planner for DefaultPlanner {
    async fn plan(&self, objective: &str, context: &ResearchContext) -> Result<Plan> {
        let objective = objective.trim();
        if objective.is_empty() {
            return Err(Error::Validation("objective must not be empty".into()));
        }

        let mut background = String::new();
        for note in &context.notes {
            background.push_str(&format!("\n- {}", note.title));
        }
        let analysis_desc = if background.is_empty() {
            format!("Analyze the codebase and design an approach for: {}", objective)
        } else {
            format!(
                "Analyze the codebase and design an approach for: {}\nPrior notes:{}",
                objective, background
            )
        };

        Ok(Plan::new(vec![
            PlannedTask::new("analysis", TaskKind::Analysis, "architect", "Analyze requirements")
                .with_description(&analysis_desc)
                .with_priority(30),
            PlannedTask::new(
                "implementation",
                TaskKind::Implementation,
                "implementer",
                "Implement changes",
            )
            .with_description(&format!("Implement: {}", objective))
            .with_priority(20)
            .depends_on("analysis"),
            PlannedTask::new("testing", TaskKind::Testing, "tester", "Verify changes")
                .with_description(&format!("Write and run tests for: {}", objective))
                .with_priority(10)
                .depends_on("implementation"),
        ]))
    }
}

const ADVANCED_KEYWORDS: &[&str] = &[
    "architecture",
    "concurrency",
    "distributed",
    "migration",
    "performance",
    "refactor",
    "security",
    "protocol",
];

const BASIC_KEYWORDS: &[&str] = &["typo", "rename", "comment", "docs", "format", "bump"];

/// Tier from keyword hits and description length.
#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn score(description: &str) -> f32 {
        let text = description.to_lowercase();
        let advanced = ADVANCED_KEYWORDS.iter().filter(|k| text.contains(*k)).count() as f32;
        let basic = BASIC_KEYWORDS.iter().filter(|k| text.contains(*k)).count() as f32;
        let length = (text.split_whitespace().count() as f32 / 200.0).min(0.3);
        (0.4 + advanced * 0.2 - basic * 0.2 + length).clamp(0.0, 1.0)
    }

    pub fn tier_for(score: f32) -> &'static str {
        if score < 0.34 {
            "basic"
        } else if score < 0.67 {
            "standard"
        } else {
            "advanced"
        }
    }
}

#[async_trait]
impl ComplexityClassifier for KeywordClassifier {
    async fn analyze(&self, description: &str) -> Result<ComplexityAnalysis> {
        let score = Self::score(description);
        let tier = Self::tier_for(score);
        Ok(ComplexityAnalysis {
            tier: tier.to_string(),
            score,
            rationale: format!("keyword score {:.2}", score),
        })
    }
}
