//! Declarative workflow definition language.
//!
//! A definition file is TOML holding one or more `[[workflow]]` tables. Each
//! workflow is a named graph of tasks with dependencies.
//!
//! # Example TOML
//!
//! ```toml
//! [[workflow]]
//! id = "nightly_etl"
//! description = "Extract, transform and load the warehouse"
//! schedule = "0 2 * * *"
//! tags = ["warehouse"]
//!
//! [[workflow.tasks]]
//! id = "extract"
//!
//! [[workflow.tasks]]
//! id = "load"
//! dependencies = ["extract"]
//! ```
//!
//! A single `[workflow]` table is accepted as shorthand for a file holding one
//! workflow. Workflows are decoded one at a time so a malformed workflow does
//! not hide its well-formed siblings.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors found while loading or validating a definition file.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// The file is not valid TOML.
    #[error("TOML parse error: {0}")]
    Syntax(#[from] toml::de::Error),

    /// The document is TOML but not shaped like a definition file.
    #[error("Malformed definition file: {0}")]
    Shape(String),

    /// A workflow table could not be decoded.
    #[error("Workflow #{index} is malformed: {reason}")]
    Malformed { index: usize, reason: String },

    /// A workflow decoded but is structurally invalid.
    #[error("Invalid workflow '{workflow}': {reason}")]
    Invalid { workflow: String, reason: String },
}

impl DefinitionError {
    fn invalid(workflow: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            workflow: workflow.to_string(),
            reason: reason.into(),
        }
    }
}

/// A complete declarative workflow definition.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkflowDefinition {
    /// Unique workflow identifier.
    pub id: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Optional cron-style schedule for the downstream scheduler.
    #[serde(default)]
    pub schedule: Option<String>,

    /// Free-form labels.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Tasks in declaration order.
    pub tasks: Vec<TaskDefinition>,
}

/// A single task within a workflow.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TaskDefinition {
    /// Unique task identifier within this workflow.
    pub id: String,

    /// Name of the operator that runs this task downstream.
    #[serde(default)]
    pub operator: Option<String>,

    /// IDs of tasks that must complete before this one runs.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// A parsed definition file whose workflows have not been decoded yet.
#[derive(Debug)]
pub struct DefinitionDocument {
    tables: Vec<toml::Value>,
}

impl DefinitionDocument {
    /// Parse the file contents. Only document-level problems fail here.
    pub fn parse(source: &str) -> Result<Self, DefinitionError> {
        let mut root: toml::Table = toml::from_str(source)?;

        let tables = match root.remove("workflow") {
            None => Vec::new(),
            Some(toml::Value::Array(items)) => items,
            Some(table @ toml::Value::Table(_)) => vec![table],
            Some(other) => {
                return Err(DefinitionError::Shape(format!(
                    "'workflow' must be a table or an array of tables, found {}",
                    other.type_str()
                )));
            }
        };

        Ok(Self { tables })
    }

    /// Number of workflow tables declared in the document.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether the document declares no workflows.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Decode and validate each workflow, in declaration order.
    ///
    /// Each entry is either a valid workflow or the error that disqualified it.
    /// A workflow whose id repeats an earlier valid workflow in the same file is
    /// rejected.
    pub fn into_workflows(self) -> Vec<Result<WorkflowDefinition, DefinitionError>> {
        let mut seen = HashSet::new();

        self.tables
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                let workflow: WorkflowDefinition =
                    value
                        .try_into()
                        .map_err(|e: toml::de::Error| DefinitionError::Malformed {
                            index: index + 1,
                            reason: e.message().to_string(),
                        })?;
                workflow.validate()?;
                if !seen.insert(workflow.id.clone()) {
                    return Err(DefinitionError::invalid(
                        &workflow.id,
                        "workflow id is declared more than once in this file",
                    ));
                }
                Ok(workflow)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl WorkflowDefinition {
    /// Validate the workflow definition.
    ///
    /// Checks:
    /// - Non-empty workflow id
    /// - At least one task
    /// - No empty or duplicate task IDs
    /// - All dependency references point to existing tasks
    /// - No cycles in the dependency graph
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.id.trim().is_empty() {
            return Err(DefinitionError::invalid(
                &self.id,
                "workflow id cannot be empty",
            ));
        }

        if self.tasks.is_empty() {
            return Err(DefinitionError::invalid(
                &self.id,
                "workflow must have at least one task",
            ));
        }

        let mut seen_ids = HashSet::new();
        for task in &self.tasks {
            if task.id.is_empty() {
                return Err(DefinitionError::invalid(&self.id, "task id cannot be empty"));
            }
            if !seen_ids.insert(task.id.as_str()) {
                return Err(DefinitionError::invalid(
                    &self.id,
                    format!("duplicate task id '{}'", task.id),
                ));
            }
        }

        for task in &self.tasks {
            for dep in &task.dependencies {
                if !seen_ids.contains(dep.as_str()) {
                    return Err(DefinitionError::invalid(
                        &self.id,
                        format!("task '{}' depends on unknown task '{}'", task.id, dep),
                    ));
                }
            }
        }

        if self.topological_order().is_none() {
            return Err(DefinitionError::invalid(
                &self.id,
                "cycle detected in task dependencies",
            ));
        }

        Ok(())
    }

    /// Task ids in an order that respects dependencies (Kahn's algorithm).
    ///
    /// Returns `None` when the graph has a cycle. Ties keep declaration order.
    pub fn topological_order(&self) -> Option<Vec<&str>> {
        let id_to_idx: HashMap<&str, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();

        let n = self.tasks.len();
        let mut in_degree = vec![0usize; n];
        let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

        for (idx, task) in self.tasks.iter().enumerate() {
            for dep in &task.dependencies {
                let dep_idx = *id_to_idx.get(dep.as_str())?;
                adj[dep_idx].push(idx);
                in_degree[idx] += 1;
            }
        }

        let mut ready: Vec<usize> = (0..n).rev().filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(node) = ready.pop() {
            order.push(self.tasks[node].id.as_str());
            for &neighbor in adj[node].iter().rev() {
                in_degree[neighbor] -= 1;
                if in_degree[neighbor] == 0 {
                    ready.push(neighbor);
                }
            }
        }

        (order.len() == n).then_some(order)
    }

    /// Tasks with no upstream dependencies.
    pub fn roots(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.dependencies.is_empty())
            .map(|t| t.id.as_str())
            .collect()
    }

    /// Tasks nothing else depends on.
    pub fn leaves(&self) -> Vec<&str> {
        let upstream: HashSet<&str> = self
            .tasks
            .iter()
            .flat_map(|t| t.dependencies.iter().map(String::as_str))
            .collect();
        self.tasks
            .iter()
            .map(|t| t.id.as_str())
            .filter(|id| !upstream.contains(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_WORKFLOWS: &str = r#"
[[workflow]]
id = "etl"
description = "Nightly load"
schedule = "0 2 * * *"
tags = ["warehouse"]

[[workflow.tasks]]
id = "extract"

[[workflow.tasks]]
id = "transform"
dependencies = ["extract"]

[[workflow.tasks]]
id = "load"
operator = "sql"
dependencies = ["transform"]

[[workflow]]
id = "report"

[[workflow.tasks]]
id = "render"
"#;

    fn workflows(source: &str) -> Vec<Result<WorkflowDefinition, DefinitionError>> {
        DefinitionDocument::parse(source).unwrap().into_workflows()
    }

    #[test]
    fn test_parse_multiple_workflows() {
        let results = workflows(TWO_WORKFLOWS);
        assert_eq!(results.len(), 2);

        let etl = results[0].as_ref().unwrap();
        assert_eq!(etl.id, "etl");
        assert_eq!(etl.description, "Nightly load");
        assert_eq!(etl.schedule.as_deref(), Some("0 2 * * *"));
        assert_eq!(etl.tags, vec!["warehouse"]);
        assert_eq!(etl.tasks.len(), 3);
        assert_eq!(etl.tasks[2].operator.as_deref(), Some("sql"));

        let report = results[1].as_ref().unwrap();
        assert_eq!(report.id, "report");
        assert!(report.schedule.is_none());
    }

    #[test]
    fn test_single_table_shorthand() {
        let results = workflows(
            r#"
[workflow]
id = "solo"
[[workflow.tasks]]
id = "t1"
"#,
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap().id, "solo");
    }

    #[test]
    fn test_no_workflows_is_not_an_error() {
        let doc = DefinitionDocument::parse("title = \"notes\"\n").unwrap();
        assert!(doc.is_empty());
        assert!(doc.into_workflows().is_empty());
    }

    #[test]
    fn test_invalid_toml_syntax() {
        let err = DefinitionDocument::parse("[[workflow]\nid = ").unwrap_err();
        assert!(matches!(err, DefinitionError::Syntax(_)));
    }

    #[test]
    fn test_workflow_key_wrong_type() {
        let err = DefinitionDocument::parse("workflow = 3\n").unwrap_err();
        assert!(matches!(err, DefinitionError::Shape(_)));
    }

    #[test]
    fn test_malformed_workflow_does_not_hide_siblings() {
        let results = workflows(
            r#"
[[workflow]]
description = "missing id"
[[workflow.tasks]]
id = "a"

[[workflow]]
id = "fine"
[[workflow.tasks]]
id = "a"
"#,
        );
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[0],
            Err(DefinitionError::Malformed { index: 1, .. })
        ));
        assert_eq!(results[1].as_ref().unwrap().id, "fine");
    }

    #[test]
    fn test_duplicate_workflow_id_in_file() {
        let results = workflows(
            r#"
[[workflow]]
id = "dup"
[[workflow.tasks]]
id = "a"

[[workflow]]
id = "dup"
[[workflow.tasks]]
id = "b"
"#,
        );
        assert!(results[0].is_ok());
        let err = results[1].as_ref().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_validate_no_tasks() {
        let results = workflows("[[workflow]]\nid = \"empty\"\ntasks = []\n");
        let err = results[0].as_ref().unwrap_err();
        assert!(err.to_string().contains("at least one task"));
    }

    #[test]
    fn test_validate_duplicate_task_ids() {
        let results = workflows(
            r#"
[[workflow]]
id = "w"
[[workflow.tasks]]
id = "a"
[[workflow.tasks]]
id = "a"
"#,
        );
        let err = results[0].as_ref().unwrap_err();
        assert!(err.to_string().contains("duplicate task id 'a'"));
    }

    #[test]
    fn test_validate_unknown_dependency() {
        let results = workflows(
            r#"
[[workflow]]
id = "w"
[[workflow.tasks]]
id = "a"
dependencies = ["ghost"]
"#,
        );
        let err = results[0].as_ref().unwrap_err();
        assert!(err.to_string().contains("unknown task 'ghost'"));
    }

    #[test]
    fn test_validate_cycle_detection() {
        let results = workflows(
            r#"
[[workflow]]
id = "w"
[[workflow.tasks]]
id = "a"
dependencies = ["c"]
[[workflow.tasks]]
id = "b"
dependencies = ["a"]
[[workflow.tasks]]
id = "c"
dependencies = ["b"]
"#,
        );
        let err = results[0].as_ref().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_validate_self_cycle() {
        let results = workflows(
            r#"
[[workflow]]
id = "w"
[[workflow.tasks]]
id = "a"
dependencies = ["a"]
"#,
        );
        assert!(results[0].is_err());
    }

    #[test]
    fn test_topological_order_and_shape() {
        let results = workflows(TWO_WORKFLOWS);
        let etl = results[0].as_ref().unwrap();
        assert_eq!(
            etl.topological_order().unwrap(),
            vec!["extract", "transform", "load"]
        );
        assert_eq!(etl.roots(), vec!["extract"]);
        assert_eq!(etl.leaves(), vec!["load"]);
    }

    #[test]
    fn test_diamond_dag() {
        let results = workflows(
            r#"
[[workflow]]
id = "diamond"
[[workflow.tasks]]
id = "start"
[[workflow.tasks]]
id = "left"
dependencies = ["start"]
[[workflow.tasks]]
id = "right"
dependencies = ["start"]
[[workflow.tasks]]
id = "join"
dependencies = ["left", "right"]
"#,
        );
        let wf = results[0].as_ref().unwrap();
        let order = wf.topological_order().unwrap();
        assert_eq!(order.first(), Some(&"start"));
        assert_eq!(order.last(), Some(&"join"));
        assert_eq!(wf.leaves(), vec!["join"]);
    }

    #[test]
    fn test_roundtrip_serialize() {
        let results = workflows(TWO_WORKFLOWS);
        let etl = results[0].as_ref().unwrap();
        let json = serde_json::to_string(etl).unwrap();
        let back: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, etl);
    }
}
