//! Stage specifications and the static edge table.
//!
//! A [`StageGraph`] is process-wide, read-only configuration: it is built and
//! validated once, then shared behind an `Arc` by every run.
//!
//! ```text
//! idea → structure ─┬─ research → draft → finish
//!                   └─────────────┘
//!          (conditional: decided at run time)
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::json::parse_embedded_object;

/// Shape an artifact must have before it is written into the state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum OutputSchema {
    /// Free prose; must be non-blank and at least `min_chars` characters.
    Text {
        #[serde(default)]
        min_chars: usize,
    },
    /// A JSON object (possibly wrapped in prose or a fenced block).
    Json {
        #[serde(default)]
        required_fields: Vec<String>,
    },
}

impl Default for OutputSchema {
    fn default() -> Self {
        Self::Text { min_chars: 1 }
    }
}

impl OutputSchema {
    /// Validate raw collaborator output.
    ///
    /// Returns the parsed JSON payload for `Json` schemas, `None` for text.
    pub fn validate(&self, raw: &str) -> Result<Option<serde_json::Value>, String> {
        match self {
            Self::Text { min_chars } => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Err("output is empty".to_string());
                }
                let len = trimmed.chars().count();
                if len < *min_chars {
                    return Err(format!(
                        "output has {} characters, expected at least {}",
                        len, min_chars
                    ));
                }
                Ok(None)
            }
            Self::Json { required_fields } => {
                let value = parse_embedded_object(raw)?;
                let missing: Vec<&str> = required_fields
                    .iter()
                    .filter(|field| value.get(field.as_str()).is_none())
                    .map(String::as_str)
                    .collect();
                if !missing.is_empty() {
                    return Err(format!("missing fields: {}", missing.join(", ")));
                }
                Ok(Some(value))
            }
        }
    }
}

/// Position of a stage in the static edge table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Successor {
    /// Always continue with the named stage.
    Next(String),
    /// Choose among these stages at run time.
    Conditional(Vec<String>),
    /// The designated final stage.
    Final,
}

/// Static description of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    /// State keys that must be present before the stage may run.
    #[serde(default)]
    pub required_keys: Vec<String>,
    /// State keys passed along when present.
    #[serde(default)]
    pub optional_keys: Vec<String>,
    #[serde(default)]
    pub output_schema: OutputSchema,
    #[serde(default)]
    pub quality_gated: bool,
    pub successor: Successor,
    /// Higher wins when the action selector falls back to a default.
    #[serde(default)]
    pub priority: u32,
    /// Sub-dimensions scored for gated stages, in declaration order.
    #[serde(default)]
    pub quality_dimensions: Vec<String>,
    /// One-line description shown to the reasoning collaborator.
    #[serde(default)]
    pub summary: String,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, successor: Successor) -> Self {
        Self {
            name: name.into(),
            required_keys: Vec::new(),
            optional_keys: Vec::new(),
            output_schema: OutputSchema::default(),
            quality_gated: false,
            successor,
            priority: 0,
            quality_dimensions: Vec::new(),
            summary: String::new(),
        }
    }

    pub fn requires<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn optional<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn schema(mut self, schema: OutputSchema) -> Self {
        self.output_schema = schema;
        self
    }

    /// Mark the stage as quality-gated with the given sub-dimensions.
    pub fn gated<I, S>(mut self, dimensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.quality_gated = true;
        self.quality_dimensions = dimensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn is_final(&self) -> bool {
        matches!(self.successor, Successor::Final)
    }

    /// Successor names referenced by this stage.
    pub fn successor_names(&self) -> Vec<&str> {
        match &self.successor {
            Successor::Next(next) => vec![next.as_str()],
            Successor::Conditional(candidates) => candidates.iter().map(String::as_str).collect(),
            Successor::Final => Vec::new(),
        }
    }
}

/// Errors raised while building a [`StageGraph`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Stage graph has no stages")]
    Empty,

    #[error("Duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("Stage '{from}' references unknown successor '{to}'")]
    UnknownSuccessor { from: String, to: String },

    #[error("Conditional stage '{0}' has no candidates")]
    EmptyConditional(String),

    #[error("Stage '{stage}' is marked final but the final stage is '{final_stage}'")]
    UnexpectedFinal { stage: String, final_stage: String },

    #[error("Final stage '{0}' must not have a successor")]
    FinalHasSuccessor(String),

    #[error("Final stage '{final_stage}' is unreachable from '{start}'")]
    FinalUnreachable { start: String, final_stage: String },
}

/// The validated, read-only stage graph.
#[derive(Debug, Clone)]
pub struct StageGraph {
    start: String,
    final_stage: String,
    stages: Vec<StageSpec>,
    index: HashMap<String, usize>,
}

impl StageGraph {
    /// Build and validate a graph.
    pub fn new(
        start: impl Into<String>,
        final_stage: impl Into<String>,
        stages: Vec<StageSpec>,
    ) -> Result<Self, GraphError> {
        let start = start.into();
        let final_stage = final_stage.into();

        if stages.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut index = HashMap::with_capacity(stages.len());
        for (i, spec) in stages.iter().enumerate() {
            if index.insert(spec.name.clone(), i).is_some() {
                return Err(GraphError::DuplicateStage(spec.name.clone()));
            }
        }

        if !index.contains_key(&start) {
            return Err(GraphError::StageNotFound(start));
        }
        if !index.contains_key(&final_stage) {
            return Err(GraphError::StageNotFound(final_stage));
        }

        for spec in &stages {
            match &spec.successor {
                Successor::Final if spec.name != final_stage => {
                    return Err(GraphError::UnexpectedFinal {
                        stage: spec.name.clone(),
                        final_stage: final_stage.clone(),
                    });
                }
                Successor::Conditional(candidates) if candidates.is_empty() => {
                    return Err(GraphError::EmptyConditional(spec.name.clone()));
                }
                _ => {}
            }
            if spec.name == final_stage && !spec.is_final() {
                return Err(GraphError::FinalHasSuccessor(spec.name.clone()));
            }
            for to in spec.successor_names() {
                if !index.contains_key(to) {
                    return Err(GraphError::UnknownSuccessor {
                        from: spec.name.clone(),
                        to: to.to_string(),
                    });
                }
            }
        }

        let graph = Self {
            start,
            final_stage,
            stages,
            index,
        };
        graph.check_reachability()?;
        Ok(graph)
    }

    fn check_reachability(&self) -> Result<(), GraphError> {
        let mut dag: DiGraph<&str, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = self
            .stages
            .iter()
            .map(|s| dag.add_node(s.name.as_str()))
            .collect();
        for (i, spec) in self.stages.iter().enumerate() {
            for to in spec.successor_names() {
                dag.add_edge(nodes[i], nodes[self.index[to]], ());
            }
        }

        let start = nodes[self.index[&self.start]];
        let finish = nodes[self.index[&self.final_stage]];
        if !petgraph::algo::has_path_connecting(&dag, start, finish, None) {
            return Err(GraphError::FinalUnreachable {
                start: self.start.clone(),
                final_stage: self.final_stage.clone(),
            });
        }

        for (i, spec) in self.stages.iter().enumerate() {
            if !petgraph::algo::has_path_connecting(&dag, start, nodes[i], None) {
                tracing::warn!(stage = %spec.name, "stage is unreachable from the start stage");
            }
        }
        Ok(())
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn final_stage(&self) -> &str {
        &self.final_stage
    }

    /// All stages in declaration order.
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn get(&self, name: &str) -> Option<&StageSpec> {
        self.index.get(name).map(|&i| &self.stages[i])
    }

    pub fn stage(&self, name: &str) -> Result<&StageSpec, GraphError> {
        self.get(name)
            .ok_or_else(|| GraphError::StageNotFound(name.to_string()))
    }

    /// Position of a stage in declaration order.
    pub fn declaration_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Stages reachable in one step from `name`, in the order they were listed.
    pub fn legal_next(&self, name: &str) -> Vec<&StageSpec> {
        self.get(name)
            .map(|spec| {
                spec.successor_names()
                    .into_iter()
                    .filter_map(|n| self.get(n))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Required keys that no stage produces; callers must seed them.
    pub fn seed_keys(&self) -> BTreeSet<String> {
        self.stages
            .iter()
            .flat_map(|s| s.required_keys.iter())
            .filter(|k| !self.index.contains_key(k.as_str()))
            .cloned()
            .collect()
    }
}

impl fmt::Display for StageGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for spec in &self.stages {
            let marker = if spec.name == self.start { "*" } else { " " };
            let gate = if spec.quality_gated { " [gated]" } else { "" };
            let next = match &spec.successor {
                Successor::Next(n) => n.clone(),
                Successor::Conditional(c) => format!("one of {{{}}}", c.join(", ")),
                Successor::Final => "(final)".to_string(),
            };
            writeln!(f, "{marker} {}{gate} -> {next}", spec.name)?;
        }
        Ok(())
    }
}
