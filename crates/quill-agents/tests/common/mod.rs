//! Scripted in-process collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use quill_agents::{
    Collaborators, ContextSnapshot, EngineConfig, Evaluator, GenerationError, GenerationRequest,
    Generator, ProfileStore, Reasoner, ReasoningError, RunRequest, WorkflowEngine,
};
use quill_coordination::{Artifact, QualityAssessment, StageSpec};

pub const PLAN_DRAFT: &str =
    r#"{"plan": [{"action": "draft", "justification": "outline is detailed enough"}]}"#;
pub const PLAN_RESEARCH_THEN_DRAFT: &str = r#"{"plan": [
    {"action": "research", "justification": "period details are thin"},
    {"action": "draft", "justification": "then write"}
]}"#;

/// Output that satisfies the built-in pipeline's schema for `stage`.
pub fn stage_text(stage: &str, attempt: u32) -> String {
    if stage == "structure" {
        return format!(
            r#"{{"title": "The Keeper", "acts": [{{"name": "one", "beats": ["arrival"]}}], "attempt": {attempt}}}"#
        );
    }
    let mut text = format!("{stage} attempt {attempt}: ");
    while text.len() < 240 {
        text.push_str("the lamp turned and the sea kept its counsel. ");
    }
    text
}

/// Generator that answers every stage with [`stage_text`], after draining any
/// failures queued for that stage.
#[derive(Default)]
pub struct ScriptedGenerator {
    failures: Mutex<HashMap<String, VecDeque<GenerationError>>>,
    calls: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(self, stage: &str, errors: Vec<GenerationError>) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(stage.to_string(), errors.into());
        self
    }

    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, stage: &str) -> Vec<GenerationRequest> {
        self.calls()
            .into_iter()
            .filter(|r| r.stage == stage)
            .collect()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        self.calls.lock().unwrap().push(request.clone());
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&request.stage)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(error) => Err(error),
            None => Ok(stage_text(&request.stage, request.attempt)),
        }
    }
}

/// Evaluator returning queued overall scores per stage, then `default`.
pub struct ScriptedEvaluator {
    scores: Mutex<HashMap<String, VecDeque<f64>>>,
    default: f64,
    seen: Mutex<Vec<(String, u32, f64)>>,
}

impl ScriptedEvaluator {
    pub fn new(default: f64) -> Self {
        Self {
            scores: Mutex::new(HashMap::new()),
            default,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn scoring(self, stage: &str, scores: Vec<f64>) -> Self {
        self.scores
            .lock()
            .unwrap()
            .insert(stage.to_string(), scores.into());
        self
    }

    /// `(stage, artifact attempt, score)` for every evaluation, in order.
    pub fn seen(&self) -> Vec<(String, u32, f64)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate(
        &self,
        stage: &StageSpec,
        artifact: &Artifact,
    ) -> Result<QualityAssessment, GenerationError> {
        let overall = self
            .scores
            .lock()
            .unwrap()
            .get_mut(&stage.name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(self.default);
        self.seen
            .lock()
            .unwrap()
            .push((stage.name.clone(), artifact.attempt, overall));

        let mut assessment = QualityAssessment::new(overall).with_notes("scripted review");
        for (i, dim) in stage.quality_dimensions.iter().enumerate() {
            let score = (overall - i as f64 * 0.5).max(0.0);
            assessment = assessment.with_dimension(dim.clone(), score);
        }
        Ok(assessment)
    }
}

/// Reasoner replaying queued responses, then repeating `fallback`.
pub struct ScriptedReasoner {
    responses: Mutex<VecDeque<String>>,
    fallback: String,
    calls: AtomicUsize,
}

impl ScriptedReasoner {
    pub fn always(raw: &str) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: raw.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn then(self, raw: &str) -> Self {
        self.responses.lock().unwrap().push_back(raw.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn reason(
        &self,
        _snapshot: &ContextSnapshot,
        _legal_actions: &[String],
    ) -> Result<String, ReasoningError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.responses.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

pub struct Harness {
    pub generator: Arc<ScriptedGenerator>,
    pub evaluator: Arc<ScriptedEvaluator>,
    pub reasoner: Arc<ScriptedReasoner>,
    pub engine: Arc<WorkflowEngine>,
}

impl Harness {
    pub fn new(
        generator: ScriptedGenerator,
        evaluator: ScriptedEvaluator,
        reasoner: ScriptedReasoner,
    ) -> Self {
        Self::with_config(generator, evaluator, reasoner, EngineConfig::default(), None)
    }

    pub fn with_config(
        generator: ScriptedGenerator,
        evaluator: ScriptedEvaluator,
        reasoner: ScriptedReasoner,
        config: EngineConfig,
        profiles: Option<Arc<dyn ProfileStore>>,
    ) -> Self {
        let generator = Arc::new(generator);
        let evaluator = Arc::new(evaluator);
        let reasoner = Arc::new(reasoner);
        let graph = config.build_graph().unwrap();
        let engine = WorkflowEngine::new(
            Arc::new(graph),
            Arc::new(config),
            Collaborators {
                generator: generator.clone(),
                evaluator: evaluator.clone(),
                reasoner: reasoner.clone(),
                profiles,
            },
        );
        Self {
            generator,
            evaluator,
            reasoner,
            engine: Arc::new(engine),
        }
    }
}

pub fn premise() -> RunRequest {
    RunRequest::new().with_seed("premise", "a lighthouse keeper finds a letter from herself")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("quill_agents=debug,quill_coordination=debug")
        .with_test_writer()
        .try_init();
}
