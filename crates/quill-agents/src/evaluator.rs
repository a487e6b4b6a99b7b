//! Default evaluation collaborator: ask the generation backend to review its
//! own artifact, then parse and range-check the scores.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use quill_coordination::{Artifact, QualityAssessment, StageSpec};

use crate::collaborators::{Evaluator, GenerationError, GenerationRequest, Generator};
use crate::prompts;

/// Evaluator backed by any [`Generator`], using `<stage>:review` requests.
pub struct GeneratorEvaluator {
    generator: Arc<dyn Generator>,
}

impl GeneratorEvaluator {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Evaluator for GeneratorEvaluator {
    async fn evaluate(
        &self,
        stage: &StageSpec,
        artifact: &Artifact,
    ) -> Result<QualityAssessment, GenerationError> {
        let mut request = GenerationRequest::new(
            String::new(),
            format!("{}{}", stage.name, prompts::REVIEW_SUFFIX),
        )
        .with_input("text", prompts::review_prompt(stage, &artifact.content));
        request.attempt = artifact.attempt;

        let raw = self.generator.generate(&request).await?;
        let assessment = QualityAssessment::from_response(&raw).map_err(GenerationError::Malformed)?;

        let missing: Vec<&str> = stage
            .quality_dimensions
            .iter()
            .filter(|d| !assessment.dimensions.contains_key(d.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            debug!(stage = %stage.name, missing = ?missing, "Assessment omitted declared dimensions");
        }
        Ok(assessment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MockGenerator;
    use quill_coordination::Successor;

    fn draft() -> StageSpec {
        StageSpec::new("draft", Successor::Next("finish".into())).gated(["voice", "pacing"])
    }

    #[tokio::test]
    async fn test_parses_review_output() {
        let mut mock = MockGenerator::new();
        mock.expect_generate()
            .withf(|req| req.stage == "draft:review" && req.inputs["text"].contains("voice, pacing"))
            .times(1)
            .returning(|_| {
                Ok("```json\n{\"overall\": 7.5, \"dimensions\": {\"voice\": 8, \"pacing\": 6.5}, \"notes\": \"tighten act two\"}\n```".into())
            });
        let evaluator = GeneratorEvaluator::new(Arc::new(mock));
        let assessment = evaluator
            .evaluate(&draft(), &Artifact::new("draft", "Once upon a time"))
            .await
            .unwrap();
        assert_eq!(assessment.overall, 7.5);
        assert_eq!(assessment.dimensions["pacing"], 6.5);
    }

    #[tokio::test]
    async fn test_out_of_range_is_malformed() {
        let mut mock = MockGenerator::new();
        mock.expect_generate()
            .returning(|_| Ok(r#"{"overall": 14, "dimensions": {}}"#.into()));
        let evaluator = GeneratorEvaluator::new(Arc::new(mock));
        let err = evaluator
            .evaluate(&draft(), &Artifact::new("draft", "text"))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Malformed(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_backend_error_passes_through() {
        let mut mock = MockGenerator::new();
        mock.expect_generate()
            .returning(|_| Err(GenerationError::Refused("policy".into())));
        let evaluator = GeneratorEvaluator::new(Arc::new(mock));
        let err = evaluator
            .evaluate(&draft(), &Artifact::new("draft", "text"))
            .await
            .unwrap_err();
        assert_eq!(err, GenerationError::Refused("policy".into()));
    }
}
