//! The built-in creative-writing pipeline.
//!
//! ```text
//! idea → structure → { research | draft }
//!                      research → draft
//!                                 draft [gated] → finish [gated, final]
//! ```

use quill_coordination::{GraphError, OutputSchema, StageGraph, StageSpec, Successor};

pub const START_STAGE: &str = "idea";
pub const FINAL_STAGE: &str = "finish";

/// Seed key holding the user's premise.
pub const PREMISE_KEY: &str = "premise";
/// Seed key holding the user's previous work, filled from the profile store.
pub const PROFILE_KEY: &str = "profile";

pub fn default_stages() -> Vec<StageSpec> {
    vec![
        StageSpec::new("idea", Successor::Next("structure".into()))
            .requires([PREMISE_KEY])
            .optional([PROFILE_KEY])
            .schema(OutputSchema::Text { min_chars: 40 })
            .summary("Brainstorm story ideas from the premise"),
        StageSpec::new(
            "structure",
            Successor::Conditional(vec!["research".into(), "draft".into()]),
        )
        .requires(["idea"])
        .schema(OutputSchema::Json {
            required_fields: vec!["acts".into()],
        })
        .summary("Pick the strongest idea and outline its acts and beats"),
        StageSpec::new("research", Successor::Next("draft".into()))
            .requires(["structure"])
            .priority(1)
            .schema(OutputSchema::Text { min_chars: 40 })
            .summary("Gather facts and period detail the draft will need"),
        StageSpec::new("draft", Successor::Next(FINAL_STAGE.into()))
            .requires(["structure"])
            .optional(["research", PROFILE_KEY])
            .priority(2)
            .schema(OutputSchema::Text { min_chars: 200 })
            .gated(["voice", "pacing", "coherence", "dialogue"])
            .summary("Write the full draft from the outline"),
        StageSpec::new(FINAL_STAGE, Successor::Final)
            .requires(["draft"])
            .schema(OutputSchema::Text { min_chars: 200 })
            .gated(["polish", "consistency"])
            .summary("Polish the draft into the finished piece"),
    ]
}

pub fn default_graph() -> Result<StageGraph, GraphError> {
    StageGraph::new(START_STAGE, FINAL_STAGE, default_stages())
}
