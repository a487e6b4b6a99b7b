//! Prompt text for each stage, the reviewer, and the stage planner.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever preamble content changes,
//! so a report can be traced back to the prompts that produced it.

use quill_coordination::{QualityAssessment, StageSpec};

use crate::collaborators::{ContextSnapshot, GenerationRequest};

/// Prompt version. Bump on any preamble content change.
pub const PROMPT_VERSION: &str = "1.2.0";

/// Suffix appended to a stage name for evaluation requests.
pub const REVIEW_SUFFIX: &str = ":review";

/// Shared preamble for every writing stage.
pub const WRITER_PREAMBLE: &str = "\
You are a careful fiction collaborator working one stage of a multi-stage writing \
pipeline. Use only the material you are given. Do not add commentary about your \
process, and do not wrap prose in code fences.";

pub const IDEA_PREAMBLE: &str = "\
Turn the premise into three distinct story ideas. For each give a one-line logline, \
the central conflict, and the emotional turn at the end. If a reader profile is \
provided, favour ideas that fit its history.";

pub const STRUCTURE_PREAMBLE: &str = "\
Choose the strongest idea and lay out its structure. Answer with a single JSON object: \
{\"title\": string, \"acts\": [{\"name\": string, \"beats\": [string]}], \
\"research_needed\": [string]}.";

pub const RESEARCH_PREAMBLE: &str = "\
List the concrete facts, period details and sensory specifics the draft will need, \
grouped by act. Flag anything uncertain instead of inventing it.";

pub const DRAFT_PREAMBLE: &str = "\
Write the full draft following the structure beat by beat. Keep a consistent point of \
view, let dialogue carry conflict, and end on the emotional turn.";

pub const FINISH_PREAMBLE: &str = "\
Polish the draft for publication: fix continuity slips, tighten sentences, and make \
names and facts consistent. Return the complete finished text.";

pub const REVIEW_PREAMBLE: &str = "\
You are a demanding fiction editor. Score the text on a 0-10 scale overall and for each \
requested dimension. Answer with a single JSON object: \
{\"overall\": number, \"dimensions\": {\"<name>\": number}, \"notes\": string}. \
Keep notes under 80 words and make them actionable.";

pub const PLANNER_PREAMBLE: &str = "\
You choose which stage of a writing pipeline runs next. Pick only from the legal \
stages listed. Answer with a single JSON object matching the schema you are given: \
{\"plan\": [{\"action\": \"<stage>\", \"arguments\": {}, \"justification\": \"<why>\"}]}. \
Propose between 1 and 5 stages, each with a short justification.";

/// Preamble for a stage name (review requests included).
pub fn preamble_for(stage: &str) -> &'static str {
    if stage.ends_with(REVIEW_SUFFIX) {
        return REVIEW_PREAMBLE;
    }
    match stage {
        "idea" => IDEA_PREAMBLE,
        "structure" => STRUCTURE_PREAMBLE,
        "research" => RESEARCH_PREAMBLE,
        "draft" => DRAFT_PREAMBLE,
        "finish" => FINISH_PREAMBLE,
        _ => WRITER_PREAMBLE,
    }
}

/// User prompt for a stage request: inputs, then arguments, then any revision instruction.
pub fn stage_prompt(request: &GenerationRequest) -> String {
    let mut prompt = format!("## Stage\n\n{}\n", request.stage);
    for (key, value) in &request.inputs {
        prompt.push_str(&format!("\n## {}\n\n{}\n", heading(key), value));
    }
    if let Some(arguments) = &request.arguments {
        prompt.push_str(&format!("\n## Guidance\n\n{arguments}\n"));
    }
    if let Some(revision) = &request.revision {
        prompt.push_str(&format!(
            "\n## Revision (attempt {})\n\n{}\n\nReturn the complete revised text.\n",
            request.attempt, revision
        ));
    }
    prompt
}

fn heading(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Targeted instruction for the revise variant of a stage.
pub fn revision_instruction(
    stage: &StageSpec,
    assessment: &QualityAssessment,
    targets: &[(String, f64)],
) -> String {
    let mut out = format!(
        "The current {} scored {:.1}/10. Revise it, keeping what works.",
        stage.name, assessment.overall
    );
    if !targets.is_empty() {
        let focus: Vec<String> = targets
            .iter()
            .map(|(name, score)| format!("{name} ({score:.1})"))
            .collect();
        out.push_str(&format!(" Focus on: {}.", focus.join(", ")));
    }
    if !assessment.notes.trim().is_empty() {
        out.push_str(&format!(" Editor notes: {}", assessment.notes.trim()));
    }
    out
}

/// Evaluation request body: the artifact and the dimensions to score.
pub fn review_prompt(stage: &StageSpec, content: &str) -> String {
    format!(
        "## Stage\n\n{}\n\n## Dimensions\n\n{}\n\n## Text\n\n{}\n",
        stage.name,
        if stage.quality_dimensions.is_empty() {
            "(overall only)".to_string()
        } else {
            stage.quality_dimensions.join(", ")
        },
        content
    )
}

/// Planner prompt built from a context snapshot.
pub fn planner_prompt(snapshot: &ContextSnapshot, legal: &[String]) -> String {
    let mut prompt = format!(
        "## Just finished\n\n{}\n\n## Legal next stages\n\n",
        snapshot.current_stage
    );
    for option in &snapshot.options {
        prompt.push_str(&format!(
            "- {} (priority {}): {}\n",
            option.name, option.priority, option.summary
        ));
    }
    prompt.push_str(&format!("\nAllowed names: {}\n", legal.join(", ")));
    prompt.push_str(&format!(
        "\n## Available material\n\n{}\n",
        snapshot.available_keys.join(", ")
    ));
    if let Some(score) = snapshot.quality_score {
        prompt.push_str(&format!("\nLast quality score: {score:.1}/10\n"));
    }
    if !snapshot.recent.is_empty() {
        prompt.push_str("\n## Recent history\n\n");
        for line in &snapshot.recent {
            prompt.push_str(&format!(
                "- {} #{} {}: {}\n",
                line.stage, line.attempt, line.outcome, line.summary
            ));
        }
    }
    prompt.push_str(&format!("\n## Answer schema\n\n{}\n", snapshot.schema));
    if let Some(correction) = &snapshot.correction {
        prompt.push_str(&format!("\n## Correction\n\n{correction}\n"));
    }
    prompt
}

/// Corrective instruction sent after a rejected planner answer.
pub fn corrective_instruction(error: &str, legal: &[String]) -> String {
    format!(
        "Your previous answer was rejected: {error}. Reply with only a JSON object of the form \
         {{\"plan\": [{{\"action\": \"<stage>\", \"justification\": \"<why>\"}}]}} \
         using one of: {}.",
        legal.join(", ")
    )
}
