//! Quality evaluation: assessments, the accept/revise/abandon gate, and
//! revision progress traces.
//!
//! ```text
//! artifact ─► QualityAssessment ─► QualityGate::decide
//!                                     ├─ Accept
//!                                     ├─ Revise  ─► select_targets ─► targeted instruction
//!                                     └─ Abandon (ceiling | plateau)
//! ```

pub mod assessment;
pub mod gate;
pub mod progress;

pub use assessment::{select_targets, QualityAssessment};
pub use gate::{AbandonReason, GateConfig, GateVerdict, QualityGate};
pub use progress::{RevisionProgress, RevisionStep};
