//! Workflow runtime pieces.
//!
//! - [`expand`]: subworkflow flattening with parameter substitution
//! - [`state`]: the in-memory state of the active run
//! - [`surface`]: the traits the orchestrator drives and reads rows through
//! - [`orchestrator`]: run lifecycle, configuration chaining, and resumes
//! - [`runner`]: an in-process execution surface

pub mod expand;
pub mod orchestrator;
pub mod runner;
pub mod state;
pub mod surface;
