//! # Rowpilot Engine
//!
//! The engine prepares recorded browser workflows for execution and drives their runs.
//!
//! ## Key Features
//!
//! - **Parameter templates**: `${name}` substitution into step fields
//! - **Subworkflow expansion**: inlines referenced workflows with cycle detection
//! - **Interruption handlers**: text normalization, deduplication, and LCS-based generalization
//!   of recorded handlers into reusable patterns
//! - **Run orchestration**: single-flight runs over a row window, configuration chaining,
//!   pause/resume/stop, and resumes after navigation or failure
//!
//! ## Usage
//!
//! ```rust
//! use rowpilot_engine::{WorkflowExpander, load_workflow_library};
//!
//! let temp_dir = tempfile::tempdir()?;
//! let library_path = temp_dir.path().join("library.yaml");
//! std::fs::write(&library_path, r#"
//! workflows:
//!   - id: login
//!     steps:
//!       - type: input
//!         value: "${user}"
//!   - id: orders
//!     steps:
//!       - type: subworkflow
//!         subworkflowId: login
//!         paramBindings:
//!           user: { valueSource: static, value: admin }
//! "#)?;
//!
//! let library = load_workflow_library(&library_path)?;
//! let expanded = WorkflowExpander::new(&library).expand(&library[1])?;
//! assert_eq!(expanded.workflow.steps[0].body().str_field("value"), Some("admin"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - **`templates`**: parameter token extraction and substitution
//! - **`interruption`**: handler normalization, signatures, and pattern unification
//! - **`workflow`**: expansion, execution state, the orchestrator, and the loopback runner
//! - **`error`**: typed errors for expansion, dispatch, and orchestration

use std::{fs, path::Path};

use anyhow::{Context, Result};
use rowpilot_types::Workflow;
use serde::Deserialize;

pub mod error;
pub mod interruption;
pub mod templates;
pub mod workflow;

pub use error::{DispatchError, ExpansionError, OrchestratorError};
pub use interruption::{
    PatternValidation, TextMatch, build_handler_repository, compute_lcs, compute_unified_pattern, dedupe_handlers, find_matching_handler,
    handler_regex, handler_signature, has_placeholders, merge_handlers, normalize_text, pattern_to_regex, trigger_matches, unify_handlers, validate_pattern_against_texts,
};
pub use templates::{SubstitutionScope, collect_required_params, extract_param_names, substitute_step};
pub use workflow::expand::{ExpansionOutput, WorkflowExpander};
pub use workflow::orchestrator::{Orchestrator, OrchestratorConfig, ResumeMode, RunNotice};
pub use workflow::runner::{InjectedFailure, LoopbackSurface, drive_payload};
pub use workflow::state::{ExecutionState, RunPhase, StepRunStatus};
pub use workflow::surface::{Destination, ExecutionSurface, InlineRowResolver, RowResolver};

/// Loads a workflow library from a YAML or JSON file.
///
/// Accepted shapes: a document with a `workflows` list, a bare list of workflows, or a single
/// workflow object.
pub fn load_workflow_library(file_path: impl AsRef<Path>) -> Result<Vec<Workflow>> {
    let file_path = file_path.as_ref();
    let content = fs::read_to_string(file_path).with_context(|| format!("failed to read workflow library: {}", file_path.display()))?;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum LibraryDocument {
        Library { workflows: Vec<Workflow> },
        List(Vec<Workflow>),
        Single(Box<Workflow>),
    }

    let document: LibraryDocument =
        serde_yaml::from_str(&content).with_context(|| format!("unsupported workflow library format: {}", file_path.display()))?;
    Ok(match document {
        LibraryDocument::Library { workflows } | LibraryDocument::List(workflows) => workflows,
        LibraryDocument::Single(workflow) => vec![*workflow],
    })
}
