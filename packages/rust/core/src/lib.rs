//! Link planning and injection engine for linkweave.
//!
//! A planning run for one scope goes graph → budget → target selection →
//! anchor selection → injection → validation, and commits the result as the
//! scope's new active snapshot (see [`pipeline`]). [`tasks`] exposes runs as
//! pollable background tasks; [`links`] handles manual single-edge edits.

pub mod anchors;
pub mod budget;
pub mod generation;
pub mod graph;
pub mod import;
pub mod inject;
pub mod links;
pub mod pipeline;
pub mod selector;
pub mod tasks;
pub mod validate;

pub use anchors::{AnchorCandidate, AnchorLedger, AnchorPool, AnchorSuggestion};
pub use generation::{
    LlmTermEnricher, OfflineGenerator, OpenRouterGenerator, TermEnricher, TextGenerator,
};
pub use import::{ImportDocument, ImportSummary, import_file};
pub use links::{LinkChange, LinkEdit, anchor_suggestions, edit_page_links, link_map, page_links};
pub use pipeline::{
    PlanOutcome, PlanPhase, PlanProgress, PlanRequest, Planner, SilentProgress, hint_instruction,
    rollback_scope, strip_scope, validate_scope,
};
pub use tasks::{PlanService, TaskResult, TaskStatus};
