//! Shared types, error model, and configuration for linkweave.
//!
//! This crate is the foundation depended on by all other linkweave crates.
//! It provides:
//! - [`LinkweaveError`], the unified error type
//! - Domain types ([`Page`], [`Scope`], [`Edge`], [`PlanSnapshot`], [`Violation`])
//! - Configuration ([`AppConfig`], [`PlanConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AnchorMix, AppConfig, DefaultsConfig, GenerationConfig, GenerationPolicy, OpenRouterConfig,
    PlanConfig, PlannerConfig, UnderBudgetPolicy, config_dir, config_file_path, database_path,
    init_config, load_config, load_config_from, resolve_api_key,
};
pub use error::{LinkweaveError, Result};
pub use types::{
    AnchorKind, Edge, EdgeStatus, LinkHint, Page, PageReport, PageRole, PageStatus, PlacementMethod,
    PlanReport, PlanSnapshot, Rule, Scope, ScopeKind, ScopePosition, SnapshotSummary, TaskId,
    UnderBudget, UnplacedReason, Violation, anchor_key,
};
