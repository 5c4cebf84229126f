//! Application configuration for linkweave.
//!
//! User config lives at `~/.linkweave/linkweave.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LinkweaveError, Result};
use crate::types::AnchorKind;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "linkweave.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".linkweave";

// ---------------------------------------------------------------------------
// Config structs (matching linkweave.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// OpenRouter settings for the generation collaborator.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    /// Timeout/retry policy for generation calls.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Link planning parameters.
    #[serde(default)]
    pub planner: PlannerConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Database file (a leading `~/` expands to the home directory).
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

fn default_database() -> String {
    "~/.linkweave/linkweave.db".into()
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for sentence rewrites and term variations.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// OpenAI-compatible API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            base_url: default_base_url(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "moonshotai/kimi-k2.5".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}

/// `[generation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Per-attempt timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Total attempts per call (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Linear backoff step between attempts, in ms.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Generative-fallback rewrites allowed per page per run.
    #[serde(default = "default_fallback_limit")]
    pub fallback_limit_per_page: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            fallback_limit_per_page: default_fallback_limit(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_fallback_limit() -> usize {
    3
}

/// What to do with pages that realize fewer links than `min_budget`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnderBudgetPolicy {
    /// Any under-budget page fails validation.
    Strict,
    /// Under-budget pages pass with an `under_budget` note.
    #[default]
    Lenient,
}

/// Target anchor-kind distribution per target page, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorMix {
    pub partial: u32,
    pub exact: u32,
    pub natural: u32,
}

impl Default for AnchorMix {
    fn default() -> Self {
        Self {
            partial: 60,
            exact: 10,
            natural: 30,
        }
    }
}

impl AnchorMix {
    /// Share of `kind`, in percent.
    pub fn share(&self, kind: AnchorKind) -> u32 {
        match kind {
            AnchorKind::Partial => self.partial,
            AnchorKind::Exact => self.exact,
            AnchorKind::Natural => self.natural,
        }
    }
}

/// `[planner]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default = "default_min_budget")]
    pub min_budget: usize,
    #[serde(default = "default_max_budget")]
    pub max_budget: usize,
    /// Words of body text that afford one outbound link.
    #[serde(default = "default_words_per_link")]
    pub words_per_link: usize,
    /// Shared labels needed for two flat-scope pages to be related.
    #[serde(default = "default_min_shared_labels")]
    pub related_min_shared_labels: usize,
    /// Flat scoring: weight per shared label.
    #[serde(default = "default_label_weight")]
    pub label_weight: i64,
    /// Magnetism bonus added to every candidate edge pointing at a priority page.
    #[serde(default = "default_priority_bonus")]
    pub priority_bonus: i64,
    /// Hierarchical scopes: sibling candidates kept per dependent.
    #[serde(default = "default_sibling_top_k")]
    pub sibling_top_k: usize,
    /// Maximum scope-wide repeats of one literal anchor per target.
    #[serde(default = "default_anchor_max_repeat")]
    pub anchor_max_repeat: usize,
    #[serde(default)]
    pub anchor_mix: AnchorMix,
    #[serde(default = "default_max_links_per_paragraph")]
    pub max_links_per_paragraph: usize,
    #[serde(default = "default_min_words_between_links")]
    pub min_words_between_links: usize,
    #[serde(default)]
    pub under_budget: UnderBudgetPolicy,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            min_budget: default_min_budget(),
            max_budget: default_max_budget(),
            words_per_link: default_words_per_link(),
            related_min_shared_labels: default_min_shared_labels(),
            label_weight: default_label_weight(),
            priority_bonus: default_priority_bonus(),
            sibling_top_k: default_sibling_top_k(),
            anchor_max_repeat: default_anchor_max_repeat(),
            anchor_mix: AnchorMix::default(),
            max_links_per_paragraph: default_max_links_per_paragraph(),
            min_words_between_links: default_min_words_between_links(),
            under_budget: UnderBudgetPolicy::default(),
        }
    }
}

fn default_min_budget() -> usize {
    3
}
fn default_max_budget() -> usize {
    5
}
fn default_words_per_link() -> usize {
    250
}
fn default_min_shared_labels() -> usize {
    2
}
fn default_label_weight() -> i64 {
    1
}
fn default_priority_bonus() -> i64 {
    1
}
fn default_sibling_top_k() -> usize {
    2
}
fn default_anchor_max_repeat() -> usize {
    3
}
fn default_max_links_per_paragraph() -> usize {
    2
}
fn default_min_words_between_links() -> usize {
    50
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Bounded timeout/retry policy for generation collaborator calls.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for GenerationPolicy {
    fn default() -> Self {
        Self::from(&GenerationConfig::default())
    }
}

impl From<&GenerationConfig> for GenerationPolicy {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

/// Runtime planning configuration.
#[derive(Debug, Clone)]
pub struct PlanConfig {
    pub planner: PlannerConfig,
    pub generation: GenerationPolicy,
    pub fallback_limit_per_page: usize,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PlanConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            planner: config.planner.clone(),
            generation: GenerationPolicy::from(&config.generation),
            fallback_limit_per_page: config.generation.fallback_limit_per_page,
        }
    }
}

impl PlanConfig {
    /// Reject parameter combinations the planner cannot honor.
    pub fn validate(&self) -> Result<()> {
        let p = &self.planner;
        if p.min_budget > p.max_budget {
            return Err(LinkweaveError::config(format!(
                "planner.min_budget ({}) exceeds planner.max_budget ({})",
                p.min_budget, p.max_budget
            )));
        }
        if p.words_per_link == 0 {
            return Err(LinkweaveError::config("planner.words_per_link must be > 0"));
        }
        if p.anchor_max_repeat == 0 {
            return Err(LinkweaveError::config("planner.anchor_max_repeat must be > 0"));
        }
        let mix = p.anchor_mix;
        if mix.partial + mix.exact + mix.natural != 100 {
            return Err(LinkweaveError::config(format!(
                "planner.anchor_mix must sum to 100 (got {})",
                mix.partial + mix.exact + mix.natural
            )));
        }
        if p.max_links_per_paragraph == 0 {
            return Err(LinkweaveError::config(
                "planner.max_links_per_paragraph must be > 0",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.linkweave/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| LinkweaveError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.linkweave/linkweave.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Resolve the configured database path, expanding a leading `~/`.
pub fn database_path(config: &AppConfig) -> Result<PathBuf> {
    let raw = &config.defaults.database;
    match raw.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| LinkweaveError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(raw)),
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LinkweaveError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| LinkweaveError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LinkweaveError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LinkweaveError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LinkweaveError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the OpenRouter API key from the configured env var.
pub fn resolve_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(LinkweaveError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable \
             or run with --offline."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("database"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
        assert!(toml_str.contains("anchor_max_repeat"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.planner.min_budget, 3);
        assert_eq!(parsed.planner.max_budget, 5);
        assert_eq!(parsed.planner.under_budget, UnderBudgetPolicy::Lenient);
        assert_eq!(parsed.openrouter.api_key_env, "OPENROUTER_API_KEY");
    }

    #[test]
    fn partial_planner_section_keeps_defaults() {
        let toml_str = r#"
[planner]
max_budget = 8
under_budget = "strict"

[planner.anchor_mix]
partial = 50
exact = 10
natural = 40
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.planner.max_budget, 8);
        assert_eq!(config.planner.min_budget, 3);
        assert_eq!(config.planner.under_budget, UnderBudgetPolicy::Strict);
        assert_eq!(config.planner.anchor_mix.natural, 40);
        assert_eq!(config.generation.max_attempts, 3);
    }

    #[test]
    fn plan_config_from_app_config() {
        let app = AppConfig::default();
        let plan = PlanConfig::from(&app);
        assert_eq!(plan.planner.words_per_link, 250);
        assert_eq!(plan.generation.timeout, Duration::from_secs(30));
        assert_eq!(plan.generation.max_attempts, 3);
        assert_eq!(plan.fallback_limit_per_page, 3);
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn plan_config_rejects_inverted_budget() {
        let mut plan = PlanConfig::default();
        plan.planner.min_budget = 6;
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn plan_config_rejects_bad_mix() {
        let mut plan = PlanConfig::default();
        plan.planner.anchor_mix.exact = 20;
        assert!(plan.validate().is_err());
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let generation = GenerationConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(GenerationPolicy::from(&generation).max_attempts, 1);
    }

    #[test]
    fn database_path_keeps_absolute() {
        let mut config = AppConfig::default();
        config.defaults.database = "/tmp/lw.db".into();
        assert_eq!(database_path(&config).unwrap(), PathBuf::from("/tmp/lw.db"));
    }

    #[test]
    fn api_key_resolution() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.openrouter.api_key_env = "LW_TEST_NONEXISTENT_KEY_12345".into();
        let result = resolve_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
