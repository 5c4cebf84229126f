//! Core domain types for linkweave link plans.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LinkweaveError, Result};

// ---------------------------------------------------------------------------
// TaskId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for planning task handles (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a new time-sortable task identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// String-backed enums
// ---------------------------------------------------------------------------

/// Implements `as_str` / `FromStr` for a snake_case enum stored as TEXT.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Storage / display representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = LinkweaveError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(LinkweaveError::validation(format!(
                        concat!("unknown ", stringify!($name), " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

/// Role a page plays in its content group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageRole {
    Standalone,
    Hub,
    Dependent,
    Satellite,
}

text_enum!(PageRole {
    Standalone => "standalone",
    Hub => "hub",
    Dependent => "dependent",
    Satellite => "satellite",
});

/// Editorial status of a page body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Draft,
    Approved,
    Published,
}

text_enum!(PageStatus {
    Draft => "draft",
    Approved => "approved",
    Published => "published",
});

/// How a scope permits pages to link to one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    /// Label-overlap based relatedness, no hub.
    Flat,
    /// One hub, every other member a dependent.
    Hierarchical,
    /// Hub plus anchor pages with satellites that only link up and sideways.
    Siloed,
}

text_enum!(ScopeKind {
    Flat => "flat",
    Hierarchical => "hierarchical",
    Siloed => "siloed",
});

impl ScopeKind {
    /// Whether dependents/satellites owe a mandatory first link to the hub.
    pub fn requires_hub(&self) -> bool {
        !matches!(self, Self::Flat)
    }
}

/// Literal relationship between an anchor and its target's primary term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorKind {
    Exact,
    Partial,
    Natural,
}

text_enum!(AnchorKind {
    Exact => "exact",
    Partial => "partial",
    Natural => "natural",
});

/// Channel through which a link was realized in the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementMethod {
    GenerationHint,
    RuleScan,
    GenerativeFallback,
    Manual,
}

text_enum!(PlacementMethod {
    GenerationHint => "generation_hint",
    RuleScan => "rule_scan",
    GenerativeFallback => "generative_fallback",
    Manual => "manual",
});

/// Whether an edge made it into the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeStatus {
    Placed,
    Unplaced,
}

text_enum!(EdgeStatus {
    Placed => "placed",
    Unplaced => "unplaced",
});

/// Why a selected edge could not be realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnplacedReason {
    /// Every anchor candidate for the target hit the repeat cap.
    AnchorExhausted,
    /// No lexical match and no qualifying sentence for a rewrite.
    NoEligibleLocation,
    /// The generative fallback failed, timed out, or returned unusable text.
    FallbackFailed,
    /// The page already used its generative-fallback allowance.
    FallbackLimit,
    /// The page's mandatory hub edge could not be placed.
    MandatoryUnplaced,
}

text_enum!(UnplacedReason {
    AnchorExhausted => "anchor_exhausted",
    NoEligibleLocation => "no_eligible_location",
    FallbackFailed => "fallback_failed",
    FallbackLimit => "fallback_limit",
    MandatoryUnplaced => "mandatory_unplaced",
});

/// Where a page sits inside one scope; drives the allowed-direction matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopePosition {
    Hub,
    Anchor,
    Dependent,
    Satellite,
    Peer,
}

impl ScopePosition {
    /// Position of a page in a scope of `kind`.
    pub fn of(kind: ScopeKind, role: PageRole, is_designated_hub: bool) -> Self {
        match kind {
            ScopeKind::Flat => Self::Peer,
            ScopeKind::Hierarchical if is_designated_hub => Self::Hub,
            ScopeKind::Hierarchical => Self::Dependent,
            ScopeKind::Siloed if is_designated_hub => Self::Hub,
            ScopeKind::Siloed if role == PageRole::Hub => Self::Anchor,
            ScopeKind::Siloed => Self::Satellite,
        }
    }

    /// The allowed-direction matrix: may a page at `self` link to one at `to`?
    pub fn may_link(self, to: ScopePosition) -> bool {
        use ScopePosition::*;
        matches!(
            (self, to),
            (Hub, Anchor | Dependent | Satellite)
                | (Anchor, Hub | Anchor | Satellite)
                | (Dependent, Hub | Dependent)
                | (Satellite, Hub | Anchor | Satellite)
                | (Peer, Peer)
        )
    }
}

// ---------------------------------------------------------------------------
// Page
// ---------------------------------------------------------------------------

/// A content page as read from the page directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// Stable page identifier.
    pub id: String,
    /// Absolute URL or site-relative path used as the link href.
    pub url: String,
    /// Display title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub role: PageRole,
    /// Topical labels; flat scopes relate pages by label overlap.
    #[serde(default)]
    pub labels: BTreeSet<String>,
    /// Primary search term the page targets.
    pub primary_term: String,
    /// Externally supplied variations of the primary term.
    #[serde(default)]
    pub term_variants: Vec<String>,
    /// Priority pages attract links more aggressively.
    #[serde(default)]
    pub priority: bool,
    /// Markdown body text.
    pub body: String,
    /// Word count of the body (derived on import).
    #[serde(default)]
    pub word_count: usize,
    pub status: PageStatus,
}

impl Page {
    /// Check field-level invariants before the page enters the directory.
    pub fn check(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(LinkweaveError::validation("page id must not be empty"));
        }
        if self.primary_term.trim().is_empty() {
            return Err(LinkweaveError::validation(format!(
                "page {} has an empty primary term",
                self.id
            )));
        }
        validate_page_url(&self.url)
            .map_err(|e| LinkweaveError::validation(format!("page {}: {e}", self.id)))
    }

    /// Whether the body is final enough to be planned against.
    pub fn is_finalized(&self) -> bool {
        self.status != PageStatus::Draft
    }
}

/// Accept absolute URLs or site-relative paths (`/blog/post`).
fn validate_page_url(raw: &str) -> std::result::Result<(), String> {
    if raw.starts_with('/') && !raw.starts_with("//") {
        return Ok(());
    }
    url::Url::parse(raw)
        .map(|_| ())
        .map_err(|e| format!("invalid url '{raw}': {e}"))
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// A bounded page group within which linking is permitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: ScopeKind,
    /// Member page ids, in insertion order (used as the final tie-break).
    pub members: Vec<String>,
    /// Designated hub page (hierarchical/siloed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_id: Option<String>,
}

impl Scope {
    pub fn contains(&self, page_id: &str) -> bool {
        self.members.iter().any(|m| m == page_id)
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// One directed internal link, from selection through realization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub scope_id: String,
    pub source_id: String,
    pub target_id: String,
    /// Literal visible text of the link (as it appears in the body once placed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_kind: Option<AnchorKind>,
    /// Byte offset of the link markup in the source body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    pub mandatory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<PlacementMethod>,
    pub status: EdgeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<UnplacedReason>,
    /// Order of the edge within its source page's plan (mandatory first).
    pub ordinal: usize,
}

impl Edge {
    pub fn is_placed(&self) -> bool {
        self.status == EdgeStatus::Placed
    }

    /// Normalized anchor key used for diversity counting.
    pub fn anchor_key(&self) -> Option<String> {
        self.anchor_text.as_deref().map(anchor_key)
    }
}

/// Normalize an anchor literal for usage counting: lowercase, single spaces.
pub fn anchor_key(anchor: &str) -> String {
    anchor
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ---------------------------------------------------------------------------
// Generation-time hints
// ---------------------------------------------------------------------------

/// The mandatory link a page's writer is asked to author natively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkHint {
    pub scope_id: String,
    pub page_id: String,
    pub target_id: String,
    pub target_url: String,
    pub anchor_text: String,
    pub anchor_kind: AnchorKind,
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// The durable record of one planning run for a scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub id: String,
    pub scope_id: String,
    pub created_at: DateTime<Utc>,
    pub edges: Vec<Edge>,
    pub edge_count: usize,
    /// Who or what triggered the run (`cli`, `manual:<page>`, `rollback:<id>`, ...).
    pub actor: String,
    pub has_violations: bool,
    /// Whether this snapshot is the scope's current link map.
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_at: Option<DateTime<Utc>>,
}

/// Snapshot listing row (without edges).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub id: String,
    pub scope_id: String,
    pub created_at: DateTime<Utc>,
    pub edge_count: usize,
    pub actor: String,
    pub has_violations: bool,
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Validation report
// ---------------------------------------------------------------------------

/// The fixed rule set a realized plan is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    MandatoryFirst,
    CrossScope,
    SelfEdge,
    DuplicateTarget,
    Density,
    AnchorDiversity,
    EdgeCount,
    Direction,
}

text_enum!(Rule {
    MandatoryFirst => "mandatory_first",
    CrossScope => "cross_scope",
    SelfEdge => "self_edge",
    DuplicateTarget => "duplicate_target",
    Density => "density",
    AnchorDiversity => "anchor_diversity",
    EdgeCount => "edge_count",
    Direction => "direction",
});

/// A single rule failure, attributed to scope, page and (where applicable) edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: Rule,
    pub scope_id: String,
    pub page_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    pub message: String,
}

/// Documentation of a page that realized fewer links than its minimum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnderBudget {
    pub min_budget: usize,
    pub placed: usize,
    /// Selected edges that could not be realized.
    pub unplaced: usize,
    /// Missing candidates: the graph offered fewer targets than the minimum.
    pub candidate_shortfall: usize,
}

/// Validation outcome for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageReport {
    pub page_id: String,
    pub valid: bool,
    pub violations: Vec<Violation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub under_budget: Option<UnderBudget>,
}

/// Validation outcome for a whole scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanReport {
    pub pages: Vec<PageReport>,
}

impl PlanReport {
    pub fn has_violations(&self) -> bool {
        self.pages.iter().any(|p| !p.valid)
    }

    pub fn violation_count(&self) -> usize {
        self.pages.iter().map(|p| p.violations.len()).sum()
    }

    pub fn page(&self, page_id: &str) -> Option<&PageReport> {
        self.pages.iter().find(|p| p.page_id == page_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(id: &str, url: &str) -> Page {
        Page {
            id: id.into(),
            url: url.into(),
            title: None,
            role: PageRole::Standalone,
            labels: BTreeSet::new(),
            primary_term: "trail running".into(),
            term_variants: vec![],
            priority: false,
            body: String::new(),
            word_count: 0,
            status: PageStatus::Approved,
        }
    }

    #[test]
    fn task_id_roundtrip() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().expect("parse TaskId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn enums_roundtrip_through_text() {
        for kind in [ScopeKind::Flat, ScopeKind::Hierarchical, ScopeKind::Siloed] {
            assert_eq!(kind.as_str().parse::<ScopeKind>().unwrap(), kind);
        }
        assert_eq!(
            "generative_fallback".parse::<PlacementMethod>().unwrap(),
            PlacementMethod::GenerativeFallback
        );
        assert!("sideways".parse::<PageRole>().is_err());
    }

    #[test]
    fn enums_serialize_snake_case() {
        let json = serde_json::to_string(&UnplacedReason::AnchorExhausted).unwrap();
        assert_eq!(json, r#""anchor_exhausted""#);
        let kind: AnchorKind = serde_json::from_str(r#""natural""#).unwrap();
        assert_eq!(kind, AnchorKind::Natural);
    }

    #[test]
    fn page_check_accepts_relative_and_absolute_urls() {
        assert!(page("a", "/guides/trail-running").check().is_ok());
        assert!(page("a", "https://example.com/guides").check().is_ok());
        assert!(page("a", "not a url").check().is_err());
        assert!(page("", "/x").check().is_err());
    }

    #[test]
    fn positions_follow_scope_kind() {
        assert_eq!(
            ScopePosition::of(ScopeKind::Flat, PageRole::Hub, true),
            ScopePosition::Peer
        );
        assert_eq!(
            ScopePosition::of(ScopeKind::Hierarchical, PageRole::Satellite, false),
            ScopePosition::Dependent
        );
        assert_eq!(
            ScopePosition::of(ScopeKind::Siloed, PageRole::Hub, false),
            ScopePosition::Anchor
        );
        assert_eq!(
            ScopePosition::of(ScopeKind::Siloed, PageRole::Dependent, false),
            ScopePosition::Satellite
        );
    }

    #[test]
    fn direction_matrix() {
        use ScopePosition::*;
        assert!(Dependent.may_link(Hub));
        assert!(Hub.may_link(Dependent));
        assert!(Satellite.may_link(Satellite));
        assert!(Satellite.may_link(Anchor));
        assert!(!Hub.may_link(Hub));
        assert!(!Anchor.may_link(Dependent));
        assert!(!Peer.may_link(Hub));
    }

    #[test]
    fn anchor_key_normalizes() {
        assert_eq!(anchor_key("  Trail   Running Shoes "), "trail running shoes");
    }

    #[test]
    fn report_flags_violations() {
        let mut report = PlanReport::default();
        assert!(!report.has_violations());
        report.pages.push(PageReport {
            page_id: "a".into(),
            valid: false,
            violations: vec![Violation {
                rule: Rule::SelfEdge,
                scope_id: "s".into(),
                page_id: "a".into(),
                edge_id: None,
                message: "links to itself".into(),
            }],
            under_budget: None,
        });
        assert!(report.has_violations());
        assert_eq!(report.violation_count(), 1);
    }
}
