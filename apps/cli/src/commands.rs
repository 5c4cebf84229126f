//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use linkweave_core::{
    LinkEdit, LlmTermEnricher, OfflineGenerator, OpenRouterGenerator, PlanOutcome, PlanPhase,
    PlanRequest, PlanService, Planner, TaskResult, TextGenerator,
};
use linkweave_shared::{
    AppConfig, Edge, LinkHint, PlanConfig, PlanReport, database_path, init_config, load_config,
    load_config_from,
};
use linkweave_storage::Storage;
use serde::Serialize;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// linkweave: plan and inject internal links within content scopes.
#[derive(Parser)]
#[command(
    name = "linkweave",
    version,
    about = "Plan, inject and validate internal links across scoped page groups.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Database path (overrides `[defaults] database`).
    #[arg(long, global = true, env = "LINKWEAVE_DB")]
    pub db: Option<PathBuf>,

    /// Config file (defaults to ~/.linkweave/linkweave.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Load pages and scopes from a JSON document.
    Import {
        /// Path to `{ "pages": [...], "scopes": [...] }`.
        file: PathBuf,
    },

    /// Plan a scope and inject its links.
    Plan {
        scope: String,

        /// Replace the scope's active plan.
        #[arg(long)]
        re_plan: bool,

        /// Never call the generation backend; fallback edges stay unplaced.
        #[arg(long)]
        offline: bool,

        /// Widen anchor pools with generated term variations.
        #[arg(long, conflicts_with = "offline")]
        enrich: bool,

        /// Model override for this run.
        #[arg(long)]
        model: Option<String>,

        /// Recorded on the snapshot.
        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Compute the generation-time link hint for every mandatory edge.
    Hints { scope: String },

    /// Re-validate a scope's active plan against current bodies.
    Validate { scope: String },

    /// Inspect or edit a scope's link map.
    Links {
        #[command(subcommand)]
        action: LinksAction,
    },

    /// Anchor text helpers.
    Anchors {
        #[command(subcommand)]
        action: AnchorsAction,
    },

    /// List a scope's snapshot history.
    Snapshots { scope: String },

    /// Remove the active plan's links and empty the link map.
    Strip { scope: String },

    /// Re-activate an earlier snapshot.
    Rollback { scope: String, snapshot: String },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum LinksAction {
    /// Every edge of the current snapshot.
    Map { scope: String },
    /// Outbound edges of one page.
    Show { scope: String, page: String },
    /// Link the first occurrence of ANCHOR in PAGE to TARGET.
    Add {
        scope: String,
        page: String,
        target: String,
        anchor: String,
    },
    /// Remove PAGE's edge to TARGET.
    Remove {
        scope: String,
        page: String,
        target: String,
    },
    /// Change the visible text of PAGE's link to TARGET.
    Edit {
        scope: String,
        page: String,
        target: String,
        anchor: String,
    },
}

#[derive(Subcommand)]
pub(crate) enum AnchorsAction {
    /// Ranked anchor candidates toward a page.
    Suggest {
        target: String,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "linkweave=info",
        1 => "linkweave=debug",
        _ => "linkweave=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Resolved global options shared by every command.
struct Context {
    config: AppConfig,
    db: PathBuf,
    json: bool,
}

impl Context {
    fn load(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => load_config_from(path)?,
            None => load_config()?,
        };
        let db = match &cli.db {
            Some(path) => path.clone(),
            None => database_path(&config)?,
        };
        Ok(Self {
            config,
            db,
            json: cli.json,
        })
    }

    async fn storage(&self) -> Result<Storage> {
        Storage::open(&self.db)
            .await
            .wrap_err_with(|| format!("opening database {}", self.db.display()))
    }

    /// Read-only handle when the database already exists.
    async fn reader(&self) -> Result<Storage> {
        if self.db.exists() {
            Ok(Storage::open_readonly(&self.db).await?)
        } else {
            self.storage().await
        }
    }

    fn plan_config(&self) -> Result<PlanConfig> {
        let config = PlanConfig::from(&self.config);
        config.validate()?;
        Ok(config)
    }

    /// Print `value` as JSON, or run `text` for human output.
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T)) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            text(value);
        }
        Ok(())
    }
}

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(cli.config.as_deref()),
        };
    }

    let ctx = Context::load(&cli)?;
    match cli.command {
        Command::Import { file } => cmd_import(&ctx, &file).await,
        Command::Plan {
            scope,
            re_plan,
            offline,
            enrich,
            model,
            actor,
        } => {
            let request = PlanRequest::new(scope).re_plan(re_plan).actor(actor);
            cmd_plan(&ctx, request, offline, enrich, model.as_deref()).await
        }
        Command::Hints { scope } => cmd_hints(&ctx, &scope).await,
        Command::Validate { scope } => cmd_validate(&ctx, &scope).await,
        Command::Links { action } => cmd_links(&ctx, action).await,
        Command::Anchors {
            action: AnchorsAction::Suggest { target, limit },
        } => cmd_anchors_suggest(&ctx, &target, limit).await,
        Command::Snapshots { scope } => cmd_snapshots(&ctx, &scope).await,
        Command::Strip { scope } => cmd_strip(&ctx, &scope).await,
        Command::Rollback { scope, snapshot } => cmd_rollback(&ctx, &scope, &snapshot).await,
        Command::Config { .. } => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_import(ctx: &Context, file: &Path) -> Result<()> {
    let storage = ctx.storage().await?;
    let summary = linkweave_core::import_file(&storage, file).await?;
    ctx.emit(&summary, |s| {
        println!("Imported {} pages and {} scopes.", s.pages, s.scopes);
    })
}

fn generator(
    ctx: &Context,
    offline: bool,
    model: Option<&str>,
) -> Result<Arc<dyn TextGenerator>> {
    if offline {
        return Ok(Arc::new(OfflineGenerator));
    }
    let generator = OpenRouterGenerator::from_config(&ctx.config, model)
        .wrap_err("generation backend unavailable (use --offline to plan without it)")?;
    Ok(Arc::new(generator))
}

async fn cmd_plan(
    ctx: &Context,
    request: PlanRequest,
    offline: bool,
    enrich: bool,
    model: Option<&str>,
) -> Result<()> {
    let config = ctx.plan_config()?;
    let generator = generator(ctx, offline, model)?;
    let mut planner = Planner::new(config.clone(), Arc::clone(&generator))?;
    if enrich {
        planner = planner.with_enricher(Arc::new(LlmTermEnricher::new(
            generator,
            config.generation.clone(),
        )));
    }

    info!(scope = %request.scope_id, re_plan = request.re_plan, offline, "planning scope");
    let service = PlanService::new(planner, ctx.storage().await?);
    let task = service.trigger(request).await?;

    let spinner = (!ctx.json).then(spinner);
    let result = loop {
        let status = service.status(task)?;
        if let Some(spinner) = &spinner {
            let message = match (&status.current_page, status.phase) {
                (Some(page), PlanPhase::Injecting) => format!(
                    "injecting [{}/{}] {page}",
                    status.pages_done, status.pages_total
                ),
                _ => status.phase.to_string(),
            };
            spinner.set_message(message);
        }
        match service.result(task)? {
            TaskResult::Pending => tokio::time::sleep(Duration::from_millis(100)).await,
            _ => break service.forget(task)?,
        }
    };
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }

    match result {
        TaskResult::Done(outcome) => ctx.emit(&outcome, print_outcome),
        TaskResult::Failed { error } => Err(eyre!("planning failed: {error}")),
        TaskResult::Pending => Err(eyre!("planning task {task} did not finish")),
    }
}

fn spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

fn print_outcome(outcome: &PlanOutcome) {
    println!();
    println!("  Plan committed.");
    println!("  Snapshot:   {}", outcome.snapshot.id);
    println!("  Placed:     {}", outcome.placed);
    println!("  Unplaced:   {}", outcome.unplaced);
    println!("  Fallbacks:  {}", outcome.fallback_calls);
    println!("  Violations: {}", outcome.report.violation_count());
    println!("  Time:       {:.1}s", outcome.elapsed_ms as f64 / 1000.0);
    println!();
    print_report(&outcome.report);
}

fn print_report(report: &PlanReport) {
    for page in &report.pages {
        let mark = if page.valid { "ok " } else { "ERR" };
        println!("  [{mark}] {}", page.page_id);
        for v in &page.violations {
            println!("        {}: {}", v.rule, v.message);
        }
        if let Some(under) = &page.under_budget {
            println!(
                "        under budget: {} placed of {} (unplaced {}, missing candidates {})",
                under.placed, under.min_budget, under.unplaced, under.candidate_shortfall
            );
        }
    }
}

fn print_edges(edges: &[Edge]) {
    for e in edges {
        let anchor = e.anchor_text.as_deref().unwrap_or("-");
        let detail = match (e.method, e.reason) {
            (Some(method), _) => method.to_string(),
            (None, Some(reason)) => reason.to_string(),
            (None, None) => String::new(),
        };
        let position = e.position.map_or_else(|| "-".to_string(), |p| p.to_string());
        println!(
            "  {:<28} {:<8} {:>6}  {:<20} \"{anchor}\"{}",
            e.id,
            e.status.as_str(),
            position,
            detail,
            if e.mandatory { " (mandatory)" } else { "" }
        );
    }
}

#[derive(Serialize)]
struct HintLine<'a> {
    #[serde(flatten)]
    hint: &'a LinkHint,
    instruction: String,
}

async fn cmd_hints(ctx: &Context, scope: &str) -> Result<()> {
    let storage = ctx.storage().await?;
    let planner = Planner::new(ctx.plan_config()?, Arc::new(OfflineGenerator))?;
    let hints = planner.mandatory_hints(&storage, scope).await?;
    let lines: Vec<HintLine<'_>> = hints
        .iter()
        .map(|hint| HintLine {
            hint,
            instruction: linkweave_core::hint_instruction(hint),
        })
        .collect();
    ctx.emit(&lines, |lines| {
        for line in lines {
            println!("{}: {}", line.hint.page_id, line.instruction);
        }
    })
}

async fn cmd_validate(ctx: &Context, scope: &str) -> Result<()> {
    let storage = ctx.storage().await?;
    let config = ctx.plan_config()?;
    let report = linkweave_core::validate_scope(&storage, scope, &config.planner).await?;
    ctx.emit(&report, print_report)?;
    if report.has_violations() {
        return Err(eyre!(
            "{} violation(s) in scope {scope}",
            report.violation_count()
        ));
    }
    Ok(())
}

async fn cmd_links(ctx: &Context, action: LinksAction) -> Result<()> {
    let (scope, page, edit) = match action {
        LinksAction::Map { scope } => {
            let snapshot = linkweave_core::link_map(&ctx.reader().await?, &scope).await?;
            return ctx.emit(&snapshot, |s| {
                println!("Snapshot {} ({}, {} edges)", s.id, s.actor, s.edge_count);
                print_edges(&s.edges);
            });
        }
        LinksAction::Show { scope, page } => {
            let edges = linkweave_core::page_links(&ctx.reader().await?, &scope, &page).await?;
            return ctx.emit(&edges, |edges| print_edges(edges));
        }
        LinksAction::Add {
            scope,
            page,
            target,
            anchor,
        } => (scope, page, LinkEdit::Add { target, anchor }),
        LinksAction::Remove {
            scope,
            page,
            target,
        } => (scope, page, LinkEdit::Remove { target }),
        LinksAction::Edit {
            scope,
            page,
            target,
            anchor,
        } => (scope, page, LinkEdit::Retext { target, anchor }),
    };

    let storage = ctx.storage().await?;
    let config = ctx.plan_config()?;
    let change =
        linkweave_core::edit_page_links(&storage, &scope, &page, &edit, &config.planner).await?;
    ctx.emit(&change, |c| {
        println!("Snapshot {} committed.", c.snapshot.id);
        print_report(&PlanReport {
            pages: vec![c.page.clone()],
        });
    })
}

async fn cmd_anchors_suggest(ctx: &Context, target: &str, limit: usize) -> Result<()> {
    let storage = ctx.reader().await?;
    let config = ctx.plan_config()?;
    let mut suggestions =
        linkweave_core::anchor_suggestions(&storage, target, &config.planner).await?;
    suggestions.truncate(limit);
    ctx.emit(&suggestions, |suggestions| {
        for s in suggestions {
            println!(
                "  {:<40} {:<8} used {} / {} left",
                s.text,
                s.kind.as_str(),
                s.uses,
                s.remaining
            );
        }
    })
}

async fn cmd_snapshots(ctx: &Context, scope: &str) -> Result<()> {
    let storage = ctx.reader().await?;
    let snapshots = storage.list_snapshots(scope).await?;
    ctx.emit(&snapshots, |snapshots| {
        for s in snapshots {
            println!(
                "  {} {} {}  {:<16} {:>4} edges{}",
                if s.active { "*" } else { " " },
                s.id,
                s.created_at.format("%Y-%m-%d %H:%M:%S"),
                s.actor,
                s.edge_count,
                if s.has_violations { "  violations" } else { "" },
            );
        }
    })
}

async fn cmd_strip(ctx: &Context, scope: &str) -> Result<()> {
    let storage = ctx.storage().await?;
    let snapshot = linkweave_core::strip_scope(&storage, scope).await?;
    ctx.emit(&snapshot, |s| {
        println!("Stripped scope {scope}; empty snapshot {} is active.", s.id);
    })
}

async fn cmd_rollback(ctx: &Context, scope: &str, snapshot_id: &str) -> Result<()> {
    let storage = ctx.storage().await?;
    let config = ctx.plan_config()?;
    let (snapshot, report) =
        linkweave_core::rollback_scope(&storage, scope, snapshot_id, &config.planner).await?;
    ctx.emit(&(snapshot, report), |(s, report)| {
        println!("Rolled back to {snapshot_id}; snapshot {} is active.", s.id);
        print_report(report);
    })
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config: AppConfig = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
