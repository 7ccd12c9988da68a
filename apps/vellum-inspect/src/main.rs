//! # Vellum Inspect
//!
//! A standalone CLI that drives a Vellum workspace and shows what the
//! operation lock and the marker delta log do.
//!
//! ## Notification windows
//!
//! ```text
//! top-level op 1  ──▶ generation G0 (sealed at end)
//! top-level op 2  ──▶ generation G1 (sealed at end)
//! listener        ──▶ marker_deltas_since(G0) = merge(G0, G1)
//! ```

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use colored::*;
use tracing_subscriber::EnvFilter;
use vellum_core::marker::{attributes, types};
use vellum_core::{AttributeValue, DeltaKind, DeltaMap, MarkerRecord, ResourcePath};
use vellum_markers::{MarkerFilter, MemoryResourceTree};
use vellum_workspace::{OperationContext, Workspace, WorkspaceConfig};

// ─── CLI ───────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "vellum-inspect")]
#[command(about = "Replay marker delta scenarios against a Vellum workspace")]
#[command(version)]
struct Cli {
    /// Log lock and generation activity to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Workspace configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add, change and remove markers across notification windows
    Scenarios,
    /// Nested operations on one context: depths, lock owner, outcome
    Nesting {
        #[arg(short, long, default_value_t = 3)]
        depth: usize,
    },
    /// Several workers queue for the lock; show the order they are granted
    Contention {
        #[arg(short, long, default_value_t = 4)]
        workers: usize,
    },
    /// Print the effective configuration
    Config,
}

// ─── Output helpers ────────────────────────────────────────────────────────

fn header(text: &str) {
    let bar = "═".repeat(60);
    println!("\n{}", bar.bright_cyan());
    println!("  {}", text.bold().bright_white());
    println!("{}", bar.bright_cyan());
}

fn section(text: &str) {
    println!("\n{} {}", "▸".bright_yellow(), text.bold());
}

fn step(text: &str) {
    println!("  {} {}", "•".bright_green(), text);
}

fn check(ok: bool, text: &str) -> bool {
    if ok {
        println!("  {} {}", "✓".bright_green().bold(), text.bright_green());
    } else {
        println!("  {} {}", "✗".bright_red().bold(), text.bright_red());
    }
    ok
}

fn kind_label(kind: DeltaKind) -> ColoredString {
    match kind {
        DeltaKind::Added => "ADDED".bright_green(),
        DeltaKind::Removed => "REMOVED".bright_red(),
        DeltaKind::Changed => "CHANGED".bright_yellow(),
    }
}

fn show_deltas(title: &str, deltas: &DeltaMap) {
    let border = "─".repeat(44);
    println!("  ┌{}┐", border);
    println!("  │ {:^42} │", title.bright_yellow().to_string());
    println!("  ├{}┤", border);
    if deltas.is_empty() {
        println!("  │ {:^42} │", "(no deltas)".dimmed().to_string());
    }
    for (path, set) in deltas {
        let mut entries: Vec<_> = set.iter().collect();
        entries.sort_by_key(|delta| delta.marker_id());
        for delta in entries {
            let severity = delta
                .snapshot
                .severity()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".into());
            let line = format!(
                "{:<18} #{:<4} {:<8} sev={}",
                path.as_str(),
                delta.marker_id(),
                kind_label(delta.kind),
                severity
            );
            println!("  │ {:<42} │", line);
        }
    }
    println!("  └{}┘", border);
}

fn open_workspace(config: WorkspaceConfig, paths: &[&str]) -> Arc<Workspace> {
    let tree = MemoryResourceTree::with_paths(paths.iter().copied());
    Arc::new(Workspace::open(config, Arc::new(tree)))
}

fn problem(severity: i64) -> MarkerRecord {
    MarkerRecord::new(types::PROBLEM).with_attribute(attributes::SEVERITY, severity)
}

// ─── Scenarios ─────────────────────────────────────────────────────────────

fn run_scenarios(config: WorkspaceConfig) -> Result<bool, Box<dyn std::error::Error>> {
    header("SCENARIOS - Delta merging across notification windows");
    let mut all_ok = true;

    section("Scenario 1: add, change, remove inside one operation");
    let ws = open_workspace(config.clone(), &["/proj/main.rs"]);
    let path = ResourcePath::new("/proj/main.rs");
    let g0 = ws.next_generation();
    let mut ctx = ws.new_context();

    ws.run(&mut ctx, |ctx| {
        let ids = ws.create_markers(ctx, &path, vec![problem(2)])?;
        step(&format!("added problem #{} with severity 2", ids[0]));
        show_deltas("after add", &ws.marker_deltas_since(g0));

        ws.set_marker_attributes(ctx, &path, ids[0], [(attributes::SEVERITY, AttributeValue::Integer(1))])?;
        step("changed severity to 1");
        let deltas = ws.marker_deltas_since(g0);
        show_deltas("after change", &deltas);
        let merged = deltas.get(&path).and_then(|set| set.get(ids[0]));
        all_ok &= check(
            merged.is_some_and(|d| d.kind == DeltaKind::Added && d.snapshot.severity() == Some(1)),
            "add + change = add carrying the new content",
        );

        let removed = ws.delete_markers(ctx, &path, &MarkerFilter::of_type(types::PROBLEM))?;
        step(&format!("removed {} problem marker(s)", removed.len()));
        Ok(())
    })?;
    let deltas = ws.marker_deltas_since(g0);
    show_deltas("after remove", &deltas);
    all_ok &= check(deltas.is_empty(), "add + remove cancels out");

    section("Scenario 2: add in G0, change in G1");
    let ws = open_workspace(config, &["/proj/lib.rs"]);
    let path = ResourcePath::new("/proj/lib.rs");
    let mut ctx = ws.new_context();

    let g0 = ws.next_generation();
    let id = ws.create_markers(&mut ctx, &path, vec![problem(2)])?[0];
    step(&format!("G{}: added problem #{}", g0, id));
    let g1 = ws.next_generation();
    ws.set_marker_attributes(&mut ctx, &path, id, [(attributes::SEVERITY, AttributeValue::Integer(0))])?;
    step(&format!("G{}: changed severity to 0", g1));

    let from_g0 = ws.marker_deltas_since(g0);
    let from_g1 = ws.marker_deltas_since(g1);
    show_deltas(&format!("since G{}", g0), &from_g0);
    show_deltas(&format!("since G{}", g1), &from_g1);
    all_ok &= check(
        from_g0.get(&path).and_then(|s| s.get(id)).map(|d| d.kind) == Some(DeltaKind::Added),
        "a window starting at G0 sees the marker as added",
    );
    all_ok &= check(
        from_g1
            .get(&path)
            .and_then(|s| s.get(id))
            .is_some_and(|d| d.kind == DeltaKind::Changed && d.snapshot.severity() == Some(2)),
        "a window starting at G1 sees only the change, with the prior state",
    );

    section("Compaction");
    let dropped = ws.compact_deltas(g1);
    step(&format!("dropped {} batch(es) older than G{}", dropped, g1));
    all_ok &= check(ws.marker_deltas_since(g0) == from_g1, "older windows now start at G1");

    let severity = ws
        .markers()
        .find_max_problem_severity(&ResourcePath::new("/proj"), &MarkerFilter::of_type(types::PROBLEM).depth(vellum_core::Depth::Infinite))?;
    step(&format!("highest problem severity under /proj: {}", severity));

    Ok(all_ok)
}

// ─── Nesting ───────────────────────────────────────────────────────────────

fn nest(ws: &Workspace, ctx: &mut OperationContext, level: usize, depth: usize) -> vellum_workspace::Result<()> {
    ws.run(ctx, |ctx| {
        println!(
            "  {}{} level {}  prepared={} nested={} owner={:?}",
            "  ".repeat(level),
            "↳".bright_magenta(),
            level,
            ctx.prepared_depth(),
            ctx.nested_depth(),
            ws.lock().owner()
        );
        if level + 1 < depth {
            nest(ws, ctx, level + 1, depth)
        } else {
            ctx.request_build();
            Ok(())
        }
    })
}

fn run_nesting(config: WorkspaceConfig, depth: usize) -> Result<bool, Box<dyn std::error::Error>> {
    header("NESTING - Reentrant operations on one context");
    let ws = open_workspace(config, &[]);
    let mut ctx = ws.new_context();
    step(&format!("context operation id {}", ctx.operation_id()));

    section(&format!("Entering {} nested operation(s)", depth.max(1)));
    nest(&ws, &mut ctx, 0, depth.max(1))?;

    section("After the outermost end");
    let stats = ws.stats();
    step(&format!("top-level operations: {}", stats.operations));
    step(&format!("builds requested: {}", stats.builds_requested));
    let mut ok = check(!ws.lock().is_held(), "lock released once");
    ok &= check(!ctx.is_active(), "context reset");
    Ok(ok)
}

// ─── Contention ────────────────────────────────────────────────────────────

fn run_contention(config: WorkspaceConfig, workers: usize) -> Result<bool, Box<dyn std::error::Error>> {
    header("CONTENTION - FIFO hand-off of the workspace lock");
    let ws = open_workspace(config, &["/proj/shared.rs"]);
    let order = Arc::new(Mutex::new(Vec::new()));

    section("Holder takes the lock");
    let mut holder = ws.new_context();
    let scope = ws.scope(&mut holder)?;
    step(&format!("owner = {:?}", ws.lock().owner()));

    section("Workers queue up");
    let mut handles = Vec::new();
    let mut expected = Vec::new();
    for worker in 0..workers {
        let ws_clone = Arc::clone(&ws);
        let order = Arc::clone(&order);
        let mut ctx = ws.new_context();
        expected.push(ctx.operation_id());
        handles.push(thread::spawn(move || {
            let path = ResourcePath::new("/proj/shared.rs");
            ws_clone.run(&mut ctx, |ctx| {
                if let Ok(mut order) = order.lock() {
                    order.push(ctx.operation_id());
                }
                ws_clone.create_markers(ctx, &path, vec![MarkerRecord::new(types::TASK)])?;
                Ok(())
            })
        }));

        let deadline = Instant::now() + Duration::from_secs(5);
        while ws.lock().queue_len() <= worker && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        step(&format!("worker {} queued (queue length {})", worker, ws.lock().queue_len()));
    }

    section("Holder releases");
    let outcome = scope.end();
    step(&format!("top-level end: {}", serde_json::to_string(&outcome)?));
    for handle in handles {
        if let Ok(Err(err)) = handle.join() {
            step(&format!("worker failed: {}", err));
        }
    }

    let granted = order.lock().map(|o| o.clone()).unwrap_or_default();
    step(&format!("grant order: {:?}", granted));
    let mut ok = check(granted == expected, "workers granted in arrival order");
    ok &= check(ws.markers().marker_count() == workers, "every worker added its marker");
    Ok(ok)
}

// ─── Config ────────────────────────────────────────────────────────────────

fn run_config(config: WorkspaceConfig) -> Result<bool, Box<dyn std::error::Error>> {
    header("CONFIG - Effective workspace configuration");
    println!("{}", config.to_json()?);
    Ok(true)
}

fn load_config(path: Option<&PathBuf>) -> Result<WorkspaceConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(WorkspaceConfig::from_json(&fs::read_to_string(path)?)?),
        None => Ok(WorkspaceConfig::default()),
    }
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "info,vellum=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_writer(std::io::stderr)
        .init();

    let result = load_config(cli.config.as_ref()).and_then(|config| match cli.command {
        Commands::Scenarios => run_scenarios(config),
        Commands::Nesting { depth } => run_nesting(config, depth),
        Commands::Contention { workers } => run_contention(config, workers),
        Commands::Config => run_config(config),
    });

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("{} {}", "error:".bright_red().bold(), err);
            std::process::exit(2);
        }
    }
}
