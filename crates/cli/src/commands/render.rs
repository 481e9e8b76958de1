//! `tokenloom render` — Render a declared tree against a budget.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokenloom_config::AppConfig;
use tokenloom_engine::{
    CancellationToken, CharHeuristicMeasurer, Node, NodeDecl, RenderResult, Renderer, Tree,
};

pub struct RenderArgs {
    pub tree: PathBuf,
    pub budget: Option<u64>,
    pub json: bool,
    pub config: Option<PathBuf>,
}

pub async fn run(args: RenderArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?,
    };
    let budget = args.budget.unwrap_or(config.default_budget);

    let tree = Tree::new(load_tree(&args.tree)?)?;
    let measurer = Arc::new(CharHeuristicMeasurer::from_config(&config.measurer));
    let renderer = Renderer::with_measurer(measurer, config.engine.clone());

    // Ctrl-C cancels the in-flight render.
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling render");
            on_interrupt.cancel();
        }
    });

    let result = renderer.render(tree, budget, &cancel).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(())
}

/// Read a tree declaration; `.toml` files are parsed as TOML, anything else as JSON.
pub fn load_tree(path: &Path) -> Result<Node, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read tree file {}: {e}", path.display()))?;
    parse_tree(&content, path.extension().and_then(|e| e.to_str()))
}

fn parse_tree(content: &str, extension: Option<&str>) -> Result<Node, Box<dyn std::error::Error>> {
    let decl: NodeDecl = match extension {
        Some("toml") => toml::from_str(content)?,
        _ => serde_json::from_str(content)?,
    };
    Ok(decl.into())
}

fn print_result(result: &RenderResult) {
    for message in &result.messages {
        println!("[{}]", message.role);
        println!("{}", message.content);
        println!();
    }

    println!("──────────────────────────────");
    println!(
        "Total:      {} / {} ({:.1}%)",
        result.total_size, result.budget, result.utilization_pct
    );
    println!("Messages:   {}", result.messages.len());
    println!(
        "Cache:      {} hits, {} misses",
        result.cache_stats.hits, result.cache_stats.misses
    );

    if !result.evicted.is_empty() {
        println!("Evicted:    {}", result.evicted.len());
        for unit in &result.evicted {
            println!(
                "  - {} (priority {}, order {}, size {})",
                unit.node, unit.priority, unit.order, unit.size
            );
        }
    }

    for subtree in &result.degraded {
        println!(
            "Degraded:   {} ({} failed during {}: {})",
            subtree.node, subtree.component, subtree.phase, subtree.reason
        );
    }

    if result.budget_unsatisfiable {
        println!("Warning:    mandatory content exceeds the budget");
    }
}
