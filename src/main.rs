//! matacc CLI - statement hierarchies, position identifiers and duplicate facts

use anyhow::{Context, Result};
use clap::{ArgAction, Parser as ClapParser, Subcommand};
use colored::*;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use matacc::position::parse_position_id;
use matacc::{
    attach_facts, Config, DuplicateHandler, DuplicateType, FactIndex, HierarchyBuilder, StatementKind,
    StatementTypeRegistry, Strategy,
};

/// Financial statement hierarchies from XBRL structural metadata
#[derive(ClapParser)]
#[command(name = "matacc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build statement trees from a filing directory, linkbase or JSON record
    Tree {
        /// Filing directory, *_pre.xml / *_cal.xml linkbase or statement JSON
        input: PathBuf,

        /// Output as JSON
        #[arg(short, long, conflicts_with = "flat")]
        json: bool,

        /// One line per node with its position identifier
        #[arg(short, long)]
        flat: bool,

        /// Default context appended to position identifiers
        #[arg(short, long)]
        context: Option<String>,

        /// Facts JSON whose values are attached to the trees
        #[arg(long)]
        facts: Option<PathBuf>,

        /// Config JSON (typing rules, reconciliation, indent)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Decode a position identifier such as BS-002-001-c4
    Id {
        identifier: String,
    },

    /// Classify duplicate facts in a facts JSON file
    Duplicates {
        input: PathBuf,

        /// Comparison strategy (decimal, percentage, both)
        #[arg(short, long, default_value = "both")]
        strategy: String,

        /// Only list inconsistent groups
        #[arg(long)]
        conflicts: bool,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Registry with the standard statement kinds bound in a fixed order.
fn standard_registry() -> StatementTypeRegistry {
    let mut registry = StatementTypeRegistry::new();
    for kind in [
        StatementKind::BalanceSheet,
        StatementKind::IncomeStatement,
        StatementKind::CashFlow,
        StatementKind::Equity,
        StatementKind::Other,
    ] {
        registry.get_or_generate_code(kind.as_str());
    }
    registry
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Tree {
            input,
            json,
            flat,
            context,
            facts,
            config,
        } => {
            let config = match config {
                Some(path) => Config::from_json_file(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => Config::default(),
            };
            let indent = config.indent_size;
            let handler = DuplicateHandler::new(config.reconcile.clone());

            let start = Instant::now();
            let builder = HierarchyBuilder::new(config)
                .with_registry(standard_registry().shared())
                .with_default_context(context.as_deref());
            let mut trees = builder
                .build_path(&input)
                .with_context(|| format!("Failed to build hierarchy from {}", input.display()))?;
            let elapsed = start.elapsed();

            if let Some(path) = facts {
                let mut index = FactIndex::new();
                index
                    .load_file(&path)
                    .with_context(|| format!("Failed to load facts {}", path.display()))?;
                for (key, tree) in trees.iter_mut() {
                    let report = attach_facts(tree, &index, &handler, context.as_deref());
                    if !json {
                        eprintln!(
                            "{} {}: {} attached, {} missing, {} inconsistent",
                            "facts".cyan(),
                            key,
                            report.attached,
                            report.missing.len(),
                            report.inconsistent.len()
                        );
                    }
                }
            }

            if json {
                let output: BTreeMap<&str, serde_json::Value> =
                    trees.iter().map(|(key, tree)| (key.as_str(), tree.to_json())).collect();
                println!("{}", serde_json::to_string_pretty(&output)?);
                return Ok(());
            }

            println!(
                "{} {} ({} statements, {:.2}ms)",
                "✓".green().bold(),
                input.display(),
                trees.len(),
                elapsed.as_secs_f64() * 1000.0
            );

            for (key, tree) in &trees {
                println!();
                println!("{} {} nodes", key.bold(), tree.node_count());
                if flat {
                    for record in tree.to_records() {
                        let id = record.position_id.unwrap_or_default();
                        let value = record.value.map(|v| v.to_string()).unwrap_or_default();
                        println!("  {:<20} {:<60} {}", id.yellow(), record.path, value);
                    }
                } else {
                    print!("{}", tree.to_text(indent));
                }

                let (valid, messages) = tree.validate();
                for message in messages {
                    let tag = if valid { "WARN:".yellow() } else { "ERROR:".red() };
                    println!("  {} {}", tag, message);
                }
            }
        }

        Commands::Id { identifier } => {
            let registry = standard_registry();
            let parsed = parse_position_id(&identifier, &registry);
            if parsed.code.is_empty() {
                println!("{} {} - not a position identifier", "✗".red().bold(), identifier);
                std::process::exit(1);
            }

            println!("{} {}", "✓".green().bold(), identifier);
            println!("  Code:           {}", parsed.code);
            println!("  Statement type: {}", parsed.statement_type);
            println!("  Level:          {}", parsed.level);
            println!("  Sibling:        {}", parsed.sibling);
            println!("  Position:       {}", parsed.position);
            if let Some(context) = parsed.context {
                println!("  Context:        {}", context);
            }
        }

        Commands::Duplicates {
            input,
            strategy,
            conflicts,
        } => {
            let strategy: Strategy = strategy.parse()?;
            let config = Config::default();
            let handler = DuplicateHandler::new(config.reconcile.with_strategy(strategy));

            let mut index = FactIndex::new();
            index
                .load_file(&input)
                .with_context(|| format!("Failed to load facts {}", input.display()))?;

            let infos = handler.group_and_analyze(&index);
            let summary = DuplicateHandler::summarize(&infos);

            println!("{} {}", "✓".green().bold(), input.display());
            println!("  Facts:        {}", index.total_facts());
            println!("  Concepts:     {}", index.concept_count());
            println!("  Duplicated:   {}", summary.groups);
            println!("  Complete:     {}", summary.complete);
            println!("  Consistent:   {}", summary.consistent);
            println!("  Inconsistent: {}", summary.inconsistent);

            for info in &infos {
                let tag = match info.duplicate_type {
                    Some(DuplicateType::Inconsistent) => "CONFLICT".red(),
                    _ if conflicts => continue,
                    Some(DuplicateType::Consistent) => "OK".yellow(),
                    _ => "OK".green(),
                };
                println!("  {} {}", tag, info.summary());
            }

            if summary.inconsistent > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
