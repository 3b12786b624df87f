//! vetus command-line client.
//!
//! Drives a collection in a vetus store: read and write documents, manage
//! branches and merges, and compute field-level history.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vetus_core::errors::CollectionError;
use vetus_core::history::{is_checkpoint_branch, new_cancel_flag};
use vetus_core::{Collection, HistoryCheckpoint, SaveOutcome, VetusConfig};

/// Config file used when `--config` is not given, if it exists.
const DEFAULT_CONFIG_PATH: &str = "~/.config/vetus/config.toml";

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// vetus command-line client.
#[derive(Parser, Debug)]
#[command(
    name = "vetus",
    version,
    about = "Versioned JSON documents on git, with field-level history"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Repository root, overriding `[store].root`.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// User whose working copy to use.
    #[arg(short, long, global = true, default_value = "vetus")]
    user: String,

    /// Target branch. Defaults to `[store].default_branch`.
    #[arg(short, long, global = true)]
    branch: Option<String>,

    /// Log filter, overriding `[logging].level`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./vetus.toml")]
        output: PathBuf,
    },

    /// Validate the configuration.
    Validate,

    /// Print one document, or all of them.
    Show {
        /// Document name.
        name: Option<String>,
    },

    /// Store a document read from a JSON file.
    Put {
        /// Document name.
        name: String,

        /// JSON file with the document content.
        file: PathBuf,

        /// Commit message.
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Delete a document.
    Remove {
        /// Document name.
        name: String,

        /// Commit message.
        #[arg(short, long)]
        message: Option<String>,
    },

    /// List branches.
    Branches,

    /// Create a branch from the target branch.
    Branch {
        /// New branch name.
        name: String,
    },

    /// Merge another branch into the target branch.
    Merge {
        /// Branch to merge from.
        from: String,
    },

    /// Show the commit log of the target branch.
    Log {
        /// Maximum number of commits to show.
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Compute and print field-level history.
    History {
        /// Recompute from the first commit instead of the nearest checkpoint.
        #[arg(long)]
        rebuild: bool,

        /// Branch to compute history for. Defaults to the target branch.
        #[arg(long)]
        branch_name: Option<String>,
    },

    /// Show the merge base with every other branch.
    Shared,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Init { output } = &cli.command {
        init_logging(cli.log_level.as_deref().unwrap_or("warn"));
        return cmd_init(output);
    }

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(root) = &cli.root {
        config.store.root = root.clone();
    }
    init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level));

    let branch = cli
        .branch
        .clone()
        .unwrap_or_else(|| config.store.default_branch.clone());
    let mut collection = Collection::open(&config, &cli.user, &branch);

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Validate => cmd_validate(&config),
        Commands::Show { name } => cmd_show(&mut collection, name.as_deref()).await,
        Commands::Put {
            name,
            file,
            message,
        } => cmd_put(&mut collection, &name, &file, message).await,
        Commands::Remove { name, message } => cmd_remove(&mut collection, &name, message).await,
        Commands::Branches => cmd_branches(&collection).await,
        Commands::Branch { name } => cmd_branch(&mut collection, &name).await,
        Commands::Merge { from } => cmd_merge(&mut collection, &from).await,
        Commands::Log { limit } => cmd_log(&collection, limit).await,
        Commands::History {
            rebuild,
            branch_name,
        } => cmd_history(&collection, rebuild, branch_name.as_deref()).await,
        Commands::Shared => cmd_shared(&collection).await,
    }
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: Option<&Path>) -> Result<VetusConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let default = expand_tilde(DEFAULT_CONFIG_PATH);
            if !default.exists() {
                return Ok(VetusConfig::default());
            }
            default
        }
    };
    VetusConfig::load_and_validate(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# vetus configuration

[store]
root = "/var/lib/vetus"
default_branch = "master"
email_domain = "vetus"

[git]
binary = "git"
remote = "origin"
network_timeout_secs = 120
command_timeout_secs = 60

[sync]
push_retries = 1

[logging]
level = "info"
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Set [store].root to a directory vetus may write to");
    println!(
        "  2. Validate with: vetus validate --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config: &VetusConfig) -> Result<()> {
    println!("  [OK] Configuration is valid");
    println!();
    println!("Configuration summary:");
    println!("  Root           : {}", config.store.root.display());
    println!("  Default branch : {}", config.store.default_branch);
    println!("  Email domain   : {}", config.store.email_domain);
    println!("  Git binary     : {}", config.git.binary);
    println!("  Remote         : {}", config.git.remote);
    println!("  Network timeout: {}s", config.git.network_timeout_secs);
    println!("  Command timeout: {}s", config.git.command_timeout_secs);
    println!("  Push retries   : {}", config.sync.push_retries);
    Ok(())
}

async fn cmd_show(collection: &mut Collection, name: Option<&str>) -> Result<()> {
    let documents = collection.load().await.context("failed to load collection")?;

    let value = match name {
        Some(name) => documents
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("document '{}' not found", name))?,
        None => Value::Object(documents.clone()),
    };
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn cmd_put(
    collection: &mut Collection,
    name: &str,
    file: &Path,
    message: Option<String>,
) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("{} is not valid JSON", file.display()))?;

    load_or_start(collection).await?;
    collection.set_document(name, value);

    let message = message.unwrap_or_else(|| format!("Update {}", name));
    let outcome = collection.save(&message).await.context("failed to save")?;
    print_outcome(outcome, collection);
    Ok(())
}

async fn cmd_remove(collection: &mut Collection, name: &str, message: Option<String>) -> Result<()> {
    collection.load().await.context("failed to load collection")?;
    if collection.remove_document(name).is_none() {
        anyhow::bail!("document '{}' not found", name);
    }

    let message = message.unwrap_or_else(|| format!("Remove {}", name));
    let outcome = collection.save(&message).await.context("failed to save")?;
    print_outcome(outcome, collection);
    Ok(())
}

/// Load the collection, tolerating a store that has no branches yet so the
/// first `put` can bootstrap it.
async fn load_or_start(collection: &mut Collection) -> Result<()> {
    let loaded = collection.load().await.map(|_| ());
    match loaded {
        Ok(()) => Ok(()),
        Err(CollectionError::BranchNotFound(branch)) => {
            let branches = collection.branch_list().await?;
            if !branches.is_empty() {
                return Err(CollectionError::BranchNotFound(branch).into());
            }
            info!("empty store, first save will bootstrap it");
            Ok(())
        }
        Err(e) => Err(e).context("failed to load collection"),
    }
}

fn print_outcome(outcome: SaveOutcome, collection: &Collection) {
    match outcome {
        SaveOutcome::Bootstrapped => println!(
            "Initialized store on branch '{}'",
            collection.options().default_branch
        ),
        SaveOutcome::Committed => println!("Committed to '{}'", collection.branch()),
        SaveOutcome::Unchanged => println!("No changes"),
        SaveOutcome::Empty => println!("Nothing to commit"),
    }
}

async fn cmd_branches(collection: &Collection) -> Result<()> {
    let branches = collection
        .branch_list()
        .await
        .context("failed to list branches")?;

    if branches.is_empty() {
        println!("No branches yet.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Branch", "Kind"]);

    for branch in &branches {
        let kind = if is_checkpoint_branch(branch) {
            Cell::new("history").fg(Color::DarkGrey)
        } else if branch == collection.branch() {
            Cell::new("work (target)").fg(Color::Green)
        } else {
            Cell::new("work")
        };
        table.add_row(vec![Cell::new(branch), kind]);
    }

    println!("{}", table);
    Ok(())
}

async fn cmd_branch(collection: &mut Collection, name: &str) -> Result<()> {
    collection
        .create_branch(name)
        .await
        .with_context(|| format!("failed to create branch '{}'", name))?;
    println!("Created branch '{}' from '{}'", name, collection.branch());
    Ok(())
}

async fn cmd_merge(collection: &mut Collection, from: &str) -> Result<()> {
    match collection.merge(from).await {
        Ok(()) => {
            println!("Merged '{}' into '{}'", from, collection.branch());
            println!("Run a save to push the merge.");
            Ok(())
        }
        Err(CollectionError::MergeConflict { branch, report, .. }) => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["Document", "Field", "Base", "Ours", "Theirs"]);
            for c in &report.conflicts {
                table.add_row(vec![
                    Cell::new(&c.document),
                    Cell::new(if c.path.is_empty() { "-" } else { c.path.as_str() }),
                    Cell::new(render(&c.base)),
                    Cell::new(render(&c.ours)).fg(Color::Yellow),
                    Cell::new(render(&c.theirs)).fg(Color::Cyan),
                ]);
            }
            println!("{}", table);
            println!("Merge base: {}", report.base_commit);
            anyhow::bail!(
                "merge of '{}' conflicts on {} field(s); nothing was changed",
                branch,
                report.conflicts.len()
            )
        }
        Err(e) => Err(e).with_context(|| format!("failed to merge '{}'", from)),
    }
}

async fn cmd_log(collection: &Collection, limit: usize) -> Result<()> {
    let commits = collection
        .commit_log(None)
        .await
        .context("failed to read commit log")?;

    if commits.is_empty() {
        println!("No commits.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Commit", "Author", "Date", "Message"]);

    for commit in commits.iter().take(limit) {
        table.add_row(vec![
            Cell::new(commit.short_hash()),
            Cell::new(&commit.author),
            Cell::new(commit.date.format("%Y-%m-%d %H:%M:%S %z")),
            Cell::new(truncate(&commit.subject, 60)),
        ]);
    }

    println!("{}", table);
    println!("{} of {} commit(s) shown", limit.min(commits.len()), commits.len());
    Ok(())
}

async fn cmd_history(
    collection: &Collection,
    rebuild: bool,
    branch_name: Option<&str>,
) -> Result<()> {
    let cancel = new_cancel_flag();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current commit");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let result = if rebuild {
        collection.rebuild_history(branch_name, cancel).await
    } else {
        collection.update_history(branch_name, cancel).await
    };
    let checkpoint: HistoryCheckpoint = result.context("failed to compute history")?;

    eprintln!(
        "History as of {} ({}, {})",
        checkpoint.commit.short_hash(),
        checkpoint.branch,
        if checkpoint.created {
            "new checkpoint"
        } else {
            "not written"
        }
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&Value::Object(checkpoint.history))?
    );
    Ok(())
}

async fn cmd_shared(collection: &Collection) -> Result<()> {
    let shared = collection
        .shared_commits()
        .await
        .context("failed to compute shared commits")?;

    if shared.is_empty() {
        println!("No other branches.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Branch", "Merge base"]);
    for entry in &shared {
        table.add_row(vec![Cell::new(&entry.branch), Cell::new(&entry.base)]);
    }
    println!("{}", table);
    Ok(())
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

fn render(value: &Option<Value>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "(absent)".to_string(),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
