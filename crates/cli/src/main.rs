use std::path::PathBuf;

use {
    anyhow::{Context, Result},
    clap::{Parser, Subcommand},
    echovault_config::{CONFIG_FILE, SemanticMode, load_config, memory_home, write_template},
    echovault_memory::{
        Category, MemoryConfig, MemoryManager, NewMemory,
        manager::ContextRequest,
        model::split_list,
        search::{MemoryPointer, SearchRequest},
    },
    serde::Serialize,
    tracing::debug,
    tracing_subscriber::EnvFilter,
};

#[derive(Parser)]
#[command(name = "echovault", version, about = "Local memory for coding agents")]
struct Cli {
    /// Memory home holding the vault, index and config.yaml
    #[arg(long, global = true, env = "MEMORY_HOME")]
    home: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save a memory
    Save(SaveArgs),
    /// Search memories
    Search {
        query: String,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Recent memories, or a search when --query is given
    Context {
        #[arg(long)]
        query: Option<String>,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Show the full record for an id or prefix
    Details { id: String },
    /// Delete a memory by id or prefix
    Delete { id: String },
    /// Rebuild the index from the vault
    Reindex,
    /// List session files, newest first
    Sessions {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Index and embedding status
    Status,
    /// Configuration
    #[command(subcommand)]
    Config(ConfigAction),
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration with secrets masked
    Show,
    /// Write a starter config.yaml
    Init {
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::Args)]
struct FilterArgs {
    #[arg(long)]
    project: Option<String>,
    #[arg(long)]
    source: Option<String>,
    #[arg(long, short = 'n')]
    limit: Option<usize>,
    /// auto | always | never
    #[arg(long)]
    semantic: Option<SemanticMode>,
}

#[derive(clap::Args)]
struct SaveArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    what: String,
    #[arg(long)]
    why: Option<String>,
    #[arg(long)]
    impact: Option<String>,
    #[arg(long)]
    details: Option<String>,
    /// Comma-separated
    #[arg(long)]
    tags: Option<String>,
    #[arg(long)]
    category: Option<Category>,
    /// Comma-separated paths
    #[arg(long)]
    related_files: Option<String>,
    /// Agent saving the memory
    #[arg(long)]
    source: Option<String>,
    /// Defaults to the current directory name
    #[arg(long)]
    project: Option<String>,
    /// Ask the enrichment model for extra tags
    #[arg(long)]
    enrich: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn current_project() -> Result<String> {
    let dir = std::env::current_dir().context("cannot read current directory")?;
    dir.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .context("cannot infer project from the current directory; pass --project")
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

fn print_pointers(pointers: &[MemoryPointer]) {
    if pointers.is_empty() {
        println!("No memories found.");
        return;
    }
    for p in pointers {
        let short: String = p.id.chars().take(8).collect();
        let marker = if p.recent { " (recent)" } else { "" };
        println!(
            "[{short}] {} [{}] {} {}{marker}",
            p.title,
            p.category,
            p.project,
            p.created_at.format("%Y-%m-%d")
        );
        if !p.summary.is_empty() {
            println!("    {}", p.summary);
        }
        if p.has_more {
            println!("    (more: echovault details {short})");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let home = cli.home.clone().unwrap_or_else(memory_home);
    let config_path = home.join(CONFIG_FILE);
    debug!(home = %home.display(), "memory home");

    if let Commands::Config(action) = &cli.command {
        match action {
            ConfigAction::Show => {
                let config = load_config(&config_path)?;
                print!("{}", config.to_display_yaml());
            },
            ConfigAction::Init { force } => {
                write_template(&config_path, *force)?;
                println!("Wrote {}", config_path.display());
            },
        }
        return Ok(());
    }

    let raw = load_config(&config_path)?;
    let mut config = MemoryConfig::from_home(&home, &raw);
    if let Ok(dir) = std::env::current_dir() {
        config = config.with_project_dir(dir);
    }
    let manager = MemoryManager::open(config, &raw).await?;

    match cli.command {
        Commands::Save(args) => {
            let project = match args.project {
                Some(p) => p,
                None => current_project()?,
            };
            let memory = NewMemory {
                title: args.title,
                what: args.what,
                why: args.why,
                impact: args.impact,
                details: args.details,
                tags: args.tags.as_deref().map(split_list).unwrap_or_default(),
                category: args.category,
                related_files: args
                    .related_files
                    .as_deref()
                    .map(split_list)
                    .unwrap_or_default(),
                source: args.source,
                project,
            };
            let outcome = manager.save(memory, args.enrich).await?;
            emit(cli.json, &outcome, |o| {
                println!("Saved {} to {}", o.id, o.file_path.display());
                if o.redactions > 0 {
                    println!("Redacted {} secret(s)", o.redactions);
                }
                if !o.indexed {
                    println!("Index update failed; run `echovault reindex`");
                }
            })?;
        },
        Commands::Search { query, filter } => {
            let outcome = manager
                .search(&SearchRequest {
                    query,
                    project: filter.project,
                    source: filter.source,
                    limit: filter.limit,
                    semantic: filter.semantic,
                })
                .await?;
            emit(cli.json, &outcome, |o| {
                print_pointers(&o.results);
                if o.needs_reindex {
                    eprintln!("Embedding model changed; run `echovault reindex` for semantic search");
                }
            })?;
        },
        Commands::Context { query, filter } => {
            let outcome = manager
                .context(&ContextRequest {
                    query,
                    project: filter.project,
                    source: filter.source,
                    limit: filter.limit,
                    semantic: filter.semantic,
                })
                .await?;
            emit(cli.json, &outcome, |o| {
                println!("{} memories ({} shown)", o.total, o.pointers.len());
                print_pointers(&o.pointers);
            })?;
        },
        Commands::Details { id } => {
            let record = manager.details(&id).await?;
            emit(cli.json, &record, |r| {
                println!("{} [{}] {}", r.title, r.category, r.id);
                println!("project: {}  created: {}", r.project, r.created_at.to_rfc3339());
                if let Some(source) = &r.source {
                    println!("source: {source}");
                }
                if !r.tags.is_empty() {
                    println!("tags: {}", r.tags.join(", "));
                }
                println!("\nWhat:\n{}", r.what);
                for (label, value) in [("Why", &r.why), ("Impact", &r.impact), ("Details", &r.details)] {
                    if let Some(value) = value {
                        println!("\n{label}:\n{value}");
                    }
                }
                if !r.related_files.is_empty() {
                    println!("\nFiles: {}", r.related_files.join(", "));
                }
            })?;
        },
        Commands::Delete { id } => {
            let deleted = manager.delete(&id).await?;
            emit(cli.json, &serde_json::json!({ "deleted": deleted }), |_| {
                if deleted == 0 {
                    println!("No memory matches {id}");
                } else {
                    println!("Deleted {id}");
                }
            })?;
        },
        Commands::Reindex => {
            let summary = manager.reindex().await?;
            emit(cli.json, &summary, |s| {
                println!(
                    "Indexed {} memories ({} embedded, {} duplicates skipped, {} files re-redacted)",
                    s.processed, s.embedded, s.skipped, s.rewritten
                );
                if let (Some(model), Some(dims)) = (&s.model, s.dimensions) {
                    println!("Vectors: {model} ({dims} dims)");
                }
                for file in &s.skipped_files {
                    println!("Skipped {}: {}", file.path.display(), file.reason);
                }
            })?;
        },
        Commands::Sessions { project, limit } => {
            let sessions = manager.sessions(project.as_deref(), limit).await?;
            emit(cli.json, &sessions, |list| {
                for s in list {
                    println!("{} {} ({} memories) {}", s.date, s.project, s.records, s.path.display());
                }
            })?;
        },
        Commands::Status => {
            let status = manager.status().await?;
            emit(cli.json, &status, |s| {
                println!("vault:   {}", s.vault_dir.display());
                println!("index:   {}", s.db_path.display());
                println!("memories: {}  vectors: {}", s.memories, s.vectors);
                match &s.active_space {
                    Some(space) => println!("embeddings: {space}"),
                    None => println!("embeddings: disabled"),
                }
                if s.needs_reindex {
                    println!("index vectors are from another model; run `echovault reindex`");
                }
            })?;
        },
        Commands::Config(_) => {},
    }
    Ok(())
}
