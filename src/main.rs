//! domainscope binary — thin CLI shell over the [`domainscope`] library crate.

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

use domainscope::config::{load_config, write_starter_config};
use domainscope::providers::OllamaEmbeddingClient;
use domainscope::store::Store;
use domainscope::vectors::SearchOptions;
use domainscope::{brainstorm, briefing, health, indexer, repo, scan};

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Domain workspace knowledge engine — KB indexing, semantic search, and
/// portfolio health for LLM-assisted work.
#[derive(Parser)]
#[command(name = "domainscope", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Workspace root (default: current directory)
    #[arg(long)]
    root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a workspace (writes domainscope.toml)
    Init,
    /// Manage domains
    Domains {
        #[command(subcommand)]
        command: DomainCommands,
    },
    /// Scan KB directories and sync file records
    Sync {
        /// Domain name (all domains when omitted)
        #[arg(long)]
        domain: Option<String>,
    },
    /// Chunk and embed a domain's KB
    Index {
        #[arg(long)]
        domain: String,
        /// Embedding model (default from domainscope.toml)
        #[arg(long)]
        model: Option<String>,
    },
    /// Semantic search over a domain's KB
    Search {
        #[arg(long)]
        domain: String,
        query: String,
        #[arg(long, default_value_t = 8)]
        top_k: usize,
        #[arg(long, default_value_t = 0.0)]
        min_score: f32,
        #[arg(long)]
        model: Option<String>,
    },
    /// Portfolio health across all domains
    Health,
    /// Status briefing for one domain
    Status { domain: String },
    /// Show the active brainstorm session for a domain
    Brainstorm { domain: String },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum DomainCommands {
    /// Register a domain
    Add {
        name: String,
        /// Absolute path to the domain's KB directory
        #[arg(long)]
        kb_path: PathBuf,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List registered domains
    List,
    /// Remove a domain and everything it owns
    Remove { name: String },
}

fn open_store(root: &std::path::Path) -> domainscope::Result<(Store, domainscope::config::WorkspaceConfig)> {
    let config = load_config(root)?;
    let store = Store::open(&root.join(&config.db_path))?;
    Ok((store, config))
}

fn run(cli: Cli) -> domainscope::Result<()> {
    let root = match &cli.root {
        Some(root) => root.clone(),
        None => std::env::current_dir()?,
    };

    match cli.command {
        Commands::Init => {
            write_starter_config(&root)?;
            let (_store, config) = open_store(&root)?;
            info!(db = %config.db_path, "Workspace initialized");
            println!("Initialized workspace at {}", root.display());
        }
        Commands::Domains { command } => {
            let (store, _) = open_store(&root)?;
            match command {
                DomainCommands::Add { name, kb_path, description } => {
                    let domain = repo::create_domain(
                        &store,
                        repo::NewDomain {
                            name,
                            description,
                            kb_path: kb_path.to_string_lossy().to_string(),
                            ..Default::default()
                        },
                    )?;
                    println!("Added domain {} ({})", domain.name, domain.id);
                }
                DomainCommands::List => {
                    for domain in repo::list_domains(&store)? {
                        println!("{}\t{}\t{}", domain.name, domain.kb_path, domain.id);
                    }
                }
                DomainCommands::Remove { name } => {
                    let domain = repo::get_domain_by_name(&store, &name)?;
                    repo::delete_domain(&store, &domain.id)?;
                    println!("Removed domain {name}");
                }
            }
        }
        Commands::Sync { domain } => {
            let (store, _) = open_store(&root)?;
            let domains = match domain {
                Some(name) => vec![repo::get_domain_by_name(&store, &name)?],
                None => repo::list_domains(&store)?,
            };
            for domain in domains {
                let report = scan::sync_domain(&store, &domain)?;
                println!(
                    "{}: +{} ~{} -{}",
                    domain.name, report.added, report.updated, report.deleted
                );
            }
        }
        Commands::Index { domain, model } => {
            let (store, config) = open_store(&root)?;
            let domain = repo::get_domain_by_name(&store, &domain)?;
            scan::sync_domain(&store, &domain)?;
            let model = model.unwrap_or(config.embedding.model);
            let client = OllamaEmbeddingClient::new(&model)?;
            let report = indexer::index_domain(&store, &domain, &client, None)?;
            println!(
                "{}: {} files, +{} ~{} -{} chunks, {} embedded",
                domain.name,
                report.files_processed,
                report.chunks_inserted,
                report.chunks_updated,
                report.chunks_deleted,
                report.chunks_embedded
            );
        }
        Commands::Search { domain, query, top_k, min_score, model } => {
            let (store, config) = open_store(&root)?;
            let domain = repo::get_domain_by_name(&store, &domain)?;
            let model = model.unwrap_or(config.embedding.model);
            let client = OllamaEmbeddingClient::new(&model)?;

            let hits = indexer::search_domain(
                &store,
                &domain,
                &client,
                &query,
                &SearchOptions { top_k, min_score },
            )?;
            if hits.is_empty() {
                println!("No results (is the domain indexed?)");
            }
            for hit in hits {
                println!(
                    "{:.3}  {}  {}\n      {}",
                    hit.score,
                    hit.relative_path,
                    hit.heading_path,
                    hit.snippet.replace('\n', " ")
                );
            }
        }
        Commands::Health => {
            let (store, _) = open_store(&root)?;
            let now_ms = chrono::Utc::now().timestamp_millis();
            let portfolio = health::compute_portfolio_health(&store, now_ms)?;
            for domain in &portfolio.domains {
                println!(
                    "{:<24} {:<10} severity {:>3}  gaps {}  overdue {}",
                    domain.name,
                    domain.status.as_str(),
                    domain.severity,
                    domain.open_gap_flags,
                    domain.overdue_deadlines
                );
            }
            for alert in &portfolio.alerts {
                println!("[{:?}] {}", alert.severity, alert.message);
            }
            println!("snapshot {}", portfolio.snapshot_hash);
        }
        Commands::Status { domain } => {
            let (store, _) = open_store(&root)?;
            let domain = repo::get_domain_by_name(&store, &domain)?;
            let now_ms = chrono::Utc::now().timestamp_millis();
            let briefing = briefing::build_briefing(&store, &domain, now_ms)?;
            println!(
                "{} (since {})",
                briefing.domain_name,
                briefing.since_window.as_deref().unwrap_or("none")
            );
            for action in &briefing.top_actions {
                println!("  [{:>3}] {}", action.priority_score, action.label);
            }
            println!("hints: {}", briefing.search_hints.join(", "));
        }
        Commands::Brainstorm { domain } => {
            let (store, _) = open_store(&root)?;
            let domain = repo::get_domain_by_name(&store, &domain)?;
            match brainstorm::get_active(&store, &domain.id)? {
                None => println!("No active brainstorm session for {}", domain.name),
                Some(session) => {
                    println!(
                        "{}: step {} ({}){}, {} idea(s) across {} round(s)",
                        session.topic,
                        session.step.as_str(),
                        match session.phase {
                            brainstorm::BrainstormPhase::Divergent => "divergent",
                            brainstorm::BrainstormPhase::Convergent => "convergent",
                        },
                        if session.is_paused { ", paused" } else { "" },
                        session.idea_count,
                        session.rounds.len()
                    );
                }
            }
        }
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "domainscope",
                &mut std::io::stdout(),
            );
        }
    }
    Ok(())
}

fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("domainscope=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        error!(code = err.code.as_str(), "{}", err.message);
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
