//! gitmem command line entry point
//!
//! Every subcommand prints one JSON document to stdout. Logs go to stderr and
//! are filtered with `RUST_LOG`.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gitmem_memory::embedding::EmbeddingProvider;
use gitmem_memory::{
    CachedEmbedder, Domain, HashEmbedder, MemoryConfig, MemoryEntry, MemoryId, MemoryService,
    MemoryStatus, Namespace, SearchFilters, SearchQuery, Tier,
};

#[derive(Parser)]
#[command(name = "gitmem")]
#[command(about = "Append-only memories stored as git notes")]
#[command(version)]
struct Args {
    /// Repository to operate on (defaults to the current directory)
    #[arg(long, short = 'C', global = true)]
    repo: Option<PathBuf>,

    /// Skip embeddings; search falls back to substring matching
    #[arg(long, global = true)]
    no_embed: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record a memory
    Capture {
        namespace: Namespace,
        #[arg(long, short)]
        summary: String,
        #[arg(long, short, default_value = "")]
        content: String,
        #[arg(long = "tag", short)]
        tags: Vec<String>,
        #[arg(long)]
        spec: Option<String>,
        #[arg(long = "relates-to")]
        relates_to: Vec<String>,
        #[arg(long, default_value = "project")]
        domain: Domain,
    },
    /// Search the index
    Search {
        query: String,
        #[arg(long, short, default_value_t = 0)]
        limit: usize,
        #[arg(long = "namespace", short)]
        namespaces: Vec<Namespace>,
        #[arg(long = "domain")]
        domains: Vec<Domain>,
        /// Replaces the default active/resolved filter
        #[arg(long = "status")]
        statuses: Vec<MemoryStatus>,
        #[arg(long = "tier")]
        tiers: Vec<Tier>,
    },
    /// Fetch, merge and push memory refs
    Sync {
        /// All configured domains when omitted
        #[arg(long)]
        domain: Option<Domain>,
    },
    /// Refresh index rows from the notes in place
    Reindex {
        #[arg(long, default_value = "project")]
        domain: Domain,
        /// All namespaces when omitted
        #[arg(long = "namespace", short)]
        namespaces: Vec<Namespace>,
    },
    /// Compare the index with the notes; exits non-zero on drift
    Verify {
        #[arg(long)]
        domain: Option<Domain>,
    },
    /// Drop and rebuild index rows from the notes
    Repair {
        #[arg(long)]
        domain: Option<Domain>,
    },
    /// Change a memory's status
    Transition {
        id: MemoryId,
        status: MemoryStatus,
        /// Replace the indexed content with a redaction marker
        #[arg(long)]
        redact: bool,
    },
    /// Recompute tiers and archive stale memories
    Age,
    /// Embed rows that have no vector
    Reembed,
    /// Replace legacy notes fetch refspecs in the git config
    MigrateConfig {
        #[arg(long, default_value = "project")]
        domain: Domain,
    },
    /// Index row counts
    Stats,
    /// Print the resolved configuration
    Config,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gitmem=info,gitmem_memory=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(args) {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let repo = match args.repo {
        Some(repo) => repo,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = MemoryConfig::from_env(repo)?;

    if let Command::Config = args.command {
        return print_json(&config);
    }

    let embedder: Option<Arc<dyn EmbeddingProvider>> = if args.no_embed {
        None
    } else {
        Some(Arc::new(CachedEmbedder::new(Arc::new(HashEmbedder::default()))))
    };
    tracing::debug!("Repository: {:?}", config.repo_path);
    let service = MemoryService::open(config, embedder)?;

    match args.command {
        Command::Capture {
            namespace,
            summary,
            content,
            tags,
            spec,
            relates_to,
            domain,
        } => {
            let mut builder = MemoryEntry::builder(namespace)
                .summary(summary)
                .content(content)
                .tags(tags);
            if let Some(spec) = spec {
                builder = builder.spec(spec);
            }
            for id in relates_to {
                builder = builder.relates_to(id);
            }
            let outcome = service.capture(domain, builder.build()?)?;
            for degradation in &outcome.degradations {
                tracing::warn!("Captured with degradation: {:?}", degradation);
            }
            print_json(&outcome)
        }
        Command::Search {
            query,
            limit,
            namespaces,
            domains,
            statuses,
            tiers,
        } => {
            let mut filters = if statuses.is_empty() {
                SearchFilters::live()
            } else {
                SearchFilters::default()
            };
            filters.statuses.extend(statuses);
            filters.namespaces = namespaces;
            filters.domains = domains;
            filters.tiers = tiers;

            let mut results = service.search(&SearchQuery::new(query).filters(filters).limit(limit))?;
            for hit in &mut results.hits {
                hit.record.embedding = None;
            }
            print_json(&results)
        }
        Command::Sync { domain } => {
            let outcomes = match domain {
                Some(domain) => vec![service.sync_domain(domain)],
                None => service.sync_all(),
            };
            print_json(&outcomes)?;
            let failed: Vec<String> = outcomes
                .iter()
                .filter_map(|o| o.error().map(|e| format!("{}: {}", o.domain(), e)))
                .collect();
            if !failed.is_empty() {
                bail!("sync failed for {}", failed.join("; "));
            }
            Ok(())
        }
        Command::Reindex { domain, namespaces } => print_json(&service.reindex(domain, &namespaces)?),
        Command::Verify { domain } => {
            let mut reports = Vec::new();
            for domain in domains(&service, domain) {
                reports.push((domain, service.verify(domain)?));
            }
            print_json(&reports)?;
            if reports.iter().any(|(_, r)| !r.is_clean()) {
                bail!("index drift detected; run `gitmem repair`");
            }
            Ok(())
        }
        Command::Repair { domain } => {
            let mut results = Vec::new();
            for domain in domains(&service, domain) {
                results.push((domain, service.repair(domain)?));
            }
            print_json(&results)
        }
        Command::Transition { id, status, redact } => {
            print_json(&service.transition_status(&id, status, redact)?)
        }
        Command::Age => print_json(&service.age(chrono::Utc::now())?),
        Command::Reembed => print_json(&service.reembed()?),
        Command::MigrateConfig { domain } => print_json(&service.migrate_fetch_config(domain)?),
        Command::Stats => print_json(&service.stats()?),
        Command::Config => print_json(service.config()),
    }
}

/// The requested domain, or every domain the service has a store for
fn domains(service: &MemoryService, requested: Option<Domain>) -> Vec<Domain> {
    match requested {
        Some(domain) => vec![domain],
        None => service.stores().map(|s| s.domain()).collect(),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}
