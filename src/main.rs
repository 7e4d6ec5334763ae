//! # Memory Harness CLI (`mem`)
//!
//! ## Usage
//!
//! ```bash
//! mem --config ./config/mem.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mem init` | Create the data directory and the vector store |
//! | `mem wake` | Start an interactive session |
//! | `mem sleep` | Consolidate the episodic log and re-index the project |
//! | `mem index [--path P]` | Re-index the project, or one path in it |
//! | `mem recall "<query>"` | Show what memory holds for a query |
//! | `mem stats` | Summarize the store and the log |
//! | `mem completions <shell>` | Print shell completions |
//!
//! ## Examples
//!
//! ```bash
//! mem init
//! mem sleep                                  # index the project once
//! mem recall "authentication logic" --kind code --limit 3
//! mem wake                                   # chat; type `sleep` to end
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use memory_harness::config;
use memory_harness::harness::Harness;
use memory_harness::inference::create_backend;
use memory_harness::session::{describe_manifest, run_loop, run_sleep_cycle};
use memory_harness::stats::{collect_stats, print_stats};
use memory_harness_core::models::ChunkKind;

/// Memory Harness: long-term memory for a local coding agent.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means defaults.
#[derive(Parser)]
#[command(name = "mem", version, about = "Memory Harness: long-term memory for a local coding agent")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and the vector store.
    ///
    /// Idempotent. A corrupt store is set aside and replaced.
    Init,

    /// Start an interactive wake session on stdin.
    ///
    /// Commands inside the session: `watch:<dir>`, `unwatch`,
    /// `recall:<query>`, `img:<path> [prompt]`, `sleep`, `exit`.
    Wake,

    /// Run the sleep cycle: consolidate new turns, then re-index the project.
    Sleep,

    /// Re-index the project tree.
    Index {
        /// Only re-index this file or directory.
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Retrieve the memory most relevant to a query.
    Recall {
        query: String,

        /// Restrict to `code` or `conversation` records.
        #[arg(long)]
        kind: Option<ChunkKind>,

        /// Maximum number of records (defaults to `retrieval.top_k`).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show store and log statistics.
    Stats,

    /// Print shell completions.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "mem", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    // stderr, so stdout stays the operator's channel.
    let filter = EnvFilter::try_new(&cfg.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // recall and stats only read, so they may run beside a wake session.
    let harness = match cli.command {
        Commands::Recall { .. } | Commands::Stats => Harness::open_read_only(cfg).await?,
        _ => Harness::open(cfg).await?,
    };
    if let Some(e) = &harness.recovered_from {
        eprintln!("warning: {} (the damaged file was set aside; memory starts empty)", e);
    }

    match cli.command {
        Commands::Init => {
            println!(
                "Memory initialized in {}",
                harness.config.storage.data_dir.display()
            );
        }
        Commands::Wake => run_wake(&harness).await?,
        Commands::Sleep => {
            let manifest = run_sleep_cycle(&harness.indexer, &harness.log).await?;
            println!("{}", describe_manifest(&manifest));
        }
        Commands::Index { path } => {
            let manifest = match path {
                Some(p) => {
                    let p = p.canonicalize().unwrap_or(p);
                    harness.indexer.index_path(&p).await?
                }
                None => harness.indexer.index_all().await?,
            };
            println!("{}", describe_manifest(&manifest));
        }
        Commands::Recall { query, kind, limit } => {
            let retriever = harness.retriever();
            let k = limit.unwrap_or(retriever.params().top_k);
            match retriever.retrieve(&query, k, kind).await {
                Ok(bundle) if bundle.is_empty() => println!("No relevant memory."),
                Ok(bundle) => print!("{}", bundle.render()),
                Err(e) => eprintln!("memory unavailable: {:#}", e),
            }
        }
        Commands::Stats => {
            let store_path = match harness.config.storage.backend.as_str() {
                "sqlite" => Some(harness.config.vectors_path()),
                _ => None,
            };
            let stats =
                collect_stats(harness.store.as_ref(), &harness.log, store_path.as_deref()).await?;
            print_stats(&stats, &harness.config.storage.data_dir);
        }
        Commands::Completions { .. } => {}
    }

    harness.close().await;
    Ok(())
}

async fn run_wake(harness: &Harness) -> Result<()> {
    let backend = create_backend(&harness.config.inference)?;
    let mut session = harness.session(backend);

    println!("--- memory harness: awake (session {}) ---", session.session_id());
    println!(
        "Commands: watch:<dir>  unwatch  recall:<query>  img:<path> [prompt]  sleep  exit"
    );

    let stdin = BufReader::new(tokio::io::stdin());
    run_loop(&mut session, stdin, &mut std::io::stdout()).await
}
