//! # repo-ask CLI (`rask`)
//!
//! Ask questions about git repositories and local directories. `rask`
//! keeps each configured resource cached on disk, joins the resources a
//! question needs into one working directory, and lets a coding agent
//! answer from the files.
//!
//! ## Usage
//!
//! ```bash
//! rask [--config ~/.config/repo-ask/config.toml] <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rask init` | Write a starter config and create the thread database |
//! | `rask resources` | List configured resources |
//! | `rask ensure <name>...` | Clone or refresh resources |
//! | `rask remove <name>...` | Delete cached clones |
//! | `rask collection <name>...` | Materialize a collection and print its path |
//! | `rask ask -r <name> "<question>"` | Ask a question, streaming the answer |
//! | `rask threads list\|show\|delete` | Inspect stored threads |
//! | `rask serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! rask ask -r svelte "How do runes track dependencies?"
//! rask ask --thread 3f2c... "And in effects?"
//! rask ask --server http://127.0.0.1:8787 -r svelte -r effect --quiet "..."
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `repo_ask=info`).

use clap::{Parser, Subcommand};
use repo_ask::ask::AskRequest;
use repo_ask::{commands, config, server};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// repo-ask: answer questions about repositories with a coding agent.
#[derive(Parser)]
#[command(
    name = "rask",
    about = "Answer questions about git repositories and local directories with a coding agent",
    version
)]
struct Cli {
    /// Path to the configuration file (TOML).
    ///
    /// Defaults to `$RASK_CONFIG`, then `~/.config/repo-ask/config.toml`.
    /// A `rask.toml` in the working directory is layered on top.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Write a starter config if none exists and initialize storage.
    ///
    /// Creates the resource and collection directories and the thread
    /// database. Safe to run repeatedly.
    Init,

    /// List configured resources.
    Resources,

    /// Clone or refresh the named resources and print their cache paths.
    Ensure {
        /// Resource names.
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Delete the cached clones of the named resources.
    ///
    /// They are cloned again the next time they are needed. Local
    /// resources are never touched.
    Remove {
        /// Resource names.
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Materialize the collection for a set of resources.
    Collection {
        /// Resource names.
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Ask a question.
    ///
    /// The answer streams to stdout. Ctrl-C cancels; the partial answer
    /// is kept in the thread.
    Ask {
        /// The question.
        question: String,

        /// Resource to search (repeatable).
        #[arg(short = 'r', long = "resource")]
        resources: Vec<String>,

        /// Continue an existing thread; its resources are included.
        #[arg(long)]
        thread: Option<String>,

        /// Ask through a running `rask serve` instead of spawning the agent.
        #[arg(long)]
        server: Option<String>,

        /// Only print answer text (no tool or reasoning notes).
        #[arg(short, long)]
        quiet: bool,
    },

    /// Inspect stored threads.
    Threads {
        #[command(subcommand)]
        action: ThreadsAction,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum ThreadsAction {
    /// List threads, most recently updated first.
    List,
    /// Print a thread with its questions and answers.
    Show { id: String },
    /// Delete a thread and its questions.
    Delete { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("repo_ask=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        // init creates the config, so it runs before loading one
        Commands::Init => {
            let path = cli.config.unwrap_or_else(config::default_config_path);
            commands::run_init(&path).await
        }
        // remote asks need no local config
        Commands::Ask {
            question,
            resources,
            thread,
            server: Some(server),
            quiet,
        } => {
            let request = AskRequest {
                question,
                resources,
                thread_id: thread,
                quiet,
            };
            commands::run_ask_remote(&server, request).await
        }
        command => {
            let cfg = config::load_default(cli.config)?;
            run(&cfg, command).await
        }
    }
}

async fn run(cfg: &config::Config, command: Commands) -> anyhow::Result<()> {
    match command {
        // handled before config loading
        Commands::Init => unreachable!(),
        Commands::Resources => commands::list_resources(cfg)?,
        Commands::Ensure { names } => commands::run_ensure(cfg, &names).await?,
        Commands::Remove { names } => commands::run_remove(cfg, &names).await?,
        Commands::Collection { names } => commands::run_collection(cfg, &names).await?,
        Commands::Ask {
            question,
            resources,
            thread,
            quiet,
            ..
        } => {
            let request = AskRequest {
                question,
                resources,
                thread_id: thread,
                quiet,
            };
            commands::run_ask(cfg, request).await?;
        }
        Commands::Threads { action } => match action {
            ThreadsAction::List => commands::run_threads_list(cfg).await?,
            ThreadsAction::Show { id } => commands::run_threads_show(cfg, &id).await?,
            ThreadsAction::Delete { id } => commands::run_threads_delete(cfg, &id).await?,
        },
        Commands::Serve => server::run_server(cfg).await?,
    }

    Ok(())
}
