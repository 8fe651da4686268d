// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use bookfetch::config::{config_path, load_config, save_config, Config};
use bookfetch::download::{DownloadManager, DownloadRequest, JobOutcome};
use bookfetch::server::Server;
use bookfetch::upstream::{http_client, search::ArchiveSearch, SearchProvider};

/// Process exit codes
mod exit_codes {
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Cancelled by the user (128 + SIGINT)
    pub const INTERRUPTED: i32 = 130;
}

#[derive(Parser)]
#[command(name = "bookfetch")]
#[command(version, about = "Search for books and download them in the background", long_about = None)]
#[command(after_help = "\
Quick start:\n    \
    Start the server:    bookfetch serve\n    \
    Search:              bookfetch search \"dune\"\n    \
    Download one book:   bookfetch fetch <md5> \"Dune\" --format epub\n    \
    Configure:           bookfetch config show")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Quiet mode: only warnings and errors are logged
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Verbose mode: detailed output for debugging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API (the default when no command is given)
    ///
    /// Examples:
    ///   bookfetch serve
    ///   bookfetch serve --port 8080 --storage-dir ~/books
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind to
        #[arg(long)]
        bind: Option<String>,
        /// Directory for downloaded books
        #[arg(long)]
        storage_dir: Option<PathBuf>,
    },

    /// Search the book index
    ///
    /// Examples:
    ///   bookfetch search "the left hand of darkness"
    ///   bookfetch search tolkien --page 2
    Search {
        /// Search terms
        query: String,
        /// Result page (1-based)
        #[arg(short, long, default_value_t = 1)]
        page: u32,
    },

    /// Download one book in the foreground (Ctrl+C cancels)
    ///
    /// Examples:
    ///   bookfetch fetch 0123456789abcdef0123456789abcdef "My Book" --format epub
    Fetch {
        /// Content key (md5) from the search results
        md5: String,
        /// Title used to name the stored file
        title: String,
        /// Preferred extension
        #[arg(short, long)]
        format: Option<String>,
        /// Directory for downloaded books
        #[arg(long)]
        storage_dir: Option<PathBuf>,
    },

    /// Configure settings
    ///
    /// Examples:
    ///   bookfetch config show
    ///   bookfetch config set-port 8080
    ///   bookfetch config set-storage-dir /srv/books
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set the server port
    SetPort { port: u16 },
    /// Set the storage directory
    SetStorageDir { path: PathBuf },
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default = if verbose {
        "bookfetch=debug,tower_http=debug,info"
    } else if quiet {
        "warn"
    } else {
        "info,hyper=warn,reqwest=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .try_init();
}

fn handle_config(command: Option<ConfigCommands>) -> Result<()> {
    let mut config = load_config()?;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", "=== bookfetch Configuration ===".bright_cyan().bold());
            println!();
            println!("  Port:            {}", config.port);
            println!("  Bind address:    {}", config.bind_address);
            println!("  Storage dir:     {}", config.storage_dir.display());
            println!("  Chunk size:      {} bytes", config.chunk_size);
            println!("  User agent:      {}", config.user_agent);
            println!("  Search index:    {}", config.search_base_url);
            println!("  Mirror:          {}", config.mirror_base_url);
            println!("  Request timeout: {}s", config.request_timeout_secs);
            println!();

            if let Ok(path) = config_path() {
                println!("Config file: {}", path.display().to_string().dimmed());
            }
            println!();
        }
        Some(ConfigCommands::SetPort { port }) => {
            config.port = port;
            save_config(&config)?;
            println!("{} Port set to: {}", "[✓]".green(), port);
        }
        Some(ConfigCommands::SetStorageDir { path }) => {
            config.storage_dir = path.clone();
            save_config(&config)?;
            println!("{} Storage directory set to: {}", "[✓]".green(), path.display());
        }
    }

    Ok(())
}

async fn handle_serve(mut config: Config, port: Option<u16>, bind: Option<String>, storage_dir: Option<PathBuf>) -> Result<()> {
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(bind) = bind {
        config.bind_address = bind;
    }
    if let Some(dir) = storage_dir {
        config.storage_dir = dir;
    }

    let server = Server::from_config(&config)?;
    println!(
        "{} Serving on http://{}:{} (books in {})",
        "[✓]".green(),
        config.bind_address,
        config.port,
        config.storage_dir.display()
    );
    server.start().await
}

async fn handle_search(config: &Config, query: &str, page: u32) -> Result<()> {
    let client = http_client(&config.user_agent, config.request_timeout())?;
    let search = ArchiveSearch::new(client, config.search_base_url.clone());
    let results = search
        .search(query, page.max(1))
        .await
        .with_context(|| format!("Search for {:?} failed", query))?;

    if results.results.is_empty() {
        println!("{} No results for {:?}", "[!]".yellow(), query);
        return Ok(());
    }

    println!();
    for (idx, hit) in results.results.iter().enumerate() {
        println!("{:>3}. {}", idx + 1, hit.title.bold());
        if let Some(author) = &hit.author {
            println!("     {}", author.dimmed());
        }
        let format = hit.format.as_deref().unwrap_or("?");
        match &hit.md5 {
            Some(md5) => println!("     {} {}", format.cyan(), md5),
            None => println!("     {} {}", format.cyan(), hit.url.dimmed()),
        }
    }
    println!();

    let pagination = results.pagination;
    let mut nav = Vec::new();
    if pagination.has_previous {
        nav.push(format!("--page {}", pagination.page - 1));
    }
    if pagination.has_next {
        nav.push(format!("--page {}", pagination.page.saturating_add(1)));
    }
    println!("Page {}{}", pagination.page, if nav.is_empty() { String::new() } else { format!("  ({})", nav.join(", ")) });
    Ok(())
}

async fn handle_fetch(mut config: Config, md5: String, title: String, format: Option<String>, storage_dir: Option<PathBuf>) -> Result<()> {
    use indicatif::{ProgressBar, ProgressStyle};

    if let Some(dir) = storage_dir {
        config.storage_dir = dir;
    }
    let manager = DownloadManager::from_config(&config)?;
    let id = manager.start_download(DownloadRequest::new(md5, title, format.as_deref()))?;

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% | {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("█▓░"),
    );
    pb.set_message("Resolving mirror link...");
    pb.enable_steady_tick(Duration::from_millis(100));

    let wait = manager.wait(&id);
    tokio::pin!(wait);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let mut interrupted = false;

    let outcome = loop {
        tokio::select! {
            outcome = &mut wait => break outcome,
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                manager.cancel(&id);
                pb.set_message("Cancelling...");
            }
            _ = ticker.tick() => {
                if let Some(percent) = manager.get_progress(&id) {
                    if percent > 0 {
                        pb.set_message("Downloading...");
                    }
                    pb.set_position(u64::from(percent));
                }
            }
        }
    };

    pb.finish_and_clear();

    match outcome {
        Some(JobOutcome::Finished(file)) => {
            let path = manager.storage().root().join(&file.filename);
            println!("{} Saved {} ({})", "[✓]".green(), path.display(), file.detected_kind);
            Ok(())
        }
        Some(JobOutcome::Cancelled) => {
            println!("{} Download cancelled", "[!]".yellow());
            std::process::exit(exit_codes::INTERRUPTED);
        }
        Some(JobOutcome::Failed { reason }) => {
            println!("{} Download failed: {}", "[✗]".red(), reason);
            anyhow::bail!("Download failed: {}", reason)
        }
        None => anyhow::bail!("Download {} ended without an outcome", id),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let command = match cli.command {
        Some(Commands::Config { command }) => return handle_config(command),
        other => other,
    };

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} Failed to load config: {:#}", "[!]".red(), e);
            std::process::exit(exit_codes::ERROR);
        }
    };

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(async move {
        match command {
            None => handle_serve(config, None, None, None).await,
            Some(Commands::Serve { port, bind, storage_dir }) => {
                handle_serve(config, port, bind, storage_dir).await
            }
            Some(Commands::Search { query, page }) => handle_search(&config, &query, page).await,
            Some(Commands::Fetch { md5, title, format, storage_dir }) => {
                handle_fetch(config, md5, title, format, storage_dir).await
            }
            Some(Commands::Config { .. }) => Ok(()),
        }
    })
}
