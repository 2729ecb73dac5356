use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{Sender, unbounded};
use serde::Serialize;
use watchmux::{FileEventListener, Settings, WatchService, logging};

#[derive(Parser)]
#[command(name = "watchmux")]
#[command(version, about = "Directory change notifications multiplexed over shared native watches")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration file
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show current configuration
    Config,

    /// Print changes to the given directories until every watch is gone
    Watch {
        /// Directories to watch
        #[arg(required = true)]
        dirs: Vec<PathBuf>,

        /// Watch every directory directly instead of sharing subtree watches
        #[arg(long)]
        no_subtree: bool,

        /// Number of dispatch threads (overrides config)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Print one JSON object per line
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Notification {
    Changed { dir: PathBuf, name: String },
    EventsMissed { dir: PathBuf },
    Abandoned { dir: PathBuf },
}

struct ChannelListener {
    dir: PathBuf,
    sender: Sender<Notification>,
}

impl FileEventListener for ChannelListener {
    fn changed(&self, name: &str) {
        let _ = self.sender.send(Notification::Changed {
            dir: self.dir.clone(),
            name: name.to_string(),
        });
    }

    fn events_missed(&self) {
        let _ = self.sender.send(Notification::EventsMissed {
            dir: self.dir.clone(),
        });
    }

    fn listener_abandoned(&self) {
        let _ = self.sender.send(Notification::Abandoned {
            dir: self.dir.clone(),
        });
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Settings::load().unwrap_or_else(|e| {
        eprintln!("Configuration error: {e}");
        Settings::default()
    });
    logging::init_with_config(&config.logging);

    match cli.command {
        Commands::Init { force } => {
            let path = Settings::init_config_file(force)
                .map_err(|e| anyhow::anyhow!("{e}"))
                .context("Failed to create configuration file")?;
            println!("Created configuration file at: {}", path.display());
            println!("Edit this file to customize your settings.");
        }

        Commands::Config => {
            println!("Current Configuration:");
            println!("{}", "=".repeat(50));
            println!("{}", toml::to_string_pretty(&config)?);
        }

        Commands::Watch {
            dirs,
            no_subtree,
            threads,
            json,
        } => {
            if no_subtree {
                config.watcher.subtree_watching = false;
            }
            if let Some(threads) = threads {
                config.watcher.dispatch_threads = threads;
            }
            watch(config, dirs, json)?;
        }
    }

    Ok(())
}

fn watch(config: Settings, dirs: Vec<PathBuf>, json: bool) -> Result<()> {
    let service = WatchService::new(config.watcher);
    let (sender, receiver) = unbounded();

    let mut tokens = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let dir = dir
            .canonicalize()
            .with_context(|| format!("Cannot watch {}", dir.display()))?;
        let listener = Arc::new(ChannelListener {
            dir: dir.clone(),
            sender: sender.clone(),
        });
        let token = service
            .add_listener(&dir, listener)
            .with_context(|| format!("Cannot watch {}", dir.display()))?;
        tokens.push(token);
    }
    drop(sender);

    let stats = service.stats();
    eprintln!(
        "Watching {} director{} with {} native handle(s)",
        stats.watched_directories,
        if stats.watched_directories == 1 { "y" } else { "ies" },
        stats.native_handles
    );

    let mut remaining = tokens.len();
    for notification in receiver {
        if json {
            println!("{}", serde_json::to_string(&notification)?);
        } else {
            match &notification {
                Notification::Changed { dir, name } => println!("{}", dir.join(name).display()),
                Notification::EventsMissed { dir } => {
                    println!("{}: events missed, rescan needed", dir.display())
                }
                Notification::Abandoned { dir } => println!("{}: watch abandoned", dir.display()),
            }
        }
        if matches!(notification, Notification::Abandoned { .. }) {
            remaining -= 1;
            if remaining == 0 {
                break;
            }
        }
    }

    service.remove_listeners(&mut tokens)?;
    service.shutdown();
    Ok(())
}
