use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dmirror_core::{normalize, MirrorConfig, SyncManager};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

mod tokenize;

#[derive(Parser)]
#[command(name = "dmirror", version, about = "DMirror – live directory mirroring CLI")]
struct Cli {
    /// Optional config file (YAML / JSON) with options and mirrors to
    /// register before the prompt starts
    #[arg(short, long)]
    config: Option<String>,
}

enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    /// Only `.json` selects JSON. Everything else, extensionless files
    /// included, is parsed as YAML, which accepts JSON documents too.
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => ConfigFormat::Json,
            _ => ConfigFormat::Yaml,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(Path::new(path))?,
        None => MirrorConfig::default(),
    };

    let manager = SyncManager::new(config.options);
    for mirror in &config.mirrors {
        if let Err(e) = manager.add(&mirror.source, &mirror.targets).await {
            eprintln!("add {}: {e:#}", mirror.source.display());
        }
    }

    repl(&manager).await?;
    manager.stop_all().await;
    Ok(())
}

fn load_config(path: &Path) -> Result<MirrorConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config = match ConfigFormat::of(path) {
        ConfigFormat::Json => serde_json::from_str(&text)
            .with_context(|| format!("parse {} as JSON", path.display()))?,
        ConfigFormat::Yaml => serde_yaml::from_str(&text)
            .with_context(|| format!("parse {} as YAML", path.display()))?,
    };
    Ok(config)
}

async fn repl(manager: &Arc<SyncManager>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt().await?;
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break, // EOF behaves like `exit`
            },
        };
        let tokens = match tokenize::tokenize(&line) {
            Ok(tokens) => tokens,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };
        let Some((command, args)) = tokens.split_first() else {
            continue;
        };
        match command.as_str() {
            "add" if args.len() >= 2 => {
                let outcome = async {
                    let (source, targets) = resolve_args(args)?;
                    manager.add(&source, &targets).await
                }
                .await;
                if let Err(e) = outcome {
                    eprintln!("add: {e:#}");
                }
            }
            "end" if args.len() >= 2 => {
                let outcome = async {
                    let (source, targets) = resolve_args(args)?;
                    manager.end(&source, &targets).await
                }
                .await;
                if let Err(e) = outcome {
                    eprintln!("end: {e:#}");
                }
            }
            "restore" if args.len() == 2 => {
                let outcome = async {
                    let source = resolve_arg(&args[0])?;
                    let target = resolve_arg(&args[1])?;
                    manager.restore(&source, &target).await
                }
                .await;
                if let Err(e) = outcome {
                    eprintln!("restore: {e:#}");
                }
            }
            "list" if args.is_empty() => {
                for info in manager.list() {
                    let state = if info.watching { "live" } else { "syncing" };
                    println!("{} [{state}]", info.source.display());
                    for target in &info.targets {
                        println!("  -> {}", target.display());
                    }
                }
            }
            "exit" if args.is_empty() => break,
            _ => eprintln!(
                "usage: add SOURCE TARGET... | end SOURCE TARGET... | restore SOURCE TARGET | list | exit"
            ),
        }
    }
    Ok(())
}

/// The registry is only ever handed absolute paths; relative prompt input
/// is resolved against the current directory here at the boundary.
fn resolve_arg(arg: &str) -> Result<PathBuf> {
    normalize(Path::new(arg))
}

fn resolve_args(args: &[String]) -> Result<(PathBuf, Vec<PathBuf>)> {
    let source = resolve_arg(&args[0])?;
    let targets = args[1..]
        .iter()
        .map(|arg| resolve_arg(arg))
        .collect::<Result<_>>()?;
    Ok((source, targets))
}

async fn prompt() -> Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"> ").await?;
    stdout.flush().await?;
    Ok(())
}
