//! ui-agent-cache - inspect and maintain engine cache files
//!
//! Usage:
//!   ui-agent-cache list <file>
//!   ui-agent-cache clear <file>
//!   ui-agent-cache prune <file>
//!
//! `<file>` may also be a cache id, resolved against the configured cache directory.

use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context};
use tracing_subscriber::EnvFilter;
use ui_agent_core::cache::{load_cache_file, save_cache_file, CacheConfig, CacheRecord};
use ui_agent_core::EngineSettings;

fn print_usage() {
    println!("Usage: ui-agent-cache <list|clear|prune> <file-or-cache-id>");
    println!();
    println!("Commands:");
    println!("  list    Print every record in the cache file");
    println!("  clear   Remove all records");
    println!("  prune   Remove empty plan workflows and negative locate records");
}

/// Accept either a path to an existing file or a cache id.
fn resolve_path(target: &str, settings: &EngineSettings) -> anyhow::Result<PathBuf> {
    let path = PathBuf::from(target);
    if path.exists() {
        return Ok(path);
    }
    let mut config = CacheConfig::new(target)?
        .with_max_filename_length(settings.cache_max_filename_length);
    if !settings.cache_dir.is_empty() {
        config = config.with_cache_dir(&settings.cache_dir);
    }
    config
        .file_path()
        .context("Cannot determine cache directory")
}

fn describe(record: &CacheRecord) -> String {
    match record {
        CacheRecord::Plan(plan) => match plan.usable_workflow() {
            Some(workflow) => format!(
                "plan    {:?} ({} workflow lines)",
                plan.prompt,
                workflow.lines().count()
            ),
            None => format!("plan    {:?} (empty workflow)", plan.prompt),
        },
        CacheRecord::Locate(locate) => match &locate.cache {
            Some(feature) => format!(
                "locate  {:?} xpaths={:?} texts={:?}",
                locate.prompt,
                feature.xpaths.as_deref().unwrap_or_default(),
                feature.texts.as_deref().unwrap_or_default()
            ),
            None => format!("locate  {:?} (negative)", locate.prompt),
        },
    }
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_usage();
        return Ok(());
    }
    let (command, target) = match args.as_slice() {
        [command, target] => (command.as_str(), target.as_str()),
        _ => {
            print_usage();
            bail!("expected a command and a cache file");
        }
    };

    let settings = EngineSettings::from_env();
    let path = resolve_path(target, &settings)?;
    let mut content = load_cache_file(&path)
        .with_context(|| format!("Failed to load cache file {}", path.display()))?;

    match command {
        "list" => {
            println!(
                "{} (cache id {}, {} records)",
                path.display(),
                content.cache_id,
                content.caches.len()
            );
            for record in &content.caches {
                println!("  {}", describe(record));
            }
        }
        "clear" => {
            let removed = content.caches.len();
            content.caches.clear();
            save_cache_file(&path, &content)?;
            tracing::info!("Cleared {} records from {}", removed, path.display());
        }
        "prune" => {
            let removed = content.prune();
            save_cache_file(&path, &content)?;
            tracing::info!("Pruned {} records from {}", removed, path.display());
        }
        other => {
            print_usage();
            bail!("unknown command: {}", other);
        }
    }

    Ok(())
}
