mod cli;
mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use cli::{Cli, Command};
use earmark::{load_config, Config, Index};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    // Load config: explicit --config path, or auto-detect earmark.toml / global config
    let config_path = cli.config.clone().or_else(|| {
        let local = PathBuf::from("earmark.toml");
        if local.exists() {
            return Some(local);
        }
        if let Some(home) = dirs::home_dir() {
            let xdg = home.join(".config").join("earmark").join("config.toml");
            if xdg.exists() {
                return Some(xdg);
            }
        }
        if let Some(config_dir) = dirs::config_dir() {
            let platform = config_dir.join("earmark").join("config.toml");
            if platform.exists() {
                return Some(platform);
            }
        }
        None
    });
    let config = match config_path {
        Some(ref path) => {
            let cfg = load_config(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            log::info!("Loaded config from {}", path.display());
            cfg
        }
        None => Config::default(),
    };

    if let Some(threads) = cli.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("Failed to configure worker threads")?;
    }

    let index_dir = cli
        .index
        .clone()
        .or_else(|| config.storage.index_dir.clone())
        .or_else(|| dirs::data_dir().map(|d| d.join("earmark").join("index")))
        .unwrap_or_else(|| PathBuf::from("earmark-index"));
    let cache_dir = |flag: &Option<PathBuf>| {
        flag.clone()
            .or_else(|| config.storage.cache_dir.clone())
            .unwrap_or_else(|| index_dir.join("cache"))
    };
    let open_index = || {
        Index::open(&index_dir, &config)
            .with_context(|| format!("Failed to open index at {}", index_dir.display()))
    };

    match &cli.command {
        Command::Store { inputs, id } => {
            let items = commands::items(inputs, *id)?;
            commands::store(&open_index()?, &config, &items)
        }
        Command::Cache { inputs, cache_dir: dir } => {
            let items = commands::items(inputs, None)?;
            commands::cache(&config, &items, &cache_dir(dir))
        }
        Command::Build { dumps, cache_dir: dir } => {
            commands::build(&open_index()?, &config, &cache_dir(dir), dumps)
        }
        Command::Query { inputs, min_match_count, off_by_one } => {
            let mut config = config.clone();
            if let Some(n) = min_match_count {
                config.matcher.min_match_count = *n;
            }
            config.matcher.include_off_by_one |= *off_by_one;
            commands::query(&open_index()?, &config, inputs, cli.json)
        }
        Command::Monitor { input, window } => {
            let mut config = config.clone();
            if let Some(secs) = window {
                config.matcher.monitor_window_secs = *secs;
                config.validate()?;
            }
            commands::monitor(&open_index()?, &config, input, cli.json)
        }
        Command::Dedup { inputs } => {
            let items = commands::items(inputs, None)?;
            commands::dedup(&open_index()?, &config, &items, cli.json)
        }
        Command::Delete { inputs, ids } => commands::delete(&open_index()?, inputs, ids),
        Command::Stats { verbose } => commands::stats(&open_index()?, *verbose, cli.json),
        Command::Clear => {
            open_index()?.clear().context("Failed to clear index")?;
            println!("index at {} cleared", index_dir.display());
            Ok(())
        }
        Command::Print { input, binary } => commands::print(&config, input, *binary, cli.json),
        Command::Dump { output } => commands::dump(&open_index()?, output.as_deref()),
    }
}
