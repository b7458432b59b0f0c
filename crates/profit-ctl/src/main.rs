//! profit-ctl — drive job batches through a runner backend.

mod cmd;

use std::path::PathBuf;

use anyhow::{Context, Result};

use profit_core::config::ProfitConfig;

fn print_usage() {
    println!("Usage: profit-ctl [--url <url>] [--config <file>] <command>");
    println!();
    println!("Commands:");
    println!("  run [--out <dir>] <job-dir>...   Run job directories as one batch");
    println!("  check                            Open and close every channel for the backend");
    println!("  init                             Write the default config file if missing");
    println!();
    println!("Options:");
    println!("  --url <url>      Backend, e.g. local://, ssh://host/scratch, slurm://hpc/scratch");
    println!("  --config <file>  Config file (default: $PROFIT_CONFIG or ~/.config/profit/config.toml)");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut url = None;
    let mut config_path = None;
    let mut out = PathBuf::from("output");
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--url" => {
                i += 1;
                url = Some(args.get(i).context("--url requires a value")?.clone());
            }
            "--config" => {
                i += 1;
                config_path = Some(PathBuf::from(args.get(i).context("--config requires a value")?));
            }
            "--out" => {
                i += 1;
                out = PathBuf::from(args.get(i).context("--out requires a value")?);
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    let mut config = match config_path {
        Some(path) => ProfitConfig::load_from(path)?,
        None => ProfitConfig::load()?,
    };
    if let Some(url) = url {
        config.runner.url = url;
    }

    match remaining.as_slice() {
        ["run", jobs @ ..] if !jobs.is_empty() => {
            let jobs: Vec<PathBuf> = jobs.iter().map(|j| PathBuf::from(*j)).collect();
            if !cmd::run::cmd_run(&config, &jobs, &out).await? {
                std::process::exit(2);
            }
            Ok(())
        }
        ["check"] => cmd::check::cmd_check(&config).await,
        ["init"] => {
            let path = ProfitConfig::write_default_if_missing()?;
            println!("Config at {}", path.display());
            Ok(())
        }
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
