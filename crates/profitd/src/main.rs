//! profitd — worker side of the job transport.
//!
//! `profitd serve` speaks one channel on stdin/stdout; runners launch it over
//! ssh, one process per channel. Logs go to stderr.

use anyhow::{Context, Result};

use profit_core::config::ProfitConfig;
use profit_services::agent::{self, backend};

fn print_usage() {
    eprintln!("Usage: profitd <command>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  serve      Serve one channel on stdin/stdout");
    eprintln!("  identify   Print the queueing system found on this host");
    eprintln!("  config     Print the effective configuration");
}

fn load_config() -> ProfitConfig {
    ProfitConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ProfitConfig::default()
    })
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

async fn cmd_serve() -> Result<()> {
    let config = load_config();
    tracing::debug!(pid = std::process::id(), "serving channel on stdio");
    agent::serve(tokio::io::stdin(), tokio::io::stdout(), config.agent)
        .await
        .context("channel failed")
}

async fn cmd_identify() -> Result<()> {
    let config = load_config();
    match backend::detect(&config.agent).await {
        Some(found) => {
            println!("{}", found.name);
            Ok(())
        }
        None => anyhow::bail!("no supported queueing system found"),
    }
}

fn cmd_config() -> Result<()> {
    let config = load_config();
    print!("{}", config.to_toml().context("failed to render config")?);
    Ok(())
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol under `serve`.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["serve"] => cmd_serve().await,
        ["identify"] => cmd_identify().await,
        ["config"] => cmd_config(),
        ["help"] | ["--help"] | ["-h"] => {
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
