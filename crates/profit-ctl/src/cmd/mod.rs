//! CLI command modules.

pub mod check;
pub mod run;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use profit_core::config::ProfitConfig;
use profit_services::Runner;

/// Connect a runner that closes itself on Ctrl-C.
pub async fn connect(config: &ProfitConfig) -> Result<Runner> {
    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, closing runner");
                token.cancel();
            }
        });
    }
    Runner::connect(config, token)
        .await
        .with_context(|| format!("failed to connect to {}", config.runner.url))
}
