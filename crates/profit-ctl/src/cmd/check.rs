//! Open every channel for a backend and close them again.

use anyhow::Result;

use profit_core::config::ProfitConfig;

pub async fn cmd_check(config: &ProfitConfig) -> Result<()> {
    let runner = super::connect(config).await?;

    println!("═══════════════════════════════════════");
    println!("  Backend Check");
    println!("═══════════════════════════════════════");
    println!("  URL         : {}", runner.url());
    println!("  Runner id   : {}", runner.id());
    println!("  Remote root : {}", runner.root());
    println!("  Channels    : {} per transfer direction", config.runner.transfer_channels);
    println!("  Cleanup     : {}", if config.runner.do_cleanup { "on" } else { "off" });

    runner.close().await;
    println!("\n  All channels closed.");
    Ok(())
}
