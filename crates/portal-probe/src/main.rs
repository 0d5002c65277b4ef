// ABOUTME: Entry point for portal-probe binary.
// ABOUTME: Loads endpoint config, health-checks every service, exits non-zero on failure.

use anyhow::Result;
use clap::Parser;
use portal_probe::Config;
use tracing::Level;

#[derive(Parser)]
#[command(name = "portal-probe")]
#[command(about = "Health-check portal backend endpoints and their multiplexed services")]
struct Cli {
    /// Config file path
    #[arg(short, long, env = "PORTAL_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Probe an in-process server instead of the configured endpoints
    #[arg(long)]
    self_test: bool,

    /// Log connection attempts and pool activity
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    portal_log::init_for(&["portal_probe", "portal_rpc"], level);

    let reports = if cli.self_test {
        portal_probe::self_test().await?
    } else {
        let config = Config::load(cli.config)?;
        portal_probe::run(&config).await?
    };

    for report in &reports {
        println!("{report}");
    }

    let failed = reports.iter().filter(|r| !r.is_healthy()).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} probes failed", reports.len());
    }
    Ok(())
}
