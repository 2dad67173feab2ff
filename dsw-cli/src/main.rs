//! Data Switch Scenario Driver
//!
//! Runs a scripted scenario against the data-connection switch on a virtual
//! modem and prints the final arbitrator status and modem counters as JSON.
//! Exits with an error if the modem ever saw two slots on the data path.

mod scenario;
mod settings;

use std::path::PathBuf;

use anyhow::bail;
use clap::Parser;
use scenario::run_scenario;
use settings::Settings;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Drive the data-connection switch through a scenario
#[derive(Parser, Debug)]
#[command(name = "dataswitch")]
#[command(version, about, long_about = None)]
struct Args {
    /// Settings file (defaults to $XDG_CONFIG_HOME/dataswitch/settings.json)
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Write the default settings to the settings path and exit
    #[arg(long)]
    write_default: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Include all our crates in the default filter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "dataswitch=info,dsw_switch=info,dsw_sim=info,dsw_modem=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if args.write_default {
        let path = Settings::default().save(args.settings.as_deref())?;
        info!("Wrote default settings to {}", path.display());
        return Ok(());
    }

    let settings = Settings::load(args.settings.as_deref())?;
    info!(
        "Starting dataswitch: {} tenants, {} scenario steps",
        settings.arbitrator.tenant_count,
        settings.scenario.len()
    );

    let report = run_scenario(&settings).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.violated() {
        bail!(
            "Virtual modem recorded {} single-data-path violations",
            report.stats.violations
        );
    }
    Ok(())
}
