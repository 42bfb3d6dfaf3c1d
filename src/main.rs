use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use contaforge::cli::{Cli, Command};
use contaforge::config::EngineConfig;
use contaforge::engine::Engine;
use contaforge::executor::{SimulatedAutomation, StaticProfiles};
use contaforge::registry::{BatchRequest, BatchStatus, JobSpec};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(Path::new(path))?,
        None => EngineConfig::load()?,
    };

    match cli.command {
        Command::Config => {
            println!("{config:#?}");
        }
        Command::Demo {
            profiles,
            max_concurrent,
        } => run_demo(config, profiles, max_concurrent).await?,
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "contaforge=debug"
    } else {
        "contaforge=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Submits a demo batch against the simulated executor and prints the final
/// report once the batch settles.
async fn run_demo(
    config: EngineConfig,
    profiles: usize,
    max_concurrent: Option<usize>,
) -> Result<()> {
    let ids: Vec<String> = (1..=profiles.max(1)).map(|i| format!("demo-{i}")).collect();
    let engine = Engine::new(
        config,
        Arc::new(SimulatedAutomation::default()),
        Arc::new(StaticProfiles::new(ids.clone())),
    );

    let ticket = engine.submit_batch(BatchRequest {
        profiles: ids.iter().map(JobSpec::new).collect(),
        common_params: None,
        max_concurrent,
        webhook_callback: None,
    })?;
    println!(
        "batch {} submitted ({} jobs, ceiling {})",
        ticket.batch_id, ticket.total_jobs, ticket.max_concurrent
    );

    loop {
        let report = engine.batch_status(&ticket.batch_id, false, true)?;
        if report.status != BatchStatus::Running {
            println!("{}", serde_json::to_string_pretty(&report)?);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    engine.shutdown().await;
    Ok(())
}
