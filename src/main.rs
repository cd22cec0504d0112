use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use console::Style;
use tracing_subscriber::EnvFilter;

use skein::cli::{Cli, Command};
use skein::config::BatchConfig;
use skein::flow::FlowDefinition;
use skein::status::BatchStatus;
use skein::task::TokioTaskExecutor;

const LOG_ENV: &str = "SKEIN_LOG";

fn init_tracing(config: &BatchConfig, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(&config.log_filter))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn check(file: &std::path::Path) -> Result<()> {
    let definition = FlowDefinition::from_path(file)
        .with_context(|| format!("loading {}", file.display()))?;
    let flow = definition.validate()?;
    let green = Style::new().green().bold();
    println!(
        "  {} {} starts at {}",
        green.apply_to("✓"),
        definition.name,
        flow.start_state()
    );
    for transition in flow.transitions() {
        println!("    {transition}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => BatchConfig::from_path(path)?,
        None => BatchConfig::load()?,
    };
    cli.apply(&mut config);
    init_tracing(&config, cli.verbose);

    match cli.command {
        Command::Demo { restart } => {
            let executor = Arc::new(TokioTaskExecutor::new(config.split_threads)?);
            let executions = skein::demo::run(&config, executor, restart)?;
            let completed = executions
                .last()
                .is_some_and(|e| e.status() == BatchStatus::Completed);
            if !completed {
                std::process::exit(1);
            }
        }
        Command::Check { file } => check(&file)?,
    }
    Ok(())
}
