//! Command line interface of `skein`, built on clap.
//!
//! [`Cli`] carries the global flags that override `skein.toml` and the
//! [`Command`] to run.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::BatchConfig;

/// skein: resumable batch jobs with chunked steps, retry and skip.
#[derive(Debug, Parser)]
#[command(name = "skein", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Items per chunk transaction.
    #[arg(long, global = true)]
    pub commit_interval: Option<usize>,

    /// Attempts per item before skipping or failing.
    #[arg(long, global = true)]
    pub retry_limit: Option<u32>,

    /// Configuration file to use instead of ./skein.toml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enables debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs the built-in sample job.
    Demo {
        /// Fail the first run of the report step to show a restart.
        #[arg(long, default_value_t = false)]
        restart: bool,
    },

    /// Validates the routing of a TOML flow definition.
    Check {
        /// Path to the flow definition.
        file: PathBuf,
    },
}

impl Cli {
    /// Applies the command line overrides to `config`.
    pub fn apply(&self, config: &mut BatchConfig) {
        if let Some(interval) = self.commit_interval {
            config.commit_interval = interval;
        }
        if let Some(limit) = self.retry_limit {
            config.retry_limit = limit;
        }
        if self.verbose {
            config.log_filter = "debug".to_string();
        }
    }
}
